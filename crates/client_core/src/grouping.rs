use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{domain::UserId, protocol::ChatMessage};

pub const DEFAULT_GROUP_THRESHOLD: Duration = Duration::from_millis(600_000);

/// Anything with a sender and a send time can be grouped.
pub trait Groupable {
    fn sender_id(&self) -> UserId;
    fn sent_at(&self) -> DateTime<Utc>;
}

impl Groupable for ChatMessage {
    fn sender_id(&self) -> UserId {
        self.sender_id
    }

    fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupingAnnotation {
    pub is_first_in_group: bool,
    pub is_middle_in_group: bool,
    pub is_last_in_group: bool,
}

fn same_group<M: Groupable>(earlier: &M, later: &M, threshold_ms: i64) -> bool {
    earlier.sender_id() == later.sender_id()
        && (later.sent_at() - earlier.sent_at()).num_milliseconds() <= threshold_ms
}

/// Annotates an already chronological run of messages with its visual
/// grouping. A gap of exactly `threshold` still groups.
pub fn group_messages<M: Groupable>(messages: &[M], threshold: Duration) -> Vec<GroupingAnnotation> {
    let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let joins_previous = index
                .checked_sub(1)
                .map(|prev| same_group(&messages[prev], message, threshold_ms))
                .unwrap_or(false);
            let joins_next = messages
                .get(index + 1)
                .map(|next| same_group(message, next, threshold_ms))
                .unwrap_or(false);
            GroupingAnnotation {
                is_first_in_group: !joins_previous,
                is_middle_in_group: joins_previous && joins_next,
                is_last_in_group: !joins_next,
            }
        })
        .collect()
}

pub fn group<M: Groupable>(messages: &[M]) -> Vec<GroupingAnnotation> {
    group_messages(messages, DEFAULT_GROUP_THRESHOLD)
}

#[cfg(test)]
#[path = "tests/grouping_tests.rs"]
mod tests;
