use async_trait::async_trait;
use shared::{
    domain::{ConversationId, MemberRole, UserId},
    error::SyncError,
    protocol::GroupMember,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CacheValue, QueryCache, QueryKey},
    mutation::OptimisticMutation,
    remote::RemoteApi,
    retry::RetryPolicy,
};

/// Zeroes the unread counter of a conversation in every cached list.
pub struct MarkConversationRead;

#[async_trait]
impl OptimisticMutation for MarkConversationRead {
    type Variables = ConversationId;
    type Output = ();

    fn name(&self) -> &'static str {
        "mark_conversation_read"
    }

    /// Only the cached lists that hold the conversation.
    fn affected_keys(&self, cache: &QueryCache, conversation_id: &ConversationId) -> Vec<QueryKey> {
        cache
            .keys_where(QueryKey::is_conversation_list)
            .into_iter()
            .filter(|key| {
                matches!(
                    cache.get(key),
                    Some(CacheValue::Conversations(list))
                        if list.iter().any(|c| c.conversation_id == *conversation_id)
                )
            })
            .collect()
    }

    fn speculate(
        &self,
        _key: &QueryKey,
        current: &CacheValue,
        conversation_id: &ConversationId,
    ) -> Option<CacheValue> {
        let CacheValue::Conversations(list) = current else {
            return None;
        };
        let index = list
            .iter()
            .position(|c| c.conversation_id == *conversation_id && c.unread_count != 0)?;
        let mut next = list.clone();
        next[index].unread_count = 0;
        Some(CacheValue::Conversations(next))
    }

    // setting unread to zero twice is harmless
    fn exclusive(&self) -> bool {
        false
    }

    fn retry_policy(&self) -> Option<RetryPolicy<SyncError>> {
        Some(RetryPolicy::message_send())
    }

    async fn execute(
        &self,
        remote: &dyn RemoteApi,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        remote.mark_conversation_read(*conversation_id, cancel).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

fn members_of(current: &CacheValue) -> Option<&Vec<GroupMember>> {
    match current {
        CacheValue::Members(members) => Some(members),
        _ => None,
    }
}

pub struct AddGroupMember;

#[async_trait]
impl OptimisticMutation for AddGroupMember {
    type Variables = NewMember;
    type Output = GroupMember;

    fn name(&self) -> &'static str {
        "add_group_member"
    }

    fn affected_keys(&self, _cache: &QueryCache, member: &NewMember) -> Vec<QueryKey> {
        vec![QueryKey::GroupMembers(member.conversation_id)]
    }

    fn speculate(
        &self,
        _key: &QueryKey,
        current: &CacheValue,
        member: &NewMember,
    ) -> Option<CacheValue> {
        let members = members_of(current)?;
        if members.iter().any(|m| m.user_id == member.user_id) {
            return None;
        }
        let mut next = members.clone();
        next.push(GroupMember {
            user_id: member.user_id,
            display_name: member.display_name.clone(),
            role: MemberRole::Member,
        });
        Some(CacheValue::Members(next))
    }

    async fn execute(
        &self,
        remote: &dyn RemoteApi,
        member: &NewMember,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        remote
            .add_group_member(member.conversation_id, member.user_id, cancel)
            .await
    }
}

pub struct RemoveGroupMember;

#[async_trait]
impl OptimisticMutation for RemoveGroupMember {
    type Variables = MemberRef;
    type Output = ();

    fn name(&self) -> &'static str {
        "remove_group_member"
    }

    fn affected_keys(&self, _cache: &QueryCache, member: &MemberRef) -> Vec<QueryKey> {
        vec![QueryKey::GroupMembers(member.conversation_id)]
    }

    fn speculate(
        &self,
        _key: &QueryKey,
        current: &CacheValue,
        member: &MemberRef,
    ) -> Option<CacheValue> {
        let members = members_of(current)?;
        if !members.iter().any(|m| m.user_id == member.user_id) {
            return None;
        }
        let next = members
            .iter()
            .filter(|m| m.user_id != member.user_id)
            .cloned()
            .collect();
        Some(CacheValue::Members(next))
    }

    async fn execute(
        &self,
        remote: &dyn RemoteApi,
        member: &MemberRef,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        remote
            .remove_group_member(member.conversation_id, member.user_id, cancel)
            .await
    }
}

pub struct PromoteGroupMember;

#[async_trait]
impl OptimisticMutation for PromoteGroupMember {
    type Variables = MemberRef;
    type Output = GroupMember;

    fn name(&self) -> &'static str {
        "promote_group_member"
    }

    fn affected_keys(&self, _cache: &QueryCache, member: &MemberRef) -> Vec<QueryKey> {
        vec![QueryKey::GroupMembers(member.conversation_id)]
    }

    fn speculate(
        &self,
        _key: &QueryKey,
        current: &CacheValue,
        member: &MemberRef,
    ) -> Option<CacheValue> {
        let members = members_of(current)?;
        let index = members
            .iter()
            .position(|m| m.user_id == member.user_id && m.role == MemberRole::Member)?;
        let mut next = members.clone();
        next[index].role = MemberRole::Admin;
        Some(CacheValue::Members(next))
    }

    async fn execute(
        &self,
        remote: &dyn RemoteApi,
        member: &MemberRef,
        cancel: &CancellationToken,
    ) -> Result<GroupMember, SyncError> {
        remote
            .promote_group_member(member.conversation_id, member.user_id, cancel)
            .await
    }
}

#[cfg(test)]
#[path = "tests/mutations_tests.rs"]
mod tests;
