use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkOffline,
    NetworkTimeout,
    Unauthorized,
    BadRequest,
    ServerError,
    FileTooLarge,
    UnsupportedFileType,
    Unknown,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkOffline | Self::NetworkTimeout | Self::ServerError
        )
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::NetworkOffline => "You appear to be offline. Check your connection and try again.",
            Self::NetworkTimeout => "The request took too long. Please try again.",
            Self::Unauthorized => "Your session has expired. Please sign in again.",
            Self::BadRequest => "The request could not be processed.",
            Self::ServerError => "The server ran into a problem. Please try again shortly.",
            Self::FileTooLarge => "The file is too large to upload.",
            Self::UnsupportedFileType => "This file type is not supported.",
            Self::Unknown => "Something went wrong.",
        }
    }
}

/// The observable shape of a failure, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// The device reports no connectivity.
    Offline,
    /// The request was aborted by its deadline or by the caller.
    Aborted,
    /// A transport failure with no HTTP response (connect refused, reset).
    Transport,
    Status(u16),
    FileTooLarge,
    UnsupportedFileType,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub code: ErrorCode,
    pub retryable: bool,
    pub user_message: &'static str,
}

pub fn classify(signal: FailureSignal) -> Classification {
    let code = match signal {
        FailureSignal::Offline | FailureSignal::Transport => ErrorCode::NetworkOffline,
        FailureSignal::Aborted => ErrorCode::NetworkTimeout,
        FailureSignal::Status(status) => code_for_status(status),
        FailureSignal::FileTooLarge => ErrorCode::FileTooLarge,
        FailureSignal::UnsupportedFileType => ErrorCode::UnsupportedFileType,
        FailureSignal::Other => ErrorCode::Unknown,
    };
    Classification {
        code,
        retryable: code.is_retryable(),
        user_message: code.user_message(),
    }
}

fn code_for_status(status: u16) -> ErrorCode {
    match status {
        401 | 403 => ErrorCode::Unauthorized,
        400 | 404 | 409 | 422 => ErrorCode::BadRequest,
        408 => ErrorCode::NetworkTimeout,
        413 => ErrorCode::FileTooLarge,
        415 => ErrorCode::UnsupportedFileType,
        500..=599 => ErrorCode::ServerError,
        _ => ErrorCode::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
    pub status: Option<u16>,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn from_signal(signal: FailureSignal, detail: impl Into<String>) -> Self {
        let status = match signal {
            FailureSignal::Status(status) => Some(status),
            _ => None,
        };
        Self {
            code: classify(signal).code,
            message: detail.into(),
            status,
        }
    }

    pub fn aborted() -> Self {
        Self::from_signal(FailureSignal::Aborted, "request aborted")
    }

    pub fn offline() -> Self {
        Self::from_signal(FailureSignal::Offline, "device is offline")
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn user_message(&self) -> &'static str {
        self.code.user_message()
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
