use std::fmt;

use thiserror::Error;

/// Failure categories surfaced through session and channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OfferCreationFailed,
    AnswerCreationFailed,
    DataChannelCreationFailed,
    InvalidState,
    InvalidArgument,
    SendFailed,
    ChannelError,
    Signaling,
    Platform,
    IceServers,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::OfferCreationFailed => "offer_creation_failed",
            ErrorKind::AnswerCreationFailed => "answer_creation_failed",
            ErrorKind::DataChannelCreationFailed => "data_channel_creation_failed",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::SendFailed => "send_failed",
            ErrorKind::ChannelError => "channel_error",
            ErrorKind::Signaling => "signaling",
            ErrorKind::Platform => "platform",
            ErrorKind::IceServers => "ice_servers",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carrying the failing operation and an opaque cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub operation: &'static str,
    pub message: String,
    pub cause: Option<String>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn invalid_state(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, operation, message)
    }

    pub fn invalid_argument(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, operation, message)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
