use std::fmt;

use parley_api::{ApiError, ChatId, ErrorCause, ValidationId};
use snafu::Snafu;

use crate::stream::StreamHandleId;

pub type SessionResult<T> = Result<T, SessionError>;

/// Why a validation action was refused before reaching the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Neither the send request nor the chat carries an agent.
    AgentUnbound { chat_id: ChatId },
    AlreadyResolved { validation_id: ValidationId },
    NotPending { validation_id: ValidationId },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentUnbound { chat_id } => write!(f, "chat '{chat_id}' has no agent bound"),
            Self::AlreadyResolved { validation_id } => {
                write!(f, "validation '{validation_id}' was already resolved")
            }
            Self::NotPending { validation_id } => {
                write!(f, "validation '{validation_id}' is not pending")
            }
        }
    }
}

/// Coarse grouping for callers that only branch on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ValidationConflict,
    StreamTransport,
    StaleHandle,
    PersistenceRefresh,
    Backend,
    Closed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("message content is empty on `{stage}`"))]
    EmptyContent { stage: &'static str },

    #[snafu(display("no chat is active on `{stage}`"))]
    NoActiveChat { stage: &'static str },

    #[snafu(display("chat '{chat_id}' already has an exchange in flight"))]
    StreamAlreadyActive {
        stage: &'static str,
        chat_id: ChatId,
    },

    #[snafu(display("validation conflict on `{stage}`: {reason}"))]
    ValidationConflict {
        stage: &'static str,
        reason: ConflictReason,
    },

    #[snafu(display("failed to open exchange for chat '{chat_id}', {source}"))]
    OpenExchange {
        stage: &'static str,
        chat_id: ChatId,
        source: ApiError,
    },

    #[snafu(display("exchange for chat '{chat_id}' failed ({cause}): {message}"))]
    StreamTransport {
        stage: &'static str,
        chat_id: ChatId,
        cause: ErrorCause,
        message: String,
    },

    #[snafu(display("stream handle {handle} is no longer current for chat '{chat_id}'"))]
    StaleHandle {
        stage: &'static str,
        chat_id: ChatId,
        handle: StreamHandleId,
    },

    #[snafu(display("failed to refresh messages for chat '{chat_id}', {source}"))]
    PersistenceRefresh {
        stage: &'static str,
        chat_id: ChatId,
        source: ApiError,
    },

    #[snafu(display("failed to build backend client on `{stage}`, {source}"))]
    BackendSetup {
        stage: &'static str,
        source: ApiError,
    },

    #[snafu(display("chat directory call failed on `{stage}`, {source}"))]
    ChatDirectory {
        stage: &'static str,
        source: ApiError,
    },

    #[snafu(display("validation service rejected '{validation_id}' on `{stage}`, {source}"))]
    ValidationService {
        stage: &'static str,
        validation_id: ValidationId,
        source: ApiError,
    },

    #[snafu(display("session shut down before the exchange for '{chat_id}' finished"))]
    SessionClosed {
        stage: &'static str,
        chat_id: ChatId,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyContent { .. }
            | Self::NoActiveChat { .. }
            | Self::StreamAlreadyActive { .. } => ErrorKind::InvalidInput,
            Self::ValidationConflict { .. } => ErrorKind::ValidationConflict,
            Self::OpenExchange { .. } | Self::StreamTransport { .. } => ErrorKind::StreamTransport,
            Self::StaleHandle { .. } => ErrorKind::StaleHandle,
            Self::PersistenceRefresh { .. } => ErrorKind::PersistenceRefresh,
            Self::BackendSetup { .. }
            | Self::ChatDirectory { .. }
            | Self::ValidationService { .. } => ErrorKind::Backend,
            Self::SessionClosed { .. } => ErrorKind::Closed,
        }
    }

    /// Whether repeating the same call may succeed without any other state change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StreamTransport | ErrorKind::PersistenceRefresh | ErrorKind::Backend
        )
    }

    pub fn conflict_reason(&self) -> Option<&ConflictReason> {
        match self {
            Self::ValidationConflict { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn agent_unbound(stage: &'static str, chat_id: &ChatId) -> Self {
        Self::ValidationConflict {
            stage,
            reason: ConflictReason::AgentUnbound {
                chat_id: chat_id.clone(),
            },
        }
    }
}
