use parley_api::{Chat, ChatId, Message, Source, ValidationRequest};

use crate::stream::{StreamHandleId, StreamPhase};

/// Everything a presentation layer needs to draw the session, published after each change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub active_chat: Option<ChatId>,
    /// Newest first.
    pub chats: Vec<Chat>,
    /// Merged view of the active chat.
    pub messages: Vec<Message>,
    pub is_sending: bool,
    pub stream: Option<StreamView>,
    /// Chats with an exchange in flight, including ones not currently shown.
    pub streaming_chats: Vec<ChatId>,
}

impl SessionSnapshot {
    pub fn pending_validation(&self) -> Option<&ValidationRequest> {
        self.stream
            .as_ref()
            .and_then(|stream| stream.pending_validation.as_ref())
    }
}

/// In-flight exchange of the active chat.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamView {
    pub handle: StreamHandleId,
    pub phase: StreamPhase,
    pub text: String,
    pub sources: Vec<Source>,
    pub paused: bool,
    pub pending_validation: Option<ValidationRequest>,
    /// A resolving call for `pending_validation` is in flight.
    pub resolving: bool,
    pub queued_validations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    StreamFailed,
    RefreshFailed,
    ValidationFailed,
    AbandonFailed,
}

/// Failure surfaced outside the call that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub chat_id: Option<ChatId>,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, chat_id: Option<ChatId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            chat_id,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, NotificationKind::AbandonFailed)
    }
}
