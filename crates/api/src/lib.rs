pub mod auth;
pub mod error;
pub mod events;
pub mod http;
pub mod ids;
pub mod sse;
pub mod types;

pub use auth::{CredentialProvider, StaticCredentials};
pub use error::{ApiError, ApiResult};
pub use events::{
    BoxFuture, ErrorCause, ExchangeEvent, ExchangeEventSender, ExchangeEventStream,
    ExchangeStreamHandle, ExchangeWorker, make_event_stream,
};
pub use http::{BackendConfig, HttpBackend};
pub use ids::{AgentId, ChatId, MessageId, TEMPORARY_ID_PREFIX, ValidationId};
pub use sse::SseStreamParser;
pub use types::{
    Chat, DEFAULT_CHAT_TITLE, ExchangeRequest, Message, Role, Source, ValidationOutcome,
    ValidationRequest, unix_timestamp_seconds,
};

pub trait ChatDirectory: Send + Sync {
    fn list_chats<'a>(&'a self) -> BoxFuture<'a, ApiResult<Vec<Chat>>>;
    fn create_chat<'a>(&'a self) -> BoxFuture<'a, ApiResult<Chat>>;
    fn delete_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>>;
}

pub trait MessagePersistence: Send + Sync {
    /// Durable history for one chat, oldest first.
    fn list_messages<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<Vec<Message>>>;
}

pub trait ExchangeTransport: Send + Sync {
    /// Opens the incremental channel for one exchange.
    ///
    /// The returned worker must be spawned by the caller; dropping the stream cancels it.
    fn open_exchange(&self, request: ExchangeRequest) -> ApiResult<ExchangeStreamHandle>;
    /// Best-effort request asking the backend to abandon the in-flight exchange.
    fn abandon_exchange<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>>;
}

pub trait ValidationService: Send + Sync {
    fn approve<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        always_allow: bool,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>>;
    fn reject<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        reason: Option<String>,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>>;
    fn feedback<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        text: String,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>>;
}

/// Every collaborator the session manager consumes.
pub trait Backend: ChatDirectory + MessagePersistence + ExchangeTransport + ValidationService {}

impl<T> Backend for T where T: ChatDirectory + MessagePersistence + ExchangeTransport + ValidationService {}
