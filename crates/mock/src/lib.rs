//! Deterministic in-memory implementation of every `parley-api` collaborator.
//!
//! Exchanges are driven by the caller: each `open_exchange` hands an [`ExchangeDriver`]
//! out through [`MockBackend::next_exchange`], and the test emits events one at a time.
//! The backend persists the user turn when an exchange opens and the assistant turn
//! when the driver reports `done`, mirroring how the real service behaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_api::{
    AgentId, ApiError, ApiResult, BoxFuture, Chat, ChatDirectory, ChatId, ErrorCause,
    ExchangeEvent, ExchangeEventSender, ExchangeRequest, ExchangeStreamHandle, ExchangeTransport,
    ExchangeWorker, Message, MessageId, MessagePersistence, Role, Source, ValidationId,
    ValidationOutcome, ValidationRequest, ValidationService, make_event_stream,
};
use tokio::sync::{mpsc, watch};

/// Base timestamp for generated records; ids double as a creation clock.
const EPOCH_SECONDS: u64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationCall {
    Approve {
        validation_id: ValidationId,
        always_allow: bool,
    },
    Reject {
        validation_id: ValidationId,
        reason: Option<String>,
    },
    Feedback {
        validation_id: ValidationId,
        text: String,
    },
}

#[derive(Debug, Default)]
struct Faults {
    open_exchange: Option<String>,
    list_messages: u32,
    validation: Option<String>,
}

struct MockState {
    chats: Mutex<Vec<Chat>>,
    messages: Mutex<HashMap<ChatId, Vec<Message>>>,
    next_id: AtomicU64,
    drivers_tx: mpsc::UnboundedSender<ExchangeDriver>,
    faults: Mutex<Faults>,
    opened: Mutex<Vec<ExchangeRequest>>,
    validation_calls: Mutex<Vec<ValidationCall>>,
    abandoned: Mutex<Vec<ChatId>>,
    stream_active_after_validation: AtomicBool,
    validation_latency: Mutex<Option<Duration>>,
    refresh_latency: Mutex<Option<Duration>>,
    refresh_calls: AtomicU64,
}

impl MockState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn persist(&self, chat_id: &ChatId, role: Role, content: &str) -> Message {
        let id = self.next_id();
        let message = Message {
            id: MessageId::durable(format!("msg-{id}")),
            chat_id: chat_id.clone(),
            role,
            content: content.to_string(),
            created_at_unix_seconds: EPOCH_SECONDS + id,
        };
        lock(&self.messages)
            .entry(chat_id.clone())
            .or_default()
            .push(message.clone());
        message
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
    drivers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ExchangeDriver>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (drivers_tx, drivers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                chats: Mutex::new(Vec::new()),
                messages: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                drivers_tx,
                faults: Mutex::new(Faults::default()),
                opened: Mutex::new(Vec::new()),
                validation_calls: Mutex::new(Vec::new()),
                abandoned: Mutex::new(Vec::new()),
                stream_active_after_validation: AtomicBool::new(true),
                validation_latency: Mutex::new(None),
                refresh_latency: Mutex::new(None),
                refresh_calls: AtomicU64::new(0),
            }),
            drivers_rx: Arc::new(tokio::sync::Mutex::new(drivers_rx)),
        }
    }

    pub fn seed_chat(&self, title: &str, agent_id: Option<AgentId>) -> Chat {
        let id = self.state.next_id();
        let chat = Chat {
            id: ChatId::new(format!("chat-{id}")),
            title: title.to_string(),
            created_at_unix_seconds: EPOCH_SECONDS + id,
            agent_id,
        };
        lock(&self.state.chats).push(chat.clone());
        chat
    }

    pub fn seed_message(&self, chat_id: &ChatId, role: Role, content: &str) -> Message {
        self.state.persist(chat_id, role, content)
    }

    pub fn chats(&self) -> Vec<Chat> {
        lock(&self.state.chats).clone()
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        lock(&self.state.messages)
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Waits for the next exchange opened against this backend.
    pub async fn next_exchange(&self) -> Option<ExchangeDriver> {
        self.drivers_rx.lock().await.recv().await
    }

    pub fn opened_requests(&self) -> Vec<ExchangeRequest> {
        lock(&self.state.opened).clone()
    }

    pub fn validation_calls(&self) -> Vec<ValidationCall> {
        lock(&self.state.validation_calls).clone()
    }

    pub fn abandoned_chats(&self) -> Vec<ChatId> {
        lock(&self.state.abandoned).clone()
    }

    pub fn fail_next_open(&self, details: &str) {
        lock(&self.state.faults).open_exchange = Some(details.to_string());
    }

    pub fn fail_next_refreshes(&self, count: u32) {
        lock(&self.state.faults).list_messages = count;
    }

    pub fn fail_next_validation(&self, details: &str) {
        lock(&self.state.faults).validation = Some(details.to_string());
    }

    pub fn set_stream_active_after_validation(&self, stream_active: bool) {
        self.state
            .stream_active_after_validation
            .store(stream_active, Ordering::SeqCst);
    }

    pub fn set_validation_latency(&self, latency: Duration) {
        *lock(&self.state.validation_latency) = Some(latency);
    }

    /// Delays successful message listings; injected refresh failures still return at once.
    pub fn set_refresh_latency(&self, latency: Duration) {
        *lock(&self.state.refresh_latency) = Some(latency);
    }

    /// Number of `list_messages` calls received so far.
    pub fn refresh_calls(&self) -> u64 {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    async fn record_validation(&self, call: ValidationCall) -> ApiResult<ValidationOutcome> {
        let latency = *lock(&self.state.validation_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(details) = lock(&self.state.faults).validation.take() {
            return Err(ApiError::Rejected {
                stage: "mock-validation",
                details,
            });
        }

        lock(&self.state.validation_calls).push(call);
        Ok(ValidationOutcome {
            stream_active: self
                .state
                .stream_active_after_validation
                .load(Ordering::SeqCst),
        })
    }
}

impl ChatDirectory for MockBackend {
    fn list_chats<'a>(&'a self) -> BoxFuture<'a, ApiResult<Vec<Chat>>> {
        Box::pin(async move { Ok(self.chats()) })
    }

    fn create_chat<'a>(&'a self) -> BoxFuture<'a, ApiResult<Chat>> {
        Box::pin(async move { Ok(self.seed_chat("", None)) })
    }

    fn delete_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            let mut chats = lock(&self.state.chats);
            let before = chats.len();
            chats.retain(|chat| &chat.id != chat_id);
            if chats.len() == before {
                return Err(ApiError::NotFound {
                    stage: "mock-delete-chat",
                    entity: "chat",
                    id: chat_id.to_string(),
                });
            }
            lock(&self.state.messages).remove(chat_id);
            Ok(())
        })
    }
}

impl MessagePersistence for MockBackend {
    fn list_messages<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<Vec<Message>>> {
        Box::pin(async move {
            self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut faults = lock(&self.state.faults);
                if faults.list_messages > 0 {
                    faults.list_messages -= 1;
                    return Err(ApiError::HttpStatus {
                        stage: "mock-list-messages",
                        status: 503,
                        body: "message store unavailable".to_string(),
                    });
                }
            }
            let latency = *lock(&self.state.refresh_latency);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            Ok(self.messages(chat_id))
        })
    }
}

impl ExchangeTransport for MockBackend {
    fn open_exchange(&self, request: ExchangeRequest) -> ApiResult<ExchangeStreamHandle> {
        lock(&self.state.opened).push(request.clone());

        if let Some(details) = lock(&self.state.faults).open_exchange.take() {
            return Err(ApiError::Rejected {
                stage: "mock-open-exchange",
                details,
            });
        }

        {
            let mut chats = lock(&self.state.chats);
            if let Some(chat) = chats.iter_mut().find(|chat| chat.id == request.chat_id)
                && chat.agent_id.is_none()
            {
                chat.agent_id = request.agent_id.clone();
            }
        }
        self.state
            .persist(&request.chat_id, Role::User, &request.content);

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let (released_tx, released_rx) = watch::channel(false);
        let worker: ExchangeWorker = Box::pin(async move {
            let _ = cancel_rx.await;
            let _ = released_tx.send(true);
        });

        let driver = ExchangeDriver {
            request,
            event_tx,
            state: Arc::clone(&self.state),
            text: String::new(),
            released_rx,
        };
        if self.state.drivers_tx.send(driver).is_err() {
            tracing::warn!("mock exchange driver dropped because nobody is listening");
        }

        Ok(ExchangeStreamHandle { stream, worker })
    }

    fn abandon_exchange<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            lock(&self.state.abandoned).push(chat_id.clone());
            Ok(())
        })
    }
}

impl ValidationService for MockBackend {
    fn approve<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        always_allow: bool,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(self.record_validation(ValidationCall::Approve {
            validation_id: validation_id.clone(),
            always_allow,
        }))
    }

    fn reject<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        reason: Option<String>,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(self.record_validation(ValidationCall::Reject {
            validation_id: validation_id.clone(),
            reason,
        }))
    }

    fn feedback<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        text: String,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(self.record_validation(ValidationCall::Feedback {
            validation_id: validation_id.clone(),
            text,
        }))
    }
}

/// Test-side handle emitting events for one open exchange.
///
/// Every emit returns whether the session side was still listening.
pub struct ExchangeDriver {
    request: ExchangeRequest,
    event_tx: ExchangeEventSender,
    state: Arc<MockState>,
    text: String,
    released_rx: watch::Receiver<bool>,
}

impl ExchangeDriver {
    pub fn chat_id(&self) -> &ChatId {
        &self.request.chat_id
    }

    pub fn request(&self) -> &ExchangeRequest {
        &self.request
    }

    pub fn token(&mut self, text: &str) -> bool {
        self.text.push_str(text);
        self.event_tx
            .send(ExchangeEvent::Token(text.to_string()))
            .is_ok()
    }

    pub fn source(&self, source: Source) -> bool {
        self.event_tx.send(ExchangeEvent::Source(source)).is_ok()
    }

    pub fn request_validation(&self, tool_name: &str, arguments: serde_json::Value) -> ValidationId {
        let validation_id = ValidationId::new(format!("val-{}", self.state.next_id()));
        let request = ValidationRequest {
            id: validation_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
            chat_id: self.request.chat_id.clone(),
            agent_id: self.request.agent_id.clone(),
        };
        let _ = self
            .event_tx
            .send(ExchangeEvent::ValidationRequested(request));
        validation_id
    }

    pub fn resolve_validation(&self, validation_id: &ValidationId) -> bool {
        self.event_tx
            .send(ExchangeEvent::ValidationResolved(validation_id.clone()))
            .is_ok()
    }

    /// Persists the accumulated assistant text, then reports success.
    pub fn done(self) -> bool {
        self.state
            .persist(&self.request.chat_id, Role::Assistant, &self.text);
        self.event_tx.send(ExchangeEvent::Done).is_ok()
    }

    pub fn fail(self, code: &str, message: &str) -> bool {
        self.event_tx
            .send(ExchangeEvent::Error {
                cause: ErrorCause::Backend(code.to_string()),
                message: message.to_string(),
            })
            .is_ok()
    }

    /// Drops the channel without a terminal event.
    pub fn close(self) {}

    /// Resolves once the session side dropped its end of the exchange.
    pub async fn wait_released(&mut self) {
        let _ = self.released_rx.wait_for(|released| *released).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_exchange_persists_user_turn_and_binds_agent() {
        let backend = MockBackend::new();
        let chat = backend.seed_chat("empty", None);
        let agent = AgentId::new("agent-1");

        let handle = backend
            .open_exchange(ExchangeRequest::new(
                chat.id.clone(),
                "Hello",
                "model",
                Some(agent.clone()),
            ))
            .expect("exchange opens");
        let driver = backend.next_exchange().await.expect("driver published");

        assert_eq!(driver.chat_id(), &chat.id);
        assert_eq!(backend.messages(&chat.id)[0].content, "Hello");
        assert_eq!(backend.chats()[0].agent_id, Some(agent));
        drop(handle);
    }

    #[tokio::test]
    async fn done_persists_accumulated_assistant_text() {
        let backend = MockBackend::new();
        let chat = backend.seed_chat("chat", None);
        let mut handle = backend
            .open_exchange(ExchangeRequest::new(chat.id.clone(), "Hello", "model", None))
            .expect("exchange opens");
        let mut driver = backend.next_exchange().await.expect("driver published");

        assert!(driver.token("Hi"));
        assert!(driver.token(" there"));
        assert!(driver.done());

        let messages = backend.messages(&chat.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there");
        assert_eq!(
            handle.stream.recv().await,
            Some(ExchangeEvent::Token("Hi".to_string()))
        );
    }

    #[tokio::test]
    async fn refresh_faults_are_consumed_in_order() {
        let backend = MockBackend::new();
        let chat = backend.seed_chat("chat", None);
        backend.fail_next_refreshes(1);

        assert!(backend.list_messages(&chat.id).await.is_err());
        assert!(backend.list_messages(&chat.id).await.is_ok());
        assert_eq!(backend.refresh_calls(), 2);
    }
}
