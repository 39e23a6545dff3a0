use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwap;
use parley_api::{
    AgentId, Backend, Chat, ChatDirectory, ChatId, ErrorCause, ExchangeEvent, ExchangeEventStream,
    ExchangeRequest, ExchangeStreamHandle, ExchangeTransport, HttpBackend, Message,
    MessagePersistence, Source, ValidationId, ValidationOutcome, ValidationService,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::{broadcast, watch};

use crate::error::{
    BackendSetupSnafu, ChatDirectorySnafu, NoActiveChatSnafu, PersistenceRefreshSnafu,
    SessionClosedSnafu, SessionError, SessionResult,
};
use crate::gate::Resolution;
use crate::settings::{SessionSettings, SettingsStore};
use crate::snapshot::{Notification, NotificationKind, SessionSnapshot};
use crate::state::{CompletionReceiver, EventEffect, SessionState, StreamTasks};
use crate::stream::StreamHandleId;

/// One user submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub content: String,
    pub model_id: String,
    /// Falls back to the agent already bound to the chat.
    pub agent_id: Option<AgentId>,
}

impl SendRequest {
    pub fn new(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: model_id.into(),
            agent_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    Completed {
        text: String,
        sources: Vec<Source>,
        /// `false` when the post-exchange refresh failed and provisional turns are still shown.
        durable_refreshed: bool,
    },
    Cancelled,
}

/// Resolves once the exchange started by `send_message` reaches its final state.
#[derive(Debug)]
pub struct ExchangeTicket {
    chat_id: ChatId,
    completion: CompletionReceiver,
}

impl ExchangeTicket {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub async fn finished(self) -> SessionResult<ExchangeOutcome> {
        match self.completion.await {
            Ok(result) => result,
            Err(_) => SessionClosedSnafu {
                stage: "await-exchange",
                chat_id: self.chat_id,
            }
            .fail(),
        }
    }
}

/// Backend services the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ChatDirectory>,
    pub persistence: Arc<dyn MessagePersistence>,
    pub transport: Arc<dyn ExchangeTransport>,
    pub validations: Arc<dyn ValidationService>,
}

impl Collaborators {
    pub fn from_backend<B: Backend + 'static>(backend: Arc<B>) -> Self {
        Self {
            directory: backend.clone(),
            persistence: backend.clone(),
            transport: backend.clone(),
            validations: backend,
        }
    }
}

struct Inner {
    collaborators: Collaborators,
    settings: Arc<ArcSwap<SessionSettings>>,
    state: Mutex<SessionState>,
    snapshots: watch::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<Notification>,
}

/// Owns the chat session: history, the optimistic overlay, in-flight exchanges and their
/// validation gates.
///
/// Cheap to clone. `send_message`, `stop_stream` and `stop_stream_for` spawn onto the ambient
/// Tokio runtime and must be called from within one.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new<B: Backend + 'static>(backend: Arc<B>, settings: SessionSettings) -> Self {
        Self::with_collaborators(Collaborators::from_backend(backend), settings)
    }

    /// Follows `store`: edits made through [`SettingsStore::update`] reach running exchanges
    /// on their next read. The notification capacity is fixed at construction.
    pub fn with_settings_store<B: Backend + 'static>(
        backend: Arc<B>,
        store: &SettingsStore,
    ) -> Self {
        Self::from_shared(Collaborators::from_backend(backend), store.shared())
    }

    pub fn with_collaborators(collaborators: Collaborators, settings: SessionSettings) -> Self {
        Self::from_shared(
            collaborators,
            Arc::new(ArcSwap::from_pointee(settings.normalized())),
        )
    }

    fn from_shared(collaborators: Collaborators, settings: Arc<ArcSwap<SessionSettings>>) -> Self {
        let capacity = settings.load().notification_capacity.max(1);
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let (notifications, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                collaborators,
                settings,
                state: Mutex::new(SessionState::default()),
                snapshots,
                notifications,
            }),
        }
    }

    /// Builds the HTTP backend described by the store's current `backend` section.
    pub fn connect(store: &SettingsStore) -> SessionResult<Self> {
        let settings = store.settings();
        let backend = HttpBackend::new(
            settings.backend.to_backend_config(),
            settings.backend.credentials(),
        )
        .context(BackendSetupSnafu {
            stage: "connect-backend",
        })?;
        Ok(Self::with_settings_store(Arc::new(backend), store))
    }

    pub fn settings(&self) -> Arc<SessionSettings> {
        self.inner.settings()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state().snapshot()
    }

    pub fn active_chat(&self) -> Option<ChatId> {
        self.inner.state().active_chat().cloned()
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.inner.state().chats().to_vec()
    }

    /// Merged history of the active chat.
    pub fn render_messages(&self) -> Vec<Message> {
        let state = self.inner.state();
        state
            .active_chat()
            .map(|chat_id| state.render_messages(chat_id))
            .unwrap_or_default()
    }

    /// Whether the active chat has an exchange in flight.
    pub fn is_sending(&self) -> bool {
        let state = self.inner.state();
        state
            .active_chat()
            .is_some_and(|chat_id| state.is_streaming(chat_id))
    }

    pub fn is_streaming(&self, chat_id: &ChatId) -> bool {
        self.inner.state().is_streaming(chat_id)
    }

    pub async fn refresh_chats(&self) -> SessionResult<Vec<Chat>> {
        let chats = self
            .inner
            .collaborators
            .directory
            .list_chats()
            .await
            .context(ChatDirectorySnafu {
                stage: "list-chats",
            })?;

        let mut state = self.inner.state();
        state.replace_chats(chats);
        self.inner.publish(&state);
        Ok(state.chats().to_vec())
    }

    /// Switches the shown chat and reloads its history. Exchanges in other chats keep running.
    pub async fn set_active_chat(&self, chat_id: Option<ChatId>) -> SessionResult<()> {
        {
            let mut state = self.inner.state();
            state.set_active_chat(chat_id.clone());
            self.inner.publish(&state);
        }
        match chat_id {
            Some(chat_id) => self.inner.refresh_chat(&chat_id).await,
            None => Ok(()),
        }
    }

    pub async fn refresh_messages(&self) -> SessionResult<()> {
        let chat_id = self.active_chat().context(NoActiveChatSnafu {
            stage: "refresh-messages",
        })?;
        self.inner.refresh_chat(&chat_id).await
    }

    /// Creates a chat, makes it active and returns it.
    pub async fn create_new_chat(&self) -> SessionResult<Chat> {
        let chat = self
            .inner
            .collaborators
            .directory
            .create_chat()
            .await
            .context(ChatDirectorySnafu {
                stage: "create-chat",
            })?;

        let mut state = self.inner.state();
        state.insert_chat(chat.clone());
        state.set_active_chat(Some(chat.id.clone()));
        let generation = state.begin_refresh(&chat.id);
        state.apply_refresh(&chat.id, generation, Vec::new());
        self.inner.publish(&state);
        tracing::info!("created chat {}", chat.id);
        Ok(chat)
    }

    /// Stops any exchange in the chat, then deletes it.
    pub async fn delete_chat(&self, chat_id: &ChatId) -> SessionResult<()> {
        self.cancel_exchange(chat_id, false);
        self.inner
            .collaborators
            .directory
            .delete_chat(chat_id)
            .await
            .context(ChatDirectorySnafu {
                stage: "delete-chat",
            })?;

        let mut state = self.inner.state();
        state.remove_chat(chat_id);
        self.inner.publish(&state);
        tracing::info!("deleted chat {}", chat_id);
        Ok(())
    }

    /// Starts an exchange in the active chat.
    ///
    /// Returns as soon as the exchange is open; the optimistic message and streaming state are
    /// already visible in the published snapshot. Await the ticket for the final outcome.
    pub fn send_message(&self, request: SendRequest) -> SessionResult<ExchangeTicket> {
        let inner = &self.inner;
        let begun = {
            let mut state = inner.state();
            let begun = state.begin_send(&request.content, request.agent_id)?;
            inner.publish(&state);
            begun
        };

        let exchange = ExchangeRequest::new(
            begun.chat_id.clone(),
            request.content,
            request.model_id,
            Some(begun.agent_id.clone()),
        );
        let opened = match inner.collaborators.transport.open_exchange(exchange) {
            Ok(opened) => opened,
            Err(source) => {
                {
                    let mut state = inner.state();
                    state.abandon_send(&begun.chat_id, begun.handle);
                    inner.publish(&state);
                }
                inner.notify(Notification::new(
                    NotificationKind::StreamFailed,
                    Some(begun.chat_id.clone()),
                    source.to_string(),
                ));
                return Err(SessionError::OpenExchange {
                    stage: "open-exchange",
                    chat_id: begun.chat_id,
                    source,
                });
            }
        };

        let ExchangeStreamHandle { stream, worker } = opened;
        let worker = tokio::spawn(worker);
        let reader = tokio::spawn(run_reader(
            Arc::downgrade(inner),
            begun.chat_id.clone(),
            begun.handle,
            stream,
        ));
        let leftover = inner.state().attach_tasks(
            &begun.chat_id,
            begun.handle,
            StreamTasks { reader, worker },
        );
        if leftover.is_some() {
            tracing::debug!(
                "exchange {} on chat {} ended before its tasks were attached",
                begun.handle,
                begun.chat_id
            );
        }

        tracing::info!("opened exchange {} on chat {}", begun.handle, begun.chat_id);
        Ok(ExchangeTicket {
            chat_id: begun.chat_id,
            completion: begun.completion,
        })
    }

    /// Stops the active chat's exchange. Returns `false` when nothing was in flight.
    pub fn stop_stream(&self) -> bool {
        match self.active_chat() {
            Some(chat_id) => self.stop_stream_for(&chat_id),
            None => false,
        }
    }

    pub fn stop_stream_for(&self, chat_id: &ChatId) -> bool {
        self.cancel_exchange(chat_id, true)
    }

    /// Clears local state at once; the backend abandon and the refresh run in the background.
    fn cancel_exchange(&self, chat_id: &ChatId, refresh: bool) -> bool {
        let cancelled = {
            let mut state = self.inner.state();
            let cancelled = state.cancel_stream(chat_id);
            if cancelled.is_some() {
                self.inner.publish(&state);
            }
            cancelled
        };
        let Some(mut session) = cancelled else {
            tracing::debug!("no exchange to stop on chat {}", chat_id);
            return false;
        };

        if let Some(tasks) = session.take_tasks() {
            tasks.abort_reader();
        }
        session.finish(Ok(ExchangeOutcome::Cancelled));
        tracing::info!("stopped exchange {} on chat {}", session.handle, chat_id);

        let inner = Arc::clone(&self.inner);
        let chat_id = chat_id.clone();
        tokio::spawn(async move {
            if let Err(error) = inner
                .collaborators
                .transport
                .abandon_exchange(&chat_id)
                .await
            {
                inner.notify(Notification::new(
                    NotificationKind::AbandonFailed,
                    Some(chat_id.clone()),
                    error.to_string(),
                ));
            }
            if refresh && inner.settings().refresh_after_cancel {
                inner.refresh_in_place(&chat_id).await;
            }
        });
        true
    }

    pub async fn approve(
        &self,
        validation_id: &ValidationId,
        always_allow: bool,
    ) -> SessionResult<ValidationOutcome> {
        self.resolve(validation_id, Resolution::Approve { always_allow })
            .await
    }

    pub async fn reject(
        &self,
        validation_id: &ValidationId,
        reason: Option<String>,
    ) -> SessionResult<ValidationOutcome> {
        self.resolve(validation_id, Resolution::Reject { reason }).await
    }

    pub async fn feedback(
        &self,
        validation_id: &ValidationId,
        text: impl Into<String>,
    ) -> SessionResult<ValidationOutcome> {
        self.resolve(validation_id, Resolution::Feedback { text: text.into() })
            .await
    }

    /// Claims the request before calling the service so concurrent resolutions collide locally.
    async fn resolve(
        &self,
        validation_id: &ValidationId,
        resolution: Resolution,
    ) -> SessionResult<ValidationOutcome> {
        let inner = &self.inner;
        let claim = {
            let mut state = inner.state();
            let claim = state.begin_resolution(validation_id, resolution)?;
            inner.publish(&state);
            claim
        };
        tracing::debug!(
            "resolving validation {} on chat {} with {}",
            validation_id,
            claim.chat_id,
            claim.resolution.label()
        );

        let validations = &inner.collaborators.validations;
        let result = match &claim.resolution {
            Resolution::Approve { always_allow } => {
                validations.approve(validation_id, *always_allow).await
            }
            Resolution::Reject { reason } => validations.reject(validation_id, reason.clone()).await,
            Resolution::Feedback { text } => validations.feedback(validation_id, text.clone()).await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(source) => {
                {
                    let mut state = inner.state();
                    state.abort_resolution(&claim);
                    inner.publish(&state);
                }
                inner.notify(Notification::new(
                    NotificationKind::ValidationFailed,
                    Some(claim.chat_id.clone()),
                    source.to_string(),
                ));
                return Err(SessionError::ValidationService {
                    stage: "resolve-validation",
                    validation_id: validation_id.clone(),
                    source,
                });
            }
        };

        let auto_approve = inner.settings().auto_approve_standing;
        let effect = {
            let mut state = inner.state();
            let effect = state.complete_resolution(&claim, outcome, auto_approve);
            inner.publish(&state);
            effect
        };

        if let Some(next) = effect.auto_approve {
            spawn_auto_approve(inner, next);
        }
        if effect.finish_exchange {
            tracing::info!(
                "validation {} ended exchange {} on chat {}",
                validation_id,
                claim.handle,
                claim.chat_id
            );
            if let Some(tasks) = effect.finished_tasks {
                tasks.abort_reader();
            }
            inner.finish_completed(&claim.chat_id, claim.handle).await;
        }
        Ok(outcome)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Arc<SessionSettings> {
        self.settings.load_full()
    }

    fn publish(&self, state: &SessionState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn notify(&self, notification: Notification) {
        tracing::warn!(
            "{:?} on chat {:?}: {}",
            notification.kind,
            notification.chat_id,
            notification.message
        );
        let _ = self.notifications.send(notification);
    }

    /// A refresh superseded by a newer one for the same chat is dropped silently.
    async fn refresh_chat(&self, chat_id: &ChatId) -> SessionResult<()> {
        let generation = self.state().begin_refresh(chat_id);
        let messages = self
            .collaborators
            .persistence
            .list_messages(chat_id)
            .await
            .context(PersistenceRefreshSnafu {
                stage: "refresh-messages",
                chat_id: chat_id.clone(),
            })?;

        let mut state = self.state();
        if state.apply_refresh(chat_id, generation, messages) {
            self.publish(&state);
        } else {
            tracing::debug!("dropped stale refresh {:?} for chat {}", generation, chat_id);
        }
        Ok(())
    }

    /// Refresh whose failure is reported as a notification instead of an error.
    async fn refresh_in_place(&self, chat_id: &ChatId) {
        if let Err(error) = self.refresh_chat(chat_id).await {
            self.notify(Notification::new(
                NotificationKind::RefreshFailed,
                Some(chat_id.clone()),
                error.to_string(),
            ));
        }
    }

    async fn finish_completed(&self, chat_id: &ChatId, handle: StreamHandleId) {
        let mark = self.state().refresh_mark(chat_id);
        self.refresh_in_place(chat_id).await;

        // Durable only once a refresh issued after `done` has landed; a superseded one may not.
        let (finished, durable_refreshed) = {
            let mut state = self.state();
            let durable_refreshed = state.refreshed_since(chat_id, mark);
            let finished = state.complete_stream(chat_id, handle, durable_refreshed);
            self.publish(&state);
            (finished, durable_refreshed)
        };
        let Some(mut session) = finished else {
            tracing::debug!("exchange {} on chat {} was released early", handle, chat_id);
            return;
        };

        let (text, sources) = std::mem::take(&mut session.projection).into_parts();
        tracing::info!(
            "exchange {} on chat {} completed with {} chars",
            handle,
            chat_id,
            text.len()
        );
        session.finish(Ok(ExchangeOutcome::Completed {
            text,
            sources,
            durable_refreshed,
        }));
    }

    async fn finish_failed(
        &self,
        chat_id: &ChatId,
        handle: StreamHandleId,
        cause: ErrorCause,
        message: String,
    ) {
        let failed = {
            let mut state = self.state();
            let failed = state.fail_stream(chat_id, handle);
            self.publish(&state);
            failed
        };
        let Some(mut session) = failed else {
            return;
        };

        self.notify(Notification::new(
            NotificationKind::StreamFailed,
            Some(chat_id.clone()),
            format!("{cause}: {message}"),
        ));
        session.finish(Err(SessionError::StreamTransport {
            stage: "read-exchange",
            chat_id: chat_id.clone(),
            cause,
            message,
        }));
        self.refresh_in_place(chat_id).await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for mut session in state.drain_streams() {
            if let Some(tasks) = session.take_tasks() {
                tasks.abort_reader();
            }
        }
    }
}

fn spawn_auto_approve(inner: &Arc<Inner>, validation_id: ValidationId) {
    let controller = SessionController {
        inner: Arc::clone(inner),
    };
    tokio::spawn(async move {
        tracing::info!("auto-approving validation {} from a standing permission", validation_id);
        if let Err(error) = controller.approve(&validation_id, false).await {
            tracing::warn!("auto-approval of validation {} failed: {}", validation_id, error);
        }
    });
}

/// Drains one exchange stream into the session until a terminal event or until the handle is
/// no longer current.
async fn run_reader(
    weak: Weak<Inner>,
    chat_id: ChatId,
    handle: StreamHandleId,
    mut stream: ExchangeEventStream,
) {
    loop {
        let (paused, idle_timeout) = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(paused) = inner.state().reader_paused(&chat_id, handle) else {
                return;
            };
            (paused, inner.settings().idle_timeout())
        };

        // The idle window does not run while a validation is waiting on the user.
        let event = match tokio::time::timeout(idle_timeout, stream.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => ExchangeEvent::Error {
                cause: ErrorCause::ClosedEarly,
                message: "exchange stream closed before a terminal event".to_string(),
            },
            Err(_) if paused => continue,
            Err(_) => ExchangeEvent::Error {
                cause: ErrorCause::IdleTimeout,
                message: format!("no exchange event within {}ms", idle_timeout.as_millis()),
            },
        };

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let auto_approve = inner.settings().auto_approve_standing;
        let effect = {
            let mut state = inner.state();
            let effect = state.apply_event(&chat_id, handle, event, auto_approve);
            if effect.is_ok() {
                inner.publish(&state);
            }
            effect
        };

        match effect {
            Ok(EventEffect::Continue) => {}
            Ok(EventEffect::AutoApprove(validation_id)) => spawn_auto_approve(&inner, validation_id),
            Ok(EventEffect::Completed) => {
                drop(stream);
                inner.finish_completed(&chat_id, handle).await;
                return;
            }
            Ok(EventEffect::Failed { cause, message }) => {
                drop(stream);
                tracing::warn!(
                    "exchange {} on chat {} failed ({}): {}",
                    handle,
                    chat_id,
                    cause,
                    message
                );
                inner.finish_failed(&chat_id, handle, cause, message).await;
                return;
            }
            Err(error) => {
                tracing::debug!("reader for exchange {} stopping: {}", handle, error);
                return;
            }
        }
    }
}
