use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use parley_api::{
    AgentId, Chat, ChatId, ErrorCause, ExchangeEvent, Message, Role, ValidationId,
    ValidationOutcome, ValidationRequest,
};
use snafu::{OptionExt, ensure};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::controller::ExchangeOutcome;
use crate::error::{
    ConflictReason, EmptyContentSnafu, NoActiveChatSnafu, SessionError, SessionResult,
    StreamAlreadyActiveSnafu,
};
use crate::gate::{GateRejection, Resolution, ValidationGate};
use crate::overlay::OptimisticOverlay;
use crate::snapshot::{SessionSnapshot, StreamView};
use crate::store::{MessageStore, RefreshGeneration};
use crate::stream::{ReaderStep, StreamHandleId, StreamPhase, StreamProjection};

/// Resolved validation ids remembered to tell `AlreadyResolved` from `NotPending`.
const RESOLVED_MEMORY: usize = 256;
/// Deleted chats remembered so refreshes still in flight for them are dropped.
const DELETED_MEMORY: usize = 64;

pub(crate) type CompletionSender = oneshot::Sender<SessionResult<ExchangeOutcome>>;
pub(crate) type CompletionReceiver = oneshot::Receiver<SessionResult<ExchangeOutcome>>;

pub(crate) struct StreamTasks {
    pub reader: JoinHandle<()>,
    pub worker: JoinHandle<()>,
}

impl StreamTasks {
    /// Stops reading; the dropped event stream signals the worker to wind down on its own.
    pub fn abort_reader(self) {
        self.reader.abort();
        drop(self.worker);
    }
}

pub(crate) struct StreamSession {
    pub handle: StreamHandleId,
    pub agent_id: AgentId,
    /// Set when this send bound the agent to a chat that had none.
    bound_agent: bool,
    pub phase: StreamPhase,
    pub projection: StreamProjection,
    pub gate: ValidationGate,
    completion: Option<CompletionSender>,
    tasks: Option<StreamTasks>,
}

impl StreamSession {
    fn new(handle: StreamHandleId, agent_id: AgentId, completion: CompletionSender) -> Self {
        Self {
            handle,
            agent_id,
            bound_agent: false,
            phase: StreamPhase::Streaming,
            projection: StreamProjection::default(),
            gate: ValidationGate::default(),
            completion: Some(completion),
            tasks: None,
        }
    }

    pub fn take_tasks(&mut self) -> Option<StreamTasks> {
        self.tasks.take()
    }

    /// Resolves the ticket handed out by `send_message`; later calls are no-ops.
    pub fn finish(&mut self, result: SessionResult<ExchangeOutcome>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }

    fn view(&self) -> StreamView {
        StreamView {
            handle: self.handle,
            phase: self.phase,
            text: self.projection.text().to_string(),
            sources: self.projection.sources().to_vec(),
            paused: self.projection.is_paused(),
            pending_validation: self.gate.current().cloned(),
            resolving: self.gate.is_resolving(),
            queued_validations: self.gate.queued_len(),
        }
    }

    fn sync_pause(&mut self) {
        self.projection.set_paused(self.gate.is_blocking());
    }
}

pub(crate) struct BegunSend {
    pub chat_id: ChatId,
    pub handle: StreamHandleId,
    pub agent_id: AgentId,
    pub completion: CompletionReceiver,
}

pub(crate) enum EventEffect {
    Continue,
    AutoApprove(ValidationId),
    Completed,
    Failed { cause: ErrorCause, message: String },
}

/// Exclusive right to call the validation service for one request.
#[derive(Debug, Clone)]
pub(crate) struct ResolutionClaim {
    pub chat_id: ChatId,
    pub handle: StreamHandleId,
    pub validation_id: ValidationId,
    pub agent_id: AgentId,
    pub tool_name: String,
    pub resolution: Resolution,
}

#[derive(Default)]
pub(crate) struct ResolutionEffect {
    pub auto_approve: Option<ValidationId>,
    /// Set when the service reported the exchange over; the reader must be stopped.
    pub finish_exchange: bool,
    pub finished_tasks: Option<StreamTasks>,
}

/// Insertion-ordered set that forgets its oldest entries past `CAPACITY`.
#[derive(Debug)]
struct RecentSet<T, const CAPACITY: usize> {
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T, const CAPACITY: usize> Default for RecentSet<T, CAPACITY> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<T: Clone + Eq + Hash, const CAPACITY: usize> RecentSet<T, CAPACITY> {
    fn insert(&mut self, value: T) {
        if !self.members.insert(value.clone()) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, value: &T) {
        if self.members.remove(value) {
            self.order.retain(|known| known != value);
        }
    }

    fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }
}

/// Synchronous session state; every transition runs under the controller's lock.
#[derive(Default)]
pub(crate) struct SessionState {
    active_chat: Option<ChatId>,
    chats: Vec<Chat>,
    store: MessageStore,
    overlay: OptimisticOverlay,
    streams: HashMap<ChatId, StreamSession>,
    resolved: RecentSet<ValidationId, RESOLVED_MEMORY>,
    standing: HashSet<(AgentId, String)>,
    deleted: RecentSet<ChatId, DELETED_MEMORY>,
    next_handle: u64,
}

impl SessionState {
    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active_chat.as_ref()
    }

    pub fn set_active_chat(&mut self, chat_id: Option<ChatId>) {
        self.active_chat = chat_id;
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn replace_chats(&mut self, chats: Vec<Chat>) {
        for chat in &chats {
            self.deleted.remove(&chat.id);
        }
        self.chats = chats;
        self.sort_chats();
    }

    pub fn insert_chat(&mut self, chat: Chat) {
        self.deleted.remove(&chat.id);
        self.chats.retain(|known| known.id != chat.id);
        self.chats.push(chat);
        self.sort_chats();
    }

    fn sort_chats(&mut self) {
        self.chats
            .sort_by(|a, b| b.created_at_unix_seconds.cmp(&a.created_at_unix_seconds));
    }

    pub fn remove_chat(&mut self, chat_id: &ChatId) {
        self.chats.retain(|chat| &chat.id != chat_id);
        self.store.forget(chat_id);
        self.overlay.clear(chat_id);
        self.deleted.insert(chat_id.clone());
        if self.active_chat.as_ref() == Some(chat_id) {
            self.active_chat = None;
        }
    }

    pub fn is_streaming(&self, chat_id: &ChatId) -> bool {
        self.streams.contains_key(chat_id)
    }

    pub fn begin_send(
        &mut self,
        content: &str,
        agent_id: Option<AgentId>,
    ) -> SessionResult<BegunSend> {
        let stage = "begin-send";
        ensure!(!content.trim().is_empty(), EmptyContentSnafu { stage });
        let chat_id = self
            .active_chat
            .clone()
            .context(NoActiveChatSnafu { stage })?;
        ensure!(
            !self.streams.contains_key(&chat_id),
            StreamAlreadyActiveSnafu {
                stage,
                chat_id: chat_id.clone(),
            }
        );

        let chat = self.chats.iter_mut().find(|chat| chat.id == chat_id);
        let chat_agent = chat.as_ref().and_then(|chat| chat.agent_id.clone());
        let agent_id = agent_id
            .or(chat_agent)
            .ok_or_else(|| SessionError::agent_unbound(stage, &chat_id))?;

        self.overlay
            .stage(&chat_id, content)
            .context(StreamAlreadyActiveSnafu {
                stage,
                chat_id: chat_id.clone(),
            })?;

        let mut bound_agent = false;
        if let Some(chat) = chat
            && chat.agent_id.is_none()
        {
            chat.agent_id = Some(agent_id.clone());
            bound_agent = true;
        }

        self.next_handle += 1;
        let handle = StreamHandleId::new(self.next_handle);
        let (completion_tx, completion_rx) = oneshot::channel();
        let mut session = StreamSession::new(handle, agent_id.clone(), completion_tx);
        session.bound_agent = bound_agent;
        self.streams.insert(chat_id.clone(), session);

        Ok(BegunSend {
            chat_id,
            handle,
            agent_id,
            completion: completion_rx,
        })
    }

    /// Rolls back a send whose exchange never opened, including an agent binding it made.
    pub fn abandon_send(&mut self, chat_id: &ChatId, handle: StreamHandleId) {
        if self.current(chat_id, handle).is_none() {
            return;
        }
        let Some(session) = self.streams.remove(chat_id) else {
            return;
        };
        self.overlay.clear(chat_id);
        if session.bound_agent
            && let Some(chat) = self.chats.iter_mut().find(|chat| &chat.id == chat_id)
        {
            chat.agent_id = None;
        }
    }

    /// Hands the tasks back when the exchange already ended before they could be attached.
    pub fn attach_tasks(
        &mut self,
        chat_id: &ChatId,
        handle: StreamHandleId,
        tasks: StreamTasks,
    ) -> Option<StreamTasks> {
        match self.streams.get_mut(chat_id) {
            Some(session) if session.handle == handle => {
                session.tasks = Some(tasks);
                None
            }
            _ => Some(tasks),
        }
    }

    fn current(&self, chat_id: &ChatId, handle: StreamHandleId) -> Option<&StreamSession> {
        self.streams
            .get(chat_id)
            .filter(|session| session.handle == handle)
    }

    fn current_in<'a>(
        streams: &'a mut HashMap<ChatId, StreamSession>,
        chat_id: &ChatId,
        handle: StreamHandleId,
        stage: &'static str,
    ) -> SessionResult<&'a mut StreamSession> {
        match streams.get_mut(chat_id) {
            Some(session) if session.handle == handle => Ok(session),
            _ => Err(SessionError::StaleHandle {
                stage,
                chat_id: chat_id.clone(),
                handle,
            }),
        }
    }

    /// Whether the reader for `handle` should keep going, and if so whether it is paused.
    pub fn reader_paused(&self, chat_id: &ChatId, handle: StreamHandleId) -> Option<bool> {
        self.current(chat_id, handle)
            .filter(|session| session.phase == StreamPhase::Streaming)
            .map(|session| session.projection.is_paused())
    }

    pub fn apply_event(
        &mut self,
        chat_id: &ChatId,
        handle: StreamHandleId,
        event: ExchangeEvent,
        auto_approve: bool,
    ) -> SessionResult<EventEffect> {
        let stage = "apply-exchange-event";
        let session = Self::current_in(&mut self.streams, chat_id, handle, stage)?;
        if session.phase != StreamPhase::Streaming {
            return Err(SessionError::StaleHandle {
                stage,
                chat_id: chat_id.clone(),
                handle,
            });
        }

        match session.projection.apply(event) {
            ReaderStep::Continue => Ok(EventEffect::Continue),
            ReaderStep::ValidationRequested(request) => {
                let surfaced = session.gate.request(request.clone());
                session.sync_pause();
                tracing::debug!(
                    "validation {} for tool {} on chat {} (surfaced: {})",
                    request.id,
                    request.tool_name,
                    chat_id,
                    surfaced
                );
                Ok(Self::auto_approval(
                    &self.standing,
                    auto_approve && surfaced,
                    &session.agent_id,
                    Some(&request),
                ))
            }
            ReaderStep::ValidationResolved(validation_id) => {
                self.resolved.insert(validation_id.clone());
                let promoted = session.gate.resolved_remotely(&validation_id);
                session.sync_pause();
                Ok(Self::auto_approval(
                    &self.standing,
                    auto_approve,
                    &session.agent_id,
                    promoted.as_ref(),
                ))
            }
            ReaderStep::Completed => {
                session.phase = StreamPhase::Finalizing;
                Ok(EventEffect::Completed)
            }
            ReaderStep::Failed { cause, message } => Ok(EventEffect::Failed { cause, message }),
        }
    }

    fn auto_approval(
        standing: &HashSet<(AgentId, String)>,
        enabled: bool,
        session_agent: &AgentId,
        request: Option<&ValidationRequest>,
    ) -> EventEffect {
        let Some(request) = request.filter(|_| enabled) else {
            return EventEffect::Continue;
        };
        let agent_id = request.agent_id.as_ref().unwrap_or(session_agent);
        if standing.contains(&(agent_id.clone(), request.tool_name.clone())) {
            EventEffect::AutoApprove(request.id.clone())
        } else {
            EventEffect::Continue
        }
    }

    /// Deleted chats get no history entry back; their refresh is dropped on arrival.
    pub fn begin_refresh(&mut self, chat_id: &ChatId) -> RefreshGeneration {
        if self.deleted.contains(chat_id) {
            return self.store.latest_refresh(chat_id);
        }
        self.store.begin_refresh(chat_id)
    }

    /// Marks the point after which a landed refresh counts as confirming an exchange.
    pub fn refresh_mark(&self, chat_id: &ChatId) -> RefreshGeneration {
        self.store.latest_refresh(chat_id)
    }

    pub fn refreshed_since(&self, chat_id: &ChatId, mark: RefreshGeneration) -> bool {
        self.store.refreshed_since(chat_id, mark)
    }

    pub fn apply_refresh(
        &mut self,
        chat_id: &ChatId,
        generation: RefreshGeneration,
        messages: Vec<Message>,
    ) -> bool {
        if self.deleted.contains(chat_id) {
            return false;
        }
        if !self.store.apply_refresh(chat_id, generation, messages) {
            return false;
        }
        self.overlay.reconcile(chat_id, self.store.durable(chat_id));
        true
    }

    /// Releases a finished exchange; provisional turns stay visible if the refresh failed.
    pub fn complete_stream(
        &mut self,
        chat_id: &ChatId,
        handle: StreamHandleId,
        durable_refreshed: bool,
    ) -> Option<StreamSession> {
        self.current(chat_id, handle)?;
        let session = self.streams.remove(chat_id)?;
        let optimistic = self.overlay.clear(chat_id);

        if !durable_refreshed && !self.deleted.contains(chat_id) {
            let assistant_text = session.projection.text();
            let assistant = (!assistant_text.is_empty()).then(|| {
                Message::temporary(chat_id.clone(), Role::Assistant, assistant_text)
            });
            self.store
                .push_unconfirmed(chat_id, optimistic.into_iter().chain(assistant));
        }
        Some(session)
    }

    pub fn fail_stream(&mut self, chat_id: &ChatId, handle: StreamHandleId) -> Option<StreamSession> {
        self.current(chat_id, handle)?;
        self.overlay.clear(chat_id);
        self.streams.remove(chat_id)
    }

    pub fn cancel_stream(&mut self, chat_id: &ChatId) -> Option<StreamSession> {
        let session = self.streams.remove(chat_id)?;
        self.overlay.clear(chat_id);
        Some(session)
    }

    pub fn drain_streams(&mut self) -> Vec<StreamSession> {
        self.overlay = OptimisticOverlay::default();
        self.streams.drain().map(|(_, session)| session).collect()
    }

    pub fn begin_resolution(
        &mut self,
        validation_id: &ValidationId,
        resolution: Resolution,
    ) -> SessionResult<ResolutionClaim> {
        let stage = "begin-resolution";
        let conflict = |reason| SessionError::ValidationConflict { stage, reason };

        let Some((chat_id, session)) = self
            .streams
            .iter_mut()
            .find(|(_, session)| session.gate.contains(validation_id))
        else {
            let validation_id = validation_id.clone();
            return Err(conflict(if self.resolved.contains(&validation_id) {
                ConflictReason::AlreadyResolved { validation_id }
            } else {
                ConflictReason::NotPending { validation_id }
            }));
        };

        match session.gate.begin(validation_id, resolution.clone()) {
            Ok(request) => {
                let agent_id = request.agent_id.unwrap_or_else(|| session.agent_id.clone());
                Ok(ResolutionClaim {
                    chat_id: chat_id.clone(),
                    handle: session.handle,
                    validation_id: validation_id.clone(),
                    agent_id,
                    tool_name: request.tool_name,
                    resolution,
                })
            }
            Err(GateRejection::AlreadyResolving) => Err(conflict(ConflictReason::AlreadyResolved {
                validation_id: validation_id.clone(),
            })),
            Err(GateRejection::NotPending) => Err(conflict(ConflictReason::NotPending {
                validation_id: validation_id.clone(),
            })),
        }
    }

    pub fn complete_resolution(
        &mut self,
        claim: &ResolutionClaim,
        outcome: ValidationOutcome,
        auto_approve: bool,
    ) -> ResolutionEffect {
        self.resolved.insert(claim.validation_id.clone());
        if matches!(claim.resolution, Resolution::Approve { always_allow: true }) {
            self.standing
                .insert((claim.agent_id.clone(), claim.tool_name.clone()));
        }

        let Some(session) = self
            .streams
            .get_mut(&claim.chat_id)
            .filter(|session| session.handle == claim.handle)
        else {
            return ResolutionEffect::default();
        };

        let promoted = session.gate.complete(&claim.validation_id);
        session.sync_pause();

        if !outcome.stream_active && session.phase == StreamPhase::Streaming {
            session.phase = StreamPhase::Finalizing;
            session.projection.set_paused(false);
            return ResolutionEffect {
                auto_approve: None,
                finish_exchange: true,
                finished_tasks: session.take_tasks(),
            };
        }

        let auto_approve = match Self::auto_approval(
            &self.standing,
            auto_approve,
            &session.agent_id,
            promoted.as_ref(),
        ) {
            EventEffect::AutoApprove(validation_id) => Some(validation_id),
            _ => None,
        };
        ResolutionEffect {
            auto_approve,
            ..ResolutionEffect::default()
        }
    }

    pub fn abort_resolution(&mut self, claim: &ResolutionClaim) -> bool {
        match self.streams.get_mut(&claim.chat_id) {
            Some(session) if session.handle == claim.handle => {
                let aborted = session.gate.abort(&claim.validation_id);
                session.sync_pause();
                aborted
            }
            _ => false,
        }
    }

    pub fn render_messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.store.merged(chat_id, self.overlay.pending(chat_id))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let stream = self
            .active_chat
            .as_ref()
            .and_then(|chat_id| self.streams.get(chat_id))
            .map(StreamSession::view);
        let mut streaming_chats = self.streams.keys().cloned().collect::<Vec<_>>();
        streaming_chats.sort();

        SessionSnapshot {
            active_chat: self.active_chat.clone(),
            chats: self.chats.clone(),
            messages: self
                .active_chat
                .as_ref()
                .map(|chat_id| self.render_messages(chat_id))
                .unwrap_or_default(),
            is_sending: stream.is_some(),
            stream,
            streaming_chats,
        }
    }
}
