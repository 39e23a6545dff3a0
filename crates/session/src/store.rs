use std::collections::HashMap;

use parley_api::{ChatId, Message, Role};

/// Monotonic token for one refresh request; only the newest one may land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshGeneration(u64);

#[derive(Debug, Default)]
struct ChatHistory {
    durable: Vec<Message>,
    /// Provisional turns kept after a finished exchange whose refresh failed.
    unconfirmed: Vec<Message>,
    started: u64,
    applied: u64,
}

/// Per-chat durable history as last reported by persistence.
#[derive(Debug, Default)]
pub struct MessageStore {
    chats: HashMap<ChatId, ChatHistory>,
}

impl MessageStore {
    pub fn durable(&self, chat_id: &ChatId) -> &[Message] {
        self.chats
            .get(chat_id)
            .map(|history| history.durable.as_slice())
            .unwrap_or_default()
    }

    pub fn unconfirmed(&self, chat_id: &ChatId) -> &[Message] {
        self.chats
            .get(chat_id)
            .map(|history| history.unconfirmed.as_slice())
            .unwrap_or_default()
    }

    /// Newest refresh started for the chat so far.
    pub fn latest_refresh(&self, chat_id: &ChatId) -> RefreshGeneration {
        RefreshGeneration(self.chats.get(chat_id).map_or(0, |history| history.started))
    }

    /// Whether a refresh started after `mark` has landed.
    pub fn refreshed_since(&self, chat_id: &ChatId, mark: RefreshGeneration) -> bool {
        self.chats
            .get(chat_id)
            .is_some_and(|history| history.applied > mark.0)
    }

    pub fn begin_refresh(&mut self, chat_id: &ChatId) -> RefreshGeneration {
        let history = self.chats.entry(chat_id.clone()).or_default();
        history.started += 1;
        RefreshGeneration(history.started)
    }

    /// Replaces the durable list; refused when a newer refresh has started since.
    pub fn apply_refresh(
        &mut self,
        chat_id: &ChatId,
        generation: RefreshGeneration,
        mut messages: Vec<Message>,
    ) -> bool {
        let history = self.chats.entry(chat_id.clone()).or_default();
        if generation.0 < history.started {
            tracing::debug!(
                "discarding superseded refresh {} for chat {} (latest {})",
                generation.0,
                chat_id,
                history.started
            );
            return false;
        }

        messages.sort_by_key(|message| message.created_at_unix_seconds);
        history.durable = messages;
        history.unconfirmed.clear();
        history.applied = generation.0;
        true
    }

    pub fn push_unconfirmed(&mut self, chat_id: &ChatId, messages: impl IntoIterator<Item = Message>) {
        self.chats
            .entry(chat_id.clone())
            .or_default()
            .unconfirmed
            .extend(messages);
    }

    pub fn forget(&mut self, chat_id: &ChatId) {
        self.chats.remove(chat_id);
    }

    /// Rendered history: durable, then unconfirmed turns, then the optimistic message unless a
    /// durable user message already carries the same content.
    pub fn merged(&self, chat_id: &ChatId, optimistic: Option<&Message>) -> Vec<Message> {
        let durable = self.durable(chat_id);
        let unconfirmed = self.unconfirmed(chat_id);

        let mut merged = Vec::with_capacity(durable.len() + unconfirmed.len() + 1);
        merged.extend_from_slice(durable);
        merged.extend_from_slice(unconfirmed);

        if let Some(optimistic) = optimistic {
            let echoed = durable
                .iter()
                .any(|message| message.role == Role::User && message.content == optimistic.content);
            if !echoed {
                merged.push(optimistic.clone());
            }
        }
        merged
    }
}
