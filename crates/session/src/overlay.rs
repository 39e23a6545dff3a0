use std::collections::HashMap;

use parley_api::{ChatId, Message, MessageId, Role};

/// Client-side lifecycle of the message a user just submitted in one chat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OverlayEntry {
    #[default]
    Absent,
    /// Shown in place of the durable user message that has not been seen yet.
    Pending(Message),
    /// A durable refresh produced the counterpart; the entry no longer renders.
    Reconciled { durable_id: MessageId },
}

static ABSENT: OverlayEntry = OverlayEntry::Absent;

/// At most one optimistic user message per chat.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    entries: HashMap<ChatId, OverlayEntry>,
}

impl OptimisticOverlay {
    pub fn entry(&self, chat_id: &ChatId) -> &OverlayEntry {
        self.entries.get(chat_id).unwrap_or(&ABSENT)
    }

    pub fn pending(&self, chat_id: &ChatId) -> Option<&Message> {
        match self.entry(chat_id) {
            OverlayEntry::Pending(message) => Some(message),
            _ => None,
        }
    }

    /// Stages a temporary user message; refused while another one is still pending.
    pub fn stage(&mut self, chat_id: &ChatId, content: &str) -> Option<Message> {
        if self.pending(chat_id).is_some() {
            return None;
        }
        let message = Message::temporary(chat_id.clone(), Role::User, content);
        self.entries
            .insert(chat_id.clone(), OverlayEntry::Pending(message.clone()));
        Some(message)
    }

    /// Marks the pending entry reconciled when `durable` holds a user message with equal content.
    pub fn reconcile(&mut self, chat_id: &ChatId, durable: &[Message]) -> bool {
        let Some(pending) = self.pending(chat_id) else {
            return false;
        };
        let Some(counterpart) = durable
            .iter()
            .rev()
            .find(|message| message.role == Role::User && message.content == pending.content)
        else {
            return false;
        };

        let durable_id = counterpart.id.clone();
        self.entries
            .insert(chat_id.clone(), OverlayEntry::Reconciled { durable_id });
        true
    }

    /// Returns the entry to absent, handing back the message if it was still pending.
    pub fn clear(&mut self, chat_id: &ChatId) -> Option<Message> {
        match self.entries.remove(chat_id) {
            Some(OverlayEntry::Pending(message)) => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durable_user(chat_id: &ChatId, id: &str, content: &str) -> Message {
        Message {
            id: MessageId::durable(id),
            chat_id: chat_id.clone(),
            role: Role::User,
            content: content.to_string(),
            created_at_unix_seconds: 10,
        }
    }

    #[test]
    fn absent_until_staged() {
        let overlay = OptimisticOverlay::default();
        let chat = ChatId::new("chat-1");

        assert_eq!(overlay.entry(&chat), &OverlayEntry::Absent);
        assert!(overlay.pending(&chat).is_none());
    }

    #[test]
    fn second_stage_is_refused_while_pending() {
        let mut overlay = OptimisticOverlay::default();
        let chat = ChatId::new("chat-1");

        let staged = overlay.stage(&chat, "Hello").expect("first stage");
        assert!(staged.is_temporary());
        assert!(overlay.stage(&chat, "Again").is_none());
        assert_eq!(overlay.pending(&chat), Some(&staged));
    }

    #[test]
    fn chats_hold_independent_entries() {
        let mut overlay = OptimisticOverlay::default();
        let first = ChatId::new("chat-1");
        let second = ChatId::new("chat-2");

        overlay.stage(&first, "one").expect("stage first");
        overlay.stage(&second, "two").expect("stage second");
        overlay.clear(&first);

        assert!(overlay.pending(&first).is_none());
        assert_eq!(
            overlay.pending(&second).map(|message| message.content.as_str()),
            Some("two")
        );
    }

    #[test]
    fn reconcile_requires_matching_user_content() {
        let mut overlay = OptimisticOverlay::default();
        let chat = ChatId::new("chat-1");
        overlay.stage(&chat, "Hello").expect("stage");

        assert!(!overlay.reconcile(&chat, &[durable_user(&chat, "m1", "Other")]));
        assert!(overlay.pending(&chat).is_some());

        assert!(overlay.reconcile(&chat, &[durable_user(&chat, "m2", "Hello")]));
        assert_eq!(
            overlay.entry(&chat),
            &OverlayEntry::Reconciled {
                durable_id: MessageId::durable("m2"),
            }
        );
        assert!(overlay.pending(&chat).is_none());
    }

    #[test]
    fn clear_returns_pending_message_only() {
        let mut overlay = OptimisticOverlay::default();
        let chat = ChatId::new("chat-1");
        overlay.stage(&chat, "Hello").expect("stage");

        assert_eq!(
            overlay.clear(&chat).map(|message| message.content),
            Some("Hello".to_string())
        );
        assert_eq!(overlay.entry(&chat), &OverlayEntry::Absent);
        assert!(overlay.clear(&chat).is_none());
    }
}
