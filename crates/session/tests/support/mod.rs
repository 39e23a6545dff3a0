#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_api::{AgentId, Chat};
use parley_mock::MockBackend;
use parley_session::{SessionController, SessionSettings, SessionSnapshot};

pub const AGENT: &str = "agent-1";
pub const MODEL: &str = "model-small";

pub struct Harness {
    pub backend: MockBackend,
    pub controller: SessionController,
    pub chat: Chat,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(SessionSettings::default()).await
    }

    pub async fn with_settings(settings: SessionSettings) -> Self {
        Self::build(settings, Some(AgentId::new(AGENT))).await
    }

    pub async fn without_agent() -> Self {
        Self::build(SessionSettings::default(), None).await
    }

    async fn build(settings: SessionSettings, agent_id: Option<AgentId>) -> Self {
        let backend = MockBackend::new();
        let chat = backend.seed_chat("Research", agent_id);
        let controller = SessionController::new(Arc::new(backend.clone()), settings);
        controller.refresh_chats().await.expect("list chats");
        controller
            .set_active_chat(Some(chat.id.clone()))
            .await
            .expect("activate chat");
        Self {
            backend,
            controller,
            chat,
        }
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut snapshots = self.controller.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| predicate(s)))
            .await
            .expect("snapshot condition timed out")
            .expect("controller dropped")
            .clone();
        snapshot
    }
}

/// Polls `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition timed out");
}

pub fn stream_text(snapshot: &SessionSnapshot) -> Option<&str> {
    snapshot.stream.as_ref().map(|stream| stream.text.as_str())
}

pub fn contents(snapshot: &SessionSnapshot) -> Vec<(&str, bool)> {
    snapshot
        .messages
        .iter()
        .map(|message| (message.content.as_str(), message.is_temporary()))
        .collect()
}
