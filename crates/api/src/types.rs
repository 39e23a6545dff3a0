use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ChatId, MessageId, ValidationId};

/// Default chat title used when the backend returns an empty one.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "created_at")]
    pub created_at_unix_seconds: u64,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl Chat {
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            DEFAULT_CHAT_TITLE
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    #[serde(rename = "created_at")]
    pub created_at_unix_seconds: u64,
}

impl Message {
    /// Builds a client-side message carrying a temporary id.
    pub fn temporary(chat_id: ChatId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::temporary(),
            chat_id,
            role,
            content: content.into(),
            created_at_unix_seconds: unix_timestamp_seconds(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }
}

/// Citation record attached to an assistant response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

/// Tool invocation the backend wants a human to approve before running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub id: ValidationId,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub chat_id: ChatId,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

/// Answer from the validation service after a resolving call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub stream_active: bool,
}

/// Parameters for opening one streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeRequest {
    #[serde(skip)]
    pub chat_id: ChatId,
    pub content: String,
    pub model_id: String,
    pub agent_id: Option<AgentId>,
}

impl ExchangeRequest {
    pub fn new(
        chat_id: ChatId,
        content: impl Into<String>,
        model_id: impl Into<String>,
        agent_id: Option<AgentId>,
    ) -> Self {
        Self {
            chat_id,
            content: content.into(),
            model_id: model_id.into(),
            agent_id,
        }
    }
}

pub fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
