use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used when rendering client-side temporary message ids.
pub const TEMPORARY_ID_PREFIX: &str = "temp-";

// Macro keeps all backend-issued ID wrappers structurally identical.
macro_rules! define_backend_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

define_backend_id!(ChatId);
define_backend_id!(AgentId);
define_backend_id!(ValidationId);

/// Message identifier.
///
/// Backend payloads can only ever produce `Durable` ids; `Temporary` ids are minted
/// on the client for optimistic rows and never collide with backend ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageId {
    Durable(String),
    Temporary(Uuid),
}

impl MessageId {
    pub fn durable(raw: impl Into<String>) -> Self {
        Self::Durable(raw.into())
    }

    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable(raw) => formatter.write_str(raw),
            Self::Temporary(raw) => write!(formatter, "{TEMPORARY_ID_PREFIX}{raw}"),
        }
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::Durable(value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_payload_never_yields_temporary_id() {
        let raw = format!("\"{TEMPORARY_ID_PREFIX}{}\"", Uuid::new_v4());
        let parsed: MessageId = serde_json::from_str(&raw).expect("message id should parse");
        assert!(!parsed.is_temporary());
    }

    #[test]
    fn temporary_ids_render_with_prefix_and_are_unique() {
        let first = MessageId::temporary();
        let second = MessageId::temporary();

        assert!(first.is_temporary());
        assert!(first.to_string().starts_with(TEMPORARY_ID_PREFIX));
        assert_ne!(first, second);
    }

    #[test]
    fn chat_id_serializes_transparently() {
        let chat_id = ChatId::new("chat-1");
        assert_eq!(
            serde_json::to_string(&chat_id).expect("serialize"),
            "\"chat-1\""
        );
    }
}
