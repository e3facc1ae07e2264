//! Chat-model transport for tabletalk.
//!
//! Design constraints:
//! - The agent core must work in restricted environments (tests, demos) with
//!   no network, so the transport is a small trait with an in-process mock.
//! - Real backends are optional and pluggable (Ollama by default for local
//!   models; OpenAI and Anthropic behind the same trait).
//! - Every call carries a hard wall-clock timeout. An unbounded model call is
//!   never permitted.
//!
//! The model is **untrusted**: it produces candidate proposals; the agent
//! validates and executes them.

use serde::{Deserialize, Serialize};

pub mod backends;

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no chat backend configured: {0}")]
    NotConfigured(String),
}

/// A synchronous chat transport: a full list of role/content messages in,
/// one complete text response out.
pub trait ChatClient: Send + Sync {
    fn chat(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError>;
}

/// Deterministic scripted client for tests and offline demos: returns its
/// queued responses in order, one per call.
pub struct MockChat {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl MockChat {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("mock chat lock poisoned")
            .push_back(response.into());
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("mock chat lock poisoned").len()
    }
}

impl ChatClient for MockChat {
    fn chat(&self, _messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
        self.responses
            .lock()
            .expect("mock chat lock poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::Api("mock chat has no scripted responses left".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_chat_replays_in_order() {
        let mock = MockChat::new(vec!["one".to_string(), "two".to_string()]);
        let msgs = [Message::user("q")];
        assert_eq!(mock.chat(&msgs, 0.0).unwrap(), "one");
        assert_eq!(mock.chat(&msgs, 0.0).unwrap(), "two");
        assert!(mock.chat(&msgs, 0.0).is_err());
    }

    #[test]
    fn roles_serialize_lowercase() {
        let m = Message::system("hi");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "system");
    }
}
