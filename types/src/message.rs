//! Conversation message domain model.
//!
//! Messages are immutable once created. The token cost is computed by the
//! caller (see `relay_context::TokenEstimator`) and frozen into the message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat-completion APIs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    role: Role,
    content: String,
    token_cost: u32,
}

impl ConversationMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>, token_cost: u32) -> Self {
        Self {
            role,
            content: content.into(),
            token_cost,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>, token_cost: u32) -> Self {
        Self::new(Role::User, content, token_cost)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>, token_cost: u32) -> Self {
        Self::new(Role::Assistant, content, token_cost)
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub const fn token_cost(&self) -> u32 {
        self.token_cost
    }
}
