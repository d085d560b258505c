//! Per-user conversation history.

use serde::{Deserialize, Serialize};

use crate::error::ConversationError;
use crate::models::{ChatMessage, Role};

/// How assistant turns are folded into the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPolicy {
    /// Every turn is appended; the history only grows.
    #[default]
    Full,
    /// Each assistant turn replaces the whole history with just that turn.
    Compacted,
}

impl std::fmt::Display for HistoryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryPolicy::Full => write!(f, "full"),
            HistoryPolicy::Compacted => write!(f, "compacted"),
        }
    }
}

/// Role-tagged message history of one simulated user.
///
/// Roles strictly alternate: a user turn never follows a user turn and an
/// assistant turn never follows an assistant turn.
#[derive(Debug, Clone)]
pub struct ConversationState {
    policy: HistoryPolicy,
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new(policy: HistoryPolicy) -> Self {
        Self {
            policy,
            messages: Vec::new(),
        }
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    /// Append a user query. Follow-up queries carry the `user` name tag.
    pub fn on_user_query(&mut self, query: impl Into<String>) -> Result<(), ConversationError> {
        match self.last_role() {
            None => {
                self.messages.push(ChatMessage::user(query));
                Ok(())
            }
            Some(Role::Assistant) => {
                self.messages.push(ChatMessage::user(query).with_name("user"));
                Ok(())
            }
            previous => Err(ConversationError::RoleOrder {
                previous,
                found: Role::User,
            }),
        }
    }

    /// Fold an assistant answer in under the active policy.
    pub fn on_assistant_response(
        &mut self,
        response: impl Into<String>,
        agent_index: usize,
    ) -> Result<(), ConversationError> {
        let previous = self.last_role();
        if previous != Some(Role::User) {
            return Err(ConversationError::RoleOrder {
                previous,
                found: Role::Assistant,
            });
        }

        if self.policy == HistoryPolicy::Compacted {
            self.messages.clear();
        }
        self.messages
            .push(ChatMessage::assistant(response).with_name(format!("agent{}", agent_index)));
        Ok(())
    }

    /// Drop a trailing user query whose request never completed.
    ///
    /// Returns whether a message was removed.
    pub fn abandon_pending_query(&mut self) -> bool {
        if self.last_role() == Some(Role::User) {
            self.messages.pop();
            return true;
        }
        false
    }

    /// Messages to send with the next request.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }
}

/// Whether a message list alternates roles strictly.
pub fn roles_alternate(messages: &[ChatMessage]) -> bool {
    messages.windows(2).all(|pair| pair[0].role != pair[1].role)
}
