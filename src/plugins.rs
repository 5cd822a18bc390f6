//! Hooks that run around a conversation's send cycle.
//!
//! A plugin implements only the hooks it cares about; the defaults do nothing
//! and let the send proceed.
use serde_json::{json, Map};

use crate::models::conversation::Conversation;
use crate::models::message::Role;

/// What a pre-send hook asks the conversation to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Do not call the vendor this turn.
    Skip,
}

pub trait Plugin: Send {
    /// Runs before the provider is resolved, with full access to the history.
    fn pre_send_hook(&mut self, _conversation: &mut Conversation) -> HookAction {
        HookAction::Continue
    }

    /// Runs after the assistant reply has been appended.
    fn post_send_hook(&mut self, _conversation: &Conversation) {}
}

/// Keeps a list of facts and makes sure each one is at the top of the
/// conversation as a system message before every send.
#[derive(Debug, Default)]
pub struct MemoryPlugin {
    memories: Vec<String>,
}

impl MemoryPlugin {
    pub fn new(memories: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            memories: memories.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remember(&mut self, memory: impl Into<String>) {
        self.memories.push(memory.into());
    }

    pub fn memories(&self) -> &[String] {
        &self.memories
    }
}

impl Plugin for MemoryPlugin {
    fn pre_send_hook(&mut self, conversation: &mut Conversation) -> HookAction {
        for memory in &self.memories {
            let present = conversation
                .messages()
                .iter()
                .any(|m| m.role == Role::System && &m.text == memory);
            if present {
                continue;
            }
            let mut meta = Map::new();
            meta.insert("plugin".to_string(), json!("memory"));
            conversation.prepend_system_message(Role::System, memory.clone(), Some(meta));
        }
        HookAction::Continue
    }
}
