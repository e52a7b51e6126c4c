// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Conversation context
//!
//! Every receiver of a process shares one stack of open conversation ids. A one-way message or an
//! RPC request pushes its `conv-id` before its handlers run and pops it afterwards; RPC results
//! run inside the requester's scope and leave the stack alone.
//!
//! Messages of one receiver are processed concurrently, so scopes do not always close in LIFO
//! order. A pop removes the most recent entry for the given conversation rather than whatever is
//! on top. When the last entry of a conversation goes away its scope is closed and the
//! conversation caches of the process are cleared for it.
//!

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tracing::debug;

/// Stand-in conversation for messages resolved while the stack is empty.
pub const NO_CONVERSATION: &str = "<no-conversation>";

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Result of closing a scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Popped {
    /// An entry for the conversation was on the stack.
    pub found: bool,
    /// No entry for the conversation is left: its outermost scope is closed.
    pub closed: bool,
}

/// Per-process stack of open conversations.
#[derive(Debug, Default)]
pub struct ConversationContext {
    stack: Mutex<Vec<String>>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scope for `conv_id`.
    pub fn push(&self, conv_id: &str) {
        guard(&self.stack).push(conv_id.to_owned());
    }

    /// Closes the most recent scope opened for `conv_id`.
    pub fn pop(&self, conv_id: &str) -> Popped {
        let mut stack = guard(&self.stack);
        let Some(index) = stack.iter().rposition(|c| c == conv_id) else {
            debug!("Conversation {} is not on the context stack.", conv_id);
            return Popped {
                found: false,
                closed: false,
            };
        };
        if index + 1 != stack.len() {
            debug!("Conversation {} closed out of order.", conv_id);
        }
        stack.remove(index);
        Popped {
            found: true,
            closed: !stack.iter().any(|c| c == conv_id),
        }
    }

    /// The innermost open conversation.
    pub fn current(&self) -> Option<String> {
        guard(&self.stack).last().cloned()
    }

    /// The innermost open conversation, or `NO_CONVERSATION` if none is open.
    pub fn current_or_sentinel(&self) -> String {
        self.current().unwrap_or_else(|| NO_CONVERSATION.to_owned())
    }

    pub fn depth(&self) -> usize {
        guard(&self.stack).len()
    }

    /// Copy of the stack, outermost first.
    pub fn snapshot(&self) -> Vec<String> {
        guard(&self.stack).clone()
    }
}

/// Scratch space scoped to conversations, owned by a process.
#[derive(Debug, Default)]
pub struct ConversationCaches {
    entries: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl ConversationCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, conv_id: &str, key: &str, value: &[u8]) {
        guard(&self.entries)
            .entry(conv_id.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_vec());
    }

    pub fn get(&self, conv_id: &str, key: &str) -> Option<Vec<u8>> {
        guard(&self.entries)
            .get(conv_id)
            .and_then(|cache| cache.get(key))
            .cloned()
    }

    pub fn contains(&self, conv_id: &str) -> bool {
        guard(&self.entries).contains_key(conv_id)
    }

    /// Drops everything cached for `conv_id`.
    pub fn clear(&self, conv_id: &str) {
        if guard(&self.entries).remove(conv_id).is_some() {
            debug!("Cleared caches of conversation {}.", conv_id);
        }
    }

    /// Number of conversations holding cached data.
    pub fn len(&self) -> usize {
        guard(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
