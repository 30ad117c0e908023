//! Token to handler mapping for readiness dispatch.
//!
//! Every registered connection gets a slab key that doubles as its mio
//! `Token`. The entry says which component owns the connection, so the
//! reactor can route an event without any per-source attachment.

use mio::Token;
use slab::Slab;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Owner of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// The session's control connection.
    Control,
    /// A data stream, by index into the control channel's stream list.
    Stream(usize),
}

/// Registry of live handlers with O(1) insert, lookup and remove.
pub struct HandlerRegistry {
    handlers: Slab<Handler>,
}

impl HandlerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            handlers: Slab::with_capacity(capacity),
        }
    }

    /// Token the next `insert` will use.
    pub fn next_token(&self) -> Token {
        Token(self.handlers.vacant_key())
    }

    /// Insert a handler and return its token.
    pub fn insert(&mut self, handler: Handler) -> Token {
        Token(self.handlers.insert(handler))
    }

    pub fn get(&self, token: Token) -> Option<Handler> {
        self.handlers.get(token.0).copied()
    }

    pub fn remove(&mut self, token: Token) -> Option<Handler> {
        self.handlers.try_remove(token.0)
    }

    /// Drop every handler. Used when a session is recycled.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
