//! Callback registry for routing completions back to suspended computations.
//!
//! Every handler owns one registry. Each active coroutine invocation is
//! registered under its own [`CallToken`]: the wrapped method's name plus a
//! process-unique sequence number issued when the invocation starts. Two
//! concurrent invocations of the same method on the same handler therefore
//! never share a slot.
//!
//! # Example
//!
//! ```ignore
//! let registry = CallbackRegistry::new();
//! let token = CallToken::issue("get");
//!
//! registry.register(token, completion);
//! let callback = registry.lookup(token)?;
//! registry.unregister(token);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::coroutine::Completion;
use crate::error::{Result, YieldError};

/// Next token sequence number. 0 is never issued.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifier of one invocation of a wrapped method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallToken {
    method: &'static str,
    seq: u64,
}

impl CallToken {
    /// Issue a fresh token for an invocation of `method`.
    pub fn issue(method: &'static str) -> Self {
        Self {
            method,
            seq: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Name of the wrapped method this invocation belongs to.
    #[inline]
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Sequence number of this invocation.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.method, self.seq)
    }
}

/// Per-handler mapping from call token to the callback that resumes it.
///
/// Access is expected from one logical thread of control at a time; the
/// mutex only provides interior mutability behind `&self`.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Mutex<HashMap<CallToken, Completion>>,
}

impl CallbackRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `callback` with `token`.
    ///
    /// An existing registration is replaced silently; the replaced callback
    /// is returned.
    pub fn register(&self, token: CallToken, callback: Completion) -> Option<Completion> {
        let previous = self.callbacks.lock().insert(token, callback);
        if previous.is_some() {
            tracing::debug!("Replaced callback registered for {}", token);
        } else {
            tracing::debug!("Registered callback for {}", token);
        }
        previous
    }

    /// Remove the registration for `token`.
    ///
    /// Removing a token that is not registered is a no-op and returns `None`.
    pub fn unregister(&self, token: CallToken) -> Option<Completion> {
        let removed = self.callbacks.lock().remove(&token);
        if removed.is_some() {
            tracing::debug!("Unregistered callback for {}", token);
        }
        removed
    }

    /// Get the callback registered for `token`.
    pub fn lookup(&self, token: CallToken) -> Result<Completion> {
        self.callbacks
            .lock()
            .get(&token)
            .cloned()
            .ok_or(YieldError::CallbackNotRegistered(token))
    }

    pub fn contains(&self, token: CallToken) -> bool {
        self.callbacks.lock().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    /// Tokens of all invocations that are currently registered.
    pub fn tokens(&self) -> Vec<CallToken> {
        self.callbacks.lock().keys().copied().collect()
    }

    /// Drop every registration.
    ///
    /// Abandoned computations are only released through this.
    pub fn clear(&self) {
        let mut callbacks = self.callbacks.lock();
        if !callbacks.is_empty() {
            tracing::debug!("Dropping {} pending callbacks", callbacks.len());
        }
        callbacks.clear();
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("tokens", &self.tokens())
            .finish()
    }
}
