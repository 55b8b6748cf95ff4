//! Handler-side state the trampoline works against.
//!
//! A handler is any object wrapped methods run on behalf of. It exposes a
//! [`HandlerContext`]: the callback registry for its suspended computations
//! and the lifecycle of the request it is serving.
//!
//! # Example
//!
//! ```
//! use yieldpoint::{HandlerContext, RequestContext, YieldHandler};
//!
//! struct Page {
//!     ctx: HandlerContext,
//!     request: RequestContext,
//! }
//!
//! impl YieldHandler for Page {
//!     fn context(&self) -> &HandlerContext {
//!         &self.ctx
//!     }
//! }
//!
//! let request = RequestContext::new(1);
//! let page = Page {
//!     ctx: HandlerContext::new(request.clone()),
//!     request,
//! };
//! assert!(page.context().callbacks().is_empty());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::registry::CallbackRegistry;
use crate::request::RequestLifecycle;

/// Object whose methods can be wrapped with [`async_yield`](crate::async_yield).
pub trait YieldHandler: Send + Sync + 'static {
    fn context(&self) -> &HandlerContext;
}

/// Per-handler state: callback registry plus request lifecycle.
pub struct HandlerContext {
    callbacks: CallbackRegistry,
    lifecycle: Arc<dyn RequestLifecycle>,
}

impl HandlerContext {
    /// Create a context serving the request behind `lifecycle`.
    pub fn new<L: RequestLifecycle + 'static>(lifecycle: L) -> Self {
        Self {
            callbacks: CallbackRegistry::new(),
            lifecycle: Arc::new(lifecycle),
        }
    }

    #[inline]
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    #[inline]
    pub fn lifecycle(&self) -> &dyn RequestLifecycle {
        self.lifecycle.as_ref()
    }

    /// Prepare the handler for a new request: start with an empty registry.
    pub fn prepare(&self) {
        self.callbacks.clear();
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
