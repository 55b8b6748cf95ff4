//! # yieldpoint
//!
//! Straight-line coroutines over callback-driven asynchronous I/O.
//!
//! A request handler method is written as one sequential `async` body. At
//! each point where it needs the result of a callback-style operation it
//! awaits a suspension point; the method returns to its caller as soon as
//! the first operation is in flight, and the body resumes when the
//! operation's callback fires.
//!
//! ## Architecture
//!
//! - **Registry** ([`CallbackRegistry`]): per-handler map from each live
//!   invocation's [`CallToken`] to its resumption [`Completion`]
//! - **Trampoline** ([`async_yield`], [`Method`]): drives a body step by
//!   step, delivering [`ResumeValue`]s and finishing the request
//! - **I/O loop** ([`IoLoop`]): the callback substrate on tokio
//! - **Cushion** ([`cushion`]): a pooled document store whose callbacks
//!   plug straight into suspension points
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use yieldpoint::{
//!     async_yield, Co, CompletionArgs, HandlerContext, Invocation, IoLoop, LoopHandle,
//!     RequestContext, RequestState, YieldHandler,
//! };
//!
//! struct Page {
//!     ctx: HandlerContext,
//!     request: RequestContext,
//!     io: LoopHandle,
//! }
//!
//! impl YieldHandler for Page {
//!     fn context(&self) -> &HandlerContext {
//!         &self.ctx
//!     }
//! }
//!
//! let mut io_loop = IoLoop::new();
//! let request = RequestContext::new(1);
//! let page = Arc::new(Page {
//!     ctx: HandlerContext::new(request.clone()),
//!     request: request.clone(),
//!     io: io_loop.handle(),
//! });
//!
//! let get = async_yield("get", |page: Arc<Page>, _args: (), co: Co| {
//!     Invocation::coroutine(async move {
//!         let greeting = co
//!             .suspend(|cb| page.io.complete(cb, CompletionArgs::single("hello")))
//!             .await?;
//!         page.request.respond(&greeting.into_value())?;
//!         page.request.finish();
//!         Ok(())
//!     })
//! });
//!
//! assert!(get.call(&page, ()).unwrap().is_in_flight());
//! assert_eq!(request.state(), RequestState::InFlight);
//!
//! io_loop.run_pending();
//! assert_eq!(request.state(), RequestState::Finished);
//! ```

pub mod codec;
pub mod coroutine;
pub mod cushion;
pub mod error;
pub mod handler;
pub mod ioloop;
pub mod registry;
pub mod request;
pub mod value;

pub use coroutine::{
    async_yield, BoxFuture, Callback, Co, Completion, Invocation, Method, Outcome, Suspend,
};
pub use cushion::{Cushion, CushionConfig, CushionSession, Document, MemoryServer};
pub use error::{Result, YieldError};
pub use handler::{HandlerContext, YieldHandler};
pub use ioloop::{IoLoop, LoopHandle};
pub use registry::{CallToken, CallbackRegistry};
pub use request::{RequestContext, RequestLifecycle, RequestState};
pub use value::{CompletionArgs, ResumeValue};
