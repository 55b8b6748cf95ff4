//! Straight-line coroutines over completion callbacks.
//!
//! A wrapped method's body is an ordinary `async` block. Wherever it needs the
//! result of a callback-style operation it awaits a suspension point:
//!
//! ```ignore
//! let get = async_yield("get", |page: Arc<Page>, _args: (), co: Co| {
//!     Invocation::coroutine(async move {
//!         let body = co
//!             .suspend(|callback| page.fetch("http://blah", callback))
//!             .await?;
//!         page.request.respond(&body.into_value())?;
//!         page.request.finish();
//!         Ok(())
//!     })
//! });
//!
//! get.call(&page, ())?; // returns as soon as the fetch is in flight
//! ```
//!
//! The trampoline polls the body with a no-op waker. A suspension point looks
//! up the invocation's [`Completion`] in the handler's registry, hands it to
//! the operation and returns `Pending`. When the operation calls the
//! completion, its arguments are flattened into a [`ResumeValue`] and the
//! body is polled again on the calling thread.
//!
//! Bodies must only await suspension points (and other wrapped methods via
//! [`Co::call`]); any other pending future parks the computation for good.

mod mailbox;
mod trampoline;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, YieldError};
use crate::handler::YieldHandler;
use crate::registry::CallToken;
use crate::value::{CompletionArgs, ResumeValue};

use mailbox::Mailbox;
pub use trampoline::{async_yield, Method};

/// Boxed future for coroutine bodies.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hook run with the result of a computation that finished after suspending.
pub(crate) type FinishHook<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// What a wrapped method's body produced when invoked.
pub enum Invocation<T> {
    /// The body never suspends; this is its result.
    Ready(Result<T>),
    /// The body is a coroutine to be driven by the trampoline.
    Suspending(BoxFuture<'static, Result<T>>),
}

impl<T> Invocation<T> {
    /// A plain, non-suspending return value.
    pub fn ready(value: T) -> Self {
        Invocation::Ready(Ok(value))
    }

    /// A coroutine body.
    pub fn coroutine<F>(body: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Invocation::Suspending(Box::pin(body))
    }
}

/// Result of calling a wrapped method.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The body ran to completion without suspending.
    Returned(T),
    /// The body is suspended; the response is in flight.
    InFlight(CallToken),
}

impl<T> Outcome<T> {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Outcome::InFlight(_))
    }

    /// The returned value, if the call completed synchronously.
    pub fn returned(self) -> Option<T> {
        match self {
            Outcome::Returned(value) => Some(value),
            Outcome::InFlight(_) => None,
        }
    }
}

/// Something a completion can resume.
pub(crate) trait Resume: Send + Sync {
    /// `generation` pins the value to one suspension point; `None` takes
    /// whichever is waiting.
    fn resume(&self, value: ResumeValue, generation: Option<u64>);
}

/// The generic resumption callback of one computation.
///
/// Accepts any positional and named arguments; see [`ResumeValue`] for how
/// they are flattened. Calling it after the computation finished, or while the
/// computation is not waiting, does nothing. A completion handed out by a
/// suspension point only resumes that suspension point, so an operation that
/// calls back twice cannot resume a later one.
#[derive(Clone)]
pub struct Completion {
    token: Option<CallToken>,
    generation: Option<u64>,
    target: Arc<dyn Resume>,
}

impl Completion {
    pub(crate) fn new(token: CallToken, target: Arc<dyn Resume>) -> Self {
        Self {
            token: Some(token),
            generation: None,
            target,
        }
    }

    fn pinned(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// A completion bound to nothing.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        struct Detached;
        impl Resume for Detached {
            fn resume(&self, _value: ResumeValue, _generation: Option<u64>) {}
        }

        Self {
            token: None,
            generation: None,
            target: Arc::new(Detached),
        }
    }

    /// Token of the invocation this completion resumes.
    pub fn token(&self) -> Option<CallToken> {
        self.token
    }

    /// Resume the computation with the flattened `args`.
    pub fn complete(&self, args: CompletionArgs) {
        self.target.resume(ResumeValue::from(args), self.generation);
    }

    /// Resume with exactly one positional argument.
    pub fn resume_with(&self, value: impl Into<Value>) {
        self.complete(CompletionArgs::single(value));
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Any completion callback: what asynchronous operations are handed.
///
/// Build one from a [`Completion`] to resume a coroutine, or from a closure
/// for plain callback-style use.
pub struct Callback(Box<dyn FnOnce(CompletionArgs) + Send>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(CompletionArgs) + Send + 'static,
    {
        Callback(Box::new(f))
    }

    /// Placeholder callback for when the result does not matter.
    pub fn ignored() -> Self {
        Callback::new(|_| {})
    }

    /// Invoke the callback with `args`.
    pub fn invoke(self, args: CompletionArgs) {
        (self.0)(args)
    }
}

impl From<Completion> for Callback {
    fn from(completion: Completion) -> Self {
        Callback::new(move |args| completion.complete(args))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Handle a coroutine body uses to reach its own suspension machinery.
///
/// Carries the invocation's [`CallToken`], so a suspension point finds its
/// callback without any knowledge of the caller.
#[derive(Clone)]
pub struct Co {
    token: CallToken,
    handler: Arc<dyn YieldHandler>,
    mailbox: Arc<Mailbox>,
}

impl Co {
    pub(crate) fn new(token: CallToken, handler: Arc<dyn YieldHandler>, mailbox: Arc<Mailbox>) -> Self {
        Self {
            token,
            handler,
            mailbox,
        }
    }

    /// Token of this invocation.
    #[inline]
    pub fn token(&self) -> CallToken {
        self.token
    }

    /// The completion registered for this invocation.
    pub fn callback(&self) -> Result<Completion> {
        self.handler.context().callbacks().lookup(self.token)
    }

    /// Suspend until the operation started by `initiate` completes.
    ///
    /// `initiate` receives this invocation's completion and must hand it to
    /// the asynchronous operation. An error returned by `initiate` is returned
    /// from the await without suspending.
    pub fn suspend<'a, F>(&'a self, initiate: F) -> Suspend<'a>
    where
        F: FnOnce(Completion) -> Result<()> + Send + 'a,
    {
        Suspend {
            co: self,
            initiate: Some(Box::new(initiate)),
            armed: false,
        }
    }

    /// Invoke another wrapped method as a suspension point.
    ///
    /// Resumes only once the nested computation has fully finished, and
    /// yields its result.
    pub async fn call<H, A, T>(&self, method: &Method<H, A, T>, handler: &Arc<H>, args: A) -> Result<T>
    where
        H: YieldHandler,
        A: Send,
        T: Send + 'static,
    {
        let slot: Arc<Mutex<Option<Result<T>>>> = Arc::new(Mutex::new(None));
        let filled = Arc::clone(&slot);

        self.suspend(move |callback| {
            let resume = callback.clone();
            let deliver = Arc::clone(&filled);
            let hook: FinishHook<T> = Box::new(move |result: Result<T>| {
                *deliver.lock() = Some(result);
                resume.complete(CompletionArgs::new());
            });

            match method.invoke(handler, args, Some(hook))? {
                Outcome::Returned(value) => {
                    *filled.lock() = Some(Ok(value));
                    callback.complete(CompletionArgs::new());
                }
                Outcome::InFlight(nested) => {
                    tracing::debug!("{} waiting on nested {}", self.token, nested);
                }
            }
            Ok(())
        })
        .await?;

        let result = slot.lock().take();
        result.unwrap_or_else(|| {
            Err(YieldError::Resumption(format!(
                "{} resumed before its nested call finished",
                self.token
            )))
        })
    }
}

impl fmt::Debug for Co {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Co").field("token", &self.token).finish()
    }
}

/// A suspension point: resolves to the [`ResumeValue`] of one completion.
#[must_use = "suspension points do nothing unless awaited"]
pub struct Suspend<'a> {
    co: &'a Co,
    initiate: Option<Box<dyn FnOnce(Completion) -> Result<()> + Send + 'a>>,
    armed: bool,
}

impl Future for Suspend<'_> {
    type Output = Result<ResumeValue>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(initiate) = this.initiate.take() {
            let callback = match this.co.callback() {
                Ok(callback) => callback,
                Err(e) => return Poll::Ready(Err(e)),
            };

            // Armed before initiating so a synchronous completion is accepted.
            let generation = this.co.mailbox.arm();
            this.armed = true;
            if let Err(e) = initiate(callback.pinned(generation)) {
                this.co.mailbox.disarm();
                this.armed = false;
                return Poll::Ready(Err(e));
            }
        }

        match this.co.mailbox.take() {
            Some(value) => {
                this.armed = false;
                Poll::Ready(Ok(value))
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Suspend<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.co.mailbox.disarm();
        }
    }
}
