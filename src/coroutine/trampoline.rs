//! The trampoline: starts, parks and resumes wrapped-method computations.
//!
//! A completion that arrives while its computation is still being polled
//! (the operation called back synchronously) is queued in the mailbox and
//! picked up by the loop in [`Core::drive`] instead of recursing into the body.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use super::mailbox::{Delivery, Mailbox, Park, Phase};
use super::{BoxFuture, Co, Completion, FinishHook, Invocation, Outcome, Resume};
use crate::error::{Result, YieldError};
use crate::handler::YieldHandler;
use crate::registry::CallToken;
use crate::value::ResumeValue;

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// A suspended computation: one active invocation of a wrapped method.
struct Core<T> {
    token: CallToken,
    handler: Arc<dyn YieldHandler>,
    mailbox: Arc<Mailbox>,
    body: Mutex<Option<BoxFuture<'static, Result<T>>>>,
    result: Mutex<Option<Result<T>>>,
    hook: Mutex<Option<FinishHook<T>>>,
}

impl<T: Send + 'static> Core<T> {
    /// Register, then run the body up to its first suspension point.
    fn start(
        token: CallToken,
        handler: Arc<dyn YieldHandler>,
        mailbox: Arc<Mailbox>,
        body: BoxFuture<'static, Result<T>>,
        hook: Option<FinishHook<T>>,
    ) -> Result<Outcome<T>> {
        let core = Arc::new(Core {
            token,
            handler,
            mailbox,
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            hook: Mutex::new(hook),
        });

        let target: Arc<dyn Resume> = core.clone();
        core.handler
            .context()
            .callbacks()
            .register(token, Completion::new(token, target));

        core.mailbox.begin();
        match core.drive() {
            Phase::Finished => {
                core.handler.context().callbacks().unregister(token);
                core.hook.lock().take();
                core.take_result().map(Outcome::Returned)
            }
            _ => {
                tracing::debug!("{} suspended, response in flight", token);
                Ok(Outcome::InFlight(token))
            }
        }
    }

    /// Poll the body until it finishes or parks with nothing left to consume.
    ///
    /// The caller must own the drive loop (mailbox phase `Running`).
    fn drive(&self) -> Phase {
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        let mut retrying = false;

        loop {
            let delivered = self.mailbox.delivered();
            let poll = {
                let mut body = self.body.lock();
                match body.as_mut() {
                    Some(fut) => fut.as_mut().poll(&mut cx),
                    None => return Phase::Finished,
                }
            };

            match poll {
                Poll::Ready(result) => {
                    self.body.lock().take();
                    *self.result.lock() = Some(result);
                    self.mailbox.close();
                    tracing::trace!("{} ran to completion", self.token);
                    return Phase::Finished;
                }
                Poll::Pending => {
                    let stalled = retrying && self.mailbox.delivered() == delivered;
                    match self.mailbox.park(stalled) {
                        Park::Repoll => {
                            tracing::trace!("{} completed synchronously, polling again", self.token);
                            retrying = true;
                        }
                        Park::Suspended => return Phase::Suspended,
                    }
                }
            }
        }
    }

    fn take_result(&self) -> Result<T> {
        let result = self.result.lock().take();
        result.unwrap_or_else(|| {
            Err(YieldError::Resumption(format!(
                "{} finished without a result",
                self.token
            )))
        })
    }

    /// Hand over the result of a computation that finished after suspending.
    fn finish(&self) {
        self.handler.context().callbacks().unregister(self.token);

        let Some(result) = self.result.lock().take() else {
            return;
        };
        let hook = self.hook.lock().take();
        match (hook, result) {
            (Some(hook), result) => hook(result),
            (None, Ok(_)) => tracing::debug!("{} finished", self.token),
            (None, Err(e)) => {
                tracing::error!("{} failed after suspending: {}", self.token, e);
                self.handler.context().lifecycle().fail(&e);
            }
        }
    }
}

impl<T: Send + 'static> Resume for Core<T> {
    fn resume(&self, value: ResumeValue, generation: Option<u64>) {
        match self.mailbox.offer(value, generation) {
            Delivery::Discarded(reason) => {
                tracing::debug!("Discarded resumption of {}: {}", self.token, reason);
            }
            Delivery::Queued => {
                tracing::trace!("{} resumed while running, queued", self.token);
            }
            Delivery::Claimed => {
                if self.drive() == Phase::Finished {
                    self.finish();
                }
            }
        }
    }
}

type Body<H, A, T> = dyn Fn(Arc<H>, A, Co) -> Invocation<T> + Send + Sync;

/// A wrapped method: callable like a normal method, while its body may
/// suspend any number of times.
pub struct Method<H, A, T> {
    name: &'static str,
    body: Arc<Body<H, A, T>>,
    marks_in_flight: bool,
}

/// Wrap `body` so that calling it runs it on the trampoline.
///
/// `name` identifies the method in call tokens and logs.
pub fn async_yield<H, A, T, F>(name: &'static str, body: F) -> Method<H, A, T>
where
    H: YieldHandler,
    F: Fn(Arc<H>, A, Co) -> Invocation<T> + Send + Sync + 'static,
{
    Method {
        name,
        body: Arc::new(body),
        marks_in_flight: true,
    }
}

impl<H, A, T> Method<H, A, T>
where
    H: YieldHandler,
    T: Send + 'static,
{
    /// Don't mark the request in flight on call; the handler does it itself.
    pub fn manual_lifecycle(mut self) -> Self {
        self.marks_in_flight = false;
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke the method on `handler`.
    ///
    /// Returns [`Outcome::Returned`] when the body completes without
    /// suspending and [`Outcome::InFlight`] otherwise. An error raised before
    /// the first suspension is returned here; one raised later fails the
    /// handler's request.
    pub fn call(&self, handler: &Arc<H>, args: A) -> Result<Outcome<T>> {
        self.invoke(handler, args, None)
    }

    pub(crate) fn invoke(
        &self,
        handler: &Arc<H>,
        args: A,
        hook: Option<FinishHook<T>>,
    ) -> Result<Outcome<T>> {
        if self.marks_in_flight {
            handler.context().lifecycle().mark_in_flight();
        }

        let token = CallToken::issue(self.name);
        let erased: Arc<dyn YieldHandler> = handler.clone();
        let mailbox = Arc::new(Mailbox::default());
        let co = Co::new(token, Arc::clone(&erased), Arc::clone(&mailbox));

        match (self.body)(Arc::clone(handler), args, co) {
            Invocation::Ready(result) => result.map(Outcome::Returned),
            Invocation::Suspending(body) => Core::start(token, erased, mailbox, body, hook),
        }
    }
}

impl<H, A, T> Clone for Method<H, A, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            body: Arc::clone(&self.body),
            marks_in_flight: self.marks_in_flight,
        }
    }
}

impl<H, A, T> fmt::Debug for Method<H, A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("marks_in_flight", &self.marks_in_flight)
            .finish()
    }
}
