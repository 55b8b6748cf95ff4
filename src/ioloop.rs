//! A minimal callback-driven I/O loop on tokio.
//!
//! This is the substrate completions are delivered by. Callbacks queued with
//! [`LoopHandle::add_callback`] run in FIFO order on whichever thread drives
//! [`IoLoop::run`] / [`IoLoop::run_pending`]; work handed to
//! [`LoopHandle::spawn_op`] runs on the tokio runtime, but its completion is
//! posted back to the loop. Every handler's resumptions therefore happen on
//! one thread of control.
//!
//! # Example
//!
//! ```
//! use yieldpoint::{Callback, CompletionArgs, IoLoop};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut io_loop = IoLoop::new();
//! let handle = io_loop.handle();
//!
//! handle
//!     .spawn_op(async { CompletionArgs::single(42) }, Callback::new(|args| {
//!         assert_eq!(args.positional_args().len(), 1);
//!     }))
//!     .unwrap();
//!
//! assert_eq!(io_loop.run().await, 1);
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::coroutine::Callback;
use crate::error::{Result, YieldError};
use crate::value::CompletionArgs;

type Task = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Task),
    /// A spawned operation ended without posting a completion.
    Wake,
}

/// Counts a spawned operation until its completion is posted or the
/// operation is dropped (panicked or cancelled).
struct Outstanding {
    count: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<Message>,
    posted: bool,
}

impl Outstanding {
    fn new(count: Arc<AtomicUsize>, tx: mpsc::UnboundedSender<Message>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self {
            count,
            tx,
            posted: false,
        }
    }

    fn post(&mut self, task: Task) {
        if self.tx.send(Message::Run(task)).is_err() {
            tracing::debug!("I/O loop closed before operation completed");
        }
        self.posted = true;
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        // Decrement after posting so the loop never sees an idle gap.
        self.count.fetch_sub(1, Ordering::SeqCst);
        if !self.posted {
            tracing::warn!("Spawned operation ended without completing");
            let _ = self.tx.send(Message::Wake);
        }
    }
}

/// Cloneable handle for scheduling work on an [`IoLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Message>,
    /// Spawned operations whose completion has not been posted yet.
    outstanding: Arc<AtomicUsize>,
}

impl LoopHandle {
    /// Queue `f` to run on the loop.
    pub fn add_callback<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(f)))
            .map_err(|_| YieldError::LoopClosed)
    }

    /// Invoke `callback` with `args` on a later loop turn.
    pub fn complete(&self, callback: impl Into<Callback>, args: CompletionArgs) -> Result<()> {
        let callback = callback.into();
        self.add_callback(move || callback.invoke(args))
    }

    /// Run `op` on the tokio runtime and deliver its result to `callback` on
    /// the loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_op<F>(&self, op: F, callback: impl Into<Callback>) -> Result<()>
    where
        F: Future<Output = CompletionArgs> + Send + 'static,
    {
        if self.tx.is_closed() {
            return Err(YieldError::LoopClosed);
        }

        let callback = callback.into();
        let mut outstanding = Outstanding::new(Arc::clone(&self.outstanding), self.tx.clone());

        tokio::spawn(async move {
            let args = op.await;
            outstanding.post(Box::new(move || callback.invoke(args)));
        });
        Ok(())
    }

    /// Run `f` on the loop after `delay`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_op(
            async move {
                tokio::time::sleep(delay).await;
                CompletionArgs::new()
            },
            Callback::new(move |_| f()),
        )
    }

    /// Number of spawned operations still running.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Single-consumer loop that runs queued callbacks.
pub struct IoLoop {
    handle: LoopHandle,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl IoLoop {
    /// Create a new idle loop.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: LoopHandle {
                tx,
                outstanding: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        }
    }

    /// Get a handle for scheduling work on this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run every callback that is queued right now, including ones queued
    /// while draining. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Run(task) = message {
                task();
                ran += 1;
            }
        }
        ran
    }

    /// Run until nothing is queued and no spawned operation is outstanding.
    /// Returns how many callbacks ran.
    pub async fn run(&mut self) -> usize {
        let mut ran = 0;
        loop {
            ran += self.run_pending();

            if self.handle.outstanding() == 0 {
                // A completion may have been posted just before the count dropped.
                let late = self.run_pending();
                if late == 0 {
                    return ran;
                }
                ran += late;
                continue;
            }

            match self.rx.recv().await {
                Some(Message::Run(task)) => {
                    task();
                    ran += 1;
                }
                Some(Message::Wake) => {}
                None => return ran,
            }
        }
    }
}

impl Default for IoLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_run_pending_fifo() {
        let mut io_loop = IoLoop::new();
        let handle = io_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            handle.add_callback(move || order.lock().push(i)).unwrap();
        }

        assert_eq!(io_loop.run_pending(), 3);
        assert_eq!(&*order.lock(), &[0, 1, 2]);
    }

    #[test]
    fn test_callbacks_queued_while_draining_run() {
        let mut io_loop = IoLoop::new();
        let handle = io_loop.handle();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_handle = handle.clone();
        let inner_hits = Arc::clone(&hits);
        handle
            .add_callback(move || {
                inner_hits.fetch_add(1, Ordering::SeqCst);
                let hits = Arc::clone(&inner_hits);
                inner_handle
                    .add_callback(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        assert_eq!(io_loop.run_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_complete_delivers_args() {
        let mut io_loop = IoLoop::new();
        let seen = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&seen);
        io_loop
            .handle()
            .complete(
                Callback::new(move |args| *sink.lock() = Some(args)),
                CompletionArgs::positional([1, 2]),
            )
            .unwrap();

        assert!(seen.lock().is_none());
        io_loop.run_pending();
        assert_eq!(*seen.lock(), Some(CompletionArgs::positional([1, 2])));
    }

    #[test]
    fn test_closed_loop() {
        let io_loop = IoLoop::new();
        let handle = io_loop.handle();
        drop(io_loop);

        assert!(matches!(
            handle.add_callback(|| {}),
            Err(YieldError::LoopClosed)
        ));
    }

    #[tokio::test]
    async fn test_spawn_op_posts_back_to_loop() {
        let mut io_loop = IoLoop::new();
        let handle = io_loop.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        handle
            .spawn_op(
                async {
                    tokio::task::yield_now().await;
                    CompletionArgs::single("fetched")
                },
                Callback::new(move |args| sink.lock().push(args)),
            )
            .unwrap();

        assert_eq!(io_loop.run().await, 1);
        assert_eq!(&*seen.lock(), &[CompletionArgs::single("fetched")]);
        assert_eq!(handle.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_call_later() {
        let mut io_loop = IoLoop::new();
        let handle = io_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let late = Arc::clone(&order);
        handle
            .call_later(Duration::from_millis(5), move || late.lock().push("late"))
            .unwrap();
        let now = Arc::clone(&order);
        handle.add_callback(move || now.lock().push("now")).unwrap();

        io_loop.run().await;
        assert_eq!(&*order.lock(), &["now", "late"]);
    }

    #[tokio::test]
    async fn test_panicking_operation_does_not_stall_run() {
        let mut io_loop = IoLoop::new();
        let handle = io_loop.handle();
        let called = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&called);
        handle
            .spawn_op(
                async {
                    tokio::task::yield_now().await;
                    if std::hint::black_box(true) {
                        panic!("operation blew up");
                    }
                    CompletionArgs::new()
                },
                Callback::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let ran = tokio::time::timeout(Duration::from_secs(5), io_loop.run())
            .await
            .expect("run should return once the operation is gone");
        assert_eq!(ran, 0);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(handle.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_run_returns_when_idle() {
        let mut io_loop = IoLoop::new();
        assert_eq!(io_loop.run().await, 0);
    }
}
