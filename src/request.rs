//! Request lifecycle for handlers.
//!
//! The trampoline only needs two hooks from the surrounding request-handling
//! framework: "this request will complete asynchronously" and "this request
//! failed". [`RequestLifecycle`] is that seam; [`RequestContext`] is the
//! implementation shipped with the crate.
//!
//! [`RequestContext`] provides methods for responding:
//! - `respond` - write a msgpack-encoded response chunk
//! - `respond_raw` - write raw bytes
//! - `finish` - mark the response complete
//! - `error` - fail the request with a message
//!
//! # Example
//!
//! ```ignore
//! let ctx = RequestContext::new(42);
//! ctx.respond(&"hello")?;
//! ctx.finish();
//! assert_eq!(ctx.wait_finished().await, RequestState::Finished);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::codec::MsgPackCodec;
use crate::error::{Result, YieldError};

/// Hooks the trampoline calls on the request a handler is serving.
pub trait RequestLifecycle: Send + Sync {
    /// The request will complete asynchronously; do not auto-finish it.
    fn mark_in_flight(&self);

    /// The response is complete.
    fn mark_finished(&self);

    /// A resumed computation failed; turn it into a failed response.
    fn fail(&self, error: &YieldError);
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Dispatched, nothing decided yet.
    Pending,
    /// Completing asynchronously.
    InFlight,
    /// Response complete.
    Finished,
    /// Failed with the given message.
    Failed(String),
}

impl RequestState {
    /// Whether the request has ended, successfully or not.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, RequestState::Finished | RequestState::Failed(_))
    }
}

struct RequestInner {
    request_id: u32,
    state: watch::Sender<RequestState>,
    chunks: Mutex<Vec<Bytes>>,
}

/// Context for one request being served by a handler.
///
/// `RequestContext` is `Clone`; clones share the same state and response
/// buffer.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<RequestInner>,
}

impl RequestContext {
    /// Create a new request context.
    pub fn new(request_id: u32) -> Self {
        let (state, _) = watch::channel(RequestState::Pending);
        Self {
            inner: Arc::new(RequestInner {
                request_id,
                state,
                chunks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.inner.request_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner.state.borrow().clone()
    }

    /// Write a response chunk.
    ///
    /// Serializes the payload using MsgPack.
    pub fn respond<T: serde::Serialize>(&self, payload: &T) -> Result<()> {
        let data = MsgPackCodec::encode(payload)?;
        self.write(Bytes::from(data))
    }

    /// Write a response chunk with raw bytes.
    pub fn respond_raw(&self, payload: &[u8]) -> Result<()> {
        self.write(Bytes::copy_from_slice(payload))
    }

    /// Finish the response. Has no effect once the request has ended.
    pub fn finish(&self) {
        self.transition(RequestState::Finished);
    }

    /// Fail the request with `message`. Has no effect once the request has ended.
    pub fn error(&self, message: &str) {
        self.transition(RequestState::Failed(message.to_string()));
    }

    /// All chunks written so far.
    pub fn chunks(&self) -> Vec<Bytes> {
        self.inner.chunks.lock().clone()
    }

    /// Decode the chunk at `index`.
    pub fn decode_chunk<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        let chunk = self.inner.chunks.lock().get(index).cloned();
        chunk.map(|bytes| MsgPackCodec::decode(&bytes)).transpose()
    }

    /// Wait until the request is finished or failed.
    pub async fn wait_finished(&self) -> RequestState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(RequestState::is_done).await;
        match result {
            Ok(state) => state.clone(),
            // The sender lives in `inner`, which `self` keeps alive.
            Err(_) => self.state(),
        }
    }

    fn write(&self, chunk: Bytes) -> Result<()> {
        if self.state().is_done() {
            return Err(YieldError::RequestFinished);
        }
        self.inner.chunks.lock().push(chunk);
        Ok(())
    }

    fn transition(&self, next: RequestState) {
        let request_id = self.inner.request_id;
        self.inner.state.send_if_modified(|state| {
            if state.is_done() {
                tracing::debug!("Request {} already ended, ignoring {:?}", request_id, next);
                return false;
            }
            *state = next;
            true
        });
    }
}

impl RequestLifecycle for RequestContext {
    fn mark_in_flight(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == RequestState::Pending {
                *state = RequestState::InFlight;
                true
            } else {
                false
            }
        });
    }

    fn mark_finished(&self) {
        self.finish();
    }

    fn fail(&self, error: &YieldError) {
        tracing::error!("Request {} failed: {}", self.inner.request_id, error);
        self.error(&error.to_string());
    }
}
