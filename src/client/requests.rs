//! Pending requests awaiting a response.
//!
//! A request leaves the table exactly once, whichever comes first: its real
//! response, a reassembly failure for its key, or its timeout. Whoever
//! removes the entry owns the callback, so late arrivals find nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::protocol::Progress;

/// Receives the terminal result of one request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

/// Receives upload progress for one request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
    /// Called for each `<key>~progress` acknowledgement.
    pub on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl RequestOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the progress callback.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

/// One in-flight request.
pub(crate) struct PendingRequest {
    pub event: String,
    pub created_at: Instant,
    pub timer: Option<JoinHandle<()>>,
    pub callback: ResponseCallback,
    pub on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("event", &self.event)
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    /// Stop the timer and hand `result` to the caller.
    pub(crate) fn settle(self, result: Result<Value, RpcError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        (self.callback)(result);
    }
}

/// Correlation key → pending request.
#[derive(Debug, Default)]
pub(crate) struct RequestRegistry {
    pending: HashMap<String, PendingRequest>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, key: String, request: PendingRequest) {
        self.pending.insert(key, request);
    }

    /// Remove and return the request for `key`, if still tracked.
    pub(crate) fn take(&mut self, key: &str) -> Option<PendingRequest> {
        self.pending.remove(key)
    }

    pub(crate) fn progress_callback(&self, key: &str) -> Option<ProgressCallback> {
        self.pending.get(key).and_then(|r| r.on_progress.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
