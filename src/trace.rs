//! Trace contexts and the trace-ID registry.
//!
//! Upstream request parsing installs an [`HttpRequest`] under its trace id;
//! response parsing reads it back to link the response to the request that
//! caused it. Entries are effectively immutable once installed and are
//! removed when their flow is untracked.

use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use fxhash::FxBuildHasher;

/// Trace context extracted from an HTTP message on a TCP stream.
///
/// Immutable once set. For HTTP/1.1 the stream id is derived from connection
/// reuse; for HTTP/2 it is the protocol-level stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub stream_id: u32,
}

/// Metadata of an in-flight HTTP request, keyed by trace id in the registry.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub timestamp: SystemTime,
}

/// Thread-safe map from trace id to the in-flight HTTP request it identifies.
///
/// Uses `DashMap` for lock-free concurrent access from translator workers;
/// no locking discipline beyond the map's own thread-safety is required.
pub struct TraceRegistry {
    requests: Arc<DashMap<String, HttpRequest, FxBuildHasher>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::default()),
        }
    }

    /// Install the request observed for `trace_id`, replacing any previous one.
    pub fn insert(&self, trace_id: impl Into<String>, request: HttpRequest) {
        self.requests.insert(trace_id.into(), request);
    }

    /// Request currently in flight for `trace_id`, if any.
    pub fn get(&self, trace_id: &str) -> Option<HttpRequest> {
        self.requests.get(trace_id).map(|entry| entry.value().clone())
    }

    /// Drop the entry for `trace_id`; called when its flow is untracked.
    pub fn remove(&self, trace_id: &str) -> Option<HttpRequest> {
        self.requests.remove(trace_id).map(|(_, request)| request)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TraceRegistry {
    fn clone(&self) -> Self {
        Self {
            requests: Arc::clone(&self.requests),
        }
    }
}
