//! Per-flow serialization and trace correlation for a packet-capture
//! transformer.
//!
//! Packet translations arrive out of order from a parallel worker pool.
//! This crate serializes all operations touching one TCP flow, remembers
//! which HTTP trace was in flight on each stream within the flow, pairs
//! requests with later responses even when the responses carry no trace
//! header, gates connection-termination segments on in-flight trace-bearing
//! segments, and reclaims memory for idle or abandoned flows.
//!
//! The entry point is [`FlowMutex`]: workers call [`FlowMutex::lock`] per
//! decoded segment and finish with exactly one unlock variant on the
//! returned [`FlowLock`]. Ordering is guaranteed only within a flow; across
//! flows operations overlap freely.

mod carrier;
pub mod conf;
mod error;
pub mod index;
mod log;
mod reaper;
mod sync;
pub mod tcp;
pub mod trace;

mod flow_mutex;

pub use conf::{ConfError, FlowMutexConf};
pub use error::{FlowLockError, Result};
pub use flow_mutex::{FlowLock, FlowMutex};
pub use index::FlowIndex;
pub use log::DebugLog;
pub use trace::{HttpRequest, TraceContext, TraceRegistry};
