//! Per-flow carrier state and the traced-flow records bound to it.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Instant,
};

use tokio::{sync::Mutex, task::AbortHandle};

use crate::{sync::WaitGroup, trace::TraceContext};

/// Fields guarded by the carrier mutex. Holding the mutex grants exclusive
/// access to these and to the index sub-tree keyed by this flow.
#[derive(Debug, Default)]
pub(crate) struct CarrierState {
    pub(crate) is_http2: bool,
    #[allow(dead_code)]
    pub(crate) last_locked_at: Option<Instant>,
    pub(crate) last_unlocked_at: Option<Instant>,
}

/// Mutable state of one TCP flow: the mutex serializing all operations on
/// the flow, the wait-group gating termination segments, and the request
/// accounting the unlock paths maintain.
pub(crate) struct FlowCarrier {
    pub(crate) state: Arc<Mutex<CarrierState>>,
    pub(crate) wg: WaitGroup,
    /// Signed on purpose: responses may outrun their requests, transiently
    /// driving this below zero.
    pub(crate) active_requests: AtomicI64,
    /// Flips false to true exactly once; the winner performs untracking.
    pub(crate) released: AtomicBool,
    /// Packet that created this carrier.
    pub(crate) serial: u64,
    pub(crate) flow_id: u64,
    pub(crate) created_at: Instant,
}

impl FlowCarrier {
    pub(crate) fn new(serial: u64, flow_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CarrierState::default())),
            wg: WaitGroup::new(),
            active_requests: AtomicI64::new(0),
            released: AtomicBool::new(false),
            serial,
            flow_id,
            created_at: Instant::now(),
        }
    }
}

/// Binding of a trace context to a carrier, with a timed unblocker that
/// releases the wait-group token if no response arrives in time.
pub(crate) struct TracedFlow {
    /// Non-owning back-reference; the carrier outlives its traced flows.
    pub(crate) carrier: Weak<FlowCarrier>,
    pub(crate) ts: TraceContext,
    /// Flips true to false at most once. The party winning that CAS is the
    /// sole one entitled to release the wait-group token and to stop the
    /// unblocker.
    pub(crate) is_active: AtomicBool,
    unblocker: OnceLock<AbortHandle>,
}

impl TracedFlow {
    pub(crate) fn new(carrier: &Arc<FlowCarrier>, ts: TraceContext) -> Arc<Self> {
        Arc::new(Self {
            carrier: Arc::downgrade(carrier),
            ts,
            is_active: AtomicBool::new(true),
            unblocker: OnceLock::new(),
        })
    }

    /// Attach the unblocker task handle. If the flow was deactivated before
    /// the handle landed, the timer is stopped right away.
    pub(crate) fn arm(&self, handle: AbortHandle) {
        let _ = self.unblocker.set(handle);
        if !self.is_active.load(Ordering::Acquire) {
            if let Some(handle) = self.unblocker.get() {
                handle.abort();
            }
        }
    }

    /// Win the deactivation CAS and stop the unblocker. Returns false if
    /// another party (response match, fired unblocker, untrack) won first.
    pub(crate) fn deactivate(&self) -> bool {
        if self
            .is_active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(handle) = self.unblocker.get() {
                handle.abort();
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(trace_id: &str, stream_id: u32) -> TraceContext {
        TraceContext {
            trace_id: trace_id.to_string(),
            span_id: format!("span-{trace_id}"),
            stream_id,
        }
    }

    #[test]
    fn test_new_carrier_is_idle() {
        let carrier = FlowCarrier::new(7, 42);

        assert_eq!(carrier.serial, 7);
        assert_eq!(carrier.flow_id, 42);
        assert_eq!(carrier.active_requests.load(Ordering::Acquire), 0);
        assert!(!carrier.released.load(Ordering::Acquire));
        assert_eq!(carrier.wg.count(), 0);
    }

    #[test]
    fn test_deactivate_is_single_shot() {
        let carrier = Arc::new(FlowCarrier::new(1, 1));
        let tf = TracedFlow::new(&carrier, context("trace-1", 3));

        assert!(tf.deactivate());
        assert!(!tf.deactivate());
        assert!(!tf.is_active.load(Ordering::Acquire));
    }

    #[test]
    fn test_carrier_backref_is_non_owning() {
        let carrier = Arc::new(FlowCarrier::new(1, 1));
        let tf = TracedFlow::new(&carrier, context("trace-1", 3));

        assert!(tf.carrier.upgrade().is_some());
        drop(carrier);
        assert!(tf.carrier.upgrade().is_none());
    }
}
