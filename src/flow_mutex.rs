//! Per-flow lock/unlock protocol, trace tracking and teardown.
//!
//! Translator workers decode TCP segments concurrently and in no particular
//! order. For every segment they call [`FlowMutex::lock`], mutate correlated
//! state through the returned [`FlowLock`], and finish with exactly one of
//! its unlock variants. The engine serializes all operations touching one
//! flow, remembers which trace was in flight on each stream of the flow, and
//! makes termination segments wait for in-flight trace-bearing segments
//! before flow state is wiped.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    carrier::{CarrierState, FlowCarrier, TracedFlow},
    conf::FlowMutexConf,
    error::Result,
    index::FlowIndex,
    log::DebugLog,
    tcp,
    trace::{TraceContext, TraceRegistry},
};

/// The per-flow serialization engine.
///
/// All state is in-memory and lives behind this handle; nothing is
/// persisted. The handle is cheap to clone and safe to share across worker
/// tasks. Carriers are created lazily on first lock of a flow and reclaimed
/// either by a terminating unlock or by the background reaper.
#[derive(Clone)]
pub struct FlowMutex {
    pub(crate) conf: FlowMutexConf,
    pub(crate) log: DebugLog,
    pub(crate) carriers: Arc<DashMap<u64, Arc<FlowCarrier>, FxBuildHasher>>,
    pub(crate) index: Arc<FlowIndex>,
    pub(crate) registry: Arc<TraceRegistry>,
    pub(crate) shutdown: CancellationToken,
}

impl FlowMutex {
    /// Build the engine and spawn its reaper task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        conf: FlowMutexConf,
        log: DebugLog,
        index: Arc<FlowIndex>,
        registry: Arc<TraceRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        conf.validate()?;
        let engine = Self {
            conf,
            log,
            carriers: Arc::new(DashMap::default()),
            index,
            registry,
            shutdown,
        };
        tokio::spawn(engine.clone().reap());
        Ok(engine)
    }

    /// Number of live carriers.
    pub fn carrier_count(&self) -> usize {
        self.carriers.len()
    }

    pub fn index(&self) -> &Arc<FlowIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<TraceRegistry> {
        &self.registry
    }

    /// Serialize on `flow_id` and return the handle for this segment.
    ///
    /// Termination segments (FIN/RST) first wait for the flow's wait-group
    /// to drain, so that they cannot race ahead of trace-bearing segments
    /// still in flight; the wait short-circuits on cancellation. The wait
    /// always happens before the mutex: requests add wait-group tokens while
    /// holding the mutex, so the reverse order would deadlock.
    pub async fn lock(
        &self,
        serial: u64,
        flow_id: u64,
        tcp_flags: u8,
        seq: u32,
        ack: u32,
        is_local: bool,
    ) -> FlowLock {
        let carrier = Arc::clone(
            self.carriers
                .entry(flow_id)
                .or_insert_with(|| Arc::new(FlowCarrier::new(serial, flow_id)))
                .value(),
        );

        if tcp::is_connection_termination(tcp_flags) {
            self.log.emit(serial, flow_id, tcp_flags, seq, ack, "waiting");
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = carrier.wg.wait() => {}
            }
            self.log.emit(serial, flow_id, tcp_flags, seq, ack, "continue");
        }

        // a termination segment may remove the carrier from the map while
        // other segments wait on the mutex; waiters keep their own reference
        // and later segments simply recreate the carrier
        let mut state = Arc::clone(&carrier.state).lock_owned().await;
        let acquired_at = Instant::now();
        state.last_locked_at = Some(acquired_at);

        FlowLock {
            engine: self.clone(),
            carrier,
            state,
            acquired_at,
            serial,
            flow_id,
            tcp_flags,
            seq,
            ack,
            is_local,
        }
    }

    /// Bind `ts` to the carrier and install its boundary in the index.
    ///
    /// The unblocker releases the flow if no response claims this trace
    /// within the tracking deadline; cancellation promotes it to firing
    /// immediately. The deactivation CAS keeps it race-free against the
    /// response path.
    fn track_connection(
        &self,
        carrier: &Arc<FlowCarrier>,
        serial: u64,
        tcp_flags: u8,
        seq: u32,
        ack: u32,
        is_local: bool,
        ts: &TraceContext,
    ) -> Arc<TracedFlow> {
        let flow_id = carrier.flow_id;
        let tf = TracedFlow::new(carrier, ts.clone());

        let deadline = self.conf.tracking_deadline;
        let unblocker = tokio::spawn({
            let engine = self.clone();
            let tf = Arc::clone(&tf);
            async move {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {}
                }
                engine.unblock(&tf, serial, tcp_flags, seq, ack).await;
            }
        });
        tf.arm(unblocker.abort_handle());

        let boundary = if is_local { ack } else { seq };
        self.index
            .insert(flow_id, ts.stream_id, boundary, Arc::clone(&tf));
        self.log.emit(
            serial,
            flow_id,
            tcp_flags,
            seq,
            ack,
            &format!("tracking/{}", ts.trace_id),
        );

        tf
    }

    /// Unblocker body: if this traced flow is still active, win the CAS and
    /// release the wait-group token its request added, letting termination
    /// events continue.
    async fn unblock(&self, tf: &Arc<TracedFlow>, serial: u64, tcp_flags: u8, seq: u32, ack: u32) {
        if tf
            .is_active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the response path won
            return;
        }
        let Some(carrier) = tf.carrier.upgrade() else {
            return;
        };

        let _state = carrier.state.lock().await;
        let flow_id = carrier.flow_id;
        self.log.emit(
            serial,
            flow_id,
            tcp_flags,
            seq,
            ack,
            &format!("unblocking/{}", tf.ts.trace_id),
        );
        if carrier.active_requests.fetch_sub(1, Ordering::AcqRel) >= 0 {
            carrier.wg.done();
            self.log.emit(
                serial,
                flow_id,
                tcp_flags,
                seq,
                ack,
                &format!("unblocked/{}", tf.ts.trace_id),
            );
        }
    }

    /// Full teardown of one flow: deactivate every traced flow, drop its
    /// registry entries, drain leftover wait-group tokens and forget the
    /// carrier. Panic-tolerant so one corrupt flow cannot take down the
    /// engine; idempotent so the reaper and a deferred release may race.
    pub(crate) fn untrack(&self, flow_id: u64, carrier: &Arc<FlowCarrier>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(streams) = self.index.remove_flow(flow_id) {
                for entry in streams.iter() {
                    let mut sequences = entry.value().lock();
                    for tf in sequences.values() {
                        tf.deactivate();
                        // remove orphaned trace ids
                        self.registry.remove(&tf.ts.trace_id);
                    }
                    sequences.clear();
                }
                streams.clear();
            }

            // drain wait-group tokens still held by unmatched requests
            while carrier.active_requests.load(Ordering::Acquire) > 0 {
                carrier.active_requests.fetch_sub(1, Ordering::AcqRel);
                carrier.wg.done();
            }

            self.carriers.remove(&flow_id);
        }));

        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                event.name = "flow_mutex.untrack_panic",
                flow.id = flow_id,
                error.message = %message,
                "panic isolated during untrack"
            );
            if self.log.enabled() {
                self.log
                    .emit(carrier.serial, flow_id, 0, 0, 0, "panic@untrack");
            }
        }
    }
}

/// Handle over one locked flow.
///
/// Owns the carrier mutex guard: dropping it releases the flow, and every
/// unlock variant consumes the handle, so exactly one can run per lock.
pub struct FlowLock {
    engine: FlowMutex,
    carrier: Arc<FlowCarrier>,
    state: OwnedMutexGuard<CarrierState>,
    acquired_at: Instant,
    serial: u64,
    flow_id: u64,
    tcp_flags: u8,
    seq: u32,
    ack: u32,
    is_local: bool,
}

impl FlowLock {
    /// Whether a trace-correlated unlock on this flow has seen HTTP/2.
    pub fn is_http2(&self) -> bool {
        self.state.is_http2
    }

    /// Trace context in effect for `stream_id` at this segment's reference
    /// sequence (ack for locally-originated traffic, seq otherwise).
    pub fn trace_lookup(&self, stream_id: u32) -> Option<TraceContext> {
        let reference = if self.is_local { self.ack } else { self.seq };
        self.engine
            .index
            .find(self.flow_id, stream_id, reference)
            .map(|tf| tf.ts.clone())
    }

    /// Unlock using the same flags the segment was locked with.
    pub fn unlock(self) -> (bool, Duration) {
        let tcp_flags = self.tcp_flags;
        self.unlock_with_flags(tcp_flags)
    }

    /// Unlock; termination flags delegate to [`Self::unlock_and_release`].
    pub fn unlock_with_flags(self, tcp_flags: u8) -> (bool, Duration) {
        if tcp::is_connection_termination(tcp_flags) {
            return self.unlock_and_release();
        }
        (false, self.release())
    }

    /// Unlock and, if this segment wins the release, schedule the flow's
    /// untracking.
    ///
    /// Many translations within one flow may be waiting on the mutex, and
    /// several of them may try to release (two FIN+ACKs, say): all of them
    /// unlock, exactly one wins the release and yields untracking. The
    /// winner leaves a grace window of one tracking deadline so late packets
    /// can still read flow state; cancellation collapses the window.
    pub fn unlock_and_release(self) -> (bool, Duration) {
        let released = (self.carrier.active_requests.load(Ordering::Acquire) == 0
            || self.engine.shutdown.is_cancelled())
            && self
                .carrier
                .released
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

        if released {
            let engine = self.engine.clone();
            let carrier = Arc::clone(&self.carrier);
            let (serial, flow_id) = (self.serial, self.flow_id);
            let (tcp_flags, seq, ack) = (self.tcp_flags, self.seq, self.ack);

            if engine.shutdown.is_cancelled() {
                engine.untrack(flow_id, &carrier);
            } else {
                let deadline = engine.conf.tracking_deadline;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(deadline) => {
                            engine.log.emit(serial, flow_id, tcp_flags, seq, ack, "untracking");
                        }
                    }
                    engine.untrack(flow_id, &carrier);
                });
            }
        }

        (released, self.release())
    }

    /// Trace-correlated unlock for segments carrying HTTP messages.
    ///
    /// Requests install tracking state so that responses without trace
    /// headers can still be correlated; responses retire it. A single
    /// HTTP/2 segment may carry both requests and responses over several
    /// streams, so both directions are handled in one pass. Requests and
    /// responses are accounted even when they outrun each other: the counter
    /// may transiently go negative and re-converges, and only the delayed
    /// termination suffers for it.
    ///
    /// Returns the resulting `active_requests` and the lock latency.
    pub fn unlock_with_trace_and_span(
        mut self,
        tcp_flags: u8,
        is_http2: bool,
        request_streams: &[u32],
        response_streams: &[u32],
        request_ts: &HashMap<u32, TraceContext>,
        response_ts: &HashMap<u32, TraceContext>,
    ) -> (i64, Duration) {
        // SYN/FIN/RST segments never install tracking state; fall through to
        // the flag-driven unlock with a plain counter snapshot
        if tcp::is_syn_fin_rst(self.tcp_flags) {
            let active_requests = self.carrier.active_requests.load(Ordering::Acquire);
            let (_, latency) = self.unlock_with_flags(tcp_flags);
            return (active_requests, latency);
        }

        self.state.is_http2 = is_http2;
        let mut active_requests = self.carrier.active_requests.load(Ordering::Acquire);

        for stream in request_streams {
            let Some(ts) = request_ts.get(stream) else {
                continue;
            };
            let tf = self.engine.track_connection(
                &self.carrier,
                self.serial,
                tcp_flags,
                self.seq,
                self.ack,
                self.is_local,
                ts,
            );
            active_requests = self.carrier.active_requests.fetch_add(1, Ordering::AcqRel) + 1;
            if active_requests > 0 {
                self.carrier.wg.add(1);
                self.emit(tcp_flags, &format!("request/{}", ts.trace_id));
            } else {
                // responses outran this request; do not gate termination on it
                tf.deactivate();
            }
        }

        for stream in response_streams {
            let Some(ts) = response_ts.get(stream) else {
                continue;
            };
            let found = {
                let reference = if self.is_local { self.ack } else { self.seq };
                self.engine.index.find(self.flow_id, ts.stream_id, reference)
            };
            active_requests = self.carrier.active_requests.fetch_sub(1, Ordering::AcqRel) - 1;
            if let Some(tf) = found {
                if active_requests >= 0 && tf.ts.trace_id == ts.trace_id && tf.deactivate() {
                    self.carrier.wg.done();
                    self.emit(tcp_flags, &format!("response/{}", ts.trace_id));
                }
            }
        }

        let (_, latency) = self.unlock_with_flags(tcp_flags);
        (active_requests, latency)
    }

    fn emit(&self, tcp_flags: u8, message: &str) {
        self.engine
            .log
            .emit(self.serial, self.flow_id, tcp_flags, self.seq, self.ack, message);
    }

    /// Record the unlock time, drop the mutex guard and report how long the
    /// lock was held.
    fn release(self) -> Duration {
        let FlowLock {
            mut state,
            acquired_at,
            ..
        } = self;
        state.last_unlocked_at = Some(Instant::now());
        drop(state);
        acquired_at.elapsed()
    }
}
