//! Three-level index: flow → stream → (sequence ↗ traced flow).
//!
//! The outer and middle levels are concurrent maps; insertions and deletions
//! there are safe without the carrier mutex, which only covers mutations
//! within one flow's sub-tree. The innermost level is an ordered map behind
//! its own small lock so that orderly teardown can walk it without holding
//! the carrier mutex.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use parking_lot::Mutex;

use crate::carrier::TracedFlow;

pub(crate) type SequenceMap = Mutex<BTreeMap<u32, Arc<TracedFlow>>>;
pub(crate) type StreamMap = DashMap<u32, Arc<SequenceMap>, FxBuildHasher>;

/// Index from flow id to the trace boundaries observed on each of its
/// streams. A trace id is in effect for the sequence range starting at the
/// boundary that installed it.
pub struct FlowIndex {
    flows: DashMap<u64, Arc<StreamMap>, FxBuildHasher>,
}

impl FlowIndex {
    pub fn new() -> Self {
        Self {
            flows: DashMap::default(),
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn contains_flow(&self, flow_id: u64) -> bool {
        self.flows.contains_key(&flow_id)
    }

    /// Install a trace boundary. Map levels are created with get-or-compute
    /// so concurrent first-touches collapse to one installation; an existing
    /// boundary at the same sequence is replaced.
    pub(crate) fn insert(
        &self,
        flow_id: u64,
        stream_id: u32,
        sequence: u32,
        tf: Arc<TracedFlow>,
    ) {
        let streams = Arc::clone(
            self.flows
                .entry(flow_id)
                .or_insert_with(|| Arc::new(StreamMap::default()))
                .value(),
        );
        let sequences = Arc::clone(
            streams
                .entry(stream_id)
                .or_insert_with(|| Arc::new(SequenceMap::default()))
                .value(),
        );
        sequences.lock().insert(sequence, tf);
    }

    /// Trace boundary in effect at `reference` on (flow, stream).
    ///
    /// HTTP/1.1 is not multiplexed, so the trace id in effect for a packet is
    /// the one installed at the greatest sequence boundary strictly below the
    /// packet's reference. When no boundary compares below the reference, the
    /// sequence counter has wrapped; the highest boundary is the one still in
    /// effect, so fall back to the last entry in ascending order.
    pub(crate) fn find(
        &self,
        flow_id: u64,
        stream_id: u32,
        reference: u32,
    ) -> Option<Arc<TracedFlow>> {
        let streams = Arc::clone(self.flows.get(&flow_id)?.value());
        let sequences = Arc::clone(streams.get(&stream_id)?.value());
        let map = sequences.lock();

        let below = map.range(..reference).next_back().map(|(_, tf)| Arc::clone(tf));
        below.or_else(|| map.values().next_back().map(Arc::clone))
    }

    /// Detach and return the whole sub-tree for `flow_id`; the caller owns
    /// its teardown.
    pub(crate) fn remove_flow(&self, flow_id: u64) -> Option<Arc<StreamMap>> {
        self.flows.remove(&flow_id).map(|(_, streams)| streams)
    }
}

impl Default for FlowIndex {
    fn default() -> Self {
        Self::new()
    }
}
