//! Background eviction of idle carriers.
//!
//! Translation order is not guaranteed: when every termination segment of a
//! flow is translated before its other segments, the termination creates a
//! fresh carrier that no later unlock will release. Pooled connections that
//! simply go quiet hold carriers the same way. The reaper bounds both.

use std::sync::Arc;

use tracing::debug;

use crate::{carrier::FlowCarrier, flow_mutex::FlowMutex};

impl FlowMutex {
    /// Reaper loop; ticks every carrier deadline and exits on cancellation.
    pub(crate) async fn reap(self) {
        let period = self.conf.carrier_deadline;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            self.reap_idle_carriers();
        }
    }

    fn reap_idle_carriers(&self) {
        let deadline = self.conf.carrier_deadline;

        // snapshot first: untrack mutates the carriers map, and removing
        // entries from a shard being iterated would deadlock
        let candidates: Vec<(u64, Arc<FlowCarrier>)> = self
            .carriers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (flow_id, carrier) in candidates {
            // contended mutex means some operation is in flight; retry next tick
            let Ok(state) = carrier.state.try_lock() else {
                continue;
            };
            let Some(last_unlocked_at) = state.last_unlocked_at else {
                continue;
            };

            let idle = last_unlocked_at.elapsed();
            if idle < deadline {
                continue;
            }

            self.untrack(flow_id, &carrier);
            self.carriers.remove(&flow_id);
            self.log.emit(
                carrier.serial,
                flow_id,
                0,
                0,
                0,
                &format!(
                    "reaped flow '{flow_id}' after {}",
                    humantime::format_duration(idle)
                ),
            );
            debug!(
                event.name = "flow_mutex.reaped",
                flow.id = flow_id,
                idle_secs = idle.as_secs(),
                age_secs = carrier.created_at.elapsed().as_secs(),
                "reaped idle carrier"
            );
            drop(state);
        }
    }
}
