//! Timing configuration for the flow mutex engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The `FlowMutexConf` struct carries the two deadlines that drive trace
/// tracking and carrier reclamation.
///
/// tracking_deadline: 10s - How long a trace-bearing request may gate connection
/// termination before its unblocker releases the flow, and how long flow state
/// stays readable after release before it is untracked.
/// carrier_deadline: 600s - How long a carrier may sit idle after its last
/// unlock before the reaper evicts it; also the reaper tick period.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowMutexConf {
    /// Deadline for a tracked request to be matched by a response.
    /// When it passes, the unblocker releases the wait-group token so that
    /// termination segments can make progress.
    /// - Default Value: `10s`
    #[serde(default = "defaults::tracking_deadline", with = "duration")]
    pub tracking_deadline: Duration,

    /// Idle time after the last unlock before a carrier is reaped.
    /// Flows whose termination segments were translated first leave carriers
    /// behind that no unlock will ever release; this bounds their lifetime.
    /// - Default Value: `600s`
    #[serde(default = "defaults::carrier_deadline", with = "duration")]
    pub carrier_deadline: Duration,
}

impl FlowMutexConf {
    pub fn validate(&self) -> Result<(), ConfError> {
        if self.tracking_deadline.is_zero() {
            return Err(ConfError::ZeroTrackingDeadline);
        }
        if self.carrier_deadline.is_zero() {
            return Err(ConfError::ZeroCarrierDeadline);
        }
        Ok(())
    }
}

impl Default for FlowMutexConf {
    fn default() -> FlowMutexConf {
        FlowMutexConf {
            tracking_deadline: defaults::tracking_deadline(),
            carrier_deadline: defaults::carrier_deadline(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfError {
    #[error("tracking_deadline must be greater than zero")]
    ZeroTrackingDeadline,

    #[error("carrier_deadline must be greater than zero")]
    ZeroCarrierDeadline,
}

mod defaults {
    use std::time::Duration;

    pub fn tracking_deadline() -> Duration {
        Duration::from_secs(10)
    }
    pub fn carrier_deadline() -> Duration {
        Duration::from_secs(600) // 10 minutes
    }
}

pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
