//! Debug JSON-line stream.
//!
//! When debug mode is on, every state transition of the flow mutex engine
//! emits one JSON line to stderr carrying the packet identity, the flow id,
//! the TCP header fields and a human-readable message. The stream is meant
//! for offline correlation, not for the internal `tracing` pipeline.

use std::{
    io::Write,
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};

use crate::tcp;

/// Emitter for per-transition debug records.
#[derive(Debug, Clone)]
pub struct DebugLog {
    enabled: bool,
    id: String,
    ctx: String,
}

impl DebugLog {
    /// `id` and `ctx` identify the capture run and its log name; both appear
    /// verbatim in every record.
    pub fn new(enabled: bool, id: impl Into<String>, ctx: impl Into<String>) -> Self {
        Self {
            enabled,
            id: id.into(),
            ctx: ctx.into(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn emit(
        &self,
        serial: u64,
        flow_id: u64,
        tcp_flags: u8,
        seq: u32,
        ack: u32,
        message: &str,
    ) {
        if !self.enabled {
            return;
        }
        let record = self.record(serial, flow_id, tcp_flags, seq, ack, message);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{record}");
    }

    fn record(
        &self,
        serial: u64,
        flow_id: u64,
        tcp_flags: u8,
        seq: u32,
        ack: u32,
        message: &str,
    ) -> Value {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        json!({
            "pcap": {
                "id": self.id,
                "ctx": self.ctx,
                "num": serial.to_string(),
            },
            "flow": flow_id.to_string(),
            "tcp": {
                "flags": tcp::flags_str(tcp_flags),
                "seq": seq,
                "ack": ack,
            },
            "timestamp": {
                "seconds": now.as_secs(),
                "nanos": now.subsec_nanos(),
            },
            "message": format!("#:{serial} | flow:{flow_id} | {message}"),
            "labels": {
                "tool": "pcap",
                "id": self.id,
                "name": self.ctx,
            },
        })
    }
}
