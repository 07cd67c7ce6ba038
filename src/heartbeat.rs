//! Heartbeat supervision.
//!
//! The device publishes a beacon on the heart channel roughly every 51
//! seconds. The monitor is a deadline watchdog driven from the cooperative
//! tick loop: each beacon re-arms it, and an elapsed deadline yields one
//! miss signal for the life-cycle machine. Heartbeats are not correlated -
//! they carry no message id and get no reply.
//!
//! The beacon's `count` field increments once per beacon and resets when
//! the firmware reboots, so a regression is the cheapest reboot detector
//! we have between two watchdog windows.

use serde_json::Value;

use crate::envelope::{DecodeError, SystemFrame};

/// Decoded heartbeat beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatFrame {
    pub timestamp_ms: i64,
    pub count: u64,
    pub rssi: i64,
    pub wifi_type: u8,
}

impl HeartbeatFrame {
    pub fn from_frame(frame: &SystemFrame) -> Result<Self, DecodeError> {
        Ok(HeartbeatFrame {
            timestamp_ms: frame.timestamp_ms,
            count: field_u64(frame, "count")?,
            rssi: frame
                .fields
                .get("rssi")
                .and_then(Value::as_i64)
                .ok_or_else(|| DecodeError::MalformedEnvelope("missing rssi".into()))?,
            wifi_type: field_u64(frame, "wifiType")? as u8,
        })
    }
}

fn field_u64(frame: &SystemFrame, key: &str) -> Result<u64, DecodeError> {
    frame
        .fields
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::MalformedEnvelope(format!("missing {}", key)))
}

/// What a beacon told us beyond "still alive".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatSignal {
    /// The count regressed: the device rebooted since the last beacon.
    pub restarted: bool,
}

pub struct HeartbeatMonitor {
    window_ms: i64,
    deadline_ms: Option<i64>,
    last_count: Option<u64>,
}

impl HeartbeatMonitor {
    pub fn new(window_ms: i64) -> Self {
        HeartbeatMonitor {
            window_ms,
            deadline_ms: None,
            last_count: None,
        }
    }

    /// Arm the watchdog, e.g. when the session comes up and the first
    /// heartbeat is awaited.
    pub fn arm(&mut self, now_ms: i64) {
        self.deadline_ms = Some(now_ms + self.window_ms);
    }

    pub fn disarm(&mut self) {
        self.deadline_ms = None;
        self.last_count = None;
    }

    /// Record a beacon: re-arms the deadline and reports a firmware
    /// restart when the count regressed.
    pub fn observe(&mut self, frame: &HeartbeatFrame, now_ms: i64) -> HeartbeatSignal {
        let restarted = matches!(self.last_count, Some(last) if frame.count < last);
        self.last_count = Some(frame.count);
        self.deadline_ms = Some(now_ms + self.window_ms);
        HeartbeatSignal { restarted }
    }

    /// Check the deadline. Emits at most one miss per elapsed window and
    /// re-arms itself so consecutive misses keep being reported.
    pub fn check(&mut self, now_ms: i64) -> bool {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = Some(now_ms + self.window_ms);
                true
            }
            _ => false,
        }
    }
}
