//! Clock synchronization with the device.
//!
//! Feeding plans execute on the device clock, so the engine keeps watching
//! it from two sides:
//!
//! - It periodically runs a correlated sync exchange on the ntp channel,
//!   estimating the device clock offset from the exchange midpoint so
//!   transport latency cancels out.
//! - The device itself posts its clock for checking (on boot and before
//!   plan execution); the engine answers with a calibration flag when the
//!   reported clock is too far off.
//!
//! Losing time sync never changes the life-cycle state. It only degrades
//! the accuracy signal, and the exchange keeps retrying with capped
//! backoff until it succeeds.

/// Most recent successful measurement. Replaced wholesale on every sync -
/// never averaged with stale samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockOffset {
    pub offset_ms: i64,
    pub measured_at_ms: i64,
    /// Offset delta against the previous measurement.
    pub last_drift_ms: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct TimeSyncSettings {
    /// Normal interval between sync exchanges.
    pub interval_ms: i64,
    /// Per-request timeout; sync requests are short-fused.
    pub timeout_ms: i64,
    /// Retry backoff bounds after a timed-out exchange.
    pub retry_min_ms: i64,
    pub retry_max_ms: i64,
    /// Offset delta beyond which an immediate resync is scheduled, and
    /// device-reported clocks are told to recalibrate.
    pub drift_threshold_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub offset: ClockOffset,
    /// Drift exceeded the threshold; the next sync is immediate.
    pub drift_exceeded: bool,
}

pub struct TimeSynchronizer {
    settings: TimeSyncSettings,
    offset: Option<ClockOffset>,
    next_sync_at_ms: i64,
    retry_delay_ms: i64,
    degraded: bool,
}

impl TimeSynchronizer {
    pub fn new(settings: TimeSyncSettings) -> Self {
        TimeSynchronizer {
            retry_delay_ms: settings.retry_min_ms,
            settings,
            offset: None,
            next_sync_at_ms: 0,
            degraded: false,
        }
    }

    pub fn offset(&self) -> Option<&ClockOffset> {
        self.offset.as_ref()
    }

    /// Accuracy is degraded until the next successful exchange.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn timeout_ms(&self) -> i64 {
        self.settings.timeout_ms
    }

    pub fn due(&self, now_ms: i64) -> bool {
        now_ms >= self.next_sync_at_ms
    }

    /// A sync request went out; hold off until it resolves or times out.
    pub fn on_request_sent(&mut self, now_ms: i64) {
        self.next_sync_at_ms = now_ms + self.settings.interval_ms;
    }

    /// Complete an exchange. `send_ms`/`receive_ms` are local clock,
    /// `server_ms` is the device-reported time. The midpoint estimate
    /// cancels symmetric transport latency:
    /// `offset = server - (send + receive) / 2`.
    pub fn complete(
        &mut self,
        send_ms: i64,
        receive_ms: i64,
        server_ms: i64,
        now_ms: i64,
    ) -> SyncOutcome {
        let offset_ms = server_ms - (send_ms + receive_ms) / 2;
        let last_drift_ms = match self.offset {
            Some(previous) => offset_ms - previous.offset_ms,
            None => 0,
        };
        let offset = ClockOffset {
            offset_ms,
            measured_at_ms: now_ms,
            last_drift_ms,
        };
        self.offset = Some(offset);
        self.degraded = false;
        self.retry_delay_ms = self.settings.retry_min_ms;

        let drift_exceeded = last_drift_ms.abs() > self.settings.drift_threshold_ms;
        self.next_sync_at_ms = if drift_exceeded {
            now_ms
        } else {
            now_ms + self.settings.interval_ms
        };
        SyncOutcome {
            offset,
            drift_exceeded,
        }
    }

    /// The exchange timed out. Never abandoned - retried with doubling
    /// delay up to the cap, and flagged degraded in the meantime.
    pub fn on_timeout(&mut self, now_ms: i64) {
        self.degraded = true;
        self.next_sync_at_ms = now_ms + self.retry_delay_ms;
        self.retry_delay_ms = (self.retry_delay_ms * 2).min(self.settings.retry_max_ms);
    }

    /// Check a device-reported clock against ours; `true` means the device
    /// must recalibrate (the reply carries `calibrationTag`).
    pub fn needs_calibration(&self, device_ms: i64, local_ms: i64) -> bool {
        (local_ms - device_ms).abs() > self.settings.drift_threshold_ms
    }
}
