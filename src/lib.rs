//! Feeder protocol kernel.
//!
//! This crate speaks the reverse-engineered MQTT protocol of the PLAF203
//! automatic pet feeder, replacing the vendor cloud backend with a local
//! controller. The device is a hostile peer: it reboots on certain inputs,
//! coerces submitted values, expects acknowledgements for its own events,
//! and vanishes without notice - the engine is built around supervising it
//! rather than trusting it.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - `envelope`: wire codec for `{cmd, msgId, ts, ...}` JSON envelopes and
//!   the headerless heart/ntp frames
//! - `topic`: `Channel` x `Direction` topic derivation and parsing
//! - `command`: the closed command registry (unknown ids are data)
//! - `correlation`: in-flight request table with deadlines
//! - `lifecycle`: the device reachability state machine
//! - `heartbeat`, `timesync`: supervision and clock discipline
//! - `feedplan`, `switches`: desired/confirmed device configuration
//! - `dispatch`: per-feature interpretation of responses and events
//! - `connection`: transport session, backoff, resubscription
//! - `engine`: the cooperative `start`/`stop`/`tick` loop tying it together
//!
//! One process manages one device; everything is single-threaded and
//! lock-free by construction.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod command;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod feedplan;
pub mod heartbeat;
pub mod lifecycle;
pub mod snapshot;
pub mod store;
pub mod switches;
pub mod timesync;
pub mod topic;

pub use command::{Command, RetryPolicy};
pub use config::{BrokerSettings, DeviceIdentity, FeederConfig};
pub use connection::{Backoff, ConnectionManager, MqttTransport, Transport, TransportEvent};
pub use correlation::{CorrelationTable, PendingRequest, RegisterError};
pub use dispatch::{DeviceAction, Dispatcher, Effect, HandlerKind, OutboundRequest};
pub use engine::FeederEngine;
pub use envelope::{DecodeError, Envelope, MessageId, SystemFrame};
pub use feedplan::{FeedPlanEntry, FeedPlanManager, PlanError, PlanLimits};
pub use heartbeat::{HeartbeatFrame, HeartbeatMonitor};
pub use lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};
pub use snapshot::{LogSink, SnapshotBoard, StateSink};
pub use store::{InMemoryPlanStore, PlanStore, SqlitePlanStore};
pub use switches::{Feature, SwitchBank, SwitchError};
pub use timesync::{ClockOffset, TimeSyncSettings, TimeSynchronizer};
pub use topic::{Channel, Direction, TopicMap};

/// Milliseconds since the Unix epoch, the protocol's clock unit.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
