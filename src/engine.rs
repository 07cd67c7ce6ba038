//! The protocol engine.
//!
//! One engine drives one device over one transport session, with
//! single-threaded cooperative scheduling: the host calls `tick()`
//! periodically and everything - inbound traffic, watchdogs, correlation
//! sweeps, sync timers, reconnect schedules - runs from that one call.
//! Nothing here blocks and nothing needs a lock.
//!
//! `tick()` takes the clock as an argument internally (`tick_at`), which
//! is what makes the whole engine drivable from tests without a broker or
//! a real clock.

use std::collections::VecDeque;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::command::{Command, RetryPolicy};
use crate::config::FeederConfig;
use crate::connection::{Backoff, ConnectionManager, MqttTransport, Transport, TransportEvent};
use crate::correlation::{CorrelationTable, PendingRequest, RegisterError};
use crate::dispatch::{DeviceAction, Dispatcher, Effect, OutboundRequest};
use crate::envelope::{Envelope, MessageId, SystemFrame};
use crate::epoch_ms;
use crate::feedplan::FeedPlanEntry;
use crate::heartbeat::{HeartbeatFrame, HeartbeatMonitor};
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleState, Transition};
use crate::snapshot::{SnapshotBoard, StateSink};
use crate::store::PlanStore;
use crate::switches::Feature;
use crate::timesync::{TimeSyncSettings, TimeSynchronizer};
use crate::topic::{Channel, Direction, TopicMap};

/// Attempts at regenerating a colliding message id before giving up.
const MESSAGE_ID_RETRIES: usize = 3;

pub struct FeederEngine {
    cfg: FeederConfig,
    topics: TopicMap,
    conn: ConnectionManager,
    lifecycle: Lifecycle,
    heartbeat: HeartbeatMonitor,
    timesync: TimeSynchronizer,
    correlation: CorrelationTable,
    dispatcher: Dispatcher,
    queue: VecDeque<OutboundRequest>,
    board: SnapshotBoard,
    sink: Box<dyn StateSink>,
    store: Box<dyn PlanStore>,
    startup_deadline_ms: Option<i64>,
    sync_in_flight: bool,
    started: bool,
    /// Last clock value seen by `start_at`/`tick_at`; caller-facing
    /// operations stamp their requests with it.
    clock_ms: i64,
}

impl FeederEngine {
    pub fn new(
        cfg: FeederConfig,
        transport: Box<dyn Transport>,
        sink: Box<dyn StateSink>,
        store: Box<dyn PlanStore>,
    ) -> Self {
        let topics = TopicMap::new(cfg.identity.serial.clone());
        let conn = ConnectionManager::new(
            transport,
            topics.subscribe_set(),
            Backoff::new(cfg.timing.reconnect_min_ms, cfg.timing.reconnect_max_ms),
        );
        let timesync = TimeSynchronizer::new(TimeSyncSettings {
            interval_ms: cfg.timing.sync_interval_ms,
            timeout_ms: cfg.timing.sync_timeout_ms,
            retry_min_ms: cfg.timing.sync_retry_min_ms,
            retry_max_ms: cfg.timing.sync_retry_max_ms,
            drift_threshold_ms: cfg.timing.drift_threshold_ms,
        });
        FeederEngine {
            topics,
            conn,
            lifecycle: Lifecycle::new(0),
            heartbeat: HeartbeatMonitor::new(cfg.timing.heartbeat_window_ms),
            timesync,
            correlation: CorrelationTable::new(),
            dispatcher: Dispatcher::new(cfg.plan),
            queue: VecDeque::new(),
            board: SnapshotBoard::new(),
            sink,
            store,
            startup_deadline_ms: None,
            sync_in_flight: false,
            started: false,
            clock_ms: 0,
            cfg,
        }
    }

    /// Engine wired to the real broker, as `feederd` runs it.
    pub fn with_mqtt(
        cfg: FeederConfig,
        sink: Box<dyn StateSink>,
        store: Box<dyn PlanStore>,
    ) -> Self {
        let transport = Box::new(MqttTransport::new(cfg.broker()));
        Self::new(cfg, transport, sink, store)
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn time_sync_degraded(&self) -> bool {
        self.timesync.degraded()
    }

    pub fn confirmed_plan(&self) -> &[FeedPlanEntry] {
        self.dispatcher.feed_plans().confirmed()
    }

    pub fn snapshot_board(&self) -> &SnapshotBoard {
        &self.board
    }

    // ---------------- host runtime hooks ----------------

    pub fn start(&mut self) -> Result<()> {
        self.start_at(epoch_ms())
    }

    pub fn start_at(&mut self, now_ms: i64) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.clock_ms = now_ms;
        // Recover persisted intent before anything touches the wire.
        let stored = self.store.load_plans()?;
        if !stored.is_empty() {
            self.dispatcher.adopt_stored_plan(stored);
        }
        if let Some(portions) = self.store.manual_portion()? {
            if let Err(e) = self.dispatcher.set_manual_portions(portions) {
                log::warn!("stored manual portion invalid: {}", e);
            }
        }

        self.started = true;
        if self.conn.connect_now(now_ms) {
            self.apply_lifecycle(LifecycleEvent::ConnectStarted, now_ms);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop_at(epoch_ms())
    }

    pub fn stop_at(&mut self, now_ms: i64) {
        if !self.started {
            return;
        }
        self.apply_lifecycle(LifecycleEvent::ShutdownRequested, now_ms);
        self.abort_pending("shutdown");
        self.queue.clear();
        self.heartbeat.disarm();
        self.conn.close();
        self.started = false;
    }

    pub fn tick(&mut self) -> Result<()> {
        self.tick_at(epoch_ms())
    }

    pub fn tick_at(&mut self, now_ms: i64) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.clock_ms = now_ms;

        for event in self.conn.poll() {
            match event {
                TransportEvent::Connected => self.on_session_up(now_ms),
                TransportEvent::Disconnected { reason } => {
                    log::warn!("transport lost: {}", reason);
                    self.on_session_lost(now_ms);
                }
                TransportEvent::Message { topic, payload } => {
                    self.route_message(&topic, &payload, now_ms);
                }
            }
        }

        // Startup window: a session without a first heartbeat goes back
        // through the reconnect path.
        if self.lifecycle.state() == LifecycleState::AwaitingFirstHeartbeat {
            if let Some(deadline) = self.startup_deadline_ms {
                if now_ms >= deadline {
                    log::warn!("no first heartbeat within the startup window");
                    self.apply_lifecycle(LifecycleEvent::StartupWindowElapsed, now_ms);
                    self.conn.session_lost(now_ms);
                }
            }
        }

        if self.heartbeat.check(now_ms) {
            log::warn!("heartbeat missed");
            self.on_heartbeat_missed(now_ms);
        }

        for pending in self.correlation.sweep(now_ms) {
            self.on_request_timeout(pending, now_ms);
        }

        if self.lifecycle.is_online() && !self.sync_in_flight && self.timesync.due(now_ms) {
            self.send_time_sync(now_ms);
        }

        if self.lifecycle.state() == LifecycleState::Reconnecting && self.conn.reconnect_due(now_ms)
        {
            if self.conn.connect_now(now_ms) {
                self.apply_lifecycle(LifecycleEvent::BackoffElapsed, now_ms);
            }
        }

        if self.lifecycle.is_online() {
            self.conn.maybe_reset_backoff(now_ms);
        }

        Ok(())
    }

    // ---------------- caller-facing operations ----------------

    /// Validate and adopt a feeding plan, persist it, and sync it to the
    /// device (queued while not online).
    pub fn set_feed_plan(&mut self, entries: Vec<FeedPlanEntry>) -> Result<()> {
        self.dispatcher.set_plan(entries)?;
        self.store.save_plans(self.dispatcher.feed_plans().desired())?;
        let request = self.dispatcher.build_plan_sync(self.clock_ms);
        self.submit(request, self.clock_ms);
        Ok(())
    }

    /// One-shot feed. `None` uses the stored default portion count.
    pub fn manual_feed(&mut self, portions: Option<u8>) -> Result<()> {
        let request = self.dispatcher.build_manual_feed(portions)?;
        self.submit(request, self.clock_ms);
        Ok(())
    }

    pub fn set_manual_portions(&mut self, portions: u8) -> Result<()> {
        self.dispatcher.set_manual_portions(portions)?;
        self.store.set_manual_portion(portions)?;
        Ok(())
    }

    pub fn set_feature(&mut self, feature: Feature, on: bool) -> Result<()> {
        self.dispatcher.request_switch(feature, on)?;
        self.submit_attr_set();
        Ok(())
    }

    /// Feeding audio carries its URL; both are validated before anything
    /// is sent because a bad URL reboots the device.
    pub fn set_audio(&mut self, on: bool, url: &str) -> Result<()> {
        self.dispatcher.request_audio(on, url)?;
        self.submit_attr_set();
        Ok(())
    }

    pub fn device_action(&mut self, action: DeviceAction) -> Result<()> {
        let request = self.dispatcher.build_device_action(action);
        self.submit(request, self.clock_ms);
        Ok(())
    }

    /// Query the full device state (attributes, config, identifiers).
    pub fn refresh_diagnostics(&mut self) {
        for command in [Command::AttrGet, Command::GetConfig, Command::DeviceInfo] {
            let request = self.dispatcher.build_query(command);
            self.submit(request, self.clock_ms);
        }
    }

    fn submit_attr_set(&mut self) {
        if let Some(request) = self.dispatcher.build_attr_set() {
            self.submit(request, self.clock_ms);
        }
    }

    // ---------------- session events ----------------

    fn on_session_up(&mut self, now_ms: i64) {
        if let Err(e) = self.conn.on_session_established() {
            log::warn!("resubscribe failed: {:#}", e);
            self.on_session_lost(now_ms);
            return;
        }
        self.apply_lifecycle(LifecycleEvent::SessionEstablished, now_ms);
        self.startup_deadline_ms = Some(now_ms + self.cfg.timing.startup_window_ms);
    }

    fn on_session_lost(&mut self, now_ms: i64) {
        self.apply_lifecycle(LifecycleEvent::TransportLost, now_ms);
        self.conn.session_lost(now_ms);
    }

    fn on_heartbeat_missed(&mut self, now_ms: i64) {
        let transition = self.apply_lifecycle(LifecycleEvent::HeartbeatMissed, now_ms);
        if matches!(
            transition,
            Some(Transition {
                to: LifecycleState::Reconnecting,
                ..
            })
        ) {
            // The broker session may still be up; cycle it anyway so the
            // device reattaches cleanly.
            self.conn.session_lost(now_ms);
        }
    }

    /// Apply a life-cycle event and run the entry actions of the state it
    /// lands in.
    fn apply_lifecycle(&mut self, event: LifecycleEvent, now_ms: i64) -> Option<Transition> {
        let transition = self.lifecycle.apply(event, now_ms)?;
        self.publish_snapshot(
            "status",
            vec![("lifecycle".to_string(), transition.to.to_string())],
        );

        match transition.to {
            LifecycleState::Online => {
                self.conn.note_online(now_ms);
                self.startup_deadline_ms = None;
                self.on_online(now_ms);
            }
            LifecycleState::Reconnecting | LifecycleState::Disconnected => {
                self.conn.note_offline();
                self.heartbeat.disarm();
                self.startup_deadline_ms = None;
                self.abort_pending("aborted: left online state");
            }
            _ => {}
        }
        Some(transition)
    }

    /// Entering `Online`: full state resync, then the deferred queue in
    /// FIFO order.
    fn on_online(&mut self, now_ms: i64) {
        for command in [Command::GetConfig, Command::AttrGet] {
            let request = self.dispatcher.build_query(command);
            self.send_request(request, 0, now_ms);
        }
        let plan_sync = self.dispatcher.build_plan_sync(now_ms);
        self.send_request(plan_sync, 0, now_ms);

        while let Some(request) = self.queue.pop_front() {
            self.send_request(request, 0, now_ms);
        }
    }

    fn abort_pending(&mut self, reason: &str) {
        for pending in self.correlation.cancel_all() {
            log::warn!(
                "request {} ({}) {}",
                pending.command.name(),
                pending.message_id,
                reason
            );
        }
        self.sync_in_flight = false;
    }

    // ---------------- outbound ----------------

    /// Queue or send depending on life-cycle state. Replies never come
    /// through here - they bypass the queue entirely.
    fn submit(&mut self, request: OutboundRequest, now_ms: i64) {
        if self.lifecycle.is_online() {
            self.send_request(request, 0, now_ms);
        } else {
            log::debug!(
                "queueing {} until device is online",
                request.command.name()
            );
            self.queue.push_back(request);
        }
    }

    fn send_request(&mut self, request: OutboundRequest, attempt: u32, now_ms: i64) {
        let command = request.command;
        let timeout_ms = if command == Command::NtpSync {
            self.timesync.timeout_ms()
        } else {
            self.cfg.timing.request_timeout_ms
        };

        let mut message_id = MessageId::generate();
        if command.expects_response() {
            let mut registered = false;
            for _ in 0..MESSAGE_ID_RETRIES {
                match self.correlation.register(PendingRequest {
                    command,
                    channel: command.channel(),
                    message_id: message_id.clone(),
                    fields: request.fields.clone(),
                    submitted_at_ms: now_ms,
                    deadline_ms: now_ms + timeout_ms,
                    attempt,
                }) {
                    Ok(()) => {
                        registered = true;
                        break;
                    }
                    Err(RegisterError::DuplicateMessageId(id)) => {
                        log::warn!("message id collision on {}, regenerating", id);
                        message_id = MessageId::generate();
                    }
                }
            }
            if !registered {
                self.raise_alert(format!(
                    "could not allocate a message id for {}",
                    command.name()
                ));
                return;
            }
        }

        let payload = Envelope::encode(command.id(), &message_id, now_ms, &request.fields);
        let topic = self.topics.topic(command.channel(), Direction::Sub);
        if let Err(e) = self.conn.publish(&topic, &payload) {
            log::warn!("publish {} failed: {:#}", command.name(), e);
            self.correlation.cancel(message_id.as_str());
            self.queue.push_back(request);
            return;
        }
        if command == Command::NtpSync {
            self.sync_in_flight = true;
        }
        log::debug!("sent {} ({})", command.name(), message_id);
    }

    fn send_time_sync(&mut self, now_ms: i64) {
        let mut fields = Map::new();
        fields.insert(
            "timezone".into(),
            Value::from(self.cfg.timezone_offset_hours),
        );
        let request = OutboundRequest {
            command: Command::NtpSync,
            fields,
        };
        self.timesync.on_request_sent(now_ms);
        self.send_request(request, 0, now_ms);
    }

    fn on_request_timeout(&mut self, pending: PendingRequest, now_ms: i64) {
        if pending.command == Command::NtpSync {
            self.sync_in_flight = false;
            self.timesync.on_timeout(now_ms);
            self.publish_snapshot(
                "time_sync",
                vec![("degraded".to_string(), "true".to_string())],
            );
            return;
        }

        match pending.command.retry_policy() {
            RetryPolicy::Once if pending.attempt == 0 => {
                log::warn!("{} timed out, retrying once", pending.command.name());
                let request = OutboundRequest {
                    command: pending.command,
                    fields: pending.fields,
                };
                self.send_request(request, 1, now_ms);
            }
            _ => {
                self.raise_alert(format!(
                    "request {} timed out{}",
                    pending.command.name(),
                    if pending.command.is_destructive() {
                        "; not retried, surfaced as failed"
                    } else {
                        ""
                    }
                ));
            }
        }
    }

    // ---------------- inbound ----------------

    fn route_message(&mut self, topic: &str, payload: &[u8], now_ms: i64) {
        let Some((channel, direction)) = self.topics.parse(topic) else {
            log::warn!("unrecognized topic {}, dropping", topic);
            return;
        };
        if direction != Direction::Post {
            // Our own publishes looped back; nothing to do with them.
            log::debug!("ignoring sub-direction message on {}", topic);
            return;
        }

        match channel {
            Channel::Heart => self.handle_heartbeat(payload, now_ms),
            Channel::Ntp => self.handle_ntp(payload, now_ms),
            Channel::Broadcast => {
                // Semantics unresolved; observed only, never interpreted.
                log::warn!(
                    "broadcast message dropped: {}",
                    String::from_utf8_lossy(payload)
                );
            }
            Channel::Ota => {
                log::warn!(
                    "ota message dropped (ota flow unsupported): {}",
                    String::from_utf8_lossy(payload)
                );
            }
            Channel::Event | Channel::Service | Channel::Config | Channel::System => {
                self.handle_envelope(channel, payload, now_ms);
            }
        }
    }

    fn handle_heartbeat(&mut self, payload: &[u8], now_ms: i64) {
        let frame = match SystemFrame::decode(payload).and_then(|f| HeartbeatFrame::from_frame(&f))
        {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping malformed heartbeat: {}", e);
                return;
            }
        };

        let signal = self.heartbeat.observe(&frame, now_ms);
        self.publish_snapshot(
            "wifi",
            vec![
                ("rssi".to_string(), frame.rssi.to_string()),
                ("type".to_string(), frame.wifi_type.to_string()),
            ],
        );

        if signal.restarted {
            // Count regression means the firmware rebooted between two
            // beacons; force the full resync path.
            log::warn!("heartbeat count regressed, device restarted");
            self.on_heartbeat_missed(now_ms);
            self.on_heartbeat_missed(now_ms);
            return;
        }

        self.apply_lifecycle(LifecycleEvent::HeartbeatReceived, now_ms);
        if self.timesync.needs_calibration(frame.timestamp_ms, now_ms)
            && self.lifecycle.is_online()
            && !self.sync_in_flight
        {
            log::info!("device clock drifted per heartbeat, forcing sync");
            self.send_time_sync(now_ms);
        }
    }

    fn handle_ntp(&mut self, payload: &[u8], now_ms: i64) {
        let frame = match SystemFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping malformed ntp frame: {}", e);
                return;
            }
        };

        // A frame carrying one of our message ids is a sync response.
        if let Some(message_id) = &frame.message_id {
            if let Some(pending) = self.correlation.resolve(Channel::Ntp, message_id.as_str()) {
                self.sync_in_flight = false;
                let outcome = self.timesync.complete(
                    pending.submitted_at_ms,
                    now_ms,
                    frame.timestamp_ms,
                    now_ms,
                );
                self.publish_snapshot(
                    "time_sync",
                    vec![
                        ("offset_ms".to_string(), outcome.offset.offset_ms.to_string()),
                        ("drift_ms".to_string(), outcome.offset.last_drift_ms.to_string()),
                        ("degraded".to_string(), "false".to_string()),
                    ],
                );
                if outcome.drift_exceeded {
                    log::info!(
                        "clock drift {}ms exceeds threshold, resyncing now",
                        outcome.offset.last_drift_ms
                    );
                }
                return;
            }
        }

        // Otherwise it is the device checking its own clock; answer with
        // a calibration verdict.
        let needs_calibration = self.timesync.needs_calibration(frame.timestamp_ms, now_ms);
        if needs_calibration {
            log::info!("device clock off, replying with calibration");
        }
        let mut fields = Map::new();
        fields.insert("code".into(), Value::from(0));
        fields.insert("calibrationTag".into(), Value::from(needs_calibration));
        fields.insert(
            "timezone".into(),
            Value::from(self.cfg.timezone_offset_hours),
        );
        let payload = SystemFrame::encode(Some(Command::Ntp.id()), None, now_ms, &fields);
        let topic = self.topics.topic(Channel::Ntp, Direction::Sub);
        if let Err(e) = self.conn.publish(&topic, &payload) {
            log::warn!("ntp reply failed: {:#}", e);
        }
    }

    fn handle_envelope(&mut self, channel: Channel, payload: &[u8], now_ms: i64) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed envelope on {}: {}", channel, e);
                return;
            }
        };

        let effects = match self
            .correlation
            .resolve(channel, envelope.message_id.as_str())
        {
            Some(pending) => self.dispatcher.handle_response(&pending, &envelope),
            None => self.dispatcher.handle_event(channel, &envelope, now_ms),
        };
        self.run_effects(effects, now_ms);
    }

    fn run_effects(&mut self, effects: Vec<Effect>, now_ms: i64) {
        for effect in effects {
            match effect {
                Effect::Reply {
                    channel,
                    command,
                    message_id,
                    fields,
                } => {
                    // Acks flow regardless of life-cycle state; the device
                    // needs them to make progress.
                    let payload = Envelope::encode(command.id(), &message_id, now_ms, &fields);
                    let topic = self.topics.topic(channel, Direction::Sub);
                    if let Err(e) = self.conn.publish(&topic, &payload) {
                        log::warn!("reply to {} failed: {:#}", command.name(), e);
                    }
                }
                Effect::Snapshot { group, values } => {
                    self.publish_snapshot(group, values);
                }
                Effect::ClockCheck {
                    device_timestamp_ms,
                } => {
                    if self.timesync.needs_calibration(device_timestamp_ms, now_ms)
                        && self.lifecycle.is_online()
                        && !self.sync_in_flight
                    {
                        log::info!("device timestamp drifted, forcing sync");
                        self.send_time_sync(now_ms);
                    }
                }
                Effect::Alert { message } => {
                    self.raise_alert(message);
                }
            }
        }
    }

    fn raise_alert(&mut self, message: String) {
        log::warn!("{}", message);
        self.publish_snapshot("status", vec![("last_error".to_string(), message)]);
    }

    fn publish_snapshot(&mut self, group: &str, values: Vec<(String, String)>) {
        self.board.update(&mut *self.sink, group, values);
    }
}
