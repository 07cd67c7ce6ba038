//! Engine integration tests.
//!
//! The whole engine runs against an in-memory transport and an explicit
//! clock: tests script broker traffic and drive `tick_at`, then assert on
//! published frames, life-cycle state, and pushed snapshots.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::{json, Value};

use feeder_kernel::config::TimingSettings;
use feeder_kernel::{
    DeviceAction, DeviceIdentity, Envelope, Feature, FeederConfig, FeederEngine, FeedPlanEntry,
    InMemoryPlanStore, LifecycleState, PlanLimits, SnapshotBoard, SqlitePlanStore, StateSink,
    SystemFrame, Transport, TransportEvent,
};

const SERIAL: &str = "FE2036BC";
const T0: i64 = 1_700_000_000_000;

#[derive(Default)]
struct Shared {
    inbound: VecDeque<TransportEvent>,
    published: Vec<(String, Vec<u8>)>,
    subscribed: Vec<String>,
    open_calls: usize,
}

struct FakeTransport(Rc<RefCell<Shared>>);

impl Transport for FakeTransport {
    fn open(&mut self) -> anyhow::Result<()> {
        let mut shared = self.0.borrow_mut();
        shared.open_calls += 1;
        // The broker accepts immediately in tests.
        shared.inbound.push_back(TransportEvent::Connected);
        Ok(())
    }

    fn close(&mut self) {}

    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.0.borrow_mut().subscribed.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.0
            .borrow_mut()
            .published
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.0.borrow_mut().inbound.drain(..).collect()
    }
}

struct NullSink;

impl StateSink for NullSink {
    fn publish(&mut self, _group: &str, _values: &std::collections::BTreeMap<String, String>) {}
}

fn test_config() -> FeederConfig {
    FeederConfig {
        identity: DeviceIdentity {
            serial: SERIAL.into(),
            product_key: "plaf203key".into(),
            product_secret: "s3cret".into(),
        },
        mqtt_host: "127.0.0.1".into(),
        mqtt_port: 1883,
        keep_alive_secs: 60,
        timing: TimingSettings {
            heartbeat_window_ms: 81_000,
            startup_window_ms: 90_000,
            request_timeout_ms: 10_000,
            sync_interval_ms: 900_000,
            sync_timeout_ms: 5_000,
            sync_retry_min_ms: 5_000,
            sync_retry_max_ms: 300_000,
            drift_threshold_ms: 10_000,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 300_000,
        },
        plan: PlanLimits {
            max_entries: 10,
            min_portions: 1,
            max_portions: 12,
        },
        db_path: "unused".into(),
        timezone_offset_hours: 0,
    }
}

struct Rig {
    engine: FeederEngine,
    shared: Rc<RefCell<Shared>>,
}

impl Rig {
    fn new() -> Self {
        Self::with_store(Box::new(InMemoryPlanStore::new()))
    }

    fn with_store(store: Box<dyn feeder_kernel::PlanStore>) -> Self {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let transport = Box::new(FakeTransport(shared.clone()));
        let engine = FeederEngine::new(test_config(), transport, Box::new(NullSink), store);
        Rig { engine, shared }
    }

    fn topic(channel_dir: &str) -> String {
        format!("dl/plaf203/{}/{}", SERIAL, channel_dir)
    }

    fn deliver(&self, channel_dir: &str, payload: Value) {
        self.shared
            .borrow_mut()
            .inbound
            .push_back(TransportEvent::Message {
                topic: Self::topic(channel_dir),
                payload: serde_json::to_vec(&payload).unwrap(),
            });
    }

    fn deliver_disconnect(&self) {
        self.shared
            .borrow_mut()
            .inbound
            .push_back(TransportEvent::Disconnected {
                reason: "broker gone".into(),
            });
    }

    fn heartbeat(&self, count: u64, ts: i64) {
        self.deliver(
            "heart/post",
            json!({"cmd": 1, "ts": ts, "count": count, "rssi": -61, "wifiType": 1}),
        );
    }

    /// Decoded envelopes published to one topic, in publish order.
    fn sent(&self, channel_dir: &str) -> Vec<Envelope> {
        let topic = Self::topic(channel_dir);
        self.shared
            .borrow()
            .published
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, payload)| Envelope::decode(payload).expect("published envelope"))
            .collect()
    }

    fn sent_frames(&self, channel_dir: &str) -> Vec<SystemFrame> {
        let topic = Self::topic(channel_dir);
        self.shared
            .borrow()
            .published
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, payload)| SystemFrame::decode(payload).expect("published frame"))
            .collect()
    }

    fn clear_published(&self) {
        self.shared.borrow_mut().published.clear();
    }

    /// start + session up + first heartbeat. Leaves the engine `Online`
    /// at `T0 + 20`.
    fn go_online(&mut self) {
        self.engine.start_at(T0).unwrap();
        self.engine.tick_at(T0 + 10).unwrap();
        assert_eq!(
            self.engine.lifecycle_state(),
            LifecycleState::AwaitingFirstHeartbeat
        );
        self.heartbeat(1, T0 + 20);
        self.engine.tick_at(T0 + 20).unwrap();
        assert_eq!(self.engine.lifecycle_state(), LifecycleState::Online);
    }

    fn board(&self) -> &SnapshotBoard {
        self.engine.snapshot_board()
    }
}

fn plan_entry(plan_id: u32, hour: u8, minute: u8, portions: u8) -> FeedPlanEntry {
    FeedPlanEntry {
        plan_id,
        hour,
        minute,
        portions,
        enabled: true,
        audio_enabled: false,
        audio_times: 0,
        repeat_days: [false; 7],
    }
}

#[test]
fn subscribes_to_all_post_topics_on_session_up() {
    let mut rig = Rig::new();
    rig.engine.start_at(T0).unwrap();
    rig.engine.tick_at(T0 + 10).unwrap();

    let subscribed = rig.shared.borrow().subscribed.clone();
    assert_eq!(subscribed.len(), 8);
    assert!(subscribed.contains(&Rig::topic("heart/post")));
    assert!(subscribed.contains(&Rig::topic("event/post")));
    assert!(subscribed.contains(&Rig::topic("broadcast/post")));
}

#[test]
fn first_heartbeat_brings_the_device_online_with_a_resync_burst() {
    let mut rig = Rig::new();
    rig.go_online();

    // Full state resync: config query on the config channel, attribute
    // query and plan sync on the service channel.
    let config_cmds: Vec<u32> = rig.sent("config/sub").iter().map(|e| e.command).collect();
    assert_eq!(config_cmds, vec![40]);
    let service_cmds: Vec<u32> = rig.sent("service/sub").iter().map(|e| e.command).collect();
    assert_eq!(service_cmds, vec![20, 23]);
}

#[test]
fn requests_queue_while_offline_and_flush_fifo_once_online() {
    let mut rig = Rig::new();
    rig.engine.start_at(T0).unwrap();
    rig.engine.tick_at(T0 + 10).unwrap();

    // Not online yet: both requests must wait.
    rig.engine.manual_feed(Some(3)).unwrap();
    rig.engine.set_feature(Feature::Camera, true).unwrap();
    assert!(rig.sent("service/sub").is_empty());

    rig.heartbeat(1, T0 + 20);
    rig.engine.tick_at(T0 + 20).unwrap();

    // Burst first (20, 23), then the deferred queue in submit order.
    let service_cmds: Vec<u32> = rig.sent("service/sub").iter().map(|e| e.command).collect();
    assert_eq!(service_cmds, vec![20, 23, 22, 21]);

    let manual = &rig.sent("service/sub")[2];
    assert_eq!(manual.fields["grainNum"], Value::from(3));
}

#[test]
fn device_events_are_acked_even_before_online() {
    let mut rig = Rig::new();
    rig.engine.start_at(T0).unwrap();
    rig.engine.tick_at(T0 + 10).unwrap();

    rig.deliver(
        "event/post",
        json!({
            "cmd": 12, "msgId": "devmsg0000000000000000000000beef", "ts": T0,
            "cameraSwitch": true
        }),
    );
    rig.engine.tick_at(T0 + 15).unwrap();

    let acks = rig.sent("event/sub");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].command, 12);
    assert_eq!(acks[0].message_id.as_str(), "devmsg0000000000000000000000beef");
    assert_eq!(acks[0].fields["code"], Value::from(0));
    // Still waiting on the first heartbeat.
    assert_eq!(
        rig.engine.lifecycle_state(),
        LifecycleState::AwaitingFirstHeartbeat
    );
}

#[test]
fn two_missed_heartbeats_cycle_the_session() {
    let mut rig = Rig::new();
    rig.go_online();
    assert_eq!(rig.shared.borrow().open_calls, 1);

    // One window without a beacon: degraded but not gone.
    rig.engine.tick_at(T0 + 20 + 82_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Degraded);

    // A beacon recovers the device.
    rig.heartbeat(2, T0 + 110_000);
    rig.engine.tick_at(T0 + 110_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Online);

    // Two consecutive windows without beacons: reconnect.
    rig.engine.tick_at(T0 + 110_000 + 82_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Degraded);
    rig.engine.tick_at(T0 + 110_000 + 164_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Reconnecting);

    // Backoff elapses, a fresh session comes up.
    rig.engine.tick_at(T0 + 110_000 + 166_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Connecting);
    assert_eq!(rig.shared.borrow().open_calls, 2);
    rig.engine.tick_at(T0 + 110_000 + 166_010).unwrap();
    assert_eq!(
        rig.engine.lifecycle_state(),
        LifecycleState::AwaitingFirstHeartbeat
    );
}

#[test]
fn heartbeat_count_regression_forces_reconnect() {
    let mut rig = Rig::new();
    rig.go_online();

    rig.heartbeat(7, T0 + 50_000);
    rig.engine.tick_at(T0 + 50_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Online);

    // Count went backwards: the firmware rebooted between beacons.
    rig.heartbeat(1, T0 + 100_000);
    rig.engine.tick_at(T0 + 100_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Reconnecting);
}

#[test]
fn startup_window_without_heartbeat_goes_back_to_reconnecting() {
    let mut rig = Rig::new();
    rig.engine.start_at(T0).unwrap();
    rig.engine.tick_at(T0 + 10).unwrap();
    assert_eq!(
        rig.engine.lifecycle_state(),
        LifecycleState::AwaitingFirstHeartbeat
    );

    rig.engine.tick_at(T0 + 90_011).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Reconnecting);
}

#[test]
fn transport_loss_aborts_pending_and_reconnects() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    rig.engine.refresh_diagnostics();
    assert!(!rig.sent("service/sub").is_empty());

    rig.deliver_disconnect();
    rig.engine.tick_at(T0 + 1_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Reconnecting);

    // A very late response to an aborted request is stale: it must be
    // dropped without effect, not crash or resurrect state.
    // Stay below the minimum reconnect delay so the state is stable.
    let stale_id = rig.sent("service/sub")[0].message_id.clone();
    rig.deliver(
        "service/post",
        json!({"cmd": 20, "msgId": stale_id.as_str(), "ts": T0 + 1_900, "code": 0}),
    );
    rig.engine.tick_at(T0 + 1_900).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Reconnecting);
}

#[test]
fn time_sync_uses_the_midpoint_estimate() {
    let mut rig = Rig::new();
    rig.go_online();

    // Going online triggers an immediate sync exchange.
    let syncs = rig.sent_frames("ntp/sub");
    let sync = syncs
        .iter()
        .find(|f| f.command == Some(3))
        .expect("sync request sent");
    let message_id = sync.message_id.clone().expect("sync has a message id");
    let send_ms = sync.timestamp_ms;
    assert_eq!(send_ms, T0 + 20);

    // Device answers 100ms later reporting its own clock.
    let device_ms = T0 + 1_000;
    let receive_ms = T0 + 120;
    rig.deliver(
        "ntp/post",
        json!({"cmd": 3, "msgId": message_id.as_str(), "ts": device_ms}),
    );
    rig.engine.tick_at(receive_ms).unwrap();

    let time_sync = rig.board().group("time_sync").expect("snapshot");
    let expected = device_ms - (send_ms + receive_ms) / 2;
    assert_eq!(time_sync["offset_ms"], expected.to_string());
    assert_eq!(time_sync["degraded"], "false");
    assert!(!rig.engine.time_sync_degraded());
}

#[test]
fn sync_timeout_degrades_and_retries() {
    let mut rig = Rig::new();
    rig.go_online();
    let before = rig.sent_frames("ntp/sub").len();

    // Let the 5s sync timeout pass unanswered.
    rig.engine.tick_at(T0 + 20 + 5_001).unwrap();
    assert!(rig.engine.time_sync_degraded());

    // The retry fires after the 5s retry delay.
    rig.engine.tick_at(T0 + 20 + 10_010).unwrap();
    let after = rig.sent_frames("ntp/sub").len();
    assert!(after > before, "expected a retried sync exchange");
}

#[test]
fn device_clock_check_is_answered_with_calibration_verdict() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    // Device clock 60s off: calibrate.
    rig.deliver("ntp/post", json!({"cmd": 2, "ts": T0 + 30_000 - 60_000}));
    rig.engine.tick_at(T0 + 30_000).unwrap();

    let replies = rig.sent_frames("ntp/sub");
    let reply = replies.iter().find(|f| f.command == Some(2)).expect("reply");
    assert_eq!(reply.fields["calibrationTag"], Value::from(true));
    assert_eq!(reply.fields["code"], Value::from(0));

    rig.clear_published();

    // Device clock within threshold: no calibration.
    rig.deliver("ntp/post", json!({"cmd": 2, "ts": T0 + 31_000}));
    rig.engine.tick_at(T0 + 31_000).unwrap();
    let replies = rig.sent_frames("ntp/sub");
    let reply = replies.iter().find(|f| f.command == Some(2)).expect("reply");
    assert_eq!(reply.fields["calibrationTag"], Value::from(false));
}

#[test]
fn feed_plan_confirmation_honors_device_coercion_and_is_idempotent() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    rig.engine
        .set_feed_plan(vec![plan_entry(1, 8, 0, 7)])
        .unwrap();
    let sent = rig.sent("service/sub");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, 23);
    let message_id = sent[0].message_id.clone();

    // Nothing confirmed until the device answers.
    assert!(rig.engine.confirmed_plan().is_empty());

    // Device accepts but coerces portions 7 -> 6.
    let response = json!({
        "cmd": 23, "msgId": message_id.as_str(), "ts": T0 + 500, "code": 0,
        "plans": [{
            "planId": 1, "executionTime": "08:00", "repeatDay": [1,2,3,4,5,6,7],
            "enableAudio": false, "audioTimes": 0, "grainNum": 6, "syncTime": T0
        }]
    });
    rig.deliver("service/post", response.clone());
    rig.engine.tick_at(T0 + 500).unwrap();
    assert_eq!(rig.engine.confirmed_plan().len(), 1);
    assert_eq!(rig.engine.confirmed_plan()[0].portions, 6);

    // Duplicate delivery of the same response changes nothing.
    rig.deliver("service/post", response);
    rig.engine.tick_at(T0 + 600).unwrap();
    assert_eq!(rig.engine.confirmed_plan().len(), 1);
    assert_eq!(rig.engine.confirmed_plan()[0].portions, 6);
}

#[test]
fn invalid_feed_plan_is_rejected_before_any_transport_io() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    let err = rig
        .engine
        .set_feed_plan(vec![plan_entry(1, 8, 0, 6), plan_entry(2, 8, 0, 4)])
        .unwrap_err();
    assert!(err.to_string().contains("invalid feed plan entry 1"));
    assert!(rig.sent("service/sub").is_empty());
}

#[test]
fn diagnostics_timeout_is_retried_once_then_surfaced() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    rig.engine.set_feature(Feature::Recording, true).unwrap();
    assert_eq!(rig.sent("service/sub").len(), 1);

    // First timeout: silent retry with a fresh message id.
    rig.engine.tick_at(T0 + 20 + 10_001).unwrap();
    let sent = rig.sent("service/sub");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].command, 21);
    assert_ne!(sent[0].message_id.as_str(), sent[1].message_id.as_str());

    // Second timeout: surfaced as failed, no third attempt.
    rig.engine.tick_at(T0 + 20 + 21_000).unwrap();
    assert_eq!(rig.sent("service/sub").len(), 2);
    let status = rig.board().group("status").expect("status snapshot");
    assert!(status["last_error"].contains("ATTR_SET"));
}

#[test]
fn destructive_actions_are_not_auto_retried() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    rig.engine.device_action(DeviceAction::Reboot).unwrap();
    let sent = rig.sent("system/sub");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, 52);

    rig.engine.tick_at(T0 + 20 + 10_001).unwrap();
    // Still exactly one attempt; the failure is surfaced instead.
    assert_eq!(rig.sent("system/sub").len(), 1);
    let status = rig.board().group("status").expect("status snapshot");
    assert!(status["last_error"].contains("REBOOT"));
    assert!(status["last_error"].contains("failed"));
}

#[test]
fn attribute_echo_confirms_switches_and_updates_diagnostics() {
    let mut rig = Rig::new();
    rig.go_online();

    rig.engine.set_feature(Feature::Camera, true).unwrap();
    // Device echoes the write (coerced off) along with power state.
    rig.deliver(
        "event/post",
        json!({
            "cmd": 12, "msgId": "devmsg0000000000000000000000cafe", "ts": T0 + 1_000,
            "cameraSwitch": false, "electricQuantity": 76, "surplusGrain": false
        }),
    );
    rig.engine.tick_at(T0 + 1_000).unwrap();

    let switches = rig.board().group("switches").expect("switch snapshot");
    assert_eq!(switches["camera"], "false");
    let power = rig.board().group("power").expect("power snapshot");
    assert_eq!(power["battery_level"], "76");
    let food = rig.board().group("food").expect("food snapshot");
    assert_eq!(food["low_hopper"], "true");
}

#[test]
fn get_feed_plan_is_answered_from_the_persisted_desired_plan() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("feeder.db");
    let db_path = db_path.to_str().unwrap();

    // First run: adopt a plan while offline; it persists even though the
    // device never saw it.
    {
        let store = SqlitePlanStore::open(db_path).unwrap();
        let mut rig = Rig::with_store(Box::new(store));
        rig.engine.start_at(T0).unwrap();
        rig.engine
            .set_feed_plan(vec![plan_entry(4, 6, 30, 5)])
            .unwrap();
        rig.engine.stop_at(T0 + 100);
    }

    // Second run: the device pulls the plan and gets the stored entries.
    let store = SqlitePlanStore::open(db_path).unwrap();
    let mut rig = Rig::with_store(Box::new(store));
    rig.go_online();
    rig.clear_published();

    rig.deliver(
        "event/post",
        json!({"cmd": 14, "msgId": "devmsg0000000000000000000000f00d", "ts": T0 + 2_000}),
    );
    rig.engine.tick_at(T0 + 2_000).unwrap();

    let replies = rig.sent("event/sub");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, 14);
    let plans = replies[0].fields["plans"].as_array().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0]["planId"], Value::from(4));
    assert_eq!(plans[0]["grainNum"], Value::from(5));
}

#[test]
fn unknown_commands_and_foreign_topics_are_dropped_without_state_change() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.clear_published();

    rig.deliver(
        "event/post",
        json!({"cmd": 9999, "msgId": "devmsg000000000000000000000dead", "ts": T0, "weird": true}),
    );
    // Malformed envelope on a command channel.
    rig.deliver("service/post", json!({"msgId": "x"}));
    // Unresolved broadcast channel.
    rig.deliver("broadcast/post", json!({"cmd": 1, "ts": T0}));
    rig.shared
        .borrow_mut()
        .inbound
        .push_back(TransportEvent::Message {
            topic: "frigate/events".into(),
            payload: b"{}".to_vec(),
        });

    rig.engine.tick_at(T0 + 5_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Online);
    // Nothing was answered.
    assert!(rig.sent("event/sub").is_empty());
}

#[test]
fn stop_aborts_everything_and_goes_disconnected() {
    let mut rig = Rig::new();
    rig.go_online();
    rig.engine.refresh_diagnostics();

    rig.engine.stop_at(T0 + 1_000);
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Disconnected);

    // Ticks after stop are inert.
    rig.heartbeat(5, T0 + 2_000);
    rig.engine.tick_at(T0 + 2_000).unwrap();
    assert_eq!(rig.engine.lifecycle_state(), LifecycleState::Disconnected);
}
