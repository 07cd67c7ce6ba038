//! Command dispatch.
//!
//! The device dispatches purely on the `cmd` field; topics only group
//! streams. This module mirrors that: one registry classifies every
//! command onto a handler, and the handlers interpret responses to our
//! requests, interpret device-initiated events, and build outbound
//! request payloads.
//!
//! Several device-initiated messages demand a server reply (the firmware
//! wedges itself when acknowledgements go missing), so event handling can
//! emit reply effects. The engine executes effects; handlers never touch
//! the transport.

use serde_json::{Map, Value};

use crate::command::Command;
use crate::correlation::PendingRequest;
use crate::envelope::{Envelope, MessageId};
use crate::feedplan::{FeedPlanEntry, FeedPlanManager, PlanError, PlanLimits};
use crate::switches::{Feature, SwitchBank, SwitchError};
use crate::topic::Channel;

/// Result of classifying a command id, per the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Heartbeat,
    TimeSync,
    ManualFeed,
    FeedPlan,
    Switches,
    Diagnostics,
    DeviceAction,
    SystemEvent,
    /// Recognized id with no supported behavior (ota, binding,
    /// broadcast-adjacent). Fails closed: logged, never answered.
    Unsupported,
    UnknownCommand,
}

impl HandlerKind {
    pub fn of(command: Command) -> HandlerKind {
        match command {
            Command::Heartbeat => HandlerKind::Heartbeat,
            Command::Ntp | Command::NtpSync => HandlerKind::TimeSync,
            Command::ManualFeed | Command::GrainOutput => HandlerKind::ManualFeed,
            Command::FeedPlanSet | Command::GetFeedPlan => HandlerKind::FeedPlan,
            Command::AttrSet | Command::AttrPush => HandlerKind::Switches,
            Command::AttrGet
            | Command::DeviceInfo
            | Command::DeviceProperties
            | Command::GetConfig => HandlerKind::Diagnostics,
            Command::Reboot
            | Command::FactoryReset
            | Command::WifiReconnect
            | Command::FormatSdCard
            | Command::Unbind => HandlerKind::DeviceAction,
            Command::DeviceStart
            | Command::ErrorReport
            | Command::Detection
            | Command::UserReset => HandlerKind::SystemEvent,
            Command::Binding
            | Command::ServerConfigPush
            | Command::OtaUpgrade
            | Command::OtaProgress
            | Command::OtaInform => HandlerKind::Unsupported,
            Command::Unknown(_) => HandlerKind::UnknownCommand,
        }
    }
}

/// Destructive actions a caller can request explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceAction {
    Reboot,
    FactoryReset,
    WifiReconnect,
    FormatSdCard,
    Unbind,
}

impl DeviceAction {
    pub fn command(&self) -> Command {
        match self {
            DeviceAction::Reboot => Command::Reboot,
            DeviceAction::FactoryReset => Command::FactoryReset,
            DeviceAction::WifiReconnect => Command::WifiReconnect,
            DeviceAction::FormatSdCard => Command::FormatSdCard,
            DeviceAction::Unbind => Command::Unbind,
        }
    }
}

/// An outbound request before the engine stamps a message id and
/// timestamp onto it. Retries reuse the same fields under a fresh id.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub command: Command,
    pub fields: Map<String, Value>,
}

/// Side effects for the engine to execute.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Publish a reply on `channel`, echoing the device's message id.
    Reply {
        channel: Channel,
        command: Command,
        message_id: MessageId,
        fields: Map<String, Value>,
    },
    /// Push changed key/value state to collaborators.
    Snapshot {
        group: &'static str,
        values: Vec<(String, String)>,
    },
    /// The message carried a device timestamp worth checking for drift.
    ClockCheck { device_timestamp_ms: i64 },
    /// Something went wrong on the device side; surfaced, not fatal.
    Alert { message: String },
}

pub struct Dispatcher {
    feed_plans: FeedPlanManager,
    switches: SwitchBank,
    manual_portions: u8,
    limits: PlanLimits,
}

impl Dispatcher {
    pub fn new(limits: PlanLimits) -> Self {
        Dispatcher {
            feed_plans: FeedPlanManager::new(limits),
            switches: SwitchBank::new(),
            manual_portions: limits.min_portions,
            limits,
        }
    }

    pub fn feed_plans(&self) -> &FeedPlanManager {
        &self.feed_plans
    }

    pub fn switches(&self) -> &SwitchBank {
        &self.switches
    }

    pub fn manual_portions(&self) -> u8 {
        self.manual_portions
    }

    pub fn set_manual_portions(&mut self, portions: u8) -> Result<(), PlanError> {
        self.check_portions(portions)?;
        self.manual_portions = portions;
        Ok(())
    }

    fn check_portions(&self, portions: u8) -> Result<(), PlanError> {
        if portions < self.limits.min_portions || portions > self.limits.max_portions {
            return Err(PlanError::InvalidFeedPlan {
                index: 0,
                reason: format!(
                    "portion amount {} outside {}..={}",
                    portions, self.limits.min_portions, self.limits.max_portions
                ),
            });
        }
        Ok(())
    }

    // ---------------- outbound request builders ----------------

    pub fn set_plan(&mut self, entries: Vec<FeedPlanEntry>) -> Result<(), PlanError> {
        self.feed_plans.set_plan(entries)
    }

    pub fn adopt_stored_plan(&mut self, entries: Vec<FeedPlanEntry>) {
        if let Err(e) = self.feed_plans.set_plan(entries) {
            log::warn!("stored feed plan no longer valid, dropping it: {}", e);
        }
    }

    pub fn build_plan_sync(&self, sync_time_ms: i64) -> OutboundRequest {
        let mut fields = Map::new();
        fields.insert(
            "plans".into(),
            Value::from(self.feed_plans.wire_plans(sync_time_ms)),
        );
        OutboundRequest {
            command: Command::FeedPlanSet,
            fields,
        }
    }

    pub fn build_manual_feed(&self, portions: Option<u8>) -> Result<OutboundRequest, PlanError> {
        let portions = portions.unwrap_or(self.manual_portions);
        self.check_portions(portions)?;
        let mut fields = Map::new();
        fields.insert("grainNum".into(), Value::from(portions));
        Ok(OutboundRequest {
            command: Command::ManualFeed,
            fields,
        })
    }

    pub fn request_switch(&mut self, feature: Feature, on: bool) -> Result<(), SwitchError> {
        self.switches.request(feature, on)
    }

    pub fn request_audio(&mut self, on: bool, url: &str) -> Result<(), SwitchError> {
        self.switches.set_audio(on, url)
    }

    /// Sparse attribute write for everything staged in the switch bank.
    pub fn build_attr_set(&self) -> Option<OutboundRequest> {
        if !self.switches.has_pending() {
            return None;
        }
        Some(OutboundRequest {
            command: Command::AttrSet,
            fields: self.switches.build_attr_fields(),
        })
    }

    pub fn build_query(&self, command: Command) -> OutboundRequest {
        OutboundRequest {
            command,
            fields: Map::new(),
        }
    }

    pub fn build_device_action(&self, action: DeviceAction) -> OutboundRequest {
        OutboundRequest {
            command: action.command(),
            fields: Map::new(),
        }
    }

    // ---------------- inbound: responses to our requests ----------------

    pub fn handle_response(&mut self, pending: &PendingRequest, envelope: &Envelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        effects.push(Effect::ClockCheck {
            device_timestamp_ms: envelope.timestamp_ms,
        });

        match pending.command {
            Command::AttrSet => {
                if response_ok(envelope) {
                    self.switches.confirm_submitted();
                    effects.push(self.switch_snapshot());
                } else {
                    effects.push(alert(format!(
                        "attribute write rejected with code {}",
                        response_code(envelope)
                    )));
                }
            }
            Command::FeedPlanSet => {
                if response_ok(envelope) {
                    self.feed_plans.confirm_submitted();
                    // Firmware may echo the adopted plans with coerced
                    // values; when it does, its view wins.
                    if let Some(echoed) = parse_plan_array(envelope.fields.get("plans")) {
                        if !echoed.is_empty() {
                            self.feed_plans.reconcile_echo(echoed);
                        }
                    }
                    effects.push(self.plan_snapshot());
                } else {
                    let detail = envelope
                        .fields
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified");
                    effects.push(alert(format!("feed plan rejected: {}", detail)));
                }
            }
            Command::ManualFeed => {
                if !response_ok(envelope) {
                    effects.push(alert(format!(
                        "manual feed rejected with code {}",
                        response_code(envelope)
                    )));
                }
                // Progress arrives separately as grain output events.
            }
            Command::AttrGet => {
                let changed = self.switches.reconcile(&envelope.fields);
                if !changed.is_empty() {
                    effects.push(self.switch_snapshot());
                }
                effects.extend(attribute_snapshots(&envelope.fields));
            }
            Command::DeviceInfo | Command::GetConfig => {
                effects.extend(device_info_snapshots(&envelope.fields));
            }
            Command::DeviceProperties => {
                // Water-dispenser sibling data; nothing to surface for the
                // feeder, logged for protocol archaeology.
                log::debug!("device properties: {:?}", envelope.fields);
            }
            command if command.is_destructive() => {
                if response_ok(envelope) {
                    effects.push(Effect::Snapshot {
                        group: "status",
                        values: vec![("last_action".into(), command.name().to_lowercase())],
                    });
                } else {
                    effects.push(alert(format!(
                        "{} failed with code {}",
                        command.name(),
                        response_code(envelope)
                    )));
                }
            }
            command => {
                log::warn!(
                    "unexpected response for {} ({}), dropping",
                    command.name(),
                    command.id()
                );
            }
        }
        effects
    }

    // ---------------- inbound: device-initiated events ----------------

    pub fn handle_event(
        &mut self,
        channel: Channel,
        envelope: &Envelope,
        now_ms: i64,
    ) -> Vec<Effect> {
        let command = Command::from_id(envelope.command);
        let mut effects = Vec::new();

        match command {
            Command::DeviceStart => {
                let success = envelope
                    .fields
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if success {
                    effects.extend(device_info_snapshots(&envelope.fields));
                } else {
                    effects.push(alert("device reported failed initialization".into()));
                }
                effects.push(ack(channel, command, envelope, Map::new()));
                effects.push(Effect::ClockCheck {
                    device_timestamp_ms: envelope.timestamp_ms,
                });
            }
            Command::ErrorReport => {
                let code = envelope
                    .fields
                    .get("errorCode")
                    .map(value_to_string)
                    .unwrap_or_else(|| "unknown".into());
                effects.push(alert(format!("device error {}", code)));
                effects.push(Effect::Snapshot {
                    group: "status",
                    values: vec![("last_device_error".into(), code)],
                });
                effects.push(ack(channel, command, envelope, Map::new()));
            }
            Command::AttrPush => {
                let changed = self.switches.reconcile(&envelope.fields);
                if !changed.is_empty() {
                    effects.push(self.switch_snapshot());
                }
                effects.extend(attribute_snapshots(&envelope.fields));
                effects.push(ack(channel, command, envelope, Map::new()));
                effects.push(Effect::ClockCheck {
                    device_timestamp_ms: envelope.timestamp_ms,
                });
            }
            Command::GrainOutput => {
                effects.extend(self.handle_grain_output(channel, envelope));
            }
            Command::GetFeedPlan => {
                // The device pulls the plan; answer with local intent.
                let mut fields = Map::new();
                fields.insert("code".into(), Value::from(0));
                fields.insert(
                    "plans".into(),
                    Value::from(self.feed_plans.wire_plans(now_ms)),
                );
                effects.push(Effect::Reply {
                    channel,
                    command,
                    message_id: envelope.message_id.clone(),
                    fields,
                });
                effects.push(Effect::ClockCheck {
                    device_timestamp_ms: envelope.timestamp_ms,
                });
            }
            Command::Detection => {
                effects.push(Effect::Snapshot {
                    group: "detection",
                    values: vec![(
                        "last_detection_ms".into(),
                        envelope.timestamp_ms.to_string(),
                    )],
                });
                // No ack defined for detections.
            }
            Command::UserReset => {
                effects.push(alert("device is being factory reset by the user".into()));
                effects.push(ack(channel, command, envelope, Map::new()));
            }
            Command::Binding
            | Command::ServerConfigPush
            | Command::OtaUpgrade
            | Command::OtaProgress
            | Command::OtaInform => {
                // Known ids without supported semantics. Fail closed:
                // never guess a reply the firmware might act on.
                log::warn!(
                    "unsupported command {} ({}) on {}, dropping",
                    command.name(),
                    command.id(),
                    channel
                );
            }
            Command::Unknown(id) => {
                log::warn!(
                    "unknown command {} on {}: {}",
                    id,
                    channel,
                    Value::Object(envelope.fields.clone())
                );
            }
            other => {
                log::warn!(
                    "command {} ({}) arrived as an event on {}, dropping",
                    other.name(),
                    other.id(),
                    channel
                );
            }
        }
        effects
    }

    fn handle_grain_output(&mut self, channel: Channel, envelope: &Envelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        let step = envelope
            .fields
            .get("execStep")
            .and_then(Value::as_str)
            .unwrap_or("");
        let expected = envelope
            .fields
            .get("expectGrainNum")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let actual = envelope
            .fields
            .get("actualGrainNum")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let progress = match step {
            "GRAIN_START" => "running",
            "GRAIN_BLOCKING" => "blocked",
            "GRAIN_END" => "idle",
            other => {
                log::warn!("unhandled grain output step {:?}", other);
                "unknown"
            }
        };
        let mut values = vec![("feed_progress".to_string(), progress.to_string())];
        if step == "GRAIN_END" {
            values.push(("last_feed_portions".into(), actual.to_string()));
            if expected != actual {
                effects.push(alert(format!(
                    "feed output mismatch: expected {} got {}",
                    expected, actual
                )));
            }
        }
        effects.push(Effect::Snapshot {
            group: "feeding",
            values,
        });

        // Ack echoes the execution step.
        let mut fields = Map::new();
        fields.insert("execStep".into(), Value::from(step));
        effects.push(ack(channel, Command::GrainOutput, envelope, fields));
        effects.push(Effect::ClockCheck {
            device_timestamp_ms: envelope.timestamp_ms,
        });
        effects
    }

    fn switch_snapshot(&self) -> Effect {
        let values = self
            .switches
            .confirmed()
            .iter()
            .map(|(feature, on)| (feature.name().to_string(), on.to_string()))
            .collect();
        Effect::Snapshot {
            group: "switches",
            values,
        }
    }

    fn plan_snapshot(&self) -> Effect {
        let values = self
            .feed_plans
            .confirmed()
            .iter()
            .map(|entry| {
                (
                    format!("plan_{}", entry.plan_id),
                    format!(
                        "{:02}:{:02} x{} {}",
                        entry.hour,
                        entry.minute,
                        entry.portions,
                        if entry.audio_enabled { "audio" } else { "silent" }
                    ),
                )
            })
            .collect();
        Effect::Snapshot {
            group: "feed_plan",
            values,
        }
    }
}

fn ack(
    channel: Channel,
    command: Command,
    envelope: &Envelope,
    mut fields: Map<String, Value>,
) -> Effect {
    fields.insert("code".into(), Value::from(0));
    Effect::Reply {
        channel,
        command,
        message_id: envelope.message_id.clone(),
        fields,
    }
}

fn alert(message: String) -> Effect {
    Effect::Alert { message }
}

fn response_code(envelope: &Envelope) -> i64 {
    envelope
        .fields
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(-1)
}

fn response_ok(envelope: &Envelope) -> bool {
    response_code(envelope) == 0
}

fn parse_plan_array(value: Option<&Value>) -> Option<Vec<FeedPlanEntry>> {
    let array = value?.as_array()?;
    Some(
        array
            .iter()
            .filter_map(FeedPlanEntry::from_wire)
            .collect(),
    )
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract the diagnostics the device mixes into attribute messages.
/// Attribute messages are sparse; only present keys produce values.
fn attribute_snapshots(fields: &Map<String, Value>) -> Vec<Effect> {
    let mut effects = Vec::new();

    let mut power = Vec::new();
    push_value(&mut power, fields, "electricQuantity", "battery_level");
    push_value(&mut power, fields, "powerMode", "power_mode");
    push_value(&mut power, fields, "powerType", "power_type");
    if !power.is_empty() {
        effects.push(Effect::Snapshot {
            group: "power",
            values: power,
        });
    }

    let mut food = Vec::new();
    if let Some(surplus) = fields.get("surplusGrain").and_then(Value::as_bool) {
        food.push(("low_hopper".into(), (!surplus).to_string()));
    }
    if let Some(outlet) = fields.get("grainOutletState").and_then(Value::as_bool) {
        food.push(("outlet_blocked".into(), (!outlet).to_string()));
    }
    push_value(&mut food, fields, "motorState", "motor_state");
    if !food.is_empty() {
        effects.push(Effect::Snapshot {
            group: "food",
            values: food,
        });
    }

    let mut sd_card = Vec::new();
    push_value(&mut sd_card, fields, "sdCardState", "state");
    push_value(&mut sd_card, fields, "sdCardFileSystem", "file_system");
    push_value(&mut sd_card, fields, "sdCardTotalCapacity", "total_capacity_mb");
    push_value(&mut sd_card, fields, "sdCardUsedCapacity", "used_capacity_mb");
    if !sd_card.is_empty() {
        effects.push(Effect::Snapshot {
            group: "sd_card",
            values: sd_card,
        });
    }

    let mut wifi = Vec::new();
    push_value(&mut wifi, fields, "wifiSsid", "ssid");
    if !wifi.is_empty() {
        effects.push(Effect::Snapshot {
            group: "wifi",
            values: wifi,
        });
    }

    // Schedule feature bits ride along untouched; the engine never writes
    // them, it only mirrors what the device reports.
    let mut settings = Vec::new();
    for key in [
        "cameraAgingType",
        "videoRecordAgingType",
        "motionDetectionAgingType",
        "soundDetectionAgingType",
        "soundAgingType",
        "lightAgingType",
        "volume",
        "nightVision",
        "resolution",
        "videoRecordMode",
        "motionDetectionSensitivity",
        "motionDetectionRange",
        "soundDetectionSensitivity",
    ] {
        push_value(&mut settings, fields, key, key);
    }
    if !settings.is_empty() {
        effects.push(Effect::Snapshot {
            group: "settings",
            values: settings,
        });
    }

    effects
}

fn device_info_snapshots(fields: &Map<String, Value>) -> Vec<Effect> {
    let mut device = Vec::new();
    push_value(&mut device, fields, "pid", "product_id");
    push_value(&mut device, fields, "uuid", "uuid");
    push_value(&mut device, fields, "mac", "mac_address");
    push_value(&mut device, fields, "hardwareVersion", "hardware_version");
    push_value(&mut device, fields, "softwareVersion", "software_version");
    if device.is_empty() {
        Vec::new()
    } else {
        vec![Effect::Snapshot {
            group: "device",
            values: device,
        }]
    }
}

fn push_value(
    out: &mut Vec<(String, String)>,
    fields: &Map<String, Value>,
    wire_key: &str,
    snapshot_key: &str,
) {
    if let Some(value) = fields.get(wire_key) {
        out.push((snapshot_key.to_string(), value_to_string(value)));
    }
}
