//! Scheduled feeding plans.
//!
//! The manager keeps two copies of the plan: `desired` is local intent,
//! `confirmed` is what the device has acknowledged. The device is
//! authoritative - it may coerce submitted values to supported granularity,
//! and whatever it echoes back overwrites `confirmed` without complaint.
//!
//! Plan times ride the wire as `HH:MM` strings the device interprets in
//! UTC; repeat days are a zero-padded seven-element array of ISO weekday
//! numbers.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    /// Local validation failure. Reported for the first offending entry
    /// and never sent to the device.
    #[error("invalid feed plan entry {index}: {reason}")]
    InvalidFeedPlan { index: usize, reason: String },
}

/// Bounds the device supports; see config for the defaults.
#[derive(Clone, Copy, Debug)]
pub struct PlanLimits {
    pub max_entries: usize,
    pub min_portions: u8,
    pub max_portions: u8,
}

/// One scheduled feeding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedPlanEntry {
    pub plan_id: u32,
    pub hour: u8,
    pub minute: u8,
    pub portions: u8,
    /// Disabled entries stay local; they are not synced to the device.
    pub enabled: bool,
    pub audio_enabled: bool,
    pub audio_times: u8,
    /// Monday-first week. All-false means every day.
    pub repeat_days: [bool; 7],
}

impl FeedPlanEntry {
    fn execution_time(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    /// Wire shape for plan sync and plan pull responses.
    pub fn to_wire(&self, sync_time_ms: i64) -> Value {
        let mut days: Vec<u64> = self
            .repeat_days
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(|(i, _)| i as u64 + 1)
            .collect();
        if days.is_empty() {
            days = (1..=7).collect();
        }
        // Pad to the full week length the firmware expects.
        days.resize(7, 0);

        let mut object = Map::new();
        object.insert("planId".into(), Value::from(self.plan_id));
        object.insert("executionTime".into(), Value::from(self.execution_time()));
        object.insert("repeatDay".into(), Value::from(days));
        object.insert("enableAudio".into(), Value::from(self.audio_enabled));
        object.insert("audioTimes".into(), Value::from(self.audio_times));
        object.insert("grainNum".into(), Value::from(self.portions));
        object.insert("syncTime".into(), Value::from(sync_time_ms));
        Value::Object(object)
    }

    /// Parse a device-reported plan entry. Returns `None` for shapes the
    /// firmware should not produce; callers log and skip those.
    pub fn from_wire(value: &Value) -> Option<FeedPlanEntry> {
        let object = value.as_object()?;
        let time = object.get("executionTime")?.as_str()?;
        let (hour, minute) = parse_execution_time(time)?;

        let mut repeat_days = [false; 7];
        if let Some(days) = object.get("repeatDay").and_then(Value::as_array) {
            for day in days.iter().filter_map(Value::as_u64) {
                if (1..=7).contains(&day) {
                    repeat_days[day as usize - 1] = true;
                }
            }
        }

        Some(FeedPlanEntry {
            plan_id: object.get("planId")?.as_u64()? as u32,
            hour,
            minute,
            portions: object.get("grainNum")?.as_u64()? as u8,
            enabled: true,
            audio_enabled: object
                .get("enableAudio")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            audio_times: object
                .get("audioTimes")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u8,
            repeat_days,
        })
    }
}

fn parse_execution_time(value: &str) -> Option<(u8, u8)> {
    let (hour, minute) = value.split_once(':')?;
    let hour: u8 = hour.parse().ok()?;
    let minute: u8 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

pub struct FeedPlanManager {
    limits: PlanLimits,
    desired: Vec<FeedPlanEntry>,
    confirmed: Vec<FeedPlanEntry>,
}

impl FeedPlanManager {
    pub fn new(limits: PlanLimits) -> Self {
        FeedPlanManager {
            limits,
            desired: Vec::new(),
            confirmed: Vec::new(),
        }
    }

    pub fn desired(&self) -> &[FeedPlanEntry] {
        &self.desired
    }

    pub fn confirmed(&self) -> &[FeedPlanEntry] {
        &self.confirmed
    }

    /// Validate and adopt a new desired plan. Fails fast on the first
    /// offending entry without touching the device.
    pub fn set_plan(&mut self, entries: Vec<FeedPlanEntry>) -> Result<(), PlanError> {
        self.validate(&entries)?;
        self.desired = entries;
        Ok(())
    }

    fn validate(&self, entries: &[FeedPlanEntry]) -> Result<(), PlanError> {
        if entries.len() > self.limits.max_entries {
            return Err(PlanError::InvalidFeedPlan {
                index: self.limits.max_entries,
                reason: format!("more than {} entries", self.limits.max_entries),
            });
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.hour > 23 || entry.minute > 59 {
                return Err(PlanError::InvalidFeedPlan {
                    index,
                    reason: format!("invalid time {:02}:{:02}", entry.hour, entry.minute),
                });
            }
            if entry.portions < self.limits.min_portions
                || entry.portions > self.limits.max_portions
            {
                return Err(PlanError::InvalidFeedPlan {
                    index,
                    reason: format!(
                        "portion amount {} outside {}..={}",
                        entry.portions, self.limits.min_portions, self.limits.max_portions
                    ),
                });
            }
            for earlier in &entries[..index] {
                if earlier.hour == entry.hour && earlier.minute == entry.minute {
                    return Err(PlanError::InvalidFeedPlan {
                        index,
                        reason: format!("overlaps entry at {:02}:{:02}", entry.hour, entry.minute),
                    });
                }
                if earlier.plan_id == entry.plan_id {
                    return Err(PlanError::InvalidFeedPlan {
                        index,
                        reason: format!("duplicate plan id {}", entry.plan_id),
                    });
                }
            }
        }
        Ok(())
    }

    /// The wire `plans` array for a plan sync: enabled entries only.
    pub fn wire_plans(&self, sync_time_ms: i64) -> Vec<Value> {
        self.desired
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.to_wire(sync_time_ms))
            .collect()
    }

    /// The device acknowledged the submitted plan: desired becomes
    /// confirmed. Idempotent.
    pub fn confirm_submitted(&mut self) {
        self.confirmed = self
            .desired
            .iter()
            .filter(|entry| entry.enabled)
            .cloned()
            .collect();
    }

    /// The device reported its own view of the plan. Authoritative:
    /// whatever it says replaces `confirmed`, coerced values included.
    /// Idempotent under duplicate delivery.
    pub fn reconcile_echo(&mut self, entries: Vec<FeedPlanEntry>) {
        self.confirmed = entries;
    }
}
