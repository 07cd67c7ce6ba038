//! Feature switches.
//!
//! The feeder exposes its product features (camera, audio, detection,
//! recording, ...) as boolean attributes written through sparse attribute
//! messages. Like the feeding plan, each switch keeps a pending/confirmed
//! pair: a write stays pending until the device echoes the attribute back,
//! and the echoed value wins even when it differs from what was asked.
//!
//! The feeding-audio pair is special twice over. The firmware requires
//! `enableAudio` and `audioUrl` to travel together even if only one
//! changed, and an unreachable audio URL makes the device download it,
//! fail, and reboot with no error surfaced. That hazard cannot be caught
//! from this side, so the URL is validated before anything is sent.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

/// Longest audio URL the firmware accepts.
const AUDIO_URL_MAX_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    Camera,
    Audio,
    MotionDetection,
    SoundDetection,
    Recording,
    FeedingVideo,
    CloudRecording,
    Sound,
    ButtonLights,
}

impl Feature {
    pub const ALL: [Feature; 9] = [
        Feature::Camera,
        Feature::Audio,
        Feature::MotionDetection,
        Feature::SoundDetection,
        Feature::Recording,
        Feature::FeedingVideo,
        Feature::CloudRecording,
        Feature::Sound,
        Feature::ButtonLights,
    ];

    /// Attribute key on the wire.
    pub fn wire_key(&self) -> &'static str {
        match self {
            Feature::Camera => "cameraSwitch",
            Feature::Audio => "enableAudio",
            Feature::MotionDetection => "motionDetectionSwitch",
            Feature::SoundDetection => "soundDetectionSwitch",
            Feature::Recording => "videoRecordSwitch",
            Feature::FeedingVideo => "feedingVideoSwitch",
            Feature::CloudRecording => "cloudVideoRecordSwitch",
            Feature::Sound => "soundSwitch",
            Feature::ButtonLights => "lightSwitch",
        }
    }

    /// Snapshot key pushed to collaborators.
    pub fn name(&self) -> &'static str {
        match self {
            Feature::Camera => "camera",
            Feature::Audio => "audio",
            Feature::MotionDetection => "motion_detection",
            Feature::SoundDetection => "sound_detection",
            Feature::Recording => "recording",
            Feature::FeedingVideo => "feeding_video",
            Feature::CloudRecording => "cloud_recording",
            Feature::Sound => "sound",
            Feature::ButtonLights => "button_lights",
        }
    }

    fn from_wire_key(key: &str) -> Option<Feature> {
        Feature::ALL.iter().copied().find(|f| f.wire_key() == key)
    }
}

#[derive(Default)]
pub struct SwitchBank {
    pending: BTreeMap<Feature, bool>,
    confirmed: BTreeMap<Feature, bool>,
    /// Cached because the firmware wants the URL re-sent with every audio
    /// switch write.
    audio_url: Option<String>,
}

impl SwitchBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed(&self) -> &BTreeMap<Feature, bool> {
        &self.confirmed
    }

    pub fn audio_url(&self) -> Option<&str> {
        self.audio_url.as_deref()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stage a switch write. Audio goes through [`SwitchBank::set_audio`].
    pub fn request(&mut self, feature: Feature, on: bool) -> Result<(), SwitchError> {
        if feature == Feature::Audio {
            return Err(SwitchError::InvalidConfig(
                "feeding audio requires an audio url; use set_audio".into(),
            ));
        }
        self.pending.insert(feature, on);
        Ok(())
    }

    /// Stage a feeding-audio write. The URL is validated here because the
    /// device reboots on unreachable audio files; that failure mode can
    /// only be avoided, not recovered.
    pub fn set_audio(&mut self, on: bool, url: &str) -> Result<(), SwitchError> {
        validate_audio_url(url)?;
        self.audio_url = Some(url.to_string());
        self.pending.insert(Feature::Audio, on);
        Ok(())
    }

    /// Sparse attribute fields for the staged writes. The firmware wants
    /// `enableAudio` as 0/1 and everything else as a bool; `audioUrl`
    /// always rides along with the audio switch.
    pub fn build_attr_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        for (feature, on) in &self.pending {
            match feature {
                Feature::Audio => {
                    fields.insert(feature.wire_key().into(), Value::from(*on as u8));
                    if let Some(url) = &self.audio_url {
                        fields.insert("audioUrl".into(), Value::from(url.as_str()));
                    }
                }
                _ => {
                    fields.insert(feature.wire_key().into(), Value::from(*on));
                }
            }
        }
        fields
    }

    /// The device accepted the write; adopt pending values provisionally.
    /// The attribute echo that follows remains authoritative.
    pub fn confirm_submitted(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.confirmed.extend(pending);
    }

    /// Reconcile a sparse attribute report. Every switch the device names
    /// overwrites the confirmed value and clears any matching pending
    /// write. Returns the switches whose confirmed value changed.
    pub fn reconcile(&mut self, fields: &Map<String, Value>) -> Vec<(Feature, bool)> {
        let mut changed = Vec::new();
        for (key, value) in fields {
            let Some(feature) = Feature::from_wire_key(key) else {
                continue;
            };
            let Some(on) = as_switch_value(value) else {
                log::warn!("switch {}: unreadable value {}", key, value);
                continue;
            };
            self.pending.remove(&feature);
            if self.confirmed.insert(feature, on) != Some(on) {
                changed.push((feature, on));
            }
        }
        if let Some(url) = fields.get("audioUrl").and_then(Value::as_str) {
            self.audio_url = Some(url.to_string());
        }
        changed
    }
}

/// The firmware reports switches as booleans or 0/1 integers depending on
/// the message; accept both.
fn as_switch_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

pub fn validate_audio_url(url: &str) -> Result<(), SwitchError> {
    if url.len() > AUDIO_URL_MAX_LEN {
        return Err(SwitchError::InvalidConfig(format!(
            "audio url longer than {} chars",
            AUDIO_URL_MAX_LEN
        )));
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            SwitchError::InvalidConfig("audio url must be http(s)".into())
        })?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(SwitchError::InvalidConfig("audio url has no host".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_writes_build_sparse_fields() {
        let mut bank = SwitchBank::new();
        bank.request(Feature::Camera, true).unwrap();
        bank.request(Feature::MotionDetection, false).unwrap();

        let fields = bank.build_attr_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["cameraSwitch"], Value::from(true));
        assert_eq!(fields["motionDetectionSwitch"], Value::from(false));
    }

    #[test]
    fn audio_write_carries_url_and_integer_switch() {
        let mut bank = SwitchBank::new();
        bank.set_audio(true, "https://cdn.example.com/come_to_eat.aac")
            .unwrap();

        let fields = bank.build_attr_fields();
        assert_eq!(fields["enableAudio"], Value::from(1));
        assert_eq!(
            fields["audioUrl"],
            Value::from("https://cdn.example.com/come_to_eat.aac")
        );
    }

    #[test]
    fn audio_requires_set_audio() {
        let mut bank = SwitchBank::new();
        assert!(bank.request(Feature::Audio, true).is_err());
    }

    #[test]
    fn bad_audio_urls_are_rejected_before_any_io() {
        let mut bank = SwitchBank::new();
        assert!(bank.set_audio(true, "ftp://host/file.aac").is_err());
        assert!(bank.set_audio(true, "https://").is_err());
        let long = format!("https://h/{}", "a".repeat(120));
        assert!(bank.set_audio(true, &long).is_err());
        assert!(!bank.has_pending());
    }

    #[test]
    fn echo_confirms_and_clears_pending() {
        let mut bank = SwitchBank::new();
        bank.request(Feature::Camera, true).unwrap();

        let mut echo = Map::new();
        echo.insert("cameraSwitch".into(), Value::from(true));
        let changed = bank.reconcile(&echo);
        assert_eq!(changed, vec![(Feature::Camera, true)]);
        assert!(!bank.has_pending());
        assert_eq!(bank.confirmed()[&Feature::Camera], true);
    }

    #[test]
    fn device_coercion_wins_over_request() {
        let mut bank = SwitchBank::new();
        bank.request(Feature::Recording, true).unwrap();
        bank.confirm_submitted();

        // Device reports the switch off regardless of what was asked.
        let mut echo = Map::new();
        echo.insert("videoRecordSwitch".into(), Value::from(0));
        let changed = bank.reconcile(&echo);
        assert_eq!(changed, vec![(Feature::Recording, false)]);
        assert_eq!(bank.confirmed()[&Feature::Recording], false);
    }

    #[test]
    fn duplicate_echo_is_idempotent() {
        let mut bank = SwitchBank::new();
        let mut echo = Map::new();
        echo.insert("soundSwitch".into(), Value::from(true));
        echo.insert("audioUrl".into(), Value::from("http://h/a.aac"));

        assert_eq!(bank.reconcile(&echo).len(), 1);
        assert!(bank.reconcile(&echo).is_empty());
        assert_eq!(bank.confirmed()[&Feature::Sound], true);
        assert_eq!(bank.audio_url(), Some("http://h/a.aac"));
    }

    #[test]
    fn unrelated_attributes_are_ignored() {
        let mut bank = SwitchBank::new();
        let mut echo = Map::new();
        echo.insert("electricQuantity".into(), Value::from(80));
        echo.insert("nightVision".into(), Value::from("AUTOMATIC"));
        assert!(bank.reconcile(&echo).is_empty());
        assert!(bank.confirmed().is_empty());
    }
}
