//! The command registry.
//!
//! Every protocol message carries a `cmd` integer identifying its type; the
//! topic only groups message streams on the broker, the device itself
//! dispatches purely on `cmd`. The id table below is reverse engineered
//! from firmware 3.0.14 and is not complete - firmware variance is
//! expected, so unrecognized ids are a data case ([`Command::Unknown`]),
//! never a failure.

use crate::topic::Channel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Periodic liveness beacon, no reply.
    Heartbeat,
    /// Device-initiated clock check; the reply may demand calibration.
    Ntp,
    /// Server-initiated correlated time sync exchange.
    NtpSync,
    /// Boot report after the device (re)joins wifi.
    DeviceStart,
    /// Device fault report.
    ErrorReport,
    /// Sparse attribute echo; the reconciliation source of truth.
    AttrPush,
    /// Feed execution progress (start/end/blocked).
    GrainOutput,
    /// Device pulls the feeding plan from the server.
    GetFeedPlan,
    /// Motion/sound detection notification, no ack expected.
    Detection,
    /// Full attribute snapshot query.
    AttrGet,
    /// Sparse attribute write.
    AttrSet,
    /// One-shot feed of N portions.
    ManualFeed,
    /// Full feeding plan replacement.
    FeedPlanSet,
    /// Device identifier query.
    DeviceInfo,
    /// Sibling-product property query, kept for parity with the firmware.
    DeviceProperties,
    /// Format the SD card.
    FormatSdCard,
    /// Force a wifi reconnect.
    WifiReconnect,
    /// Firmware/version info query.
    GetConfig,
    /// Fire-and-forget server push, no response defined.
    ServerConfigPush,
    /// Unprovisioned-device hello. Unsupported, fails closed.
    Binding,
    /// Unbind the device from this controller.
    Unbind,
    /// Remote reboot.
    Reboot,
    /// Remote factory reset.
    FactoryReset,
    /// User pressed the factory-reset button; device notifies us.
    UserReset,
    /// OTA flow - recognized so the ids stay documented, but unsupported.
    OtaUpgrade,
    OtaProgress,
    OtaInform,
    /// Anything the registry does not know. Logged and dropped.
    Unknown(u32),
}

/// Retry behavior when a correlated request times out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Surface the timeout immediately. Destructive actions and manual
    /// feeds land here - a duplicated manual feed would double-feed.
    Never,
    /// Retry once with a fresh message id, then surface the failure.
    Once,
}

impl Command {
    pub fn from_id(id: u32) -> Command {
        match id {
            1 => Command::Heartbeat,
            2 => Command::Ntp,
            3 => Command::NtpSync,
            10 => Command::DeviceStart,
            11 => Command::ErrorReport,
            12 => Command::AttrPush,
            13 => Command::GrainOutput,
            14 => Command::GetFeedPlan,
            15 => Command::Detection,
            20 => Command::AttrGet,
            21 => Command::AttrSet,
            22 => Command::ManualFeed,
            23 => Command::FeedPlanSet,
            25 => Command::DeviceInfo,
            26 => Command::DeviceProperties,
            27 => Command::FormatSdCard,
            28 => Command::WifiReconnect,
            40 => Command::GetConfig,
            41 => Command::ServerConfigPush,
            50 => Command::Binding,
            51 => Command::Unbind,
            52 => Command::Reboot,
            53 => Command::FactoryReset,
            54 => Command::UserReset,
            60 => Command::OtaUpgrade,
            61 => Command::OtaProgress,
            62 => Command::OtaInform,
            other => Command::Unknown(other),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Command::Heartbeat => 1,
            Command::Ntp => 2,
            Command::NtpSync => 3,
            Command::DeviceStart => 10,
            Command::ErrorReport => 11,
            Command::AttrPush => 12,
            Command::GrainOutput => 13,
            Command::GetFeedPlan => 14,
            Command::Detection => 15,
            Command::AttrGet => 20,
            Command::AttrSet => 21,
            Command::ManualFeed => 22,
            Command::FeedPlanSet => 23,
            Command::DeviceInfo => 25,
            Command::DeviceProperties => 26,
            Command::FormatSdCard => 27,
            Command::WifiReconnect => 28,
            Command::GetConfig => 40,
            Command::ServerConfigPush => 41,
            Command::Binding => 50,
            Command::Unbind => 51,
            Command::Reboot => 52,
            Command::FactoryReset => 53,
            Command::UserReset => 54,
            Command::OtaUpgrade => 60,
            Command::OtaProgress => 61,
            Command::OtaInform => 62,
            Command::Unknown(id) => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Heartbeat => "HEARTBEAT",
            Command::Ntp => "NTP",
            Command::NtpSync => "NTP_SYNC",
            Command::DeviceStart => "DEVICE_START",
            Command::ErrorReport => "ERROR_REPORT",
            Command::AttrPush => "ATTR_PUSH",
            Command::GrainOutput => "GRAIN_OUTPUT",
            Command::GetFeedPlan => "GET_FEED_PLAN",
            Command::Detection => "DETECTION",
            Command::AttrGet => "ATTR_GET",
            Command::AttrSet => "ATTR_SET",
            Command::ManualFeed => "MANUAL_FEED",
            Command::FeedPlanSet => "FEED_PLAN_SET",
            Command::DeviceInfo => "DEVICE_INFO",
            Command::DeviceProperties => "DEVICE_PROPERTIES",
            Command::FormatSdCard => "FORMAT_SD_CARD",
            Command::WifiReconnect => "WIFI_RECONNECT",
            Command::GetConfig => "GET_CONFIG",
            Command::ServerConfigPush => "SERVER_CONFIG_PUSH",
            Command::Binding => "BINDING",
            Command::Unbind => "UNBIND",
            Command::Reboot => "REBOOT",
            Command::FactoryReset => "FACTORY_RESET",
            Command::UserReset => "USER_RESET",
            Command::OtaUpgrade => "OTA_UPGRADE",
            Command::OtaProgress => "OTA_PROGRESS",
            Command::OtaInform => "OTA_INFORM",
            Command::Unknown(_) => "UNKNOWN",
        }
    }

    /// The channel a server-initiated request for this command travels on.
    /// The response comes back on the same channel's `post` topic.
    pub fn channel(&self) -> Channel {
        match self {
            Command::Heartbeat => Channel::Heart,
            Command::Ntp | Command::NtpSync => Channel::Ntp,
            Command::DeviceStart
            | Command::ErrorReport
            | Command::AttrPush
            | Command::GrainOutput
            | Command::GetFeedPlan
            | Command::Detection => Channel::Event,
            Command::AttrGet
            | Command::AttrSet
            | Command::ManualFeed
            | Command::FeedPlanSet
            | Command::DeviceInfo
            | Command::DeviceProperties
            | Command::FormatSdCard
            | Command::WifiReconnect => Channel::Service,
            Command::GetConfig | Command::ServerConfigPush => Channel::Config,
            Command::Binding
            | Command::Unbind
            | Command::Reboot
            | Command::FactoryReset
            | Command::UserReset => Channel::System,
            Command::OtaUpgrade | Command::OtaProgress | Command::OtaInform => Channel::Ota,
            Command::Unknown(_) => Channel::Broadcast,
        }
    }

    /// Whether a server-initiated request expects a device response.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::ServerConfigPush | Command::Heartbeat)
    }

    /// Destructive device actions are never auto-retried and are the ones
    /// a caller must treat as failed on timeout.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Command::Reboot
                | Command::FactoryReset
                | Command::WifiReconnect
                | Command::FormatSdCard
                | Command::Unbind
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            // Diagnostics and idempotent full-state writes get one retry.
            Command::AttrGet
            | Command::DeviceInfo
            | Command::DeviceProperties
            | Command::GetConfig
            | Command::AttrSet
            | Command::FeedPlanSet
            | Command::NtpSync => RetryPolicy::Once,
            _ => RetryPolicy::Never,
        }
    }
}
