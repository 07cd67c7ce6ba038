//! Topic routing.
//!
//! The broker groups the protocol into eight logical channels, each with a
//! `post` topic (device publishes) and a `sub` topic (device subscribes).
//! Both directions are named from the device's perspective, which makes ad
//! hoc string building a reliable source of transposition bugs - so topic
//! construction lives here as a pure `Channel` x `Direction` function and
//! nowhere else.
//!
//! Scheme: `dl/plaf203/{serial}/{channel}/{post|sub}`.

use std::fmt;

const TOPIC_ROOT: &str = "dl";
const PRODUCT_ID: &str = "plaf203";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Heart,
    Ota,
    Ntp,
    Broadcast,
    Config,
    Event,
    Service,
    System,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::Heart,
        Channel::Ota,
        Channel::Ntp,
        Channel::Broadcast,
        Channel::Config,
        Channel::Event,
        Channel::Service,
        Channel::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Heart => "heart",
            Channel::Ota => "ota",
            Channel::Ntp => "ntp",
            Channel::Broadcast => "broadcast",
            Channel::Config => "config",
            Channel::Event => "event",
            Channel::Service => "service",
            Channel::System => "system",
        }
    }

    fn from_str(value: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.as_str() == value)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic direction, named from the device's perspective: the device
/// publishes on `post` and listens on `sub`. The engine therefore consumes
/// `post` topics and publishes on `sub` topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Post,
    Sub,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Post => "post",
            Direction::Sub => "sub",
        }
    }

    fn from_str(value: &str) -> Option<Direction> {
        match value {
            "post" => Some(Direction::Post),
            "sub" => Some(Direction::Sub),
            _ => None,
        }
    }
}

/// Topic derivation for one device.
#[derive(Clone, Debug)]
pub struct TopicMap {
    serial: String,
}

impl TopicMap {
    pub fn new(serial: impl Into<String>) -> Self {
        TopicMap {
            serial: serial.into(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn topic(&self, channel: Channel, direction: Direction) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            TOPIC_ROOT,
            PRODUCT_ID,
            self.serial,
            channel.as_str(),
            direction.as_str()
        )
    }

    /// The full subscribe set: every channel's `post` topic. The engine
    /// consumes all device-originated traffic, including channels it only
    /// logs (broadcast, ota).
    pub fn subscribe_set(&self) -> Vec<String> {
        Channel::ALL
            .iter()
            .map(|channel| self.topic(*channel, Direction::Post))
            .collect()
    }

    /// Map an inbound topic back to its channel and direction. Returns
    /// `None` for anything that is not a well-formed topic of this device;
    /// callers log and drop those.
    pub fn parse(&self, topic: &str) -> Option<(Channel, Direction)> {
        let mut parts = topic.split('/');
        if parts.next() != Some(TOPIC_ROOT) || parts.next() != Some(PRODUCT_ID) {
            return None;
        }
        if parts.next() != Some(self.serial.as_str()) {
            return None;
        }
        let channel = Channel::from_str(parts.next()?)?;
        let direction = Direction::from_str(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some((channel, direction))
    }
}
