//! State snapshots for collaborators.
//!
//! The engine does not know how its state is displayed. Whenever a group
//! of values changes it pushes a plain key/value snapshot through a
//! [`StateSink`]; the discovery/entity-registration side does whatever it
//! wants with them.

use std::collections::BTreeMap;

pub type SnapshotValues = BTreeMap<String, String>;

pub trait StateSink {
    fn publish(&mut self, group: &str, values: &SnapshotValues);
}

/// Default sink: log the snapshot. `feederd` runs with this one.
#[derive(Default)]
pub struct LogSink;

impl StateSink for LogSink {
    fn publish(&mut self, group: &str, values: &SnapshotValues) {
        let rendered: Vec<String> = values
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        log::info!("state[{}]: {}", group, rendered.join(" "));
    }
}

/// Deduplicating snapshot board. Values are merged per group and pushed to
/// the sink only when something actually changed.
#[derive(Default)]
pub struct SnapshotBoard {
    groups: BTreeMap<String, SnapshotValues>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<I, K, V>(&mut self, sink: &mut dyn StateSink, group: &str, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entry = self.groups.entry(group.to_string()).or_default();
        let mut changed = false;
        for (key, value) in values {
            let key = key.into();
            let value = value.into();
            if entry.get(&key) != Some(&value) {
                entry.insert(key, value);
                changed = true;
            }
        }
        if changed {
            sink.publish(group, entry);
        }
    }

    pub fn group(&self, group: &str) -> Option<&SnapshotValues> {
        self.groups.get(group)
    }
}
