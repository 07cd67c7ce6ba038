//! Local persistence.
//!
//! The desired feeding plan and the default manual-feed portion survive
//! restarts; everything else is re-learned from the device on reconnect.
//! Entries are stored as JSON rows so schema churn stays cheap.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::feedplan::FeedPlanEntry;

pub trait PlanStore {
    fn load_plans(&mut self) -> Result<Vec<FeedPlanEntry>>;
    fn save_plans(&mut self, entries: &[FeedPlanEntry]) -> Result<()>;
    fn manual_portion(&mut self) -> Result<Option<u8>>;
    fn set_manual_portion(&mut self, portions: u8) -> Result<()>;
}

/// Serialized row shape; kept separate from the wire format on purpose.
#[derive(Serialize, Deserialize)]
struct PlanRow {
    plan_id: u32,
    hour: u8,
    minute: u8,
    portions: u8,
    enabled: bool,
    audio_enabled: bool,
    audio_times: u8,
    repeat_days: [bool; 7],
}

impl From<&FeedPlanEntry> for PlanRow {
    fn from(entry: &FeedPlanEntry) -> Self {
        PlanRow {
            plan_id: entry.plan_id,
            hour: entry.hour,
            minute: entry.minute,
            portions: entry.portions,
            enabled: entry.enabled,
            audio_enabled: entry.audio_enabled,
            audio_times: entry.audio_times,
            repeat_days: entry.repeat_days,
        }
    }
}

impl From<PlanRow> for FeedPlanEntry {
    fn from(row: PlanRow) -> Self {
        FeedPlanEntry {
            plan_id: row.plan_id,
            hour: row.hour,
            minute: row.minute,
            portions: row.portions,
            enabled: row.enabled,
            audio_enabled: row.audio_enabled,
            audio_times: row.audio_times,
            repeat_days: row.repeat_days,
        }
    }
}

pub struct SqlitePlanStore {
    conn: Connection,
}

impl SqlitePlanStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS feed_plans (
              plan_id INTEGER PRIMARY KEY,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl PlanStore for SqlitePlanStore {
    fn load_plans(&mut self) -> Result<Vec<FeedPlanEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM feed_plans ORDER BY plan_id")?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            let parsed: PlanRow = serde_json::from_str(&payload)?;
            entries.push(parsed.into());
        }
        Ok(entries)
    }

    fn save_plans(&mut self, entries: &[FeedPlanEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM feed_plans", [])?;
        for entry in entries {
            let payload = serde_json::to_string(&PlanRow::from(entry))?;
            tx.execute(
                "INSERT INTO feed_plans (plan_id, payload_json) VALUES (?1, ?2)",
                params![entry.plan_id, payload],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn manual_portion(&mut self) -> Result<Option<u8>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = 'manual_portion'")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let value: String = row.get(0)?;
                Ok(Some(value.parse()?))
            }
            None => Ok(None),
        }
    }

    fn set_manual_portion(&mut self, portions: u8) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES ('manual_portion', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![portions.to_string()],
        )?;
        Ok(())
    }
}

/// Volatile store for tests and for running without a database path.
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: Vec<FeedPlanEntry>,
    manual_portion: Option<u8>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanStore for InMemoryPlanStore {
    fn load_plans(&mut self) -> Result<Vec<FeedPlanEntry>> {
        Ok(self.plans.clone())
    }

    fn save_plans(&mut self, entries: &[FeedPlanEntry]) -> Result<()> {
        self.plans = entries.to_vec();
        Ok(())
    }

    fn manual_portion(&mut self) -> Result<Option<u8>> {
        Ok(self.manual_portion)
    }

    fn set_manual_portion(&mut self, portions: u8) -> Result<()> {
        self.manual_portion = Some(portions);
        Ok(())
    }
}
