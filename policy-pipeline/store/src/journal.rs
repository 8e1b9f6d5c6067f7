use ahash::AHashMap as HashMap;
use anyhow::Result;
use chrono::{offset::Utc, DateTime};
use parking_lot::Mutex;
use policy_pipeline_core::PolicyId;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Progress of a move through its three remote steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Pending,
    DestinationWritten,
    SourceRemoved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveEntry {
    pub record: PolicyId,
    pub from: String,
    pub to: String,
    pub state: MoveState,
    pub updated_at: DateTime<Utc>,
}

/// Durable progress for in-flight moves, so that an interrupted move can
/// be resumed from where it stopped.
#[async_trait::async_trait]
pub trait MoveJournal: Send + Sync {
    async fn load(&self, record: PolicyId) -> Result<Option<MoveEntry>>;

    async fn save(&self, entry: &MoveEntry) -> Result<()>;

    async fn clear(&self, record: PolicyId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<PolicyId, MoveEntry>>,
}

// === impl MoveState ===

impl MoveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DestinationWritten => "destination_written",
            Self::SourceRemoved => "source_removed",
        }
    }
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MoveState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "destination_written" => Ok(Self::DestinationWritten),
            "source_removed" => Ok(Self::SourceRemoved),
            _ => anyhow::bail!("unknown move state {s:?}"),
        }
    }
}

// === impl MoveEntry ===

impl MoveEntry {
    pub fn new(record: PolicyId, from: String, to: String) -> Self {
        Self {
            record,
            from,
            to,
            state: MoveState::Pending,
            updated_at: Utc::now(),
        }
    }

    pub fn is_for(&self, from: &str, to: &str) -> bool {
        self.from == from && self.to == to
    }

    pub(crate) fn advance(&mut self, state: MoveState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

// === impl MemoryJournal ===

#[async_trait::async_trait]
impl MoveJournal for MemoryJournal {
    async fn load(&self, record: PolicyId) -> Result<Option<MoveEntry>> {
        Ok(self.entries.lock().get(&record).cloned())
    }

    async fn save(&self, entry: &MoveEntry) -> Result<()> {
        self.entries.lock().insert(entry.record, entry.clone());
        Ok(())
    }

    async fn clear(&self, record: PolicyId) -> Result<()> {
        self.entries.lock().remove(&record);
        Ok(())
    }
}
