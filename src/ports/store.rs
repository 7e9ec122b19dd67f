use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Aggregate spread position persisted per strategy name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub strategy: String,
    pub long_pos: Decimal,
    pub short_pos: Decimal,
    pub net_pos: Decimal,
}

/// Opaque key-value record store used for position reconciliation and
/// order-counter crash recovery. The engine never interprets the storage
/// format; it only upserts and queries records.
pub trait RecordStore: Send + Sync {
    fn upsert_position(&self, record: &PositionRecord) -> Result<()>;
    fn position(&self, strategy: &str) -> Result<Option<PositionRecord>>;
    fn set_counter(&self, key: &str, value: u64) -> Result<()>;
    fn counter(&self, key: &str) -> Result<u64>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    positions: HashMap<String, PositionRecord>,
    counters: HashMap<String, u64>,
}

/// In-memory store for tests and backtests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<StoreState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn upsert_position(&self, record: &PositionRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .positions
            .insert(record.strategy.clone(), record.clone());
        Ok(())
    }

    fn position(&self, strategy: &str) -> Result<Option<PositionRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.positions.get(strategy).cloned())
    }

    fn set_counter(&self, key: &str, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.insert(key.to_string(), value);
        Ok(())
    }

    fn counter(&self, key: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }
}

/// File-backed store: the whole state is rewritten as JSON on every
/// mutation. Small record counts make this cheap enough for the live loop.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("failed to open record store {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("failed to parse record store {}", path.display()))?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("failed to write record store {}", self.path.display()))?;
        serde_json::to_writer(BufWriter::new(file), state)
            .with_context(|| format!("failed to serialize record store {}", self.path.display()))?;
        Ok(())
    }
}

impl RecordStore for JsonRecordStore {
    fn upsert_position(&self, record: &PositionRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .positions
            .insert(record.strategy.clone(), record.clone());
        self.persist(&state)
    }

    fn position(&self, strategy: &str) -> Result<Option<PositionRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.positions.get(strategy).cloned())
    }

    fn set_counter(&self, key: &str, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.insert(key.to_string(), value);
        self.persist(&state)
    }

    fn counter(&self, key: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }
}
