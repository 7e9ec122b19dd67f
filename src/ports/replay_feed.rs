use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::types::MarketTick;

// One line of a historical tick dump file (JSONL).
#[derive(Debug, Clone, Deserialize)]
struct TickRow {
    timestamp: i64,
    bid_price: Decimal,
    ask_price: Decimal,
    bid_size: Decimal,
    ask_size: Decimal,
}

/// Load one instrument's tick history from a JSONL dump file.
pub fn load_tick_file<P: AsRef<Path>>(path: P, instrument: &str) -> Result<Vec<MarketTick>> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("failed to open tick file {}", path_ref.display()))?;
    let reader = BufReader::new(file);
    let mut ticks = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path_ref.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: TickRow = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse tick row '{}'", line))?;
        ticks.push(MarketTick {
            instrument: instrument.to_string(),
            bid_price: row.bid_price,
            ask_price: row.ask_price,
            bid_size: row.bid_size,
            ask_size: row.ask_size,
            timestamp: row.timestamp,
        });
    }

    if ticks.is_empty() {
        return Err(anyhow!("tick file {} is empty", path_ref.display()));
    }
    Ok(ticks)
}

/// Merge per-leg histories into one replay sequence ordered by timestamp.
/// The sort is stable, so same-timestamp ticks keep their input order and
/// replays stay reproducible.
pub fn merge_histories(histories: Vec<Vec<MarketTick>>) -> Vec<MarketTick> {
    let mut merged: Vec<MarketTick> = histories.into_iter().flatten().collect();
    merged.sort_by_key(|tick| tick.timestamp);
    merged
}
