use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

pub type OrderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Direction of the hedge for a fill in this direction.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Offset {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitting,
    NotTraded,
    PartTraded,
    AllTraded,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            OrderStatus::AllTraded | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// The four sniper entry/exit signals: open long, close long, open short,
/// close short on the synthetic spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniperSignal {
    Buy,
    Sell,
    Short,
    Cover,
}

impl SniperSignal {
    pub fn direction_offset(self) -> (Direction, Offset) {
        match self {
            SniperSignal::Buy => (Direction::Long, Offset::Open),
            SniperSignal::Sell => (Direction::Short, Offset::Close),
            SniperSignal::Short => (Direction::Short, Offset::Open),
            SniperSignal::Cover => (Direction::Long, Offset::Close),
        }
    }
}

/// Best bid/ask snapshot for one instrument. Timestamps are epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub instrument: String,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub timestamp: i64,
}

impl MarketTick {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

/// Asynchronous order-status callback payload from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub instrument: String,
    pub strategy: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: Decimal,
    pub traded: Decimal,
    pub status: OrderStatus,
}

impl OrderUpdate {
    pub fn residual(&self) -> Decimal {
        self.volume - self.traded
    }
}

/// One fill produced by the matching engine. `long_delta`/`short_delta`
/// carry the signed change to the leg's long and short position.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFill {
    pub trade_id: String,
    pub order_id: OrderId,
    pub instrument: String,
    pub strategy: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: Decimal,
    pub long_delta: Decimal,
    pub short_delta: Decimal,
    pub timestamp: i64,
}

impl TradeFill {
    pub fn date(&self) -> Option<NaiveDate> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .map(|dt| dt.date_naive())
    }
}

/// Position query callback payload, routed by strategy name.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub strategy: String,
    pub instrument: String,
    pub long_qty: Decimal,
    pub short_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub strategy: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelRequest {
    pub instrument: String,
    pub order_id: OrderId,
}

/// Static contract description resolved from the contract registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub exchange: String,
    pub price_tick: Decimal,
    pub size: Decimal,
}

/// Contracts keyed by instrument symbol. Loaded once before the engine
/// builds its spreads; the engine only reads from it.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, Contract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open contract file {}", path_ref.display()))?;
        let contracts: Vec<Contract> = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse contract file {}", path_ref.display()))?;
        let mut registry = Self::new();
        for contract in contracts {
            registry.insert(contract);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, contract: Contract) {
        self.contracts.insert(contract.symbol.clone(), contract);
    }

    pub fn get(&self, symbol: &str) -> Option<&Contract> {
        self.contracts.get(symbol)
    }

    pub fn resolve(&self, symbol: &str) -> Result<&Contract> {
        self.get(symbol)
            .ok_or_else(|| anyhow!("unknown contract: {}", symbol))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// Round a price onto the instrument's tick grid.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let multiples = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (multiples * tick).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signal_maps_to_direction_and_offset() {
        assert_eq!(
            SniperSignal::Buy.direction_offset(),
            (Direction::Long, Offset::Open)
        );
        assert_eq!(
            SniperSignal::Sell.direction_offset(),
            (Direction::Short, Offset::Close)
        );
        assert_eq!(
            SniperSignal::Short.direction_offset(),
            (Direction::Short, Offset::Open)
        );
        assert_eq!(
            SniperSignal::Cover.direction_offset(),
            (Direction::Long, Offset::Close)
        );
    }

    #[test]
    fn round_to_tick_snaps_to_grid() {
        assert_eq!(round_to_tick(dec!(100.1234567), dec!(0.000001)), dec!(100.123457));
        assert_eq!(round_to_tick(dec!(0.0301), dec!(0.01)), dec!(0.03));
        assert_eq!(round_to_tick(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn finished_statuses() {
        assert!(OrderStatus::AllTraded.is_finished());
        assert!(OrderStatus::Cancelled.is_finished());
        assert!(OrderStatus::Rejected.is_finished());
        assert!(!OrderStatus::PartTraded.is_finished());
        assert!(!OrderStatus::NotTraded.is_finished());
        assert!(!OrderStatus::Submitting.is_finished());
    }
}
