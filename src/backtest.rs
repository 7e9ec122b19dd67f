use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::{BacktestConfig, EngineConfig};
use crate::engine::{EngineContext, EngineMode, SniperEngine};
use crate::ports::gateway::OrderGateway;
use crate::ports::replay_feed::{load_tick_file, merge_histories};
use crate::ports::store::{MemoryRecordStore, RecordStore};
use crate::types::{
    CancelRequest, ContractRegistry, Direction, MarketTick, Offset, OrderId, OrderRequest,
    OrderStatus, OrderUpdate, TradeFill,
};

const ORDER_SEQ_KEY: &str = "order_seq";

/// Signed long/short leg changes produced by one fill.
fn position_deltas(direction: Direction, offset: Offset, volume: Decimal) -> (Decimal, Decimal) {
    match (direction, offset) {
        (Direction::Long, Offset::Open) => (volume, Decimal::ZERO),
        (Direction::Short, Offset::Close) => (-volume, Decimal::ZERO),
        (Direction::Short, Offset::Open) => (Decimal::ZERO, volume),
        (Direction::Long, Offset::Close) => (Decimal::ZERO, -volume),
    }
}

/// Simplified limit-order book holding the resting orders of a replay.
/// Orders rest in submission order; a matched order fills its entire
/// remaining volume in one step and leaves the book.
#[derive(Debug, Default)]
pub struct MatchingBook {
    next_order_id: u64,
    trade_count: u64,
    resting: Vec<OrderUpdate>,
    pending_events: Vec<OrderUpdate>,
}

impl MatchingBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume the order id sequence from the record store.
    pub fn recover(store: &dyn RecordStore) -> Result<Self> {
        let next_order_id = store.counter(ORDER_SEQ_KEY)?;
        Ok(Self {
            next_order_id,
            ..Self::default()
        })
    }

    pub fn resting_count(&self) -> usize {
        self.resting.len()
    }

    fn insert(&mut self, mut order: OrderUpdate) -> OrderId {
        self.next_order_id += 1;
        let order_id = self.next_order_id.to_string();
        order.order_id = order_id.clone();
        order.status = OrderStatus::NotTraded;
        self.resting.push(order);
        order_id
    }

    /// Pull a resting order. The cancel confirmation is queued as an order
    /// event so the algorithm's bookkeeping sees the same terminal status it
    /// would live.
    fn cancel(&mut self, order_id: &str) {
        if let Some(index) = self
            .resting
            .iter()
            .position(|order| order.order_id == order_id)
        {
            let mut order = self.resting.remove(index);
            order.status = OrderStatus::Cancelled;
            self.pending_events.push(order);
        } else {
            log::debug!("[BACKTEST] cancel of unknown order {} ignored", order_id);
        }
    }

    fn take_events(&mut self) -> Vec<OrderUpdate> {
        std::mem::take(&mut self.pending_events)
    }

    /// Cross resting orders against an incoming tick. Long orders fill when
    /// the ask trades through their limit, short orders when the bid does;
    /// the fill price is the more conservative of order and book price.
    pub fn cross(&mut self, tick: &MarketTick) -> Vec<(OrderUpdate, TradeFill)> {
        let long_cross_price = tick.ask_price;
        let short_cross_price = tick.bid_price;

        let mut fills = Vec::new();
        let mut kept = Vec::new();
        for mut order in std::mem::take(&mut self.resting) {
            if order.instrument != tick.instrument {
                kept.push(order);
                continue;
            }
            let crossed = match order.direction {
                Direction::Long => {
                    long_cross_price > Decimal::ZERO && order.price >= long_cross_price
                }
                Direction::Short => {
                    short_cross_price > Decimal::ZERO && order.price <= short_cross_price
                }
            };
            if !crossed {
                kept.push(order);
                continue;
            }

            let trade_price = match order.direction {
                Direction::Long => order.price.min(long_cross_price),
                Direction::Short => order.price.max(short_cross_price),
            };
            order.traded = order.volume;
            order.status = OrderStatus::AllTraded;

            self.trade_count += 1;
            let (long_delta, short_delta) =
                position_deltas(order.direction, order.offset, order.volume);
            let fill = TradeFill {
                trade_id: self.trade_count.to_string(),
                order_id: order.order_id.clone(),
                instrument: order.instrument.clone(),
                strategy: order.strategy.clone(),
                direction: order.direction,
                offset: order.offset,
                price: trade_price,
                volume: order.volume,
                long_delta,
                short_delta,
                timestamp: tick.timestamp,
            };
            fills.push((order, fill));
        }
        self.resting = kept;
        fills
    }
}

/// Deterministic gateway substitute backing both backtests and paper
/// trading: submissions rest in the matching book, cancels come back as
/// cancelled order events.
pub struct SimGateway {
    book: Arc<Mutex<MatchingBook>>,
    store: Arc<dyn RecordStore>,
}

impl SimGateway {
    pub fn new(book: Arc<Mutex<MatchingBook>>, store: Arc<dyn RecordStore>) -> Self {
        Self { book, store }
    }
}

#[async_trait]
impl OrderGateway for SimGateway {
    async fn submit(&self, req: OrderRequest) -> Result<OrderId> {
        let order = OrderUpdate {
            order_id: String::new(),
            instrument: req.instrument,
            strategy: req.strategy,
            direction: req.direction,
            offset: req.offset,
            price: req.price,
            volume: req.volume,
            traded: Decimal::ZERO,
            status: OrderStatus::Submitting,
        };
        let (order_id, sequence) = {
            let mut book = self.book.lock().unwrap();
            let order_id = book.insert(order);
            (order_id, book.next_order_id)
        };
        self.store.set_counter(ORDER_SEQ_KEY, sequence)?;
        Ok(order_id)
    }

    async fn cancel(&self, req: CancelRequest) -> Result<()> {
        self.book.lock().unwrap().cancel(&req.order_id);
        Ok(())
    }

    async fn subscribe(&self, _instrument: &str) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _instrument: &str) -> Result<()> {
        Ok(())
    }

    async fn query_position(&self, _strategy: &str, _instrument: &str) -> Result<()> {
        Ok(())
    }
}

/// One trading day's mark-to-market decomposition under the inverse-price
/// (coin-margined) convention. Each day consumes the previous day's closing
/// prices and ending positions.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyResult {
    pub date: NaiveDate,
    pub close_price: BTreeMap<String, f64>,
    pub pre_close: BTreeMap<String, f64>,
    pub trades: Vec<TradeFill>,
    pub trade_count: usize,
    pub start_pos: BTreeMap<String, f64>,
    pub end_pos: BTreeMap<String, f64>,
    pub turnover: f64,
    pub commission: f64,
    pub slippage: f64,
    pub trading_pnl: f64,
    pub holding_pnl: f64,
    pub total_pnl: f64,
    pub net_pnl: f64,
}

impl DailyResult {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            close_price: BTreeMap::new(),
            pre_close: BTreeMap::new(),
            trades: Vec::new(),
            trade_count: 0,
            start_pos: BTreeMap::new(),
            end_pos: BTreeMap::new(),
            turnover: 0.0,
            commission: 0.0,
            slippage: 0.0,
            trading_pnl: 0.0,
            holding_pnl: 0.0,
            total_pnl: 0.0,
            net_pnl: 0.0,
        }
    }

    pub fn add_trade(&mut self, trade: TradeFill) {
        self.trades.push(trade);
    }

    /// Chain this day off the previous day's closes and ending positions.
    pub fn calculate_pnl(
        &mut self,
        pre_close: &BTreeMap<String, f64>,
        start_pos: &BTreeMap<String, f64>,
        size: f64,
        rate: f64,
        slippage: f64,
    ) {
        self.pre_close = pre_close.clone();
        self.start_pos = start_pos.clone();
        self.end_pos = start_pos.clone();

        // Holding pnl: the carried position marked from yesterday's close
        // to today's, in inverse-price terms.
        for (instrument, close) in &self.close_price {
            let start = self.start_pos.get(instrument).copied().unwrap_or(0.0);
            let pre = self.pre_close.get(instrument).copied().unwrap_or(0.0);
            if start != 0.0 && pre > 0.0 && *close > 0.0 {
                self.holding_pnl += start * (1.0 / pre - 1.0 / close) * size;
            }
        }

        self.trade_count = self.trades.len();
        let trades = self.trades.clone();
        for trade in &trades {
            let price = trade.price.to_f64().unwrap_or(0.0);
            let volume = trade.volume.to_f64().unwrap_or(0.0);
            if price <= 0.0 {
                continue;
            }
            let pos_change = match trade.direction {
                Direction::Long => volume,
                Direction::Short => -volume,
            };
            let close = self
                .close_price
                .get(&trade.instrument)
                .copied()
                .unwrap_or(0.0);
            if close > 0.0 {
                self.trading_pnl += pos_change * (1.0 / price - 1.0 / close) * size;
            }
            *self.end_pos.entry(trade.instrument.clone()).or_insert(0.0) += pos_change;

            let turnover = volume * size / price;
            self.turnover += turnover;
            self.commission += turnover * rate;
            self.slippage += volume * size * slippage;
        }

        self.total_pnl = self.trading_pnl + self.holding_pnl;
        self.net_pnl = self.total_pnl - self.commission - self.slippage;
    }
}

/// Aggregate statistics over a chained daily result series.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BacktestStatistics {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub total_days: usize,
    pub profit_days: usize,
    pub loss_days: usize,
    pub end_balance: f64,
    pub max_drawdown: f64,
    pub max_ddpercent: f64,
    pub total_net_pnl: f64,
    pub daily_net_pnl: f64,
    pub total_commission: f64,
    pub daily_commission: f64,
    pub total_slippage: f64,
    pub daily_slippage: f64,
    pub total_turnover: f64,
    pub daily_turnover: f64,
    pub total_trade_count: usize,
    pub daily_trade_count: f64,
    pub total_return: f64,
    pub annual_return: f64,
    pub daily_return: f64,
    pub return_std: f64,
    pub sharpe_ratio: f64,
}

/// Balance curve, drawdowns and the Sharpe ratio over the daily series.
/// Returns all zeros when the series is empty (no trades).
pub fn calculate_statistics(daily: &[DailyResult], capital: f64) -> BacktestStatistics {
    let mut stats = BacktestStatistics::default();
    if daily.is_empty() || capital <= 0.0 {
        return stats;
    }

    let total_days = daily.len();
    let mut balances = Vec::with_capacity(total_days);
    let mut returns = Vec::with_capacity(total_days);
    let mut balance = capital;
    let mut previous = capital;
    for day in daily {
        balance += day.net_pnl;
        balances.push(balance);
        let log_return = if balance > 0.0 && previous > 0.0 {
            (balance / previous).ln()
        } else {
            0.0
        };
        returns.push(log_return);
        previous = balance;
    }

    let mut highlevel = f64::MIN;
    for (index, balance) in balances.iter().enumerate() {
        highlevel = highlevel.max(*balance);
        let drawdown = balance - highlevel;
        let ddpercent = if highlevel != 0.0 {
            drawdown / highlevel * 100.0
        } else {
            0.0
        };
        if index == 0 || drawdown < stats.max_drawdown {
            stats.max_drawdown = drawdown;
        }
        if index == 0 || ddpercent < stats.max_ddpercent {
            stats.max_ddpercent = ddpercent;
        }
    }

    stats.start_date = Some(daily[0].date);
    stats.end_date = Some(daily[total_days - 1].date);
    stats.total_days = total_days;
    stats.profit_days = daily.iter().filter(|d| d.net_pnl > 0.0).count();
    stats.loss_days = daily.iter().filter(|d| d.net_pnl < 0.0).count();
    stats.end_balance = balances[total_days - 1];

    stats.total_net_pnl = daily.iter().map(|d| d.net_pnl).sum();
    stats.daily_net_pnl = stats.total_net_pnl / total_days as f64;
    stats.total_commission = daily.iter().map(|d| d.commission).sum();
    stats.daily_commission = stats.total_commission / total_days as f64;
    stats.total_slippage = daily.iter().map(|d| d.slippage).sum();
    stats.daily_slippage = stats.total_slippage / total_days as f64;
    stats.total_turnover = daily.iter().map(|d| d.turnover).sum();
    stats.daily_turnover = stats.total_turnover / total_days as f64;
    stats.total_trade_count = daily.iter().map(|d| d.trade_count).sum();
    stats.daily_trade_count = stats.total_trade_count as f64 / total_days as f64;

    stats.total_return = (stats.end_balance / capital - 1.0) * 100.0;
    stats.annual_return = stats.total_return / total_days as f64 * 365.0;

    let mean = returns.iter().sum::<f64>() / total_days as f64;
    let std = if total_days > 1 {
        let variance = returns
            .iter()
            .map(|r| {
                let d = r - mean;
                d * d
            })
            .sum::<f64>()
            / (total_days - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };
    stats.daily_return = mean * 100.0;
    stats.return_std = std * 100.0;
    stats.sharpe_ratio = if stats.return_std > 0.0 {
        stats.daily_return / stats.return_std * 365f64.sqrt()
    } else {
        0.0
    };

    log::info!(
        "[BACKTEST] days={} profit={} loss={} end_balance={:.4} max_dd={:.4} ({:.2}%)",
        stats.total_days,
        stats.profit_days,
        stats.loss_days,
        stats.end_balance,
        stats.max_drawdown,
        stats.max_ddpercent
    );
    log::info!(
        "[BACKTEST] net_pnl={:.6} commission={:.6} slippage={:.6} turnover={:.4} trades={}",
        stats.total_net_pnl,
        stats.total_commission,
        stats.total_slippage,
        stats.total_turnover,
        stats.total_trade_count
    );
    log::info!(
        "[BACKTEST] total_return={:.4}% annual={:.4}% daily={:.6}% std={:.6}% sharpe={:.4}",
        stats.total_return,
        stats.annual_return,
        stats.daily_return,
        stats.return_std,
        stats.sharpe_ratio
    );

    stats
}

/// Synchronous, single-threaded replay of merged historical ticks through
/// the same spread/algorithm pair used live. Replaying the same input and
/// configuration twice reproduces bit-identical results.
pub struct BacktestEngine {
    engine: SniperEngine,
    book: Arc<Mutex<MatchingBook>>,
    history: Vec<MarketTick>,
    rate: f64,
    slippage: f64,
    size: f64,
    pub capital: f64,
    trades: Vec<TradeFill>,
    daily_results: BTreeMap<NaiveDate, DailyResult>,
}

impl BacktestEngine {
    pub fn new(
        engine: SniperEngine,
        book: Arc<Mutex<MatchingBook>>,
        history: Vec<MarketTick>,
        backtest: &BacktestConfig,
    ) -> Self {
        Self {
            engine,
            book,
            history,
            rate: backtest.rate,
            slippage: backtest.slippage,
            size: backtest.size,
            capital: backtest.capital,
            trades: Vec::new(),
            daily_results: BTreeMap::new(),
        }
    }

    /// Wire up a replay from configuration: tick files per leg instrument,
    /// an in-memory record store and the simulated gateway.
    pub fn from_config(cfg: EngineConfig, contracts: ContractRegistry) -> Result<Self> {
        let backtest = cfg
            .backtest
            .clone()
            .ok_or_else(|| anyhow!("config has no backtest section"))?;

        let mut histories = Vec::new();
        for instrument in cfg.instruments() {
            let path = backtest
                .tick_files
                .get(&instrument)
                .ok_or_else(|| anyhow!("no tick file configured for {}", instrument))?;
            let ticks = load_tick_file(path, &instrument)
                .with_context(|| format!("failed to load history for {}", instrument))?;
            log::info!("[BACKTEST] loaded {} ticks for {}", ticks.len(), instrument);
            histories.push(ticks);
        }
        let history = merge_histories(histories);
        log::info!("[BACKTEST] merged history holds {} ticks", history.len());

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let book = Arc::new(Mutex::new(MatchingBook::new()));
        let gateway = Arc::new(SimGateway::new(book.clone(), store.clone()));
        let ctx = EngineContext {
            gateway,
            store,
            contracts,
        };
        let engine = SniperEngine::new(ctx, cfg, EngineMode::Backtest);
        Ok(Self::new(engine, book, history, &backtest))
    }

    pub fn trades(&self) -> &[TradeFill] {
        &self.trades
    }

    pub async fn run(&mut self) -> Result<()> {
        self.engine.start().await?;
        log::info!("[BACKTEST] replaying {} ticks", self.history.len());
        for index in 0..self.history.len() {
            let tick = self.history[index].clone();
            self.new_tick(&tick).await;
        }
        log::info!("[BACKTEST] replay finished with {} trades", self.trades.len());
        Ok(())
    }

    async fn new_tick(&mut self, tick: &MarketTick) {
        // (a) limit-order crossing against the fresh book
        let fills = { self.book.lock().unwrap().cross(tick) };
        for (order, fill) in fills {
            self.engine.handle_order(order).await;
            self.engine.apply_trade(&fill);
            self.trades.push(fill);
        }
        self.drain_book_events().await;

        // (b) market-data routing through the live engine path
        self.engine.handle_tick(tick).await;
        self.drain_book_events().await;

        // (c) rollover teardown/rebuild once every spread is flat
        if self.engine.all_unwound() {
            if let Err(err) = self.engine.restart(false).await {
                log::error!("[BACKTEST] rollover rebuild failed: {:#}", err);
            }
        }

        // (d) daily close-price bookkeeping
        self.update_daily_close(tick);
    }

    /// Cancel confirmations queued by the book are routed back as order
    /// events; routing them may queue more, so drain until quiet.
    async fn drain_book_events(&mut self) {
        loop {
            let events = { self.book.lock().unwrap().take_events() };
            if events.is_empty() {
                break;
            }
            for order in events {
                self.engine.handle_order(order).await;
            }
        }
    }

    fn update_daily_close(&mut self, tick: &MarketTick) {
        let date = match tick.datetime() {
            Some(dt) => dt.date_naive(),
            None => return,
        };
        let mid = ((tick.ask_price + tick.bid_price) / dec!(2))
            .to_f64()
            .unwrap_or(0.0);
        self.daily_results
            .entry(date)
            .or_insert_with(|| DailyResult::new(date))
            .close_price
            .insert(tick.instrument.clone(), mid);
    }

    /// Distribute trades over their days and chain the daily mark-to-market
    /// computation in strict date order.
    pub fn calculate_result(&mut self) -> Vec<DailyResult> {
        log::info!("[BACKTEST] computing daily mark-to-market results");
        if self.trades.is_empty() {
            log::warn!("[BACKTEST] no trades recorded; nothing to compute");
            return Vec::new();
        }

        for trade in &self.trades {
            let date = match trade.date() {
                Some(date) => date,
                None => continue,
            };
            if let Some(daily) = self.daily_results.get_mut(&date) {
                daily.add_trade(trade.clone());
            }
        }

        let mut pre_close: BTreeMap<String, f64> = BTreeMap::new();
        let mut start_pos: BTreeMap<String, f64> = BTreeMap::new();
        let mut out = Vec::with_capacity(self.daily_results.len());
        for daily in self.daily_results.values_mut() {
            daily.calculate_pnl(&pre_close, &start_pos, self.size, self.rate, self.slippage);
            pre_close = daily.close_price.clone();
            start_pos = daily.end_pos.clone();
            out.push(daily.clone());
        }
        log::info!("[BACKTEST] daily results computed for {} days", out.len());
        out
    }
}

/// Named numeric parameter ranges expanded to the Cartesian product of
/// settings for a sweep.
#[derive(Debug, Clone, Default)]
pub struct OptimizationSetting {
    params: BTreeMap<String, Vec<f64>>,
    pub target: String,
}

impl OptimizationSetting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fixed(&mut self, name: &str, value: f64) {
        self.params.insert(name.to_string(), vec![value]);
    }

    pub fn add_parameter(&mut self, name: &str, start: f64, end: f64, step: f64) -> Result<()> {
        if start >= end {
            return Err(anyhow!("parameter {} start must be below end", name));
        }
        if step <= 0.0 {
            return Err(anyhow!("parameter {} step must be positive", name));
        }
        let mut values = Vec::new();
        let mut value = start;
        while value <= end {
            values.push(value);
            value += step;
        }
        self.params.insert(name.to_string(), values);
        Ok(())
    }

    pub fn set_target(&mut self, target: &str) {
        self.target = target.to_string();
    }

    pub fn generate_settings(&self) -> Vec<BTreeMap<String, f64>> {
        let mut settings: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new()];
        for (name, values) in &self.params {
            let mut expanded = Vec::with_capacity(settings.len() * values.len());
            for base in &settings {
                for value in values {
                    let mut setting = base.clone();
                    setting.insert(name.clone(), *value);
                    expanded.push(setting);
                }
            }
            settings = expanded;
        }
        settings
    }
}

/// Sweep the entry band: `buy_percent = -x`, `short_percent = +x`.
fn apply_setting(cfg: &mut EngineConfig, setting: &BTreeMap<String, f64>) {
    if let Some(x) = setting.get("buy_percent") {
        for spread in &mut cfg.spreads {
            if let (Some(buy), Some(short)) = (Decimal::from_f64(-x), Decimal::from_f64(*x)) {
                spread.buy_percent = buy;
                spread.short_percent = short;
            }
        }
    }
}

/// Run every expanded setting through a fully independent engine instance
/// and collect its summary statistics. No state is shared between runs.
pub async fn run_optimization(
    cfg: &EngineConfig,
    contracts: &ContractRegistry,
    optimization: &OptimizationSetting,
) -> Result<Vec<(BTreeMap<String, f64>, BacktestStatistics)>> {
    let settings = optimization.generate_settings();
    log::info!("[BACKTEST] optimization sweep over {} settings", settings.len());
    let mut results = Vec::with_capacity(settings.len());
    for setting in settings {
        let mut run_cfg = cfg.clone();
        apply_setting(&mut run_cfg, &setting);
        let mut engine = BacktestEngine::from_config(run_cfg, contracts.clone())?;
        engine.run().await?;
        let daily = engine.calculate_result();
        let stats = calculate_statistics(&daily, engine.capital);
        log::info!(
            "[BACKTEST] setting {:?} -> sharpe {:.4}",
            setting,
            stats.sharpe_ratio
        );
        results.push((setting, stats));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RolloverConfig, SpreadSetting};
    use crate::types::Contract;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn order(
        id: &str,
        instrument: &str,
        direction: Direction,
        offset: Offset,
        price: Decimal,
    ) -> OrderUpdate {
        OrderUpdate {
            order_id: id.to_string(),
            instrument: instrument.to_string(),
            strategy: "A+B".to_string(),
            direction,
            offset,
            price,
            volume: dec!(1),
            traded: Decimal::ZERO,
            status: OrderStatus::NotTraded,
        }
    }

    fn tick(instrument: &str, bid: Decimal, ask: Decimal, ts: i64) -> MarketTick {
        MarketTick {
            instrument: instrument.to_string(),
            bid_price: bid,
            ask_price: ask,
            bid_size: dec!(3),
            ask_size: dec!(4),
            timestamp: ts,
        }
    }

    #[test]
    fn long_orders_cross_the_ask_at_the_conservative_price() {
        let mut book = MatchingBook::new();
        book.resting.push(order("1", "A", Direction::Long, Offset::Open, dec!(100.03)));
        book.resting.push(order("2", "A", Direction::Long, Offset::Close, dec!(99.99)));

        let fills = book.cross(&tick("A", dec!(100.00), dec!(100.02), 1));
        assert_eq!(fills.len(), 1);
        let (filled, fill) = &fills[0];
        assert_eq!(filled.order_id, "1");
        assert_eq!(filled.status, OrderStatus::AllTraded);
        assert_eq!(filled.traded, dec!(1));
        // limit 100.03 against ask 100.02 fills at the book price
        assert_eq!(fill.price, dec!(100.02));
        assert_eq!(fill.long_delta, dec!(1));
        assert_eq!(fill.short_delta, Decimal::ZERO);
        // the unfilled close order keeps resting
        assert_eq!(book.resting_count(), 1);
    }

    #[test]
    fn short_orders_cross_the_bid_at_the_conservative_price() {
        let mut book = MatchingBook::new();
        book.resting.push(order("1", "A", Direction::Short, Offset::Close, dec!(99.98)));
        book.resting.push(order("2", "A", Direction::Short, Offset::Open, dec!(100.05)));

        let fills = book.cross(&tick("A", dec!(100.00), dec!(100.02), 1));
        assert_eq!(fills.len(), 1);
        let (_, fill) = &fills[0];
        // limit 99.98 against bid 100.00 fills at the better bid
        assert_eq!(fill.price, dec!(100.00));
        assert_eq!(fill.long_delta, dec!(-1));
        assert_eq!(book.resting_count(), 1);
    }

    #[test]
    fn zero_quotes_never_fill() {
        let mut book = MatchingBook::new();
        book.resting.push(order("1", "A", Direction::Long, Offset::Open, dec!(100.03)));
        book.resting.push(order("2", "A", Direction::Short, Offset::Open, dec!(99.00)));
        let fills = book.cross(&tick("A", Decimal::ZERO, Decimal::ZERO, 1));
        assert!(fills.is_empty());
        assert_eq!(book.resting_count(), 2);
    }

    #[test]
    fn other_instruments_are_left_alone() {
        let mut book = MatchingBook::new();
        book.resting.push(order("1", "B", Direction::Long, Offset::Open, dec!(100.03)));
        let fills = book.cross(&tick("A", dec!(100.00), dec!(100.02), 1));
        assert!(fills.is_empty());
        assert_eq!(book.resting_count(), 1);
    }

    #[test]
    fn cancel_queues_a_cancelled_order_event() {
        let mut book = MatchingBook::new();
        book.resting.push(order("1", "A", Direction::Long, Offset::Open, dec!(100.03)));
        book.cancel("1");
        assert_eq!(book.resting_count(), 0);
        let events = book.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OrderStatus::Cancelled);
        assert!(book.take_events().is_empty());
    }

    #[test]
    fn open_short_then_cover_nets_flat() {
        assert_eq!(
            position_deltas(Direction::Short, Offset::Open, dec!(2)),
            (Decimal::ZERO, dec!(2))
        );
        assert_eq!(
            position_deltas(Direction::Long, Offset::Close, dec!(2)),
            (Decimal::ZERO, dec!(-2))
        );
    }

    fn fill(
        instrument: &str,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: Decimal,
        ts: i64,
    ) -> TradeFill {
        let (long_delta, short_delta) = position_deltas(direction, offset, volume);
        TradeFill {
            trade_id: "1".to_string(),
            order_id: "1".to_string(),
            instrument: instrument.to_string(),
            strategy: "A+B".to_string(),
            direction,
            offset,
            price,
            volume,
            long_delta,
            short_delta,
            timestamp: ts,
        }
    }

    #[test]
    fn daily_pnl_decomposition_matches_hand_computation() {
        let date = NaiveDate::from_ymd_opt(2019, 3, 4).unwrap();
        let size = 100.0;
        let rate = 0.0003;
        let slip = 0.001;

        // Day one: buy 1 at 100, instrument closes at 102.
        let mut day1 = DailyResult::new(date);
        day1.close_price.insert("A".to_string(), 102.0);
        day1.add_trade(fill(
            "A",
            Direction::Long,
            Offset::Open,
            dec!(100),
            dec!(1),
            0,
        ));
        day1.calculate_pnl(&BTreeMap::new(), &BTreeMap::new(), size, rate, slip);

        let expected_trading = 1.0 * (1.0 / 100.0 - 1.0 / 102.0) * size;
        let expected_turnover = 1.0 * size / 100.0;
        assert!((day1.trading_pnl - expected_trading).abs() < 1e-12);
        assert_eq!(day1.holding_pnl, 0.0);
        assert!((day1.turnover - expected_turnover).abs() < 1e-12);
        assert!((day1.commission - expected_turnover * rate).abs() < 1e-12);
        assert!((day1.slippage - 1.0 * size * slip).abs() < 1e-12);
        assert_eq!(day1.end_pos.get("A"), Some(&1.0));
        let expected_net =
            expected_trading - expected_turnover * rate - 1.0 * size * slip;
        assert!((day1.net_pnl - expected_net).abs() < 1e-12);

        // Day two: no trades, the carried long marks from 102 to 105.
        let mut day2 = DailyResult::new(date.succ_opt().unwrap());
        day2.close_price.insert("A".to_string(), 105.0);
        day2.calculate_pnl(&day1.close_price, &day1.end_pos, size, rate, slip);

        let expected_holding = 1.0 * (1.0 / 102.0 - 1.0 / 105.0) * size;
        assert!((day2.holding_pnl - expected_holding).abs() < 1e-12);
        assert_eq!(day2.trading_pnl, 0.0);
        assert_eq!(day2.end_pos.get("A"), Some(&1.0));
    }

    #[test]
    fn statistics_on_two_days() {
        let date = NaiveDate::from_ymd_opt(2019, 3, 4).unwrap();
        let mut day1 = DailyResult::new(date);
        day1.net_pnl = 10.0;
        day1.trade_count = 2;
        let mut day2 = DailyResult::new(date.succ_opt().unwrap());
        day2.net_pnl = -5.0;
        day2.trade_count = 1;

        let stats = calculate_statistics(&[day1, day2], 100.0);
        assert_eq!(stats.total_days, 2);
        assert_eq!(stats.profit_days, 1);
        assert_eq!(stats.loss_days, 1);
        assert_eq!(stats.end_balance, 105.0);
        assert_eq!(stats.max_drawdown, -5.0);
        assert!((stats.max_ddpercent - (-5.0 / 110.0 * 100.0)).abs() < 1e-12);
        assert!((stats.total_return - 5.0).abs() < 1e-12);
        assert!((stats.annual_return - 5.0 / 2.0 * 365.0).abs() < 1e-12);
        assert_eq!(stats.total_trade_count, 3);
        assert!(stats.return_std > 0.0);
        assert!(stats.sharpe_ratio > 0.0);
    }

    #[test]
    fn single_day_series_has_zero_sharpe() {
        let mut day = DailyResult::new(NaiveDate::from_ymd_opt(2019, 3, 4).unwrap());
        day.net_pnl = 10.0;
        let stats = calculate_statistics(&[day], 100.0);
        assert_eq!(stats.return_std, 0.0);
        assert_eq!(stats.sharpe_ratio, 0.0);
    }

    #[test]
    fn empty_series_yields_zeroed_statistics() {
        let stats = calculate_statistics(&[], 100.0);
        assert_eq!(stats, BacktestStatistics::default());
    }

    #[test]
    fn optimization_settings_expand_to_the_cartesian_product() {
        let mut optimization = OptimizationSetting::new();
        // binary-exact range endpoints keep the expansion predictable
        optimization.add_parameter("buy_percent", 0.25, 0.75, 0.25).unwrap();
        optimization.add_fixed("max_pos_size", 5.0);
        optimization.set_target("sharpe_ratio");

        let settings = optimization.generate_settings();
        assert_eq!(settings.len(), 3);
        assert_eq!(settings[0].get("buy_percent"), Some(&0.25));
        assert_eq!(settings[1].get("buy_percent"), Some(&0.5));
        assert_eq!(settings[2].get("buy_percent"), Some(&0.75));
        assert!(settings.iter().all(|s| s.get("max_pos_size") == Some(&5.0)));
    }

    #[test]
    fn degenerate_ranges_are_rejected() {
        let mut optimization = OptimizationSetting::new();
        assert!(optimization.add_parameter("x", 1.0, 1.0, 0.1).is_err());
        assert!(optimization.add_parameter("x", 0.0, 1.0, 0.0).is_err());
    }

    // --- end-to-end replay -------------------------------------------------

    fn registry() -> ContractRegistry {
        let mut registry = ContractRegistry::new();
        for symbol in ["A", "B"] {
            registry.insert(Contract {
                symbol: symbol.to_string(),
                exchange: "TEST".to_string(),
                price_tick: dec!(0.01),
                size: dec!(100),
            });
        }
        registry
    }

    fn replay_config() -> EngineConfig {
        EngineConfig {
            gateway: "sim".to_string(),
            contracts_file: None,
            store_file: None,
            timer_secs: 1,
            quote_interval: 16,
            rollover: RolloverConfig::default(),
            spreads: vec![SpreadSetting {
                name: "A+B".to_string(),
                active_instrument: "A".to_string(),
                passive_instrument: "B".to_string(),
                buy_percent: dec!(0.001),
                sell_percent: dec!(-0.001),
                short_percent: dec!(0.01),
                cover_percent: dec!(0.002),
                active_payup: 1,
                passive_payup: 2,
                max_order_size: dec!(1),
                max_pos_size: dec!(5),
                algo_tag: "sniper".to_string(),
            }],
            backtest: None,
            source_path: None,
        }
    }

    fn replay_engine(history: Vec<MarketTick>) -> BacktestEngine {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let book = Arc::new(Mutex::new(MatchingBook::new()));
        let gateway = Arc::new(SimGateway::new(book.clone(), store.clone()));
        let ctx = EngineContext {
            gateway,
            store,
            contracts: registry(),
        };
        let engine = SniperEngine::new(ctx, replay_config(), EngineMode::Backtest);
        let backtest = BacktestConfig {
            rate: 0.0003,
            slippage: 0.0,
            size: 100.0,
            capital: 1.0,
            tick_files: HashMap::new(),
        };
        BacktestEngine::new(engine, book, history, &backtest)
    }

    fn replay_history() -> Vec<MarketTick> {
        // Monday, far away from any rollover window.
        let base = Utc
            .with_ymd_and_hms(2019, 3, 4, 10, 0, 0)
            .unwrap()
            .timestamp_millis();
        vec![
            tick("A", dec!(100.00), dec!(100.02), base),
            // the crossed spread book triggers the open-long on A
            tick("B", dec!(99.98), dec!(100.02), base + 1_000),
            // A's next tick fills the resting buy, spawning the hedge on B
            tick("A", dec!(100.00), dec!(100.02), base + 2_000),
            // B's next tick fills the hedge
            tick("B", dec!(99.98), dec!(100.02), base + 3_000),
        ]
    }

    #[tokio::test]
    async fn replay_fills_entry_and_hedge() {
        let mut engine = replay_engine(replay_history());
        engine.run().await.unwrap();

        let trades = engine.trades();
        assert_eq!(trades.len(), 2);
        // one open-long on the active leg, sized min(askSize, cap, order cap)
        assert_eq!(trades[0].instrument, "A");
        assert_eq!(trades[0].direction, Direction::Long);
        assert_eq!(trades[0].offset, Offset::Open);
        assert_eq!(trades[0].volume, dec!(1));
        // limit was 100.02 + 1 payup tick; fill at the book ask
        assert_eq!(trades[0].price, dec!(100.02));
        // exactly one hedge on the passive leg for the same volume
        assert_eq!(trades[1].instrument, "B");
        assert_eq!(trades[1].direction, Direction::Short);
        assert_eq!(trades[1].volume, trades[0].volume);

        let spread = &engine.engine.unit("A+B").unwrap().spread;
        assert_eq!(spread.long_pos, dec!(1));
        assert_eq!(spread.net_pos, dec!(1));

        let daily = engine.calculate_result();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].trade_count, 2);
        assert!(daily[0].turnover > 0.0);
    }

    #[tokio::test]
    async fn replaying_identical_input_is_deterministic() {
        let mut first = replay_engine(replay_history());
        first.run().await.unwrap();
        let first_trades = first.trades().to_vec();
        let first_daily = first.calculate_result();

        let mut second = replay_engine(replay_history());
        second.run().await.unwrap();
        let second_trades = second.trades().to_vec();
        let second_daily = second.calculate_result();

        assert_eq!(first_trades, second_trades);
        assert_eq!(first_daily, second_daily);
    }
}
