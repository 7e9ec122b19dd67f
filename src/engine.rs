use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::ports::gateway::OrderGateway;
use crate::ports::store::{PositionRecord, RecordStore};
use crate::sniper::{resolve_algo_factory, AlgoAction, SniperAlgo};
use crate::spread::{Leg, Spread};
use crate::types::{
    CancelRequest, ContractRegistry, Direction, MarketTick, Offset, OrderId, OrderRequest,
    OrderUpdate, PositionUpdate, TradeFill, round_to_tick,
};

/// Everything that flows through the single engine queue. Feed adapters
/// and the timer task are producers; the engine is the only consumer, so
/// all spread/algorithm state stays single-threaded.
#[derive(Debug)]
pub enum Event {
    Tick(MarketTick),
    Order(OrderUpdate),
    Position(PositionUpdate),
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Live,
    Backtest,
}

/// Explicitly constructed collaborator handles passed into the engine at
/// creation; the top-level process owns their lifecycle.
#[derive(Clone)]
pub struct EngineContext {
    pub gateway: Arc<dyn OrderGateway>,
    pub store: Arc<dyn RecordStore>,
    pub contracts: ContractRegistry,
}

#[derive(Debug)]
pub struct SpreadUnit {
    pub spread: Spread,
    pub algo: SniperAlgo,
}

/// Owns all (spread, algorithm) pairs, routes inbound events to them and
/// executes the actions they emit.
pub struct SniperEngine {
    ctx: EngineContext,
    cfg: EngineConfig,
    mode: EngineMode,
    units: BTreeMap<String, SpreadUnit>,
    /// instrument -> names of every spread containing it
    symbol_index: BTreeMap<String, Vec<String>>,
    orders: BTreeMap<OrderId, OrderUpdate>,
    rollover: bool,
}

impl SniperEngine {
    pub fn new(ctx: EngineContext, cfg: EngineConfig, mode: EngineMode) -> Self {
        Self {
            ctx,
            cfg,
            mode,
            units: BTreeMap::new(),
            symbol_index: BTreeMap::new(),
            orders: BTreeMap::new(),
            rollover: false,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&SpreadUnit> {
        self.units.get(name)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn rollover_active(&self) -> bool {
        self.rollover
    }

    /// All spreads have finished unwinding inside the rollover window.
    pub fn all_unwound(&self) -> bool {
        self.rollover && self.units.is_empty()
    }

    /// Build spreads from configuration, subscribe market data and issue the
    /// initial position queries, then start every algorithm.
    pub async fn start(&mut self) -> Result<()> {
        self.build_spreads().await;
        self.start_algos();
        log::info!("[ENGINE] started with {} spreads", self.units.len());
        Ok(())
    }

    async fn build_spreads(&mut self) {
        for setting in self.cfg.spreads.clone() {
            if self.units.contains_key(&setting.name) {
                log::warn!("[ENGINE] duplicate spread name {}; skipped", setting.name);
                continue;
            }
            if self.ctx.contracts.get(&setting.active_instrument).is_none()
                || self.ctx.contracts.get(&setting.passive_instrument).is_none()
            {
                log::warn!(
                    "[ENGINE] {} references an unresolved contract; skipped",
                    setting.name
                );
                continue;
            }
            let factory = match resolve_algo_factory(&setting.algo_tag) {
                Ok(factory) => factory,
                Err(err) => {
                    log::warn!("[ENGINE] {}: {:#}; skipped", setting.name, err);
                    continue;
                }
            };

            let active = Leg::new(
                &setting.active_instrument,
                setting.active_payup,
                Decimal::ONE,
                Decimal::ONE,
            );
            let passive = Leg::new(
                &setting.passive_instrument,
                setting.passive_payup,
                Decimal::ONE,
                -Decimal::ONE,
            );
            let spread = Spread::new(
                &setting.name,
                active,
                passive,
                setting.buy_percent,
                setting.sell_percent,
                setting.short_percent,
                setting.cover_percent,
                setting.max_order_size,
                setting.max_pos_size,
            );
            let algo = factory(&spread, self.cfg.quote_interval);

            for instrument in [&setting.active_instrument, &setting.passive_instrument] {
                self.symbol_index
                    .entry(instrument.clone())
                    .or_default()
                    .push(setting.name.clone());
                if let Err(err) = self.ctx.gateway.subscribe(instrument).await {
                    log::warn!("[ENGINE] subscribe {} failed: {:#}", instrument, err);
                }
                if let Err(err) = self
                    .ctx
                    .gateway
                    .query_position(&setting.name, instrument)
                    .await
                {
                    log::warn!(
                        "[ENGINE] position query {}/{} failed: {:#}",
                        setting.name,
                        instrument,
                        err
                    );
                }
            }

            log::info!("[ENGINE] spread {} created", setting.name);
            self.units
                .insert(setting.name.clone(), SpreadUnit { spread, algo });
        }
        log::info!("[ENGINE] spread configuration loaded");
    }

    fn start_algos(&mut self) {
        for unit in self.units.values_mut() {
            if self.mode == EngineMode::Backtest {
                // The replay starts from a known flat book; there is no
                // position feed to confirm against.
                unit.spread.mark_position_confirmed();
            }
            unit.algo.start(&unit.spread);
        }
    }

    /// Drain the engine queue until every producer hangs up.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        log::info!("[ENGINE] event loop running");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        log::info!("[ENGINE] event feed closed");
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Tick(tick) => self.handle_tick(&tick).await,
            Event::Order(order) => self.handle_order(order).await,
            Event::Position(position) => self.handle_position(&position).await,
            Event::Timer => self.handle_timer().await,
        }
    }

    /// Route a market-data event to every spread containing the instrument.
    /// Ticks for unknown instruments are dropped; stale routing entries are
    /// expected during teardown.
    pub async fn handle_tick(&mut self, tick: &MarketTick) {
        let names = match self.symbol_index.get(&tick.instrument) {
            Some(names) => names.clone(),
            None => return,
        };
        for name in names {
            let actions = match self.units.get_mut(&name) {
                Some(unit) => {
                    if let Err(err) = unit.spread.update_leg_quote(
                        &tick.instrument,
                        tick.bid_price,
                        tick.ask_price,
                        tick.bid_size,
                        tick.ask_size,
                        tick.timestamp,
                    ) {
                        log::debug!("[ENGINE] dropping tick: {:#}", err);
                        continue;
                    }
                    if !unit.spread.has_quote() {
                        continue;
                    }
                    if self.rollover {
                        unit.algo.close_position(&unit.spread)
                    } else {
                        unit.algo.on_spread_tick(&unit.spread)
                    }
                }
                None => continue,
            };
            self.execute_actions(&name, actions).await;
        }

        // The gate opens off the tick clock so live and replay behave the
        // same way; it takes effect from the next price update.
        if !self.rollover {
            if let Some(dt) = tick.datetime() {
                if self.cfg.rollover.in_unwind_window(&dt) {
                    self.rollover = true;
                    log::info!("[ENGINE] rollover window open; unwinding all spreads");
                }
            }
        }
    }

    /// Route an order event by its carried strategy name. A violation of the
    /// leg-routing invariant stops that spread instead of corrupting state.
    pub async fn handle_order(&mut self, order: OrderUpdate) {
        self.orders.insert(order.order_id.clone(), order.clone());
        let name = order.strategy.clone();
        let result = match self.units.get_mut(&name) {
            Some(unit) => unit.algo.on_order(&unit.spread, &order),
            None => {
                log::debug!(
                    "[ENGINE] dropping order update for unknown strategy {}",
                    name
                );
                return;
            }
        };
        match result {
            Ok(actions) => self.execute_actions(&name, actions).await,
            Err(err) => {
                log::error!("[ENGINE] {}: {:#}; stopping spread", name, err);
                if let Some(unit) = self.units.get_mut(&name) {
                    unit.algo.stop();
                }
            }
        }
    }

    /// Route a position snapshot by strategy name and persist the updated
    /// aggregate in live mode.
    pub async fn handle_position(&mut self, position: &PositionUpdate) {
        let unit = match self.units.get_mut(&position.strategy) {
            Some(unit) => unit,
            None => {
                log::debug!(
                    "[ENGINE] dropping position update for unknown strategy {}",
                    position.strategy
                );
                return;
            }
        };
        if let Err(err) = unit.spread.update_leg_position(
            &position.instrument,
            position.long_qty,
            position.short_qty,
        ) {
            log::debug!("[ENGINE] dropping position update: {:#}", err);
            return;
        }
        if self.mode == EngineMode::Live {
            let record = PositionRecord {
                strategy: position.strategy.clone(),
                long_pos: unit.spread.long_pos,
                short_pos: unit.spread.short_pos,
                net_pos: unit.spread.net_pos,
            };
            if let Err(err) = self.ctx.store.upsert_position(&record) {
                log::warn!(
                    "[ENGINE] failed to persist position for {}: {:#}",
                    position.strategy,
                    err
                );
            }
        }
    }

    /// Tick every algorithm's staleness counters, then run the rollover
    /// schedule against the wall clock.
    pub async fn handle_timer(&mut self) {
        let names: Vec<String> = self.units.keys().cloned().collect();
        for name in names {
            let actions = match self.units.get_mut(&name) {
                Some(unit) => unit.algo.on_timer(),
                None => continue,
            };
            self.execute_actions(&name, actions).await;
        }

        let now = Utc::now();
        if !self.rollover && self.cfg.rollover.in_unwind_window(&now) {
            self.rollover = true;
            log::info!("[ENGINE] rollover window open; unwinding all spreads");
        }
        if self.all_unwound() && self.cfg.rollover.in_restart_window(&now) {
            if let Err(err) = self.restart(true).await {
                log::error!("[ENGINE] rollover restart failed: {:#}", err);
            }
        }
    }

    /// Backtest position feed: apply a fill's signed deltas to the owning
    /// spread's leg.
    pub fn apply_trade(&mut self, fill: &TradeFill) {
        let unit = match self.units.get_mut(&fill.strategy) {
            Some(unit) => unit,
            None => {
                log::debug!("[ENGINE] dropping fill for unknown strategy {}", fill.strategy);
                return;
            }
        };
        if let Err(err) =
            unit.spread
                .apply_trade_delta(&fill.instrument, fill.long_delta, fill.short_delta)
        {
            log::debug!("[ENGINE] dropping fill: {:#}", err);
        }
    }

    /// Full teardown/rebuild after a rollover: reload configuration (when it
    /// came from a file) and recreate every spread.
    pub async fn restart(&mut self, reload_config: bool) -> Result<()> {
        self.rollover = false;
        if reload_config {
            if let Some(path) = self.cfg.source_path.clone() {
                self.cfg = EngineConfig::from_yaml_path(&path)
                    .with_context(|| format!("failed to reload config {}", path.display()))?;
            }
        }
        log::info!("[ENGINE] rollover complete; rebuilding spreads");
        self.build_spreads().await;
        self.start_algos();
        Ok(())
    }

    async fn execute_actions(&mut self, name: &str, actions: Vec<AlgoAction>) {
        for action in actions {
            match action {
                AlgoAction::Submit {
                    instrument,
                    direction,
                    offset,
                    price,
                    volume,
                    payup,
                } => {
                    match self
                        .send_order(name, &instrument, direction, offset, price, volume, payup)
                        .await
                    {
                        Ok(Some(order_id)) => {
                            if let Some(unit) = self.units.get_mut(name) {
                                unit.algo.register_order(&instrument, order_id);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            log::warn!("[ENGINE] {} order submission failed: {:#}", name, err);
                        }
                    }
                }
                AlgoAction::Cancel {
                    instrument,
                    order_id,
                } => {
                    if let Err(err) = self
                        .ctx
                        .gateway
                        .cancel(CancelRequest {
                            instrument,
                            order_id: order_id.clone(),
                        })
                        .await
                    {
                        log::warn!("[ENGINE] cancel of {} failed: {:#}", order_id, err);
                    }
                }
                AlgoAction::Completed => {
                    log::info!("[ENGINE] {} finished unwinding", name);
                    self.remove_spread(name);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_order(
        &self,
        strategy: &str,
        instrument: &str,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: Decimal,
        payup: u32,
    ) -> Result<Option<OrderId>> {
        let contract = match self.ctx.contracts.get(instrument) {
            Some(contract) => contract,
            None => {
                log::warn!("[ENGINE] no contract for {}; order dropped", instrument);
                return Ok(None);
            }
        };
        // Cross the book by the configured number of ticks, then snap back
        // onto the contract's tick grid.
        let payup_offset = contract.price_tick * Decimal::from(payup);
        let aggressive = match direction {
            Direction::Long => price + payup_offset,
            Direction::Short => price - payup_offset,
        };
        let limit_price = round_to_tick(aggressive, contract.price_tick);

        let req = OrderRequest {
            instrument: instrument.to_string(),
            strategy: strategy.to_string(),
            direction,
            offset,
            price: limit_price,
            volume,
        };
        let order_id = self.ctx.gateway.submit(req).await?;
        if order_id.is_empty() {
            return Ok(None);
        }
        log::info!(
            "[ENGINE] {} submitted {} {:?}/{:?} {}@{} as order {}",
            strategy,
            instrument,
            direction,
            offset,
            volume,
            limit_price,
            order_id
        );
        Ok(Some(order_id))
    }

    fn remove_spread(&mut self, name: &str) {
        self.units.remove(name);
        self.symbol_index.retain(|_, names| {
            names.retain(|existing| existing != name);
            !names.is_empty()
        });
    }
}

/// Push a timer event onto the engine queue on a fixed period, giving all
/// timeout logic the same ordering guarantees as market data.
pub fn spawn_timer(
    sender: mpsc::UnboundedSender<Event>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if sender.send(Event::Timer).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RolloverConfig, SpreadSetting};
    use crate::ports::store::MemoryRecordStore;
    use crate::types::{Contract, OrderStatus};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        submissions: Mutex<Vec<OrderRequest>>,
        cancels: Mutex<Vec<CancelRequest>>,
        subscriptions: Mutex<Vec<String>>,
        position_queries: Mutex<Vec<(String, String)>>,
        next_id: AtomicUsize,
    }

    #[async_trait]
    impl OrderGateway for RecordingGateway {
        async fn submit(&self, req: OrderRequest) -> Result<OrderId> {
            self.submissions.lock().unwrap().push(req);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(id.to_string())
        }

        async fn cancel(&self, req: CancelRequest) -> Result<()> {
            self.cancels.lock().unwrap().push(req);
            Ok(())
        }

        async fn subscribe(&self, instrument: &str) -> Result<()> {
            self.subscriptions.lock().unwrap().push(instrument.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _instrument: &str) -> Result<()> {
            Ok(())
        }

        async fn query_position(&self, strategy: &str, instrument: &str) -> Result<()> {
            self.position_queries
                .lock()
                .unwrap()
                .push((strategy.to_string(), instrument.to_string()));
            Ok(())
        }
    }

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

    fn setting(name: &str) -> SpreadSetting {
        SpreadSetting {
            name: name.to_string(),
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
        }
    }

    fn config(settings: Vec<SpreadSetting>) -> EngineConfig {
        EngineConfig {
            gateway: "sim".to_string(),
            contracts_file: None,
            store_file: None,
            timer_secs: 1,
            quote_interval: 16,
            rollover: RolloverConfig::default(),
            spreads: settings,
            backtest: None,
            source_path: None,
        }
    }

    fn engine(
        settings: Vec<SpreadSetting>,
        mode: EngineMode,
    ) -> (SniperEngine, Arc<RecordingGateway>) {
        let gateway = Arc::new(RecordingGateway::default());
        let ctx = EngineContext {
            gateway: gateway.clone(),
            store: Arc::new(MemoryRecordStore::new()),
            contracts: registry(),
        };
        (SniperEngine::new(ctx, config(settings), mode), gateway)
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

    async fn feed_quotes(engine: &mut SniperEngine, ts: i64) {
        // crossed spread book: ask_percent <= buy threshold
        engine.handle_tick(&tick("A", dec!(100.00), dec!(100.02), ts)).await;
        engine.handle_tick(&tick("B", dec!(99.98), dec!(100.02), ts + 1)).await;
    }

    #[tokio::test]
    async fn start_subscribes_and_queries_positions() {
        let (mut engine, gateway) = engine(vec![setting("A+B")], EngineMode::Live);
        engine.start().await.unwrap();
        assert_eq!(engine.unit_count(), 1);
        assert_eq!(*gateway.subscriptions.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(
            *gateway.position_queries.lock().unwrap(),
            vec![
                ("A+B".to_string(), "A".to_string()),
                ("A+B".to_string(), "B".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_spread_names_are_rejected() {
        let (mut engine, _gateway) = engine(
            vec![setting("A+B"), setting("A+B")],
            EngineMode::Live,
        );
        engine.start().await.unwrap();
        assert_eq!(engine.unit_count(), 1);
    }

    #[tokio::test]
    async fn tick_routing_submits_active_leg_order_with_payup() {
        let (mut engine, gateway) = engine(vec![setting("A+B")], EngineMode::Backtest);
        engine.start().await.unwrap();
        feed_quotes(&mut engine, 1_000).await;

        let submissions = gateway.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let req = &submissions[0];
        assert_eq!(req.instrument, "A");
        assert_eq!(req.strategy, "A+B");
        assert_eq!(req.direction, Direction::Long);
        assert_eq!(req.offset, Offset::Open);
        // active ask 100.02 plus one payup tick of 0.01
        assert_eq!(req.price, dec!(100.03));
        assert_eq!(req.volume, dec!(1));
    }

    #[tokio::test]
    async fn no_second_order_while_one_is_outstanding() {
        let (mut engine, gateway) = engine(vec![setting("A+B")], EngineMode::Backtest);
        engine.start().await.unwrap();
        feed_quotes(&mut engine, 1_000).await;
        feed_quotes(&mut engine, 2_000).await;
        assert_eq!(gateway.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_strategy_events_are_dropped() {
        let (mut engine, _gateway) = engine(vec![setting("A+B")], EngineMode::Live);
        engine.start().await.unwrap();
        engine
            .handle_order(OrderUpdate {
                order_id: "1".to_string(),
                instrument: "A".to_string(),
                strategy: "X+Y".to_string(),
                direction: Direction::Long,
                offset: Offset::Open,
                price: dec!(1),
                volume: dec!(1),
                traded: Decimal::ZERO,
                status: OrderStatus::NotTraded,
            })
            .await;
        engine
            .handle_position(&PositionUpdate {
                strategy: "X+Y".to_string(),
                instrument: "A".to_string(),
                long_qty: dec!(1),
                short_qty: Decimal::ZERO,
            })
            .await;
        engine
            .handle_tick(&tick("Z", dec!(1), dec!(2), 1))
            .await;
        assert_eq!(engine.unit_count(), 1);
    }

    #[tokio::test]
    async fn foreign_instrument_order_stops_the_spread() {
        let (mut engine, _gateway) = engine(vec![setting("A+B")], EngineMode::Backtest);
        engine.start().await.unwrap();
        engine
            .handle_order(OrderUpdate {
                order_id: "1".to_string(),
                instrument: "C".to_string(),
                strategy: "A+B".to_string(),
                direction: Direction::Long,
                offset: Offset::Open,
                price: dec!(1),
                volume: dec!(1),
                traded: Decimal::ZERO,
                status: OrderStatus::NotTraded,
            })
            .await;
        assert!(!engine.unit("A+B").unwrap().algo.is_active());
    }

    #[tokio::test]
    async fn live_position_updates_are_persisted() {
        let gateway = Arc::new(RecordingGateway::default());
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = EngineContext {
            gateway,
            store: store.clone(),
            contracts: registry(),
        };
        let mut engine = SniperEngine::new(ctx, config(vec![setting("A+B")]), EngineMode::Live);
        engine.start().await.unwrap();

        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "A".to_string(),
                long_qty: dec!(2),
                short_qty: Decimal::ZERO,
            })
            .await;
        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "B".to_string(),
                long_qty: Decimal::ZERO,
                short_qty: dec!(2),
            })
            .await;

        let record = store.position("A+B").unwrap().unwrap();
        assert_eq!(record.long_pos, dec!(2));
        assert_eq!(record.net_pos, dec!(2));
    }

    #[tokio::test]
    async fn rollover_suppresses_entries_and_unwinds_to_completion() {
        let (mut engine, gateway) = engine(vec![setting("A+B")], EngineMode::Backtest);
        engine.start().await.unwrap();

        // carry a long spread position of 2 into the window
        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "A".to_string(),
                long_qty: dec!(2),
                short_qty: Decimal::ZERO,
            })
            .await;
        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "B".to_string(),
                long_qty: Decimal::ZERO,
                short_qty: dec!(2),
            })
            .await;

        // Friday 15:31 UTC opens the unwind window
        let in_window = Utc
            .with_ymd_and_hms(2019, 3, 8, 15, 31, 0)
            .unwrap()
            .timestamp_millis();
        engine
            .handle_tick(&tick("A", dec!(100.00), dec!(100.02), in_window))
            .await;
        assert!(engine.rollover_active());

        // quotes that would otherwise trigger a buy entry now emit a close
        engine
            .handle_tick(&tick("B", dec!(99.98), dec!(100.02), in_window + 1))
            .await;
        {
            let submissions = gateway.submissions.lock().unwrap();
            assert_eq!(submissions.len(), 1);
            assert_eq!(submissions[0].direction, Direction::Short);
            assert_eq!(submissions[0].offset, Offset::Close);
        }

        // the close order fills and the position flattens
        engine
            .handle_order(OrderUpdate {
                order_id: "1".to_string(),
                instrument: "A".to_string(),
                strategy: "A+B".to_string(),
                direction: Direction::Short,
                offset: Offset::Close,
                price: dec!(100.00),
                volume: dec!(2),
                traded: dec!(2),
                status: OrderStatus::AllTraded,
            })
            .await;
        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "A".to_string(),
                long_qty: Decimal::ZERO,
                short_qty: Decimal::ZERO,
            })
            .await;
        engine
            .handle_position(&PositionUpdate {
                strategy: "A+B".to_string(),
                instrument: "B".to_string(),
                long_qty: Decimal::ZERO,
                short_qty: Decimal::ZERO,
            })
            .await;

        // hedge order for the active fill is outstanding on the passive leg;
        // finish it so the completion check can pass
        engine
            .handle_order(OrderUpdate {
                order_id: "2".to_string(),
                instrument: "B".to_string(),
                strategy: "A+B".to_string(),
                direction: Direction::Long,
                offset: Offset::Close,
                price: dec!(100.02),
                volume: dec!(2),
                traded: dec!(2),
                status: OrderStatus::AllTraded,
            })
            .await;

        engine
            .handle_tick(&tick("A", dec!(100.00), dec!(100.02), in_window + 2))
            .await;
        assert!(engine.all_unwound());
        assert_eq!(engine.unit_count(), 0);
    }
}
