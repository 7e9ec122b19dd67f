use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::spread::Spread;
use crate::types::{Direction, Offset, OrderId, OrderStatus, OrderUpdate, SniperSignal};

/// Insertion-ordered, unique-by-identifier set of outstanding order ids.
#[derive(Debug, Default, Clone)]
pub struct OrderSet {
    ids: Vec<OrderId>,
}

impl OrderSet {
    pub fn insert(&mut self, id: OrderId) -> bool {
        if self.ids.iter().any(|existing| *existing == id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| existing != id);
        before != self.ids.len()
    }

    pub fn oldest(&self) -> Option<&OrderId> {
        self.ids.first()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderId> {
        self.ids.iter()
    }
}

/// What the algorithm wants the engine to do in response to an event. The
/// engine executes submissions through the gateway and registers the
/// resulting order id back via [`SniperAlgo::register_order`].
#[derive(Debug, Clone, PartialEq)]
pub enum AlgoAction {
    Submit {
        instrument: String,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: Decimal,
        payup: u32,
    },
    Cancel {
        instrument: String,
        order_id: OrderId,
    },
    /// Net position reached zero during unwind; the engine should remove
    /// this spread.
    Completed,
}

/// Market-order-style execution state machine for one spread: quotes the
/// active leg on threshold crossings and hedges every active fill on the
/// passive leg.
#[derive(Debug)]
pub struct SniperAlgo {
    spread_name: String,
    active_instrument: String,
    passive_instrument: String,
    active: bool,

    quote_interval: u32,
    active_quote_count: u32,
    passive_quote_count: u32,

    active_orders: OrderSet,
    passive_orders: OrderSet,
    /// order id -> last seen filled quantity, used to derive fill deltas.
    traded_cache: HashMap<OrderId, Decimal>,
}

impl SniperAlgo {
    pub fn new(spread: &Spread, quote_interval: u32) -> Self {
        Self {
            spread_name: spread.name.clone(),
            active_instrument: spread.active.instrument.clone(),
            passive_instrument: spread.passive.instrument.clone(),
            active: false,
            quote_interval,
            active_quote_count: 0,
            passive_quote_count: 0,
            active_orders: OrderSet::default(),
            passive_orders: OrderSet::default(),
            traded_cache: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn spread_name(&self) -> &str {
        &self.spread_name
    }

    pub fn has_outstanding_orders(&self) -> bool {
        !self.active_orders.is_empty() || !self.passive_orders.is_empty()
    }

    /// Start the algorithm. Fails fast on inverted thresholds and leaves the
    /// instance stopped.
    pub fn start(&mut self, spread: &Spread) -> bool {
        if self.active {
            return true;
        }
        if !self.check_thresholds(spread) {
            return false;
        }
        self.active_quote_count = 0;
        self.passive_quote_count = 0;
        self.active = true;
        log::info!("[SNIPER] {} started", self.spread_name);
        true
    }

    pub fn stop(&mut self) {
        self.active = false;
        log::info!("[SNIPER] {} stopped", self.spread_name);
    }

    fn check_thresholds(&self, spread: &Spread) -> bool {
        if spread.buy_percent >= spread.cover_percent {
            log::warn!(
                "[SNIPER] {} refused to start: buy_percent must be below cover_percent",
                self.spread_name
            );
            return false;
        }
        if spread.short_percent <= spread.sell_percent {
            log::warn!(
                "[SNIPER] {} refused to start: short_percent must be above sell_percent",
                self.spread_name
            );
            return false;
        }
        true
    }

    /// Normal-mode reaction to a spread price update.
    pub fn on_spread_tick(&mut self, spread: &Spread) -> Vec<AlgoAction> {
        if !self.active || self.has_outstanding_orders() {
            return Vec::new();
        }

        let cap = spread.max_pos_size;
        let over_cap = cap + spread.max_order_size;
        // Once the active leg itself carries more than cap + order size,
        // only exit-direction orders are considered.
        if spread.active.long_pos > over_cap || spread.active.short_pos > over_cap {
            if spread.net_pos > Decimal::ZERO && spread.bid_percent >= spread.sell_percent {
                return self.quote_active_leg(spread, SniperSignal::Sell);
            }
            if spread.net_pos < Decimal::ZERO && spread.ask_percent <= spread.cover_percent {
                return self.quote_active_leg(spread, SniperSignal::Cover);
            }
            return Vec::new();
        }

        if spread.net_pos >= Decimal::ZERO
            && spread.net_pos < cap
            && spread.ask_percent <= spread.buy_percent
        {
            self.quote_active_leg(spread, SniperSignal::Buy)
        } else if spread.net_pos > Decimal::ZERO && spread.bid_percent >= spread.sell_percent {
            self.quote_active_leg(spread, SniperSignal::Sell)
        } else if spread.net_pos <= Decimal::ZERO
            && spread.net_pos > -cap
            && spread.bid_percent >= spread.short_percent
        {
            self.quote_active_leg(spread, SniperSignal::Short)
        } else if spread.net_pos < Decimal::ZERO && spread.ask_percent <= spread.cover_percent {
            self.quote_active_leg(spread, SniperSignal::Cover)
        } else {
            Vec::new()
        }
    }

    /// Unwind-mode reaction to a price update: close whatever net position
    /// remains, then report completion once flat with no resting orders.
    pub fn close_position(&mut self, spread: &Spread) -> Vec<AlgoAction> {
        if !self.active || self.has_outstanding_orders() {
            return Vec::new();
        }

        if spread.net_pos > Decimal::ZERO {
            log::info!("[SNIPER] {} unwinding long position", self.spread_name);
            self.quote_active_leg(spread, SniperSignal::Sell)
        } else if spread.net_pos < Decimal::ZERO {
            log::info!("[SNIPER] {} unwinding short position", self.spread_name);
            self.quote_active_leg(spread, SniperSignal::Cover)
        } else {
            log::info!("[SNIPER] {} unwind complete", self.spread_name);
            vec![AlgoAction::Completed]
        }
    }

    fn quote_active_leg(&mut self, spread: &Spread, signal: SniperSignal) -> Vec<AlgoAction> {
        let (direction, offset) = signal.direction_offset();
        let (price, mut volume) = match signal {
            SniperSignal::Buy | SniperSignal::Cover => (
                spread.active.ask_price,
                spread
                    .ask_size
                    .min(spread.max_pos_size)
                    .min(spread.max_order_size),
            ),
            SniperSignal::Sell | SniperSignal::Short => (
                spread.active.bid_price,
                spread
                    .bid_size
                    .min(spread.max_pos_size)
                    .min(spread.max_order_size),
            ),
        };
        // Closing orders cannot exceed the closeable position on the leg.
        match signal {
            SniperSignal::Sell => volume = volume.min(spread.active.long_pos),
            SniperSignal::Cover => volume = volume.min(spread.active.short_pos),
            _ => {}
        }
        if volume <= Decimal::ZERO {
            return Vec::new();
        }
        log::info!(
            "[SNIPER] {} active leg {} {:?}/{:?} volume {}",
            self.spread_name,
            self.active_instrument,
            direction,
            offset,
            volume
        );
        vec![AlgoAction::Submit {
            instrument: self.active_instrument.clone(),
            direction,
            offset,
            price,
            volume,
            payup: spread.active.payup,
        }]
    }

    fn hedge_passive_leg(
        &self,
        spread: &Spread,
        order: &OrderUpdate,
        volume: Decimal,
    ) -> Vec<AlgoAction> {
        if volume <= Decimal::ZERO {
            return Vec::new();
        }
        let direction = order.direction.opposite();
        let price = match direction {
            Direction::Long => spread.passive.ask_price,
            Direction::Short => spread.passive.bid_price,
        };
        log::info!(
            "[SNIPER] {} hedging passive leg {} {:?}/{:?} volume {}",
            self.spread_name,
            self.passive_instrument,
            direction,
            order.offset,
            volume
        );
        vec![AlgoAction::Submit {
            instrument: self.passive_instrument.clone(),
            direction,
            offset: order.offset,
            price,
            volume,
            payup: spread.passive.payup,
        }]
    }

    /// Reissue the unfilled residual of a cancelled/rejected passive order,
    /// same direction and offset, at a freshly computed price.
    fn rehedge_passive_leg(&self, spread: &Spread, order: &OrderUpdate) -> Vec<AlgoAction> {
        let volume = order.residual();
        if volume <= Decimal::ZERO {
            return Vec::new();
        }
        let price = match order.direction {
            Direction::Long => spread.passive.ask_price,
            Direction::Short => spread.passive.bid_price,
        };
        log::info!(
            "[SNIPER] {} rehedging passive leg {} {:?}/{:?} residual {}",
            self.spread_name,
            self.passive_instrument,
            order.direction,
            order.offset,
            volume
        );
        vec![AlgoAction::Submit {
            instrument: self.passive_instrument.clone(),
            direction: order.direction,
            offset: order.offset,
            price,
            volume,
            payup: spread.passive.payup,
        }]
    }

    /// Route an order-status update. An update for an instrument outside the
    /// spread's legs is a routing invariant violation and stops this spread.
    pub fn on_order(&mut self, spread: &Spread, order: &OrderUpdate) -> Result<Vec<AlgoAction>> {
        if !self.active {
            return Ok(Vec::new());
        }
        if order.instrument == self.active_instrument {
            Ok(self.update_active_order(spread, order))
        } else if order.instrument == self.passive_instrument {
            Ok(self.update_passive_order(spread, order))
        } else {
            Err(anyhow!(
                "{}: order {} references instrument {} outside the spread legs",
                self.spread_name,
                order.order_id,
                order.instrument
            ))
        }
    }

    fn update_active_order(&mut self, spread: &Spread, order: &OrderUpdate) -> Vec<AlgoAction> {
        let mut actions = Vec::new();
        if let Some(delta) = self.record_fill(order) {
            log::info!(
                "[SNIPER] {} active leg {} filled {:?}/{:?} volume {}",
                self.spread_name,
                order.instrument,
                order.direction,
                order.offset,
                delta
            );
            actions.extend(self.hedge_passive_leg(spread, order, delta));
        }
        if order.status.is_finished() {
            self.active_orders.remove(&order.order_id);
            self.traded_cache.remove(&order.order_id);
            log::info!(
                "[SNIPER] {} active leg order {} finished with {:?}",
                self.spread_name,
                order.order_id,
                order.status
            );
        }
        actions
    }

    fn update_passive_order(&mut self, spread: &Spread, order: &OrderUpdate) -> Vec<AlgoAction> {
        let mut actions = Vec::new();
        if let Some(delta) = self.record_fill(order) {
            log::info!(
                "[SNIPER] {} passive leg {} filled {:?}/{:?} volume {}",
                self.spread_name,
                order.instrument,
                order.direction,
                order.offset,
                delta
            );
        }
        if order.status.is_finished() {
            self.passive_orders.remove(&order.order_id);
            self.traded_cache.remove(&order.order_id);
            log::info!(
                "[SNIPER] {} passive leg order {} finished with {:?}",
                self.spread_name,
                order.order_id,
                order.status
            );
            if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                actions.extend(self.rehedge_passive_leg(spread, order));
            }
        }
        actions
    }

    /// Returns the incremental filled quantity if this update increased the
    /// cached fill; the cache only ever moves up.
    fn record_fill(&mut self, order: &OrderUpdate) -> Option<Decimal> {
        let last = self
            .traded_cache
            .get(&order.order_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if order.traded > last {
            self.traded_cache.insert(order.order_id.clone(), order.traded);
            Some(order.traded - last)
        } else {
            None
        }
    }

    /// One timer tick: after `quote_interval` ticks with a resting order on
    /// a leg, pull the single oldest order on that leg and reset the count.
    pub fn on_timer(&mut self) -> Vec<AlgoAction> {
        if !self.active {
            return Vec::new();
        }
        self.active_quote_count += 1;
        self.passive_quote_count += 1;

        let mut actions = Vec::new();
        if self.active_quote_count > self.quote_interval {
            if let Some(order_id) = self.active_orders.oldest() {
                log::info!(
                    "[SNIPER] {} cancelling stale active leg order {}",
                    self.spread_name,
                    order_id
                );
                actions.push(AlgoAction::Cancel {
                    instrument: self.active_instrument.clone(),
                    order_id: order_id.clone(),
                });
                self.active_quote_count = 0;
            }
        }
        if self.passive_quote_count > self.quote_interval {
            if let Some(order_id) = self.passive_orders.oldest() {
                log::info!(
                    "[SNIPER] {} cancelling stale passive leg order {}",
                    self.spread_name,
                    order_id
                );
                actions.push(AlgoAction::Cancel {
                    instrument: self.passive_instrument.clone(),
                    order_id: order_id.clone(),
                });
                self.passive_quote_count = 0;
            }
        }
        actions
    }

    /// Track a freshly submitted order id on the matching leg and reset
    /// that leg's staleness count.
    pub fn register_order(&mut self, instrument: &str, order_id: OrderId) {
        if instrument == self.active_instrument {
            self.active_orders.insert(order_id);
            self.active_quote_count = 0;
        } else if instrument == self.passive_instrument {
            self.passive_orders.insert(order_id);
            self.passive_quote_count = 0;
        } else {
            log::warn!(
                "[SNIPER] {} ignoring order id {} for foreign instrument {}",
                self.spread_name,
                order_id,
                instrument
            );
        }
    }
}

/// Factory signature for configuration-driven algorithm selection.
pub type AlgoFactory = fn(&Spread, u32) -> SniperAlgo;

/// Registry mapping a configuration tag to an algorithm factory. Unknown
/// tags fail configuration loading instead of failing at first use.
static ALGO_REGISTRY: Lazy<HashMap<&'static str, AlgoFactory>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, AlgoFactory> = HashMap::new();
    registry.insert("sniper", SniperAlgo::new as AlgoFactory);
    registry
});

pub fn resolve_algo_factory(tag: &str) -> Result<AlgoFactory> {
    ALGO_REGISTRY
        .get(tag)
        .copied()
        .ok_or_else(|| anyhow!("unknown algo tag: {}", tag))
}
