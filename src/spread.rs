use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::round_to_tick;

/// Synthetic prices are snapped to this grid before the percent fields are
/// derived, so threshold comparisons stay stable against floating noise.
pub const SPREAD_PRICE_TICK: Decimal = dec!(0.000001);

/// Per-instrument market and position snapshot. A leg never exists outside
/// its owning [`Spread`], and only the spread's `update_*` operations mutate
/// it; the algorithm reads it through `&Spread`.
#[derive(Debug, Clone)]
pub struct Leg {
    pub instrument: String,
    pub ratio: Decimal,
    pub multiplier: Decimal,
    pub payup: u32,

    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,

    pub long_pos: Decimal,
    pub short_pos: Decimal,
    pub net_pos: Decimal,
}

impl Leg {
    pub fn new(instrument: &str, payup: u32, ratio: Decimal, multiplier: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            ratio,
            multiplier,
            payup,
            bid_price: Decimal::ZERO,
            ask_price: Decimal::ZERO,
            bid_size: Decimal::ZERO,
            ask_size: Decimal::ZERO,
            long_pos: Decimal::ZERO,
            short_pos: Decimal::ZERO,
            net_pos: Decimal::ZERO,
        }
    }
}

/// A named two-leg synthetic instrument. The name encodes
/// `<active-instrument>+<passive-instrument>` and doubles as the strategy
/// name carried on orders and position callbacks.
#[derive(Debug, Clone)]
pub struct Spread {
    pub name: String,
    pub active: Leg,
    pub passive: Leg,

    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub mid_price: Decimal,
    pub bid_percent: Decimal,
    pub ask_percent: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub last_update_ms: i64,

    pub long_pos: Decimal,
    pub short_pos: Decimal,
    pub net_pos: Decimal,

    pub buy_percent: Decimal,
    pub sell_percent: Decimal,
    pub short_percent: Decimal,
    pub cover_percent: Decimal,
    pub max_order_size: Decimal,
    pub max_pos_size: Decimal,

    position_updates: u32,
    confirmed: bool,
}

impl Spread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        active: Leg,
        passive: Leg,
        buy_percent: Decimal,
        sell_percent: Decimal,
        short_percent: Decimal,
        cover_percent: Decimal,
        max_order_size: Decimal,
        max_pos_size: Decimal,
    ) -> Self {
        Self {
            name: name.to_string(),
            active,
            passive,
            bid_price: Decimal::ZERO,
            ask_price: Decimal::ZERO,
            mid_price: Decimal::ZERO,
            bid_percent: Decimal::ZERO,
            ask_percent: Decimal::ZERO,
            bid_size: Decimal::ZERO,
            ask_size: Decimal::ZERO,
            last_update_ms: 0,
            long_pos: Decimal::ZERO,
            short_pos: Decimal::ZERO,
            net_pos: Decimal::ZERO,
            buy_percent,
            sell_percent,
            short_percent,
            cover_percent,
            max_order_size,
            max_pos_size,
            position_updates: 0,
            confirmed: false,
        }
    }

    /// Human-readable symbol with signed leg multipliers, e.g.
    /// `+1*BTC_CW-1*BTC_CQ`.
    pub fn display_symbol(&self) -> String {
        let mut parts = String::new();
        for leg in [&self.active, &self.passive] {
            if leg.multiplier >= Decimal::ZERO {
                parts.push('+');
            }
            parts.push_str(&format!("{}*{}", leg.multiplier, leg.instrument));
        }
        parts
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.active.instrument == instrument || self.passive.instrument == instrument
    }

    pub fn leg(&self, instrument: &str) -> Option<&Leg> {
        if self.active.instrument == instrument {
            Some(&self.active)
        } else if self.passive.instrument == instrument {
            Some(&self.passive)
        } else {
            None
        }
    }

    fn leg_mut(&mut self, instrument: &str) -> Option<&mut Leg> {
        if self.active.instrument == instrument {
            Some(&mut self.active)
        } else if self.passive.instrument == instrument {
            Some(&mut self.passive)
        } else {
            None
        }
    }

    /// True once both legs produced a quote and the spread price is usable.
    pub fn has_quote(&self) -> bool {
        !(self.bid_price == Decimal::ZERO && self.ask_price == Decimal::ZERO)
    }

    /// At least two position snapshots have been seen, so the starting
    /// position is confirmed and the spread may start pricing.
    pub fn position_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Bypass the confirmation gate. The backtest engine starts from a known
    /// flat book and has no position feed to wait for.
    pub fn mark_position_confirmed(&mut self) {
        self.confirmed = true;
    }

    /// Apply a best bid/ask update to the named leg and re-derive the
    /// synthetic price. Returns an error for instruments outside the spread.
    pub fn update_leg_quote(
        &mut self,
        instrument: &str,
        bid_price: Decimal,
        ask_price: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
        timestamp: i64,
    ) -> Result<()> {
        let name = self.name.clone();
        let leg = self
            .leg_mut(instrument)
            .ok_or_else(|| anyhow!("{}: no leg for instrument {}", name, instrument))?;
        leg.bid_price = bid_price;
        leg.ask_price = ask_price;
        leg.bid_size = bid_size;
        leg.ask_size = ask_size;
        self.last_update_ms = timestamp;
        self.recompute_price();
        Ok(())
    }

    /// Apply an absolute position snapshot to the named leg and re-derive
    /// the spread position.
    pub fn update_leg_position(
        &mut self,
        instrument: &str,
        long_qty: Decimal,
        short_qty: Decimal,
    ) -> Result<()> {
        let name = self.name.clone();
        let leg = self
            .leg_mut(instrument)
            .ok_or_else(|| anyhow!("{}: no leg for instrument {}", name, instrument))?;
        leg.long_pos = long_qty;
        leg.short_pos = short_qty;
        leg.net_pos = long_qty - short_qty;
        self.recompute_position();
        Ok(())
    }

    /// Apply a signed fill delta to the named leg (backtest position feed).
    pub fn apply_trade_delta(
        &mut self,
        instrument: &str,
        long_delta: Decimal,
        short_delta: Decimal,
    ) -> Result<()> {
        let name = self.name.clone();
        let leg = self
            .leg_mut(instrument)
            .ok_or_else(|| anyhow!("{}: no leg for instrument {}", name, instrument))?;
        leg.long_pos += long_delta;
        leg.short_pos += short_delta;
        leg.net_pos = leg.long_pos - leg.short_pos;
        self.recompute_position();
        Ok(())
    }

    /// Re-derive the synthetic price from current leg state.
    ///
    /// The price fields are never partially overwritten: until both legs
    /// carry a nonzero bid and the starting position is confirmed they stay
    /// at their previous (initially zero) value.
    pub fn recompute_price(&mut self) {
        if self.active.bid_price == Decimal::ZERO || self.passive.bid_price == Decimal::ZERO {
            return;
        }
        if !self.confirmed {
            return;
        }

        let bid = self.active.bid_price - self.passive.ask_price;
        let ask = self.active.ask_price - self.passive.bid_price;
        let mid = (self.active.bid_price
            + self.active.ask_price
            + self.passive.bid_price
            + self.passive.ask_price)
            / dec!(4);

        self.bid_price = round_to_tick(bid, SPREAD_PRICE_TICK);
        self.ask_price = round_to_tick(ask, SPREAD_PRICE_TICK);
        self.mid_price = round_to_tick(mid, SPREAD_PRICE_TICK);

        // Percent fields are undefined while the mid is zero; leave them
        // alone so they are never consulted off a division by zero.
        if self.mid_price != Decimal::ZERO {
            self.bid_percent = self.bid_price / self.mid_price;
            self.ask_percent = self.ask_price / self.mid_price;
        }

        self.bid_size = self.active.bid_size.min(self.passive.ask_size);
        self.ask_size = self.active.ask_size.min(self.passive.bid_size);
    }

    /// Re-derive the spread position from current leg state. Only the
    /// matched portion of the two legs counts as spread position; any
    /// one-sided excess is ignored.
    pub fn recompute_position(&mut self) {
        self.long_pos = self.active.long_pos.min(self.passive.short_pos);
        self.short_pos = self.active.short_pos.min(self.passive.long_pos);
        self.net_pos = self.long_pos - self.short_pos;

        self.position_updates += 1;
        if self.position_updates >= 2 {
            self.confirmed = true;
        }
    }
}
