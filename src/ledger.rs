// ===============================
// src/ledger.rs (per-bot cash, inventory & PnL)
// ===============================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{BotView, PriceSnapshot, Side};

/// Sizes smaller than this are treated as flat.
pub const QTY_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position { pub size: f64, pub avg_cost: f64 }

/// Result of applying one fill: realized PnL delta and the resulting size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillOutcome { pub realized: f64, pub position_after: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
}

impl LedgerAccount {
    pub fn new(starting_cash: f64) -> Self {
        Self { cash: starting_cash, positions: BTreeMap::new(), realized_pnl: 0.0 }
    }

    pub fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.size).unwrap_or(0.0)
    }

    /// Applies a fill using average-cost basis. Caller has validated the order.
    pub fn apply_fill(&mut self, symbol: &str, side: Side, size: f64, price: f64) -> FillOutcome {
        let signed_qty = side.sign() * size;
        let prev = self.positions.get(symbol).copied().unwrap_or_default();
        let new_size = prev.size + signed_qty;

        let mut realized = 0.0;
        let new_avg = if prev.size == 0.0 || prev.size.signum() == signed_qty.signum() {
            // arah sama -> update avg cost
            (prev.size.abs() * prev.avg_cost + size * price) / (prev.size.abs() + size)
        } else {
            // arah berlawanan -> realize PnL on the closed part
            let qty_closed = size.min(prev.size.abs());
            realized = qty_closed * (price - prev.avg_cost) * prev.size.signum();
            if size > prev.size.abs() {
                // crossed zero: remainder opens at this price
                price
            } else {
                prev.avg_cost
            }
        };

        self.cash -= signed_qty * price;
        self.realized_pnl += realized;

        if new_size.abs() < QTY_EPS {
            self.positions.remove(symbol);
            FillOutcome { realized, position_after: 0.0 }
        } else {
            self.positions.insert(symbol.to_string(), Position { size: new_size, avg_cost: new_avg });
            FillOutcome { realized, position_after: new_size }
        }
    }

    // Open positions without a price are marked at cost.
    fn mark(&self, symbol: &str, pos: &Position, prices: &PriceSnapshot) -> f64 {
        prices.price(symbol).unwrap_or(pos.avg_cost)
    }

    pub fn unrealized_pnl(&self, prices: &PriceSnapshot) -> f64 {
        self.positions
            .iter()
            .map(|(s, p)| p.size * (self.mark(s, p, prices) - p.avg_cost))
            .sum()
    }

    pub fn equity(&self, prices: &PriceSnapshot) -> f64 {
        self.cash
            + self.positions.iter().map(|(s, p)| p.size * self.mark(s, p, prices)).sum::<f64>()
    }

    /// Σ avg_cost × size over open positions.
    pub fn cost_basis(&self) -> f64 {
        self.positions.values().map(|p| p.size * p.avg_cost).sum()
    }

    pub fn view(&self, prices: &PriceSnapshot) -> BotView {
        BotView {
            cash: self.cash,
            positions: self.positions.iter().map(|(s, p)| (s.clone(), p.size)).collect(),
            equity: self.equity(prices),
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(prices),
        }
    }
}
