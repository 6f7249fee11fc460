// ===============================
// src/strategy.rs
// ===============================
//
// Bot bawaan (dipilih lewat BOTS=..., lihat registry.rs):
// 1) trend_follower  -> beli saat harga > MA, jual semua saat harga < MA
// 2) random_trader   -> acak, 10% peluang per tick
// 3) mean_reversion  -> jual/beli saat harga menyimpang dari rata-rata N-tick
//
// Semua state (window harga, rng) disimpan di struct bot masing-masing,
// jadi dua instance tidak pernah berbagi state.
//
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Side, TickPayload};
use crate::runtime::{Bot, BotContext, BotResult};

/// Fixed-size rolling window with a running sum.
#[derive(Debug, Clone)]
pub struct Window {
    values: VecDeque<f64>,
    sum: f64,
    cap: usize,
}

impl Window {
    pub fn new(cap: usize) -> Self {
        Self { values: VecDeque::with_capacity(cap), sum: 0.0, cap }
    }
    pub fn push(&mut self, v: f64) {
        if self.values.len() == self.cap {
            if let Some(x) = self.values.pop_front() { self.sum -= x; }
        }
        self.values.push_back(v);
        self.sum += v;
    }
    pub fn is_full(&self) -> bool { self.values.len() >= self.cap }
    pub fn mean(&self) -> Option<f64> {
        if self.is_full() { Some(self.sum / self.cap as f64) } else { None }
    }
}

// -----------------------------------------------------------------------------
// 1) TREND FOLLOWER
//    Buy when price is above the moving average and flat, sell the whole
//    position when price drops below it.
// -----------------------------------------------------------------------------
pub struct TrendFollower {
    name: String,
    symbols: Vec<String>,
    window: Window,
    size: f64,
}

impl TrendFollower {
    pub fn new(name: String, symbol: String, window: usize, size: f64) -> Self {
        Self { name, symbols: vec![symbol], window: Window::new(window), size }
    }
}

impl Bot for TrendFollower {
    fn name(&self) -> &str { &self.name }
    fn symbols(&self) -> &[String] { &self.symbols }

    fn init(&mut self, ctx: &mut BotContext<'_>) -> BotResult<()> {
        ctx.log(&format!("trend follower ready, {}-tick moving average", self.window.cap));
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
        let symbol = &self.symbols[0];
        let Some(price) = ctx.price(symbol) else { return Ok(()) };

        self.window.push(price);
        let Some(ma) = self.window.mean() else { return Ok(()) };

        let position = ctx.position(symbol);
        if price > ma && position == 0.0 && ctx.cash() >= price * self.size {
            ctx.submit_order(symbol, Side::Buy, self.size);
            ctx.log(&format!("TREND BUY {} {symbol} @ {price:.2} (MA {ma:.2})", self.size));
        } else if price < ma && position > 0.0 {
            ctx.submit_order(symbol, Side::Sell, position);
            ctx.log(&format!("TREND SELL {position} {symbol} @ {price:.2} (MA {ma:.2})"));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// 2) RANDOM TRADER
//    Trades occasionally: buy a small clip or sell half the position.
// -----------------------------------------------------------------------------
pub struct RandomTrader {
    name: String,
    symbols: Vec<String>,
    rng: StdRng,
    trade_prob: f64,
    size: f64,
}

impl RandomTrader {
    pub fn new(name: String, symbol: String, seed: Option<u64>, trade_prob: f64, size: f64) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { name, symbols: vec![symbol], rng, trade_prob, size }
    }
}

impl Bot for RandomTrader {
    fn name(&self) -> &str { &self.name }
    fn symbols(&self) -> &[String] { &self.symbols }

    fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
        if self.rng.gen::<f64>() >= self.trade_prob {
            return Ok(());
        }
        let symbol = &self.symbols[0];
        let Some(price) = ctx.price(symbol) else { return Ok(()) };
        let position = ctx.position(symbol);

        match self.rng.gen_range(0..3) {
            0 if ctx.cash() >= price * self.size => {
                ctx.submit_order(symbol, Side::Buy, self.size);
                ctx.log(&format!("random BUY {} {symbol} @ {price:.2}", self.size));
            }
            1 if position > 0.0 => {
                let size = position * 0.5;
                ctx.submit_order(symbol, Side::Sell, size);
                ctx.log(&format!("random SELL {size} {symbol} @ {price:.2}"));
            }
            _ => {}
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// 3) MEAN-REVERSION
//    Ide: harga < fair*(1-edge) -> Buy, harga > fair*(1+edge) -> Sell.
//    Trades both directions, so under allow_short it can carry a short.
//    Exposure is bounded by `max_abs_position`.
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    name: String,
    symbols: Vec<String>,
    window: Window,
    edge: f64,
    size: f64,
    max_abs_position: f64,
}

impl MeanReversion {
    pub fn new(name: String, symbol: String, window: usize, edge: f64, size: f64) -> Self {
        Self {
            name,
            symbols: vec![symbol],
            window: Window::new(window),
            edge,
            size,
            max_abs_position: size * 3.0,
        }
    }
}

impl Bot for MeanReversion {
    fn name(&self) -> &str { &self.name }
    fn symbols(&self) -> &[String] { &self.symbols }

    fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
        let symbol = &self.symbols[0];
        let Some(price) = ctx.price(symbol) else { return Ok(()) };

        // fair dihitung sebelum harga sekarang masuk window
        let fair = self.window.mean();
        self.window.push(price);
        let Some(fair) = fair else { return Ok(()) };

        let position = ctx.position(symbol);
        if price < fair * (1.0 - self.edge) && position + self.size <= self.max_abs_position {
            if ctx.cash() >= price * self.size {
                ctx.submit_order(symbol, Side::Buy, self.size);
            }
        } else if price > fair * (1.0 + self.edge) && position - self.size >= -self.max_abs_position {
            ctx.submit_order(symbol, Side::Sell, self.size);
        }
        Ok(())
    }
}
