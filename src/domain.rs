// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Last observed price for one symbol. `observed_at_ns` is the feed timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote { pub price: f64, pub observed_at_ns: i128 }

/// Point-in-time copy of the hub, shared read-only by every bot in a tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot { quotes: BTreeMap<String, PriceQuote> }

impl PriceSnapshot {
    pub fn from_quotes(quotes: BTreeMap<String, PriceQuote>) -> Self { Self { quotes } }

    pub fn price(&self, symbol: &str) -> Option<f64> { self.quotes.get(symbol).map(|q| q.price) }

    pub fn quote(&self, symbol: &str) -> Option<&PriceQuote> { self.quotes.get(symbol) }

    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.quotes.iter().map(|(s, q)| (s.clone(), q.price)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PriceQuote)> { self.quotes.iter() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order { pub symbol: String, pub side: Side, pub size: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub time: f64,
    pub bot_name: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub cash_after: f64,
    pub position_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub time: f64,
    pub bot_name: String,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Persisted record, one per line in its relation file.
#[derive(Debug, Clone, PartialEq)]
pub enum Record { Trade(Trade), Equity(EquitySnapshot) }

// Payload handed to `Bot::on_tick`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotView {
    pub cash: f64,
    pub positions: BTreeMap<String, f64>,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload { pub time: f64, pub prices: BTreeMap<String, f64>, pub bot: BotView }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotStatus { Loaded, Running, Paused, Stopped }
impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Loaded => "LOADED",
            BotStatus::Running => "RUNNING",
            BotStatus::Paused => "PAUSED",
            BotStatus::Stopped => "STOPPED",
        }
    }
}

/// Commands coming from the dashboard / signal handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand { Pause(String), Resume(String), Quit }

// Read-only view published to the dashboard every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotPerformance {
    pub name: String,
    pub status: BotStatus,
    pub cash: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub positions: BTreeMap<String, f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub time: f64,
    pub tick: u64,
    pub bots: Vec<BotPerformance>,
    pub prices: Vec<(String, f64, i128)>,
}

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}

pub fn now_unix() -> f64 {
    now_ns() as f64 / 1e9
}
