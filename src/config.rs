// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : paper_lab_rust — paper-trading lab for many bots on live prices
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Streams multi-symbol prices (mock/Binance WS/REST) into a shared
          price hub, ticks every loaded bot on one snapshot, fills their
          market orders against per-bot paper ledgers, exposes Prometheus
          metrics, and records trades/equity as JSONL.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

use crate::broker::SellPolicy;
use crate::registry::BotSpec;

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
    BinanceRest,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock"            => Some(FeedMode::Mock),
            "binance_sandbox" => Some(FeedMode::BinanceSandbox),
            "binance_mainnet" => Some(FeedMode::BinanceMainnet),
            "binance_rest"    => Some(FeedMode::BinanceRest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock           => "mock",
            FeedMode::BinanceSandbox => "binance_sandbox",
            FeedMode::BinanceMainnet => "binance_mainnet",
            FeedMode::BinanceRest    => "binance_rest",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            FeedMode::BinanceSandbox => "wss://testnet.binance.vision/ws",
            _                        => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            FeedMode::BinanceSandbox => "https://testnet.binance.vision",
            _                        => "https://api.binance.com",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Command-line overrides; each flag wins over the matching env key.
#[derive(Parser, Debug, Default)]
#[command(name = "paper_lab_rust", version, about = "Paper-trading lab: many bots, one price snapshot per tick")]
pub struct Cli {
    /// STARTING_CASH per bot
    #[arg(long)]
    pub starting_cash: Option<f64>,
    /// TICK_INTERVAL_MS
    #[arg(long)]
    pub tick_ms: Option<u64>,
    /// SYMBOLS, comma separated
    #[arg(long)]
    pub symbols: Option<String>,
    /// FEED_MODE: mock | binance_sandbox | binance_mainnet | binance_rest
    #[arg(long)]
    pub feed: Option<String>,
    /// BOTS, e.g. trend_follower,mean_reversion@ETHUSDT
    #[arg(long)]
    pub bots: Option<String>,
    /// SELL_POLICY: allow_short | cap_to_long
    #[arg(long)]
    pub sell_policy: Option<String>,
    /// RECORD_DIR for trades.jsonl / equity.jsonl
    #[arg(long)]
    pub record_dir: Option<String>,
    /// METRICS_PORT (0 disables)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Turn the CLI dashboard off (logs only)
    #[arg(long)]
    pub no_dashboard: bool,
    /// Print known bot kinds and exit
    #[arg(long)]
    pub list_bots: bool,
}

impl Cli {
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = self.starting_cash { out.push(("STARTING_CASH", v.to_string())); }
        if let Some(v) = self.tick_ms { out.push(("TICK_INTERVAL_MS", v.to_string())); }
        if let Some(v) = &self.symbols { out.push(("SYMBOLS", v.clone())); }
        if let Some(v) = &self.feed { out.push(("FEED_MODE", v.clone())); }
        if let Some(v) = &self.bots { out.push(("BOTS", v.clone())); }
        if let Some(v) = &self.sell_policy { out.push(("SELL_POLICY", v.clone())); }
        if let Some(v) = &self.record_dir { out.push(("RECORD_DIR", v.clone())); }
        if let Some(v) = self.metrics_port { out.push(("METRICS_PORT", v.to_string())); }
        if self.no_dashboard { out.push(("DASHBOARD", "off".to_string())); }
        out
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // ledger / broker
    pub starting_cash: f64,
    pub sell_policy: SellPolicy,

    // tick loop
    pub tick_interval: Duration,
    pub bot_soft_deadline: Duration,
    pub equity_log_every: u64,
    pub warmup: Duration,

    // market data
    pub symbols: Vec<String>,
    pub feed_mode: FeedMode,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub rest_poll: Duration,

    // bots
    pub bots: Vec<BotSpec>,

    // files / metrics / ui
    pub record_dir: PathBuf,
    pub metrics_port: u16,
    pub dashboard: bool,
    pub stale_after: Duration,
}

// Parse one numeric key; bad values are reported, default is kept.
fn num<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T, problems: &mut Vec<String>) -> T {
    match get(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            problems.push(format!("{key}: cannot parse '{raw}'"));
            default
        }),
    }
}

fn flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Args {
    /// Builds the config from any key lookup (env, overrides, test maps).
    /// Every problem found is collected before failing.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
        let mut problems = Vec::new();

        // Multi-symbol: SYMBOLS=BTCUSDT,ETHUSDT,SOLUSDT
        let symbols: Vec<String> = get("SYMBOLS")
            .unwrap_or_else(|| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
            .map(|x| x.to_ascii_uppercase())
            .collect();

        let feed_mode = match get("FEED_MODE") {
            None => FeedMode::Mock,
            Some(raw) => FeedMode::parse(&raw).unwrap_or_else(|| {
                problems.push(format!("FEED_MODE: unknown mode '{raw}'"));
                FeedMode::Mock
            }),
        };
        let binance_ws_url = get("BINANCE_WS_URL").unwrap_or_else(|| feed_mode.default_ws_url().to_string());
        let binance_rest_url = get("BINANCE_REST_URL").unwrap_or_else(|| feed_mode.default_rest_url().to_string());

        let sell_policy = match get("SELL_POLICY") {
            None => SellPolicy::default(),
            Some(raw) => SellPolicy::parse(&raw).unwrap_or_else(|| {
                problems.push(format!("SELL_POLICY: expected allow_short|cap_to_long, got '{raw}'"));
                SellPolicy::default()
            }),
        };

        let dashboard = match get("DASHBOARD") {
            None => true,
            Some(raw) => flag(&raw).unwrap_or_else(|| {
                problems.push(format!("DASHBOARD: expected on|off, got '{raw}'"));
                true
            }),
        };

        let default_symbol = symbols.first().cloned().unwrap_or_default();
        let bots = BotSpec::parse_list(
            &get("BOTS").unwrap_or_else(|| "trend_follower,random_trader".to_string()),
            &default_symbol,
        );

        let args = Args {
            starting_cash: num(&get, "STARTING_CASH", 10_000.0, &mut problems),
            sell_policy,
            tick_interval: Duration::from_millis(num(&get, "TICK_INTERVAL_MS", 1_000, &mut problems)),
            bot_soft_deadline: Duration::from_millis(num(&get, "BOT_SOFT_DEADLINE_MS", 250, &mut problems)),
            equity_log_every: num(&get, "EQUITY_LOG_EVERY", 1, &mut problems),
            warmup: Duration::from_millis(num(&get, "WARMUP_MS", 2_000, &mut problems)),
            symbols,
            feed_mode,
            binance_ws_url,
            binance_rest_url,
            rest_poll: Duration::from_millis(num(&get, "REST_POLL_MS", 2_000, &mut problems)),
            bots,
            record_dir: PathBuf::from(get("RECORD_DIR").unwrap_or_else(|| "lab_data".to_string())),
            metrics_port: num(&get, "METRICS_PORT", 9898, &mut problems),
            dashboard,
            stale_after: Duration::from_secs(num(&get, "STALE_AFTER_SECS", 10, &mut problems)),
        };

        problems.extend(args.validate());
        if problems.is_empty() { Ok(args) } else { Err(ConfigError::Invalid(problems)) }
    }

    /// Semantic checks on parsed values. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut p = Vec::new();
        if !(self.starting_cash.is_finite() && self.starting_cash > 0.0) {
            p.push(format!("STARTING_CASH must be > 0 (got {})", self.starting_cash));
        }
        if self.tick_interval.is_zero() {
            p.push("TICK_INTERVAL_MS must be > 0".to_string());
        }
        if self.equity_log_every == 0 {
            p.push("EQUITY_LOG_EVERY must be >= 1".to_string());
        }
        if self.symbols.is_empty() {
            p.push("SYMBOLS is empty".to_string());
        }
        if self.bots.is_empty() {
            p.push("BOTS is empty".to_string());
        }
        for b in &self.bots {
            if !self.symbols.contains(&b.symbol) {
                p.push(format!("bot '{}' trades {} which is not in SYMBOLS", b.name(), b.symbol));
            }
        }
        if self.feed_mode == FeedMode::BinanceRest && self.rest_poll.is_zero() {
            p.push("REST_POLL_MS must be > 0".to_string());
        }
        if self.record_dir.as_os_str().is_empty() {
            p.push("RECORD_DIR is empty".to_string());
        }
        p
    }
}

/// `.env` -> environment -> command line (last wins).
pub fn load(cli: &Cli) -> Result<Args, ConfigError> {
    // Pastikan .env dibaca (agar SYMBOLS, BOTS, dll ter-load)
    let _ = dotenv();
    let over = cli.overrides();
    Args::from_lookup(|key| {
        over.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| env::var(key).ok())
    })
}
