// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Tick loop --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "scheduler ticks").unwrap());

pub static TICK_OVERRUNS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("tick_overruns_total", "ticks that took longer than the interval").unwrap()
});

pub static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("tick_duration_ms", "wall time of one tick (ms)")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
    )
    .unwrap()
});

// -------- Market data --------
pub static PRICE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_updates_total", "accepted price updates per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Orders / trades --------
pub static ORDERS_SUBMITTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_submitted_total", "orders queued by bots").unwrap());

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_rejected_total", "broker rejections (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trades_total", "executed trades per bot"), &["bot"]).unwrap()
});

// -------- Bots --------
pub static BOT_FAULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("bot_faults_total", "errors/panics inside bot hooks"), &["bot"])
        .unwrap()
});

pub static BOT_SLOW_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bot_slow_ticks_total", "on_tick calls over the soft deadline"),
        &["bot"],
    )
    .unwrap()
});

pub static BOT_EQUITY: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("bot_equity", "cash + marked positions"), &["bot"]).unwrap()
});

pub static PNL_REALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("pnl_realized", "realized PnL per bot"), &["bot"]).unwrap()
});

pub static PNL_UNREALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("pnl_unrealized", "unrealized PnL per bot"), &["bot"]).unwrap()
});

// -------- Persistence --------
pub static PERSIST_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("persist_failures_total", "failed record writes (retried)").unwrap()
});

pub static PERSIST_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("persist_pending_records", "records waiting to be written").unwrap()
});

// ---- Config visibility (feed mode / bots / symbols) ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_BOT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_bot", "loaded bots (label: bot)"), &["bot"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICK_OVERRUNS.clone())),
        REGISTRY.register(Box::new(TICK_DURATION.clone())),
        REGISTRY.register(Box::new(PRICE_UPDATES.clone())),
        REGISTRY.register(Box::new(ORDERS_SUBMITTED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(BOT_FAULTS.clone())),
        REGISTRY.register(Box::new(BOT_SLOW_TICKS.clone())),
        REGISTRY.register(Box::new(BOT_EQUITY.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(PERSIST_FAILURES.clone())),
        REGISTRY.register(Box::new(PERSIST_PENDING.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_BOT.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, error = %e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(error = %e, "metrics accept error"),
            }
        }
    });
}
