// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/paper_lab_rust

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_mode|bot|symbol)'

# equity & pnl per bot
curl -s localhost:9898/metrics | egrep '^(bot_equity|pnl_realized|pnl_unrealized)'

# audit log
tail -f lab_data/trades.jsonl

*/
/*
=============================================================================
Project : paper_lab_rust — paper-trading lab for many bots on live prices
Module  : main.rs
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
mod domain;
mod config;
mod metrics;
mod price_hub;
mod ledger;
mod broker;
mod runtime;
mod strategy;
mod registry;
mod scheduler;
mod recorder;
mod feed;
mod dashboard;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, Duration, Instant},
};
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::{Cli, FeedMode};
use crate::domain::{now_unix, ControlCommand, DashboardView, Record};
use crate::price_hub::PriceHub;
use crate::recorder::JsonlSink;
use crate::registry::BotRegistry;
use crate::scheduler::{SchedulerConfig, TickScheduler};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ---- Logging (stderr; stdout milik dashboard) ----
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = BotRegistry::default();
    if cli.list_bots {
        for kind in registry.kinds() {
            println!("{kind}");
        }
        return ExitCode::SUCCESS;
    }

    // ---- Load config ----
    let args = match config::load(&cli) {
        Ok(a) => a,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        metrics::serve_metrics(args.metrics_port);
    }

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        feed_mode = args.feed_mode.as_str(),
        symbols = ?args.symbols,
        bots = ?args.bots.iter().map(|b| b.name()).collect::<Vec<_>>(),
        starting_cash = args.starting_cash,
        tick_ms = args.tick_interval.as_millis() as u64,
        sell_policy = ?args.sell_policy,
        record_dir = %args.record_dir.display(),
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    // ---- Recorder ----
    let sink = match JsonlSink::open(&args.record_dir).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, dir = %args.record_dir.display(), "cannot open record dir");
            return ExitCode::FAILURE;
        }
    };
    let (rec_tx, rec_rx) = mpsc::unbounded_channel::<Vec<Record>>();
    let recorder_task = tokio::spawn(recorder::run(rec_rx, sink, Duration::from_secs(2)));

    // ---- FEED (Market Data) -> PriceHub ----
    let hub = Arc::new(PriceHub::new());
    let (feed_stop_tx, feed_stop_rx) = watch::channel(false);
    let mut feeds: Vec<JoinHandle<()>> = Vec::new();
    match args.feed_mode {
        FeedMode::Mock => {
            for sym in args.symbols.iter().cloned() {
                feeds.push(tokio::spawn(feed::run_mock(hub.clone(), sym, feed_stop_rx.clone())));
            }
        }
        FeedMode::BinanceSandbox | FeedMode::BinanceMainnet => {
            for sym in args.symbols.iter().cloned() {
                let base = args.binance_ws_url.clone();
                feeds.push(tokio::spawn(feed::run_binance(hub.clone(), sym, base, feed_stop_rx.clone())));
            }
        }
        FeedMode::BinanceRest => {
            feeds.push(tokio::spawn(feed::run_rest_poll(
                hub.clone(),
                args.symbols.clone(),
                args.binance_rest_url.clone(),
                args.rest_poll,
                feed_stop_rx.clone(),
            )));
        }
    }

    // ---- Bots ----
    let (bots, load_errors) = registry.load(&args.bots, args.starting_cash, args.bot_soft_deadline);
    if !load_errors.is_empty() {
        warn!(failed = load_errors.len(), known = ?registry.kinds(), "some bots were skipped");
    }
    for b in &bots {
        info!(bot = %b.name(), symbols = ?b.symbols(), "bot ready");
        metrics::CONFIG_BOT.with_label_values(&[b.name()]).set(1);
    }

    // ---- Warm-up: tunggu harga pertama (maks WARMUP_MS) ----
    let deadline = Instant::now() + args.warmup;
    while hub.len() < args.symbols.len() && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    info!(have = hub.len(), want = args.symbols.len(), "warm-up done");

    // ---- Scheduler ----
    let (view_tx, view_rx) = watch::channel(DashboardView::default());
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel::<ControlCommand>();
    let (_sched_stop_tx, sched_stop_rx) = watch::channel(false);

    let mut scheduler = TickScheduler::new(
        hub.clone(),
        bots,
        Broker::new(args.sell_policy),
        SchedulerConfig { interval: args.tick_interval, equity_log_every: args.equity_log_every },
        rec_tx,
        view_tx,
    );
    scheduler.start_bots(now_unix());
    let scheduler_task = tokio::spawn(scheduler.run(ctl_rx, sched_stop_rx));

    // ---- Dashboard ----
    if args.dashboard {
        let lines = dashboard::spawn_stdin_reader();
        tokio::spawn(dashboard::run(view_rx, ctl_tx.clone(), lines, args.stale_after));
    } else {
        drop(view_rx);
    }

    // ---- Ctrl-C -> Quit ----
    tokio::spawn({
        let ctl_tx = ctl_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                let _ = ctl_tx.send(ControlCommand::Quit);
            }
        }
    });
    drop(ctl_tx);

    // ---- Ordered shutdown ----
    // 1) scheduler selesai (tick terakhir + final equity, channel record ditutup)
    match scheduler_task.await {
        Ok(bots) => info!(bots = bots.len(), "scheduler finished"),
        Err(e) => error!(error = %e, "scheduler task failed"),
    }
    // 2) stop feeds
    let _ = feed_stop_tx.send(true);
    for f in feeds {
        let _ = f.await;
    }
    // 3) tunggu recorder flush
    if let Err(e) = recorder_task.await {
        error!(error = %e, "recorder task failed");
    }
    info!("bye");
    ExitCode::SUCCESS
}
