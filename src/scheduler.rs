// ===============================
// src/scheduler.rs (tick loop)
// ===============================
//
// Satu loop kooperatif:
//   snapshot PriceHub -> on_tick semua bot aktif (urutan registrasi)
//   -> eksekusi order lewat Broker (harga snapshot) -> equity + trade record
//   -> kirim ke recorder (fire-and-forget) -> publish view ke dashboard.
//
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant as TokioInstant};
use tracing::{info, warn};

use crate::broker::{Broker, Rejection};
use crate::domain::{
    now_unix, ControlCommand, DashboardView, EquitySnapshot, PriceSnapshot, Record, TickPayload,
    Trade,
};
use crate::metrics::{BOT_EQUITY, PNL_REALIZED, PNL_UNREALIZED, TICKS, TICK_DURATION, TICK_OVERRUNS};
use crate::price_hub::PriceHub;
use crate::runtime::{BotFault, BotRuntime};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Equity records go to the sink every N ticks (1 = every tick).
    pub equity_log_every: u64,
}

/// Everything one tick produced.
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub time: f64,
    pub trades: Vec<Trade>,
    pub rejections: Vec<Rejection>,
    pub equity: Vec<EquitySnapshot>,
    pub faults: Vec<BotFault>,
}

pub struct TickScheduler {
    hub: Arc<PriceHub>,
    bots: Vec<BotRuntime>,
    broker: Broker,
    cfg: SchedulerConfig,
    record_tx: Option<mpsc::UnboundedSender<Vec<Record>>>,
    view_tx: watch::Sender<DashboardView>,
    tick: u64,
}

fn equity_of(bot: &BotRuntime, prices: &PriceSnapshot, time: f64) -> EquitySnapshot {
    let acct = bot.account();
    let unrealized = acct.unrealized_pnl(prices);
    EquitySnapshot {
        time,
        bot_name: bot.name().to_string(),
        equity: acct.equity(prices),
        realized_pnl: acct.realized_pnl,
        unrealized_pnl: unrealized,
    }
}

impl TickScheduler {
    pub fn new(
        hub: Arc<PriceHub>,
        bots: Vec<BotRuntime>,
        broker: Broker,
        cfg: SchedulerConfig,
        record_tx: mpsc::UnboundedSender<Vec<Record>>,
        view_tx: watch::Sender<DashboardView>,
    ) -> Self {
        let every = cfg.equity_log_every.max(1);
        Self {
            hub,
            bots,
            broker,
            cfg: SchedulerConfig { equity_log_every: every, ..cfg },
            record_tx: Some(record_tx),
            view_tx,
            tick: 0,
        }
    }

    pub fn bots(&self) -> &[BotRuntime] { &self.bots }

    pub fn ticks(&self) -> u64 { self.tick }

    /// Runs `init` for every loaded bot. Init faults are logged, bots keep running.
    pub fn start_bots(&mut self, time: f64) -> Vec<BotFault> {
        let prices = self.hub.snapshot();
        let faults: Vec<BotFault> =
            self.bots.iter_mut().filter_map(|b| b.start(&prices, time).err()).collect();
        self.publish(&prices, time);
        faults
    }

    /// One full tick. Synchronous so tests can drive it directly.
    pub fn run_tick(&mut self, time: f64) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let prices = self.hub.snapshot();
        let price_map = prices.prices();

        let mut report = TickReport { tick: self.tick, time, ..Default::default() };

        // 1) bot pass: semua bot lihat snapshot yang sama
        let mut pending = Vec::with_capacity(self.bots.len());
        for (idx, bot) in self.bots.iter_mut().enumerate() {
            if !bot.is_active() {
                continue;
            }
            let payload = TickPayload {
                time,
                prices: price_map.clone(),
                bot: bot.account().view(&prices),
            };
            match bot.tick(&prices, &payload) {
                Ok(orders) if !orders.is_empty() => pending.push((idx, orders)),
                Ok(_) => {}
                Err(fault) => report.faults.push(fault),
            }
        }

        // 2) eksekusi, urutan registrasi lalu urutan submit
        for (idx, orders) in pending {
            let bot = &mut self.bots[idx];
            let name = bot.name().to_string();
            let (trades, rejections) =
                self.broker.execute_batch(bot.account_mut(), &name, orders, &prices, time);
            report.trades.extend(trades);
            report.rejections.extend(rejections);
        }

        // 3) equity per bot aktif
        for bot in self.bots.iter().filter(|b| b.is_active()) {
            let snap = equity_of(bot, &prices, time);
            BOT_EQUITY.with_label_values(&[&snap.bot_name]).set(snap.equity);
            PNL_REALIZED.with_label_values(&[&snap.bot_name]).set(snap.realized_pnl);
            PNL_UNREALIZED.with_label_values(&[&snap.bot_name]).set(snap.unrealized_pnl);
            report.equity.push(snap);
        }

        let log_equity = self.tick % self.cfg.equity_log_every == 0;
        let mut records: Vec<Record> = report.trades.iter().cloned().map(Record::Trade).collect();
        if log_equity {
            records.extend(report.equity.iter().cloned().map(Record::Equity));
        }
        self.send_records(records);
        self.publish(&prices, time);

        TICKS.inc();
        TICK_DURATION.observe(started.elapsed().as_secs_f64() * 1_000.0);
        report
    }

    fn send_records(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        if let Some(tx) = &self.record_tx {
            if tx.send(records).is_err() {
                warn!("recorder channel closed, records dropped");
            }
        }
    }

    fn publish(&self, prices: &PriceSnapshot, time: f64) {
        let view = DashboardView {
            time,
            tick: self.tick,
            bots: self.bots.iter().map(|b| b.performance(prices)).collect(),
            prices: prices.iter().map(|(s, q)| (s.clone(), q.price, q.observed_at_ns)).collect(),
        };
        // no receivers is fine (dashboard disabled)
        let _ = self.view_tx.send(view);
    }

    /// Pause/resume by bot name. Returns true when the bot changed state.
    pub fn apply(&mut self, cmd: &ControlCommand) -> bool {
        let (name, pause) = match cmd {
            ControlCommand::Pause(n) => (n, true),
            ControlCommand::Resume(n) => (n, false),
            ControlCommand::Quit => return false,
        };
        let Some(bot) = self.bots.iter_mut().find(|b| b.name() == name) else {
            warn!(bot = %name, "control: unknown bot");
            return false;
        };
        let changed = if pause { bot.pause() } else { bot.resume() };
        if changed {
            let prices = self.hub.snapshot();
            self.publish(&prices, now_unix());
        }
        changed
    }

    /// Final equity for every non-stopped bot, then stop all and close the record channel.
    pub fn shutdown(&mut self, time: f64) -> Vec<EquitySnapshot> {
        let prices = self.hub.snapshot();
        let finals: Vec<EquitySnapshot> = self
            .bots
            .iter()
            .filter(|b| b.status() != crate::domain::BotStatus::Stopped)
            .map(|b| equity_of(b, &prices, time))
            .collect();
        self.send_records(finals.iter().cloned().map(Record::Equity).collect());
        for bot in self.bots.iter_mut() {
            bot.stop();
        }
        self.publish(&prices, time);
        self.record_tx = None;
        info!(ticks = self.tick, bots = self.bots.len(), "scheduler: shut down");
        finals
    }

    /// Drives ticks at a fixed interval until Quit or the shutdown watch fires.
    /// An overrunning tick moves the next deadline to now instead of skipping.
    pub async fn run(
        mut self,
        mut ctl_rx: mpsc::UnboundedReceiver<ControlCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<BotRuntime> {
        info!(interval_ms = self.cfg.interval.as_millis() as u64, bots = self.bots.len(), "scheduler: started");
        let mut next = TokioInstant::now() + self.cfg.interval;
        let mut ctl_open = true;

        loop {
            tokio::select! {
                _ = sleep_until(next) => {
                    self.run_tick(now_unix());
                    let now = TokioInstant::now();
                    next += self.cfg.interval;
                    if next <= now {
                        let behind_ms = (now - next).as_millis() as u64;
                        warn!(tick = self.tick, behind_ms, "tick overran interval, next tick fires now");
                        TICK_OVERRUNS.inc();
                        next = now;
                    }
                }
                cmd = ctl_rx.recv(), if ctl_open => {
                    match cmd {
                        Some(ControlCommand::Quit) => {
                            info!("control: quit");
                            break;
                        }
                        Some(cmd) => { self.apply(&cmd); }
                        None => ctl_open = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler: shutdown signal");
                        break;
                    }
                }
            }
        }

        self.shutdown(now_unix());
        self.bots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{RejectReason, SellPolicy};
    use crate::domain::{BotStatus, Side};
    use crate::metrics::BOT_SLOW_TICKS;
    use crate::runtime::{Bot, BotContext, BotError, BotResult};
    use std::sync::Mutex;

    // Records the prices it saw and submits a fixed order every tick.
    struct Watcher {
        name: String,
        symbols: Vec<String>,
        order: Option<(Side, f64)>,
        fail_on: Option<u32>,
        calls: u32,
        seen: Arc<Mutex<Vec<(String, u32, Option<f64>, f64)>>>,
    }

    impl Bot for Watcher {
        fn name(&self) -> &str { &self.name }
        fn symbols(&self) -> &[String] { &self.symbols }

        fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
            self.calls += 1;
            self.seen.lock().unwrap().push((
                self.name.clone(),
                self.calls,
                ctx.price("BTCUSDT"),
                ctx.cash(),
            ));
            if let Some((side, size)) = self.order {
                ctx.submit_order("BTCUSDT", side, size);
            }
            if self.fail_on == Some(self.calls) {
                return Err(BotError::Failed("scripted failure".into()));
            }
            Ok(())
        }
    }

    type Seen = Arc<Mutex<Vec<(String, u32, Option<f64>, f64)>>>;

    fn watcher(name: &str, order: Option<(Side, f64)>, fail_on: Option<u32>, seen: &Seen) -> BotRuntime {
        let bot = Watcher {
            name: name.into(),
            symbols: vec!["BTCUSDT".into()],
            order,
            fail_on,
            calls: 0,
            seen: seen.clone(),
        };
        BotRuntime::new(Box::new(bot), 10_000.0, Duration::from_secs(5))
    }

    struct Harness {
        sched: TickScheduler,
        hub: Arc<PriceHub>,
        rx: mpsc::UnboundedReceiver<Vec<Record>>,
        view_rx: watch::Receiver<DashboardView>,
    }

    fn harness(bots: Vec<BotRuntime>, equity_log_every: u64) -> Harness {
        let hub = Arc::new(PriceHub::new());
        hub.update("BTCUSDT", 60_000.0, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(DashboardView::default());
        let cfg = SchedulerConfig { interval: Duration::from_millis(100), equity_log_every };
        let mut sched =
            TickScheduler::new(hub.clone(), bots, Broker::new(SellPolicy::AllowShort), cfg, tx, view_tx);
        sched.start_bots(0.0);
        Harness { sched, hub, rx, view_rx }
    }

    #[test]
    fn all_bots_see_the_same_snapshot_and_fill_at_it() {
        let seen = Seen::default();
        let mut h = harness(
            vec![
                watcher("a", Some((Side::Buy, 0.01)), None, &seen),
                watcher("b", Some((Side::Buy, 0.02)), None, &seen),
            ],
            1,
        );
        let report = h.sched.run_tick(1.0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].2, Some(60_000.0));
        assert_eq!(seen[1].2, Some(60_000.0));
        // registration order, both at the snapshot price
        assert_eq!(report.trades.len(), 2);
        assert_eq!(report.trades[0].bot_name, "a");
        assert_eq!(report.trades[1].bot_name, "b");
        assert!(report.trades.iter().all(|t| t.price == 60_000.0));
        assert_eq!(h.sched.bots()[0].account().cash, 9_400.0);
        assert_eq!(h.sched.bots()[1].account().cash, 8_800.0);

        // price moves after the snapshot: already executed trades keep the old price
        h.hub.update("BTCUSDT", 70_000.0, 2);
        assert_eq!(report.equity[0].equity, 10_000.0);

        let records = h.rx.try_recv().unwrap();
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], Record::Trade(_)));
        assert!(matches!(records[3], Record::Equity(_)));
        assert_eq!(h.view_rx.borrow().tick, 1);
    }

    #[test]
    fn faulting_bot_keeps_ledger_and_runs_next_tick() {
        let seen = Seen::default();
        let mut h = harness(
            vec![
                watcher("bad", Some((Side::Buy, 0.01)), Some(1), &seen),
                watcher("good", Some((Side::Buy, 0.01)), None, &seen),
            ],
            1,
        );
        let r1 = h.sched.run_tick(1.0);
        assert_eq!(r1.faults.len(), 1);
        assert_eq!(r1.faults[0].bot, "bad");
        assert_eq!(r1.trades.len(), 1);
        assert_eq!(h.sched.bots()[0].account().cash, 10_000.0);

        let r2 = h.sched.run_tick(2.0);
        assert!(r2.faults.is_empty());
        assert_eq!(r2.trades[0].bot_name, "bad");
        let bad_calls: Vec<_> = seen.lock().unwrap().iter().filter(|s| s.0 == "bad").map(|s| (s.1, s.3)).collect();
        assert_eq!(bad_calls, vec![(1, 10_000.0), (2, 10_000.0)]);
    }

    #[test]
    fn paused_bot_is_skipped_and_resumes() {
        let seen = Seen::default();
        let mut h = harness(vec![watcher("a", None, None, &seen), watcher("b", None, None, &seen)], 1);
        assert!(h.sched.apply(&ControlCommand::Pause("a".into())));
        assert!(!h.sched.apply(&ControlCommand::Pause("a".into())));
        assert!(!h.sched.apply(&ControlCommand::Pause("nobody".into())));

        let r = h.sched.run_tick(1.0);
        assert_eq!(r.equity.len(), 1);
        assert_eq!(r.equity[0].bot_name, "b");

        assert!(h.sched.apply(&ControlCommand::Resume("a".into())));
        h.sched.run_tick(2.0);
        let names: Vec<_> = seen.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(names, vec!["b", "a", "b"]);
    }

    #[test]
    fn rejections_and_missing_prices_do_not_touch_accounts() {
        let seen = Seen::default();
        let mut h = harness(vec![watcher("whale", Some((Side::Buy, 1.0)), None, &seen)], 1);
        let r = h.sched.run_tick(1.0);
        assert!(r.trades.is_empty());
        assert_eq!(r.rejections[0].reason, RejectReason::InsufficientFunds);
        assert_eq!(h.sched.bots()[0].account().cash, 10_000.0);
    }

    #[test]
    fn equity_records_follow_log_every() {
        let seen = Seen::default();
        let mut h = harness(vec![watcher("a", None, None, &seen)], 3);
        for t in 1..=3 {
            h.sched.run_tick(t as f64);
        }
        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0], Record::Equity(e) if e.time == 3.0));
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.sched.ticks(), 3);
    }

    #[test]
    fn shutdown_writes_final_equity_and_stops_everyone() {
        let seen = Seen::default();
        let mut h = harness(vec![watcher("a", None, None, &seen), watcher("b", None, None, &seen)], 100);
        h.sched.apply(&ControlCommand::Pause("b".into()));
        let finals = h.sched.shutdown(9.0);
        assert_eq!(finals.len(), 2);
        assert!(h.sched.bots().iter().all(|b| b.status() == BotStatus::Stopped));

        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        // sender dropped
        assert!(matches!(h.rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_ticks_on_interval_and_quits() {
        let seen = Seen::default();
        let h = harness(vec![watcher("a", None, None, &seen)], 1);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let mut rx = h.rx;

        let task = tokio::spawn(h.sched.run(ctl_rx, sd_rx));
        tokio::time::sleep(Duration::from_millis(350)).await;
        ctl_tx.send(ControlCommand::Quit).unwrap();
        let bots = task.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(bots[0].status(), BotStatus::Stopped);

        // 3 tick batches + final equity, then closed
        let mut batches = 0;
        while let Some(_) = rx.recv().await {
            batches += 1;
        }
        assert_eq!(batches, 4);
    }

    struct Sleepy { name: String, symbols: Vec<String>, stamps: Arc<Mutex<Vec<Instant>>> }

    impl Bot for Sleepy {
        fn name(&self) -> &str { &self.name }
        fn symbols(&self) -> &[String] { &self.symbols }

        fn on_tick(&mut self, _ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
            self.stamps.lock().unwrap().push(Instant::now());
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }
    }

    // Jam asli: bot 50ms dengan interval 20ms. Tick berikutnya langsung jalan
    // (jarak ~ durasi bot, bukan kelipatan interval) dan tidak ada tick yang dilewati.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overrunning_ticks_fire_immediately_without_skipping() {
        let name = "sleepy-overrun";
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let bot = Sleepy { name: name.into(), symbols: vec!["BTCUSDT".into()], stamps: stamps.clone() };
        let rt = BotRuntime::new(Box::new(bot), 10_000.0, Duration::from_millis(10));

        let hub = Arc::new(PriceHub::new());
        hub.update("BTCUSDT", 60_000.0, 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (view_tx, _view_rx) = watch::channel(DashboardView::default());
        let cfg = SchedulerConfig { interval: Duration::from_millis(20), equity_log_every: 1 };
        let mut sched = TickScheduler::new(hub, vec![rt], Broker::new(SellPolicy::AllowShort), cfg, tx, view_tx);
        sched.start_bots(0.0);

        let overruns = TICK_OVERRUNS.get();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (_sd_tx, sd_rx) = watch::channel(false);
        let task = tokio::spawn(sched.run(ctl_rx, sd_rx));
        tokio::time::sleep(Duration::from_millis(400)).await;
        ctl_tx.send(ControlCommand::Quit).unwrap();
        task.await.unwrap();

        let stamps = stamps.lock().unwrap();
        let calls = stamps.len() as u64;
        assert!(calls >= 4, "only {calls} ticks in 400ms");
        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(45) && gap <= Duration::from_millis(100),
                "gap {gap:?} is not close to the bot's 50ms"
            );
        }
        assert!(TICK_OVERRUNS.get() >= overruns + calls - 1);
        assert_eq!(BOT_SLOW_TICKS.with_label_values(&[name]).get(), calls);
    }
}
