// ===============================
// src/runtime.rs (bot contract + fault boundary)
// ===============================
//
// Satu BotRuntime per strategi: memegang LedgerAccount milik bot, status
// run/pause, dan membungkus init/on_tick dengan catch_unwind sehingga bot
// yang error/panic tidak menjatuhkan proses atau bot lain.
//
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, catch_unwind, AssertUnwindSafe};
use std::sync::Once;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::{BotPerformance, BotStatus, Order, PriceSnapshot, Side, TickPayload};
use crate::ledger::LedgerAccount;
use crate::metrics::{BOT_FAULTS, BOT_SLOW_TICKS, ORDERS_SUBMITTED};

#[derive(Debug, Error)]
pub enum BotError {
    #[error("{0}")]
    Failed(String),
}

pub type BotResult<T> = Result<T, BotError>;

/// Strategy contract. Each implementation keeps its own state in `self`.
pub trait Bot: Send {
    fn name(&self) -> &str;

    fn symbols(&self) -> &[String];

    fn init(&mut self, _ctx: &mut BotContext<'_>) -> BotResult<()> {
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut BotContext<'_>, tick: &TickPayload) -> BotResult<()>;
}

/// The only surface a bot sees during a callback.
pub struct BotContext<'a> {
    bot_name: &'a str,
    prices: &'a PriceSnapshot,
    account: &'a LedgerAccount,
    orders: Vec<Order>,
}

impl<'a> BotContext<'a> {
    pub fn new(bot_name: &'a str, prices: &'a PriceSnapshot, account: &'a LedgerAccount) -> Self {
        Self { bot_name, prices, account, orders: Vec::new() }
    }

    pub fn price(&self, symbol: &str) -> Option<f64> { self.prices.price(symbol) }

    pub fn cash(&self) -> f64 { self.account.cash }

    pub fn position(&self, symbol: &str) -> f64 { self.account.position(symbol) }

    /// Queues a market order for this tick's broker pass.
    pub fn submit_order(&mut self, symbol: &str, side: Side, size: f64) {
        info!(bot = %self.bot_name, %symbol, side = side.as_str(), size, "order submitted");
        self.orders.push(Order { symbol: symbol.to_string(), side, size });
    }

    pub fn log(&self, message: &str) {
        info!(target: "bot", bot = %self.bot_name, "{message}");
    }

    pub(crate) fn into_orders(self) -> Vec<Order> { self.orders }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase { Init, Tick }

#[derive(Debug, Clone, PartialEq, Error)]
#[error("bot '{bot}' faulted in {phase:?} at tick {tick} (t={time}): {message}")]
pub struct BotFault {
    pub bot: String,
    pub time: f64,
    pub phase: FaultPhase,
    /// on_tick calls made so far, counting the faulting one. 0 for init.
    pub tick: u64,
    pub message: String,
    /// Captured only for panics.
    pub backtrace: Option<String>,
}

pub type TickOutcome = Result<Vec<Order>, BotFault>;

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

// Hook global sekali saja: simpan backtrace panic terakhir per thread,
// lalu teruskan ke hook sebelumnya (pesan default tetap ke stderr).
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|t| *t.borrow_mut() = Some(trace));
            prev(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|t| t.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

pub struct BotRuntime {
    name: String,
    symbols: Vec<String>,
    bot: Box<dyn Bot>,
    account: LedgerAccount,
    status: BotStatus,
    last_error: Option<String>,
    soft_deadline: Duration,
    ticks: u64,
}

impl BotRuntime {
    pub fn new(bot: Box<dyn Bot>, starting_cash: f64, soft_deadline: Duration) -> Self {
        install_panic_hook();
        Self {
            name: bot.name().to_string(),
            symbols: bot.symbols().to_vec(),
            bot,
            account: LedgerAccount::new(starting_cash),
            status: BotStatus::Loaded,
            last_error: None,
            soft_deadline,
            ticks: 0,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn symbols(&self) -> &[String] { &self.symbols }
    pub fn status(&self) -> BotStatus { self.status }
    pub fn account(&self) -> &LedgerAccount { &self.account }
    pub fn account_mut(&mut self) -> &mut LedgerAccount { &mut self.account }
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }
    pub fn is_active(&self) -> bool { self.status == BotStatus::Running }

    fn fault(&mut self, phase: FaultPhase, time: f64, message: String, backtrace: Option<String>) -> BotFault {
        let tick = if phase == FaultPhase::Init { 0 } else { self.ticks };
        let fault = BotFault { bot: self.name.clone(), time, phase, tick, message, backtrace };
        error!(bot = %self.name, tick, time, phase = ?phase, error = %fault.message, "bot fault");
        if let Some(bt) = &fault.backtrace {
            error!(bot = %self.name, tick, "bot panic backtrace:\n{bt}");
        }
        BOT_FAULTS.with_label_values(&[&self.name]).inc();
        self.last_error = Some(fault.message.clone());
        fault
    }

    /// Runs `init` once and moves the bot to Running. A failing init is reported
    /// but does not keep the bot from ticking.
    pub fn start(&mut self, prices: &PriceSnapshot, time: f64) -> Result<(), BotFault> {
        if self.status != BotStatus::Loaded {
            return Ok(());
        }
        self.status = BotStatus::Running;
        let mut ctx = BotContext::new(&self.name, prices, &self.account);
        let bot = &mut self.bot;
        take_panic_trace();
        let result = catch_unwind(AssertUnwindSafe(|| bot.init(&mut ctx)));
        let dropped = ctx.into_orders().len();
        if dropped > 0 {
            warn!(bot = %self.name, dropped, "orders submitted from init are discarded");
        }
        match result {
            Ok(Ok(())) => {
                info!(bot = %self.name, symbols = ?self.symbols, "bot initialized");
                Ok(())
            }
            Ok(Err(e)) => Err(self.fault(FaultPhase::Init, time, e.to_string(), None)),
            Err(p) => {
                let trace = take_panic_trace();
                Err(self.fault(FaultPhase::Init, time, panic_message(p.as_ref()), trace))
            }
        }
    }

    /// One on_tick call inside the fault boundary. Orders queued before a fault are dropped.
    pub fn tick(&mut self, prices: &PriceSnapshot, payload: &TickPayload) -> TickOutcome {
        let mut ctx = BotContext::new(&self.name, prices, &self.account);
        let bot = &mut self.bot;
        self.ticks += 1;
        take_panic_trace();
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| bot.on_tick(&mut ctx, payload)));
        let elapsed = started.elapsed();
        let orders = ctx.into_orders();

        if elapsed > self.soft_deadline {
            warn!(
                bot = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                deadline_ms = self.soft_deadline.as_millis() as u64,
                "on_tick overran soft deadline"
            );
            BOT_SLOW_TICKS.with_label_values(&[&self.name]).inc();
        }

        match result {
            Ok(Ok(())) => {
                self.last_error = None;
                ORDERS_SUBMITTED.inc_by(orders.len() as u64);
                Ok(orders)
            }
            Ok(Err(e)) => Err(self.fault(FaultPhase::Tick, payload.time, e.to_string(), None)),
            Err(p) => {
                let trace = take_panic_trace();
                Err(self.fault(FaultPhase::Tick, payload.time, panic_message(p.as_ref()), trace))
            }
        }
    }

    pub fn pause(&mut self) -> bool {
        if self.status != BotStatus::Running {
            return false;
        }
        self.status = BotStatus::Paused;
        info!(bot = %self.name, "paused");
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.status != BotStatus::Paused {
            return false;
        }
        self.status = BotStatus::Running;
        info!(bot = %self.name, "resumed");
        true
    }

    pub fn stop(&mut self) -> bool {
        if self.status == BotStatus::Stopped {
            return false;
        }
        self.status = BotStatus::Stopped;
        info!(bot = %self.name, "stopped");
        true
    }

    pub fn performance(&self, prices: &PriceSnapshot) -> BotPerformance {
        let view = self.account.view(prices);
        BotPerformance {
            name: self.name.clone(),
            status: self.status,
            cash: view.cash,
            equity: view.equity,
            realized_pnl: view.realized_pnl,
            unrealized_pnl: view.unrealized_pnl,
            positions: view.positions,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BotView;

    struct Scripted {
        name: String,
        symbols: Vec<String>,
        fail_init: bool,
        calls: u32,
    }

    impl Scripted {
        fn boxed(fail_init: bool) -> Box<dyn Bot> {
            Box::new(Scripted {
                name: "scripted".into(),
                symbols: vec!["X".into()],
                fail_init,
                calls: 0,
            })
        }
    }

    impl Bot for Scripted {
        fn name(&self) -> &str { &self.name }
        fn symbols(&self) -> &[String] { &self.symbols }

        fn init(&mut self, ctx: &mut BotContext<'_>) -> BotResult<()> {
            ctx.submit_order("X", Side::Buy, 1.0);
            if self.fail_init {
                return Err(BotError::Failed("bad init".into()));
            }
            Ok(())
        }

        fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
            self.calls += 1;
            ctx.submit_order("X", Side::Buy, 1.0);
            match self.calls {
                2 => Err(BotError::Failed("boom".into())),
                3 => panic!("kaboom"),
                _ => Ok(()),
            }
        }
    }

    fn payload(time: f64) -> TickPayload {
        TickPayload {
            time,
            prices: Default::default(),
            bot: BotView {
                cash: 0.0,
                positions: Default::default(),
                equity: 0.0,
                realized_pnl: 0.0,
                unrealized_pnl: 0.0,
            },
        }
    }

    fn runtime(fail_init: bool) -> BotRuntime {
        BotRuntime::new(Scripted::boxed(fail_init), 100.0, Duration::from_secs(5))
    }

    #[test]
    fn error_and_panic_are_contained_and_orders_dropped() {
        let mut rt = runtime(false);
        let prices = PriceSnapshot::default();
        rt.start(&prices, 0.0).unwrap();

        assert_eq!(rt.tick(&prices, &payload(1.0)).unwrap().len(), 1);

        let fault = rt.tick(&prices, &payload(2.0)).unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Tick);
        assert_eq!(fault.time, 2.0);
        assert_eq!(fault.tick, 2);
        assert!(fault.backtrace.is_none());
        assert_eq!(rt.last_error(), Some("boom"));

        let fault = rt.tick(&prices, &payload(3.0)).unwrap_err();
        assert!(fault.message.contains("kaboom"));
        assert_eq!(fault.tick, 3);
        assert!(fault.backtrace.as_deref().is_some_and(|bt| !bt.is_empty()));
        assert!(fault.to_string().contains("at tick 3"));
        assert_eq!(rt.account(), &LedgerAccount::new(100.0));

        // still eligible afterwards
        assert!(rt.is_active());
        assert_eq!(rt.tick(&prices, &payload(4.0)).unwrap().len(), 1);
        assert_eq!(rt.last_error(), None);
    }

    #[test]
    fn failing_init_still_runs() {
        let mut rt = runtime(true);
        let prices = PriceSnapshot::default();
        let fault = rt.start(&prices, 0.0).unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Init);
        assert_eq!(fault.tick, 0);
        assert_eq!(rt.status(), BotStatus::Running);
    }

    struct Sleepy { name: String, symbols: Vec<String>, nap: Duration }

    impl Bot for Sleepy {
        fn name(&self) -> &str { &self.name }
        fn symbols(&self) -> &[String] { &self.symbols }

        fn on_tick(&mut self, ctx: &mut BotContext<'_>, _tick: &TickPayload) -> BotResult<()> {
            std::thread::sleep(self.nap);
            ctx.submit_order("X", Side::Sell, 1.0);
            Ok(())
        }
    }

    #[test]
    fn slow_tick_is_counted_but_not_aborted() {
        let bot = Sleepy { name: "sleepy-runtime".into(), symbols: vec!["X".into()], nap: Duration::from_millis(30) };
        let mut rt = BotRuntime::new(Box::new(bot), 100.0, Duration::from_millis(5));
        let prices = PriceSnapshot::default();
        rt.start(&prices, 0.0).unwrap();

        let orders = rt.tick(&prices, &payload(1.0)).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(BOT_SLOW_TICKS.with_label_values(&["sleepy-runtime"]).get(), 1);
        assert!(rt.last_error().is_none());
    }

    #[test]
    fn lifecycle_transitions_are_idempotent() {
        let mut rt = runtime(false);
        assert_eq!(rt.status(), BotStatus::Loaded);
        assert!(!rt.pause());
        rt.start(&PriceSnapshot::default(), 0.0).unwrap();
        assert!(rt.pause());
        assert!(!rt.pause());
        assert_eq!(rt.status(), BotStatus::Paused);
        assert!(rt.resume());
        assert!(!rt.resume());
        assert!(rt.stop());
        assert!(!rt.stop());
        assert!(!rt.resume());
        assert_eq!(rt.status(), BotStatus::Stopped);
    }
}
