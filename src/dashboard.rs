// ===============================
// src/dashboard.rs
// ===============================
//
// CLI monitor: render tabel performa bot dari watch channel (read-only),
// dan baca perintah dari stdin:
//   p <bot>  -> pause
//   r <bot>  -> resume
//   q        -> quit
//
use std::fmt::Write as _;
use std::io::{BufRead, Write as _};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::domain::{now_ns, ControlCommand, DashboardView};

const WIDTH: usize = 100;

/// `1234567.891` -> `1,234,567.89`
pub fn fmt_money(v: f64) -> String {
    let s = format!("{:.2}", v.abs());
    let (int, frac) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if v < 0.0 && s != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{frac}")
}

fn fmt_pnl(v: f64) -> String {
    if v > 0.0 {
        format!("+${}", fmt_money(v))
    } else {
        format!("${}", fmt_money(v))
    }
}

/// Renders one frame. `now_ns` and `stale_after` decide the STALE flag per price.
pub fn render(view: &DashboardView, now_ns: i128, stale_after: Duration) -> String {
    let mut out = String::new();
    let bar = "=".repeat(WIDTH);
    let _ = writeln!(out, "{bar}");
    let _ = writeln!(
        out,
        "PAPER TRADING LAB - {} - tick {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        view.tick
    );
    let _ = writeln!(out, "{bar}\n");

    if view.bots.is_empty() {
        let _ = writeln!(out, "No bots loaded. Set BOTS=kind[@SYMBOL],... (e.g. trend_follower,random_trader)");
        return out;
    }

    let _ = writeln!(
        out,
        "{:<28} {:<8} {:>14} {:>14} {:>14} {:>14}",
        "BOT", "STATUS", "CASH", "EQUITY", "REAL_PNL", "UNREAL_PNL"
    );
    let _ = writeln!(out, "{}", "-".repeat(WIDTH));
    for b in &view.bots {
        let _ = writeln!(
            out,
            "{:<28} {:<8} {:>14} {:>14} {:>14} {:>14}",
            b.name,
            b.status.as_str(),
            format!("${}", fmt_money(b.cash)),
            format!("${}", fmt_money(b.equity)),
            fmt_pnl(b.realized_pnl),
            fmt_pnl(b.unrealized_pnl),
        );
        if !b.positions.is_empty() {
            let pos: Vec<String> = b.positions.iter().map(|(s, q)| format!("{s}: {q:.6}")).collect();
            let _ = writeln!(out, "  └─ Positions: {}", pos.join(", "));
        }
        if let Some(err) = &b.last_error {
            let short: String = err.chars().take(70).collect();
            let _ = writeln!(out, "  └─ ERROR: {short}");
        }
    }

    if !view.prices.is_empty() {
        let _ = writeln!(out, "\n{:<12} {:>14} {:>8}", "SYMBOL", "PRICE", "AGE");
        for (sym, px, ts) in &view.prices {
            let age = Duration::from_nanos((now_ns - ts).max(0) as u64);
            let flag = if age > stale_after { "  STALE" } else { "" };
            let _ = writeln!(out, "{:<12} {:>14} {:>7.1}s{flag}", sym, fmt_money(*px), age.as_secs_f64());
        }
    }

    let _ = writeln!(out, "\nCommands: p <bot_name> (pause) | r <bot_name> (resume) | q (quit)");
    out
}

/// Parses one stdin line. Unknown input gives `None`.
pub fn parse_command(line: &str) -> Option<ControlCommand> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?.to_ascii_lowercase();
    let arg = parts.next();
    match (cmd.as_str(), arg) {
        ("q" | "quit", _) => Some(ControlCommand::Quit),
        ("p" | "pause", Some(name)) => Some(ControlCommand::Pause(name.to_string())),
        ("r" | "resume", Some(name)) => Some(ControlCommand::Resume(name.to_string())),
        _ => None,
    }
}

/// Reads stdin lines on a plain OS thread. A blocking read cannot be cancelled,
/// so it stays out of the tokio runtime and dies with the process.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if tx.send(l).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed, commands disabled");
                    break;
                }
            }
        }
    });
    rx
}

/// Redraws on every published view and forwards commands read from `lines`.
/// Ends on `q` or when the scheduler drops its view sender.
pub async fn run(
    mut view_rx: watch::Receiver<DashboardView>,
    ctl_tx: mpsc::UnboundedSender<ControlCommand>,
    mut lines: mpsc::UnboundedReceiver<String>,
    stale_after: Duration,
) {
    let mut input_open = true;

    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = render(&view_rx.borrow_and_update(), now_ns(), stale_after);
                // clear screen + home
                print!("\x1b[2J\x1b[H{frame}");
                let _ = std::io::stdout().flush();
            }
            line = lines.recv(), if input_open => {
                let Some(l) = line else {
                    input_open = false;
                    continue;
                };
                match parse_command(&l) {
                    Some(cmd) => {
                        let quit = cmd == ControlCommand::Quit;
                        info!(?cmd, "dashboard command");
                        if ctl_tx.send(cmd).is_err() || quit {
                            break;
                        }
                    }
                    None if l.trim().is_empty() => {}
                    None => warn!(input = %l.trim(), "unknown command"),
                }
            }
        }
    }
}
