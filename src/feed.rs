// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters (semua menulis ke PriceHub):
// - run_mock      : random-walk generator per symbol (~4 updates/s)
// - run_binance   : Binance WS `@ticker` (works for Sandbox & Mainnet)
//                    pass the WS base URL from config (no hardcoded ENV)
// - run_rest_poll : Binance REST `/api/v3/ticker/price`, polled
//
// Semua task berhenti saat `shutdown` watch berubah ke true.
//
use futures_util::StreamExt; // for .next()
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::now_ns;
use crate::price_hub::PriceHub;

/// Resolves when the shutdown flag is raised or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Starting price for the mock random walk.
pub fn mock_start_price(symbol: &str) -> f64 {
    match symbol {
        s if s.starts_with("BTC") => 60_000.0,
        s if s.starts_with("ETH") => 3_000.0,
        s if s.starts_with("SOL") => 150.0,
        _ => 100.0,
    }
}

/// Generator market data mock (random walk, ±0.1% per step)
pub async fn run_mock(hub: Arc<PriceHub>, symbol: String, mut shutdown: watch::Receiver<bool>) {
    let mut px = mock_start_price(&symbol);
    info!(%symbol, start = px, "mock feed started");
    loop {
        // jangan simpan ThreadRng melewati .await
        let step: f64 = rand::thread_rng().gen_range(-0.001..=0.001);
        px = (px * (1.0 + step)).max(0.01);
        hub.update(&symbol, px, now_ns());

        tokio::select! {
            _ = sleep(Duration::from_millis(250)) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    info!(%symbol, "mock feed stopped");
}

/// Extracts `(symbol, last price, event time ns)` from a `@ticker` frame.
///
/// Contoh payload (dipotong):
/// `{"e":"24hrTicker","E":1672515782136,"s":"BNBBTC","c":"0.00250000",...}`
///
/// Falls back to local receive time when `E` is missing.
pub fn parse_ticker(txt: &str) -> Option<(String, f64, i128)> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    let symbol = v.get("s")?.as_str()?.to_ascii_uppercase();
    let price: f64 = v.get("c")?.as_str()?.parse().ok()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let ts = v
        .get("E")
        .and_then(|x| x.as_i64())
        .map(|ms| ms as i128 * 1_000_000)
        .unwrap_or_else(now_ns);
    Some((symbol, price, ts))
}

/// Exponential backoff + jitter: 0.5s, 1s, 2s ... capped at 32s.
fn backoff_ms(attempt: u32) -> u64 {
    let shift = attempt.min(6);                  // 0..=6
    let factor = 1u64 << shift;                  // 1,2,4,...,64
    let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
    base_ms + rand::thread_rng().gen_range(0..=250)
}

/// Adapter ke Binance WS (read-only) untuk harga terakhir (`@ticker`, field `c`)
///
/// - `ws_base` diteruskan dari config:
///     * Sandbox: wss://testnet.binance.vision/ws
///     * Mainnet: wss://stream.binance.com:9443/ws
/// - `symbol` adalah domain symbol (mis. "BTCUSDT"), lower-case saat susun topic.
pub async fn run_binance(
    hub: Arc<PriceHub>,
    symbol: String,
    ws_base: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = format!("{}@ticker", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    'outer: loop {
        info!(%ws_url, "connecting binance ticker");
        let connected = tokio::select! {
            r = connect_async(url.clone()) => r,
            _ = stopped(&mut shutdown) => break 'outer,
        };
        match connected {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to ticker stream");
                attempt = 0; // reset backoff

                loop {
                    let frame = tokio::select! {
                        f = ws.next() => Some(f),
                        _ = stopped(&mut shutdown) => None,
                    };
                    let Some(frame) = frame else {
                        let _ = ws.close(None).await;
                        break 'outer;
                    };
                    match frame {
                        Some(Ok(m)) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_ticker(&txt) {
                                Some((_, px, ts)) => {
                                    hub.update(&symbol, px, ts);
                                    debug!(%symbol, px, "ticker");
                                }
                                None => warn!(%symbol, frame = %txt, "unparseable ticker frame"),
                            }
                        }
                        Some(Ok(_)) => {
                            // ignore non-text frames (ping/pong dijawab tungstenite)
                        }
                        Some(Err(e)) => {
                            error!(?e, %symbol, "ws read error");
                            break;
                        }
                        None => break,
                    }
                }
                info!(%symbol, "ticker disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, %symbol, "connect failed");
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = sleep(Duration::from_millis(backoff_ms(attempt))) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    info!(%symbol, "binance feed stopped");
}

#[derive(Debug, Deserialize)]
struct RestTicker {
    symbol: String,
    price: String,
}

/// Parses a `/api/v3/ticker/price` body (array form).
pub fn parse_rest_prices(body: &str) -> Result<Vec<(String, f64)>, serde_json::Error> {
    let rows: Vec<RestTicker> = serde_json::from_str(body)?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.price.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0).map(|p| (r.symbol, p)))
        .collect())
}

/// Polls Binance REST for all `symbols` in one request every `every`.
pub async fn run_rest_poll(
    hub: Arc<PriceHub>,
    symbols: Vec<String>,
    rest_base: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            error!(?e, "reqwest client build failed");
            return;
        }
    };
    let list = serde_json::to_string(&symbols).unwrap_or_else(|_| "[]".to_string());
    let endpoint = format!("{}/api/v3/ticker/price", rest_base.trim_end_matches('/'));
    info!(%endpoint, ?symbols, every_ms = every.as_millis() as u64, "rest poller started");

    let mut attempt: u32 = 0;
    loop {
        let fetched = async {
            let resp = client
                .get(&endpoint)
                .query(&[("symbols", list.as_str())])
                .send()
                .await?
                .error_for_status()?;
            Ok::<String, reqwest::Error>(resp.text().await?)
        };
        let wait = match fetched.await {
            Ok(body) => match parse_rest_prices(&body) {
                Ok(rows) => {
                    attempt = 0;
                    let ts = now_ns();
                    for (sym, px) in rows {
                        hub.update(&sym, px, ts);
                    }
                    every
                }
                Err(e) => {
                    warn!(?e, "bad ticker/price body");
                    every
                }
            },
            Err(e) => {
                attempt = attempt.saturating_add(1);
                error!(?e, attempt, "rest poll failed");
                Duration::from_millis(backoff_ms(attempt)).max(every)
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    info!("rest poller stopped");
}
