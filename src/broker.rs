// ===============================
// src/broker.rs (pre-trade checks + paper execution)
// ===============================
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{Order, PriceSnapshot, Side, Trade};
use crate::ledger::{LedgerAccount, QTY_EPS};
use crate::metrics::{ORDERS_REJECTED, TRADES};

/// What to do with a SELL larger than the current long position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SellPolicy {
    /// Sells may open or extend a short position.
    #[default]
    AllowShort,
    /// Sells are capped at the long size; selling while flat/short is rejected.
    CapToLong,
}

impl SellPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow_short" | "short" => Some(SellPolicy::AllowShort),
            "cap_to_long" | "long_only" => Some(SellPolicy::CapToLong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("invalid size")]
    InvalidSize,
    #[error("no price for symbol")]
    UnknownSymbol,
    #[error("no long position to sell")]
    NoPosition,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::InsufficientFunds => "insufficient_funds",
            RejectReason::InvalidSize => "invalid_size",
            RejectReason::UnknownSymbol => "unknown_symbol",
            RejectReason::NoPosition => "no_position",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection { pub bot_name: String, pub order: Order, pub reason: RejectReason }

#[derive(Debug, Clone, Copy, Default)]
pub struct Broker { pub sell_policy: SellPolicy }

impl Broker {
    pub fn new(sell_policy: SellPolicy) -> Self { Self { sell_policy } }

    /// Pre-trade checks. Returns the size that will actually be filled.
    fn check(&self, account: &LedgerAccount, order: &Order, price: f64) -> Result<f64, RejectReason> {
        // 1) size
        if !order.size.is_finite() || order.size <= 0.0 {
            return Err(RejectReason::InvalidSize);
        }
        // 2) usable mark
        if !price.is_finite() || price <= 0.0 {
            return Err(RejectReason::UnknownSymbol);
        }
        match order.side {
            // 3) cash
            Side::Buy => {
                if price * order.size > account.cash {
                    return Err(RejectReason::InsufficientFunds);
                }
                Ok(order.size)
            }
            // 4) sell policy
            Side::Sell => match self.sell_policy {
                SellPolicy::AllowShort => Ok(order.size),
                SellPolicy::CapToLong => {
                    let long = account.position(&order.symbol);
                    if long < QTY_EPS {
                        return Err(RejectReason::NoPosition);
                    }
                    Ok(order.size.min(long))
                }
            },
        }
    }

    /// Executes one market order at `price`. On rejection the account is untouched.
    pub fn execute(
        &self,
        account: &mut LedgerAccount,
        bot_name: &str,
        order: &Order,
        price: f64,
        time: f64,
    ) -> Result<Trade, RejectReason> {
        let size = self.check(account, order, price)?;
        let fill = account.apply_fill(&order.symbol, order.side, size, price);

        info!(
            bot = %bot_name,
            symbol = %order.symbol,
            side = order.side.as_str(),
            size,
            price,
            realized = fill.realized,
            cash = account.cash,
            "FILLED"
        );
        TRADES.with_label_values(&[bot_name]).inc();

        Ok(Trade {
            time,
            bot_name: bot_name.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            size,
            price,
            cash_after: account.cash,
            position_after: fill.position_after,
        })
    }

    /// Executes `orders` in submission order against the tick snapshot.
    pub fn execute_batch(
        &self,
        account: &mut LedgerAccount,
        bot_name: &str,
        orders: Vec<Order>,
        prices: &PriceSnapshot,
        time: f64,
    ) -> (Vec<Trade>, Vec<Rejection>) {
        let mut trades = Vec::with_capacity(orders.len());
        let mut rejections = Vec::new();
        for order in orders {
            let result = match prices.price(&order.symbol) {
                Some(px) => self.execute(account, bot_name, &order, px, time),
                None => Err(RejectReason::UnknownSymbol),
            };
            match result {
                Ok(t) => trades.push(t),
                Err(reason) => {
                    warn!(
                        bot = %bot_name,
                        symbol = %order.symbol,
                        side = order.side.as_str(),
                        size = order.size,
                        %reason,
                        "REJECT"
                    );
                    ORDERS_REJECTED.with_label_values(&[reason.label()]).inc();
                    rejections.push(Rejection { bot_name: bot_name.to_string(), order, reason });
                }
            }
        }
        (trades, rejections)
    }
}
