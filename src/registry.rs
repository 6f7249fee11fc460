// ===============================
// src/registry.rs (bot loader / factories)
// ===============================
use ahash::AHashMap as HashMap;
use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::runtime::{Bot, BotRuntime};
use crate::strategy::{MeanReversion, RandomTrader, TrendFollower};

/// One entry of `BOTS=kind[@SYMBOL],...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSpec { pub kind: String, pub symbol: String }

impl BotSpec {
    pub fn name(&self) -> String { format!("{}:{}", self.kind, self.symbol) }

    /// Parses a comma separated list; entries without `@SYMBOL` get `default_symbol`.
    pub fn parse_list(raw: &str, default_symbol: &str) -> Vec<BotSpec> {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| match t.split_once('@') {
                Some((k, s)) => BotSpec {
                    kind: k.trim().to_ascii_lowercase(),
                    symbol: s.trim().to_ascii_uppercase(),
                },
                None => BotSpec { kind: t.to_ascii_lowercase(), symbol: default_symbol.to_string() },
            })
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("unknown bot kind '{0}'")]
    UnknownKind(String),
    #[error("duplicate bot name '{0}'")]
    Duplicate(String),
    #[error("bot '{0}' declares no symbols")]
    NoSymbols(String),
}

pub type BotFactory = fn(&BotSpec) -> Result<Box<dyn Bot>, LoadError>;

pub struct BotRegistry {
    factories: HashMap<&'static str, BotFactory>,
}

fn trend_follower(spec: &BotSpec) -> Result<Box<dyn Bot>, LoadError> {
    Ok(Box::new(TrendFollower::new(spec.name(), spec.symbol.clone(), 10, 0.005)))
}

fn random_trader(spec: &BotSpec) -> Result<Box<dyn Bot>, LoadError> {
    Ok(Box::new(RandomTrader::new(spec.name(), spec.symbol.clone(), None, 0.1, 0.001)))
}

fn mean_reversion(spec: &BotSpec) -> Result<Box<dyn Bot>, LoadError> {
    // window 20 tick, edge 0.2%
    Ok(Box::new(MeanReversion::new(spec.name(), spec.symbol.clone(), 20, 0.002, 0.002)))
}

impl Default for BotRegistry {
    fn default() -> Self {
        let mut r = Self::empty();
        r.register("trend_follower", trend_follower);
        r.register("random_trader", random_trader);
        r.register("mean_reversion", mean_reversion);
        r
    }
}

impl BotRegistry {
    pub fn empty() -> Self { Self { factories: HashMap::new() } }

    pub fn register(&mut self, kind: &'static str, factory: BotFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut k: Vec<_> = self.factories.keys().copied().collect();
        k.sort_unstable();
        k
    }

    pub fn build(&self, spec: &BotSpec) -> Result<Box<dyn Bot>, LoadError> {
        let factory = self
            .factories
            .get(spec.kind.as_str())
            .ok_or_else(|| LoadError::UnknownKind(spec.kind.clone()))?;
        let bot = factory(spec)?;
        if bot.symbols().is_empty() {
            return Err(LoadError::NoSymbols(bot.name().to_string()));
        }
        Ok(bot)
    }

    /// Builds runtimes in list order. Failed entries are logged and skipped.
    pub fn load(
        &self,
        specs: &[BotSpec],
        starting_cash: f64,
        soft_deadline: Duration,
    ) -> (Vec<BotRuntime>, Vec<LoadError>) {
        let mut seen = HashSet::new();
        let mut runtimes = Vec::new();
        let mut errors = Vec::new();
        for spec in specs {
            let result = self.build(spec).and_then(|bot| {
                if seen.insert(bot.name().to_string()) {
                    Ok(bot)
                } else {
                    Err(LoadError::Duplicate(bot.name().to_string()))
                }
            });
            match result {
                Ok(bot) => {
                    info!(bot = %bot.name(), symbols = ?bot.symbols(), "bot loaded");
                    runtimes.push(BotRuntime::new(bot, starting_cash, soft_deadline));
                }
                Err(e) => {
                    error!(kind = %spec.kind, symbol = %spec.symbol, error = %e, "failed to load bot");
                    errors.push(e);
                }
            }
        }
        info!(loaded = runtimes.len(), failed = errors.len(), "bots loaded");
        (runtimes, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_applies_default_symbol() {
        let specs = BotSpec::parse_list(" trend_follower , Mean_Reversion@ethusdt,,", "BTCUSDT");
        assert_eq!(
            specs,
            vec![
                BotSpec { kind: "trend_follower".into(), symbol: "BTCUSDT".into() },
                BotSpec { kind: "mean_reversion".into(), symbol: "ETHUSDT".into() },
            ]
        );
        assert_eq!(specs[1].name(), "mean_reversion:ETHUSDT");
    }

    #[test]
    fn load_keeps_order_and_skips_bad_entries() {
        let reg = BotRegistry::default();
        let specs = BotSpec::parse_list(
            "random_trader,nope,trend_follower@ETHUSDT,random_trader",
            "BTCUSDT",
        );
        let (bots, errors) = reg.load(&specs, 1_000.0, Duration::from_millis(50));
        let names: Vec<_> = bots.iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["random_trader:BTCUSDT", "trend_follower:ETHUSDT"]);
        assert_eq!(
            errors,
            vec![
                LoadError::UnknownKind("nope".into()),
                LoadError::Duplicate("random_trader:BTCUSDT".into()),
            ]
        );
        assert_eq!(bots[0].account().cash, 1_000.0);
    }

    #[test]
    fn default_registry_knows_builtin_kinds() {
        assert_eq!(
            BotRegistry::default().kinds(),
            vec!["mean_reversion", "random_trader", "trend_follower"]
        );
    }
}
