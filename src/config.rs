use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Timelike, Weekday};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::ports::gateway::is_known_gateway;
use crate::sniper::resolve_algo_factory;

const DEFAULT_GATEWAY: &str = "sim";
const DEFAULT_TIMER_SECS: u64 = 1;
const DEFAULT_QUOTE_INTERVAL: u32 = 16;
const DEFAULT_ALGO_TAG: &str = "sniper";
const DEFAULT_ROLLOVER_WEEKDAY: Weekday = Weekday::Fri;
const DEFAULT_UNWIND_HOUR: u32 = 15;
const DEFAULT_UNWIND_MINUTE: u32 = 30;
const DEFAULT_RESTART_HOUR: u32 = 16;
const DEFAULT_RESTART_MINUTE: u32 = 40;
const DEFAULT_COMMISSION_RATE: f64 = 0.0003;
const DEFAULT_SLIPPAGE: f64 = 0.0;
const DEFAULT_CONTRACT_SIZE: f64 = 100.0;
const DEFAULT_CAPITAL: f64 = 1.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct EngineYaml {
    gateway: Option<String>,
    contracts_file: Option<String>,
    store_file: Option<String>,
    timer_secs: Option<u64>,
    quote_interval: Option<u32>,
    rollover: Option<RolloverYaml>,
    spreads: Vec<SpreadYaml>,
    backtest: Option<BacktestYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct RolloverYaml {
    weekday: Option<String>,
    unwind_hour: Option<u32>,
    unwind_minute: Option<u32>,
    restart_hour: Option<u32>,
    restart_minute: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct SpreadYaml {
    name: String,
    buy_percent: Decimal,
    sell_percent: Decimal,
    short_percent: Decimal,
    cover_percent: Decimal,
    active_payup: u32,
    passive_payup: u32,
    max_order_size: Decimal,
    max_pos_size: Decimal,
    algo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BacktestYaml {
    rate: Option<f64>,
    slippage: Option<f64>,
    size: Option<f64>,
    capital: Option<f64>,
    tick_files: HashMap<String, String>,
}

/// One spread definition resolved from configuration. The name encodes the
/// two instruments as `<active>+<passive>`.
#[derive(Debug, Clone)]
pub struct SpreadSetting {
    pub name: String,
    pub active_instrument: String,
    pub passive_instrument: String,
    pub buy_percent: Decimal,
    pub sell_percent: Decimal,
    pub short_percent: Decimal,
    pub cover_percent: Decimal,
    pub active_payup: u32,
    pub passive_payup: u32,
    pub max_order_size: Decimal,
    pub max_pos_size: Decimal,
    pub algo_tag: String,
}

/// Scheduled rollover window: entries are suppressed and positions unwound
/// once the unwind window opens; the engine rebuilds after the restart
/// window is reached.
#[derive(Debug, Clone)]
pub struct RolloverConfig {
    pub weekday: Weekday,
    pub unwind_hour: u32,
    pub unwind_minute: u32,
    pub restart_hour: u32,
    pub restart_minute: u32,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            weekday: DEFAULT_ROLLOVER_WEEKDAY,
            unwind_hour: DEFAULT_UNWIND_HOUR,
            unwind_minute: DEFAULT_UNWIND_MINUTE,
            restart_hour: DEFAULT_RESTART_HOUR,
            restart_minute: DEFAULT_RESTART_MINUTE,
        }
    }
}

impl RolloverConfig {
    pub fn in_unwind_window<T: Datelike + Timelike>(&self, dt: &T) -> bool {
        dt.weekday() == self.weekday
            && dt.hour() == self.unwind_hour
            && dt.minute() > self.unwind_minute
    }

    pub fn in_restart_window<T: Datelike + Timelike>(&self, dt: &T) -> bool {
        dt.weekday() == self.weekday
            && dt.hour() == self.restart_hour
            && dt.minute() >= self.restart_minute
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub rate: f64,
    pub slippage: f64,
    pub size: f64,
    pub capital: f64,
    /// instrument symbol -> JSONL tick dump path
    pub tick_files: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gateway: String,
    pub contracts_file: Option<String>,
    pub store_file: Option<String>,
    pub timer_secs: u64,
    pub quote_interval: u32,
    pub rollover: RolloverConfig,
    pub spreads: Vec<SpreadSetting>,
    pub backtest: Option<BacktestConfig>,
    /// Where this config was loaded from; rollover restarts reload it.
    pub source_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let path = env::var("SPREAD_SNIPER_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("SPREAD_SNIPER_CONFIG must point at a config file"))?;
        Self::from_yaml_path(path)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: EngineYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.source_path = Some(path_ref.to_path_buf());
        Ok(cfg)
    }

    fn from_yaml(yaml: EngineYaml) -> Result<Self> {
        let gateway = yaml.gateway.unwrap_or_else(|| DEFAULT_GATEWAY.to_string());
        if !is_known_gateway(&gateway) {
            return Err(anyhow!("unknown gateway tag: {}", gateway));
        }

        let rollover = match yaml.rollover {
            Some(r) => {
                let weekday = match r.weekday {
                    Some(raw) => raw
                        .parse::<Weekday>()
                        .map_err(|_| anyhow!("invalid rollover weekday: {}", raw))?,
                    None => DEFAULT_ROLLOVER_WEEKDAY,
                };
                RolloverConfig {
                    weekday,
                    unwind_hour: r.unwind_hour.unwrap_or(DEFAULT_UNWIND_HOUR),
                    unwind_minute: r.unwind_minute.unwrap_or(DEFAULT_UNWIND_MINUTE),
                    restart_hour: r.restart_hour.unwrap_or(DEFAULT_RESTART_HOUR),
                    restart_minute: r.restart_minute.unwrap_or(DEFAULT_RESTART_MINUTE),
                }
            }
            None => RolloverConfig::default(),
        };

        if yaml.spreads.is_empty() {
            return Err(anyhow!("config defines no spreads"));
        }
        let mut spreads = Vec::with_capacity(yaml.spreads.len());
        for entry in yaml.spreads {
            spreads.push(resolve_spread(entry)?);
        }

        let backtest = yaml.backtest.map(|b| BacktestConfig {
            rate: b.rate.unwrap_or(DEFAULT_COMMISSION_RATE),
            slippage: b.slippage.unwrap_or(DEFAULT_SLIPPAGE),
            size: b.size.unwrap_or(DEFAULT_CONTRACT_SIZE),
            capital: b.capital.unwrap_or(DEFAULT_CAPITAL),
            tick_files: b.tick_files,
        });

        Ok(Self {
            gateway,
            contracts_file: yaml.contracts_file,
            store_file: yaml.store_file,
            timer_secs: yaml.timer_secs.unwrap_or(DEFAULT_TIMER_SECS),
            quote_interval: yaml.quote_interval.unwrap_or(DEFAULT_QUOTE_INTERVAL),
            rollover,
            spreads,
            backtest,
            source_path: None,
        })
    }

    /// All instruments referenced by the configured spreads, deduplicated.
    pub fn instruments(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for spread in &self.spreads {
            for instrument in [&spread.active_instrument, &spread.passive_instrument] {
                if seen.insert(instrument.clone()) {
                    out.push(instrument.clone());
                }
            }
        }
        out
    }
}

fn resolve_spread(entry: SpreadYaml) -> Result<SpreadSetting> {
    let parts: Vec<&str> = entry.name.split('+').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(anyhow!(
            "spread name must be <active>+<passive>: {}",
            entry.name
        ));
    }
    let algo_tag = entry.algo.unwrap_or_else(|| DEFAULT_ALGO_TAG.to_string());
    // Unknown algorithm tags fail loading here rather than at first use.
    resolve_algo_factory(&algo_tag)
        .with_context(|| format!("spread {} references an unknown algo", entry.name))?;

    Ok(SpreadSetting {
        active_instrument: parts[0].to_string(),
        passive_instrument: parts[1].to_string(),
        name: entry.name,
        buy_percent: entry.buy_percent,
        sell_percent: entry.sell_percent,
        short_percent: entry.short_percent,
        cover_percent: entry.cover_percent,
        active_payup: entry.active_payup,
        passive_payup: entry.passive_payup,
        max_order_size: entry.max_order_size,
        max_pos_size: entry.max_pos_size,
        algo_tag,
    })
}
