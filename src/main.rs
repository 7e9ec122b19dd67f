use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use spread_sniper::backtest::{calculate_statistics, BacktestEngine, MatchingBook, SimGateway};
use spread_sniper::config::EngineConfig;
use spread_sniper::engine::{spawn_timer, EngineContext, EngineMode, SniperEngine};
use spread_sniper::ports::gateway::OrderGateway;
use spread_sniper::ports::store::{JsonRecordStore, MemoryRecordStore, RecordStore};
use spread_sniper::types::ContractRegistry;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let cfg = EngineConfig::from_env()?;
    log::info!(
        "[MAIN] config loaded: gateway={} spreads={}",
        cfg.gateway,
        cfg.spreads.len()
    );

    let contracts = match &cfg.contracts_file {
        Some(path) => ContractRegistry::from_json_path(path)?,
        None => ContractRegistry::new(),
    };
    if contracts.is_empty() {
        log::warn!("[MAIN] contract registry is empty; all spreads will be skipped");
    } else {
        log::info!("[MAIN] {} contracts loaded", contracts.len());
    }

    if cfg.backtest.is_some() {
        log::info!("[MAIN] running in backtest mode");
        let mut engine = BacktestEngine::from_config(cfg, contracts)?;
        engine.run().await?;
        let daily = engine.calculate_result();
        let stats = calculate_statistics(&daily, engine.capital);
        log::info!(
            "[MAIN] backtest finished: net_pnl={:.6} sharpe={:.4}",
            stats.total_net_pnl,
            stats.sharpe_ratio
        );
        return Ok(());
    }

    log::info!("[MAIN] running in live mode");
    let store: Arc<dyn RecordStore> = match &cfg.store_file {
        Some(path) => Arc::new(JsonRecordStore::open(path)?),
        None => Arc::new(MemoryRecordStore::new()),
    };
    let gateway: Arc<dyn OrderGateway> = match cfg.gateway.as_str() {
        "sim" => {
            let book = Arc::new(Mutex::new(MatchingBook::recover(store.as_ref())?));
            Arc::new(SimGateway::new(book, store.clone()))
        }
        other => return Err(anyhow!("unsupported gateway: {}", other)),
    };
    let ctx = EngineContext {
        gateway,
        store,
        contracts,
    };

    let timer_secs = cfg.timer_secs;
    let (sender, receiver) = mpsc::unbounded_channel();
    // Feed adapters publish market-data/order/position events through
    // clones of this sender; the timer is just another producer.
    let _timer = spawn_timer(sender.clone(), Duration::from_secs(timer_secs));

    let mut engine = SniperEngine::new(ctx, cfg, EngineMode::Live);
    engine.start().await?;
    engine.run(receiver).await;
    Ok(())
}
