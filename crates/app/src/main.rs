mod user_strategies;

use std::collections::BTreeSet;
use std::sync::Arc;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;
use universe_lib::engine_core::config::EngineConfig;
use universe_lib::engine_core::engine::UniverseEngine;
use universe_lib::universes::catalog::SelectorCatalog;
use universe_lib::universes::inbuilt::r#static::MonthlyChainProvider;
use crate::user_strategies::put_selection::{demo_config, PutSelectionMonitor};
use crate::user_strategies::synthetic_feed::SyntheticFeed;

/// ------------------------------
/// main: build engine + replay a few days
/// ------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1) Configuration: $UNIVERSE_CONFIG if given, the demo book otherwise
    let mut cfg = EngineConfig::from_env()?;
    if cfg.universes.is_empty() {
        // keep the env overrides already applied to `cfg`
        let mut demo = demo_config();
        demo.provider_timeout_ms = cfg.provider_timeout_ms;
        demo.time_zone = cfg.time_zone.clone();
        cfg = demo;
    }
    let catalog = Arc::new(SelectorCatalog::with_defaults());
    cfg.validate(&catalog)?;

    // 2) Provider: synthetic monthly chains around each root's spot
    let provider = Arc::new(MonthlyChainProvider::new(6, dec!(2.5), 4));
    let mut feed = SyntheticFeed::new([("TWX", dec!(70)), ("AAPL", dec!(100))]);

    // 3) Engine on a simulated clock
    let start = Utc.with_ymd_and_hms(2014, 6, 4, 0, 0, 0).single().ok_or_else(|| anyhow::anyhow!("bad start"))?;
    let end = start + Duration::days(6);
    let mut engine = UniverseEngine::from_config(&cfg, start, provider.clone(), catalog)?;

    // 4) Listeners
    let monitor = PutSelectionMonitor::new();
    for u in &cfg.universes {
        monitor.watch(engine.hub(), &u.root);
    }
    monitor.watch_correlation(engine.hub());

    // 5) Replay hourly
    let mut now = start;
    while now <= end {
        let held: BTreeSet<_> = engine
            .active_roots()
            .iter()
            .flat_map(|r| engine.active_set(r))
            .collect();
        let batch = feed.next_batch(now, &held);
        for u in &cfg.universes {
            if let Some(px) = feed.price(&u.root) {
                provider.set_spot(&u.root, px);
            }
        }
        engine.on_data_batch(&batch);

        let report = engine.on_tick(now).await?;
        for e in &report.errors {
            tracing::warn!(%now, error=%e, "tick error");
        }
        now += Duration::hours(1);
    }

    // let the listeners drain before reporting
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for u in &cfg.universes {
        tracing::info!(root=%u.root, held=?monitor.held(&u.root), "final holdings");
    }
    let snapshot = engine.snapshot();
    tracing::info!(
        clock=%snapshot.clock,
        universes=snapshot.universes.len(),
        pending=snapshot.pending.len(),
        "final snapshot"
    );
    tracing::debug!(json=%snapshot.to_json()?, "snapshot");
    monitor.stop();
    Ok(())
}
