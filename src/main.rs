// =============================================================================
// Meridian HK Warrant Engine — Main Entry Point
// =============================================================================
//
// Intraday CBBC engine for HK underlyings: per-monitor LONG/SHORT warrant
// seats, tick-driven indicator pipeline, rule-based signals with delayed
// verification, risk-gated execution and close-of-day protection.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod auto_symbol;
mod broker;
mod config;
mod doomsday;
mod engine;
mod guards;
mod hk_time;
mod indicators;
mod journal;
mod market_data;
mod pipeline;
mod processor;
mod recorder;
mod registry;
mod scheduler;
mod signal;
mod strategy;
mod trader;
mod types;
mod verifier;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::client::{GatewayCredentials, LongportGateway};
use crate::broker::{push, QuoteGateway, TradeGateway};
use crate::config::AppConfig;
use crate::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian HK Warrant Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MERIDIAN_CONFIG").ok())
        .unwrap_or_else(|| "meridian_config.json".to_string());

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("cannot start without a valid config ({config_path})"))?;

    if config.monitors.is_empty() {
        warn!("no monitors configured — the engine will idle");
    }
    info!(
        monitors = config.monitors.len(),
        doomsday = config.global.doomsday_protection,
        trading_order_type = %config.global.trading_order_type,
        "engine config ready"
    );

    // ── 2. Brokerage gateway ─────────────────────────────────────────────
    let creds = GatewayCredentials {
        app_key: std::env::var("LONGPORT_APP_KEY").unwrap_or_default(),
        app_secret: std::env::var("LONGPORT_APP_SECRET").unwrap_or_default(),
        access_token: std::env::var("LONGPORT_ACCESS_TOKEN").unwrap_or_default(),
    };
    if creds.app_key.is_empty() || creds.access_token.is_empty() {
        warn!("broker credentials missing — gateway calls will be rejected upstream");
    }
    let gateway = Arc::new(LongportGateway::new(creds));

    // ── 3. Build and initialise the engine ───────────────────────────────
    let engine = Engine::new(
        config,
        gateway.clone() as Arc<dyn QuoteGateway>,
        gateway.clone() as Arc<dyn TradeGateway>,
    )?;
    engine.init().await.context("engine initialisation failed")?;

    // ── 4. Push session (supervised reconnect) ───────────────────────────
    let push_handle = push::spawn_supervised(gateway.clone());

    // ── 5. Workers + tick loop ───────────────────────────────────────────
    engine.start_workers();

    let loop_engine = engine.clone();
    let loop_handle = tokio::spawn(async move { loop_engine.run().await });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    engine.request_shutdown();
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "tick loop join error");
    }
    engine.stop_workers().await;
    push_handle.abort();

    info!("Meridian engine shut down complete.");
    Ok(())
}
