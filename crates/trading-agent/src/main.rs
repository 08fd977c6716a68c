use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::SignalKind;
use tokio::time;

mod agent;
mod config;
mod signals;
mod sim_gateway;

use agent::Agent;
use config::AgentConfig;
use sim_gateway::SimulatedGateway;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting FunnelTrader agent");

    // 2. Load configuration; contradictory budgets or ladders abort here.
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!(
        "  API budget: {}/min × {} buffer = {} usable",
        config.max_requests_per_minute,
        config.rate_limit_buffer,
        config.budget_config().global_cap()
    );
    tracing::info!(
        "  Funnel: {} broad results, {} deep dives, every {}s",
        config.max_broad_scan_results,
        config.deep_dive_candidates,
        config.funnel_interval_seconds
    );
    tracing::info!(
        "  Watchlist: max {} entries, min score {:.2}",
        config.max_watchlist_size,
        config.min_opportunity_score
    );
    tracing::info!(
        "  Risk: {}% per position, {}% portfolio, {}% daily drawdown, ladder '{}'",
        config.max_position_risk_pct,
        config.max_portfolio_risk_pct,
        config.max_daily_drawdown_pct,
        config.profit_ladder
    );
    tracing::info!(
        "  Lifecycle: scan every {}s, stale after {}s",
        config.lifecycle_interval_seconds,
        config.stale_order_threshold_seconds
    );
    if !config.trading_enabled {
        tracing::warn!("TRADING_ENABLED=false, discovery only, no orders will be placed");
    }

    // 3. Gateway. Transport concerns (sessions, retries, backoff) live
    // behind this trait; the simulated gateway runs the engine end to end
    // with deterministic synthetic data.
    let gateway = SimulatedGateway::new();
    tracing::info!("Simulated brokerage gateway ready");

    let funnel_period = Duration::from_secs(config.funnel_interval_seconds);
    let lifecycle_period = Duration::from_secs(config.lifecycle_interval_seconds);

    let mut agent = Agent::new(config)?;
    tracing::info!("Agent initialized, entering control loop");

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut funnel_interval = time::interval(funnel_period);
    let mut lifecycle_interval = time::interval(lifecycle_period);
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = funnel_interval.tick() => {
                // A cycle that overruns its period is truncated, not
                // extended; whatever it missed is reconsidered next time.
                match time::timeout(funnel_period, agent.funnel_cycle(&gateway)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("funnel cycle failed: {e:#}"),
                    Err(_) => tracing::warn!("funnel cycle truncated at {funnel_period:?}"),
                }
            }
            _ = lifecycle_interval.tick() => {
                match time::timeout(lifecycle_period, agent.lifecycle_cycle(&gateway)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("lifecycle scan failed: {e:#}"),
                    Err(_) => tracing::warn!("lifecycle scan truncated at {lifecycle_period:?}"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                let usage = agent.scheduler.usage();
                tracing::info!(
                    global_consumed = usage.global_consumed,
                    global_cap = usage.global_cap,
                    watchlist = agent.watchlist_len(),
                    "final state"
                );
                break;
            }
        }
    }

    tracing::info!("Agent shut down.");
    Ok(())
}
