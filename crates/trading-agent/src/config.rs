use anyhow::{bail, Result};
use budget_scheduler::BudgetConfig;
use chrono::Duration;
use opportunity_funnel::FunnelConfig;
use order_lifecycle::LifecycleConfig;
use risk_engine::{ProfitLadder, RiskParameters};
use serde::{Deserialize, Serialize};
use std::env;
use watchlist_manager::WatchlistConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // API budget (per minute)
    pub max_requests_per_minute: u32,
    pub rate_limit_buffer: f64,
    pub broad_scan_quota: u32,
    pub deep_dive_quota: u32,
    pub trade_execution_quota: u32,
    pub position_monitoring_quota: u32,
    pub emergency_reserve_quota: u32,

    // Funnel
    pub max_broad_scan_results: usize,
    pub deep_dive_candidates: usize,
    pub funnel_min_price: f64,
    pub funnel_max_price: f64,
    pub funnel_min_day_volume: i64,
    pub funnel_max_spread_pct: f64,
    pub enable_technicals: bool,
    pub enable_news: bool,
    pub enable_options_flow: bool,
    pub degraded_penalty: f64,

    // Watchlist
    pub max_watchlist_size: usize,
    pub min_opportunity_score: f64,
    pub addition_margin: f64,
    pub momentum_decay_threshold: f64,
    pub volume_decline_threshold: f64,
    pub watchlist_max_age_hours: i64,

    // Risk
    pub max_position_risk_pct: f64,
    pub min_position_size_pct: f64,
    pub max_position_size_pct: f64,
    pub max_portfolio_risk_pct: f64,
    pub max_daily_drawdown_pct: f64,
    pub max_position_loss_pct: f64,
    pub trailing_stop_activation_pct: f64,
    pub trailing_stop_distance_pct: f64,
    pub max_position_age_days: i64,
    pub max_position_hold_days: i64,
    /// "aggressive" (10/20/30) or "stepped" (5/8/12/20).
    pub profit_ladder: String,
    /// Initial protective stop distance below entry, percent.
    pub entry_stop_pct: f64,
    /// Target notional per new entry, percent of equity.
    pub target_position_size_pct: f64,
    /// Apply the regime profile's per-position cap on top of the notional
    /// bounds. The standard profile caps suit multi-position books; leave
    /// off for a concentrated account.
    pub apply_regime_position_cap: bool,
    pub max_entries_per_cycle: usize,

    // Lifecycle
    pub stale_order_threshold_seconds: i64,

    // Cadences
    pub funnel_interval_seconds: u64,
    pub lifecycle_interval_seconds: u64,
    pub regime_interval_seconds: i64,

    pub enforce_market_hours: bool,
    pub trading_enabled: bool,
}

fn parsed<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            max_requests_per_minute: parsed("MAX_REQUESTS_PER_MINUTE", "200")?,
            rate_limit_buffer: parsed("RATE_LIMIT_BUFFER", "0.85")?,
            broad_scan_quota: parsed("BROAD_SCAN_QUOTA", "25")?,
            deep_dive_quota: parsed("DEEP_DIVE_QUOTA", "50")?,
            trade_execution_quota: parsed("TRADE_EXECUTION_QUOTA", "35")?,
            position_monitoring_quota: parsed("POSITION_MONITORING_QUOTA", "40")?,
            emergency_reserve_quota: parsed("EMERGENCY_RESERVE_QUOTA", "20")?,

            max_broad_scan_results: parsed("MAX_BROAD_SCAN_RESULTS", "500")?,
            deep_dive_candidates: parsed("DEEP_DIVE_CANDIDATES", "100")?,
            funnel_min_price: parsed("FUNNEL_MIN_PRICE", "5.0")?,
            funnel_max_price: parsed("FUNNEL_MAX_PRICE", "10000.0")?,
            funnel_min_day_volume: parsed("FUNNEL_MIN_DAY_VOLUME", "500000")?,
            funnel_max_spread_pct: parsed("FUNNEL_MAX_SPREAD_PCT", "1.0")?,
            enable_technicals: parsed("ENABLE_TECHNICALS", "true")?,
            enable_news: parsed("ENABLE_NEWS", "true")?,
            enable_options_flow: parsed("ENABLE_OPTIONS_FLOW", "true")?,
            degraded_penalty: parsed("DEGRADED_PENALTY", "0.85")?,

            max_watchlist_size: parsed("MAX_WATCHLIST_SIZE", "25")?,
            min_opportunity_score: parsed("MIN_OPPORTUNITY_SCORE", "0.6")?,
            addition_margin: parsed("ADDITION_MARGIN", "0.05")?,
            momentum_decay_threshold: parsed("MOMENTUM_DECAY_THRESHOLD", "0.5")?,
            volume_decline_threshold: parsed("VOLUME_DECLINE_THRESHOLD", "0.7")?,
            watchlist_max_age_hours: parsed("WATCHLIST_MAX_AGE_HOURS", "2")?,

            max_position_risk_pct: parsed("MAX_POSITION_RISK_PCT", "3.0")?,
            min_position_size_pct: parsed("MIN_POSITION_SIZE_PCT", "25.0")?,
            max_position_size_pct: parsed("MAX_POSITION_SIZE_PCT", "40.0")?,
            max_portfolio_risk_pct: parsed("MAX_PORTFOLIO_RISK_PCT", "12.0")?,
            max_daily_drawdown_pct: parsed("MAX_DAILY_DRAWDOWN_PCT", "6.0")?,
            max_position_loss_pct: parsed("MAX_POSITION_LOSS_PCT", "-5.0")?,
            trailing_stop_activation_pct: parsed("TRAILING_STOP_ACTIVATION_PCT", "8.0")?,
            trailing_stop_distance_pct: parsed("TRAILING_STOP_DISTANCE_PCT", "4.0")?,
            max_position_age_days: parsed("MAX_POSITION_AGE_DAYS", "2")?,
            max_position_hold_days: parsed("MAX_POSITION_HOLD_DAYS", "30")?,
            profit_ladder: env::var("PROFIT_LADDER").unwrap_or_else(|_| "aggressive".to_string()),
            entry_stop_pct: parsed("ENTRY_STOP_PCT", "4.0")?,
            target_position_size_pct: parsed("TARGET_POSITION_SIZE_PCT", "30.0")?,
            apply_regime_position_cap: parsed("APPLY_REGIME_POSITION_CAP", "false")?,
            max_entries_per_cycle: parsed("MAX_ENTRIES_PER_CYCLE", "2")?,

            stale_order_threshold_seconds: parsed("STALE_ORDER_THRESHOLD_SECONDS", "120")?,

            funnel_interval_seconds: parsed("FUNNEL_INTERVAL_SECONDS", "300")?,
            lifecycle_interval_seconds: parsed("LIFECYCLE_INTERVAL_SECONDS", "30")?,
            regime_interval_seconds: parsed("REGIME_INTERVAL_SECONDS", "900")?,

            enforce_market_hours: parsed("ENFORCE_MARKET_HOURS", "true")?,
            trading_enabled: parsed("TRADING_ENABLED", "true")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Contradictory configuration is a startup error, never a runtime
    /// surprise.
    pub fn validate(&self) -> Result<()> {
        self.budget_config().validate()?;
        self.risk_parameters()?.validate()?;
        if self.stale_order_threshold_seconds <= 0 {
            bail!(
                "STALE_ORDER_THRESHOLD_SECONDS must be positive, got {}",
                self.stale_order_threshold_seconds
            );
        }
        if self.lifecycle_interval_seconds >= self.funnel_interval_seconds {
            bail!(
                "lifecycle scan interval ({}s) must be shorter than the funnel cycle ({}s)",
                self.lifecycle_interval_seconds,
                self.funnel_interval_seconds
            );
        }
        if self.max_watchlist_size == 0 {
            bail!("MAX_WATCHLIST_SIZE must be at least 1");
        }
        Ok(())
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_requests_per_minute: self.max_requests_per_minute,
            rate_limit_buffer: self.rate_limit_buffer,
            broad_scan_quota: self.broad_scan_quota,
            deep_dive_quota: self.deep_dive_quota,
            trade_execution_quota: self.trade_execution_quota,
            position_monitoring_quota: self.position_monitoring_quota,
            emergency_reserve_quota: self.emergency_reserve_quota,
        }
    }

    pub fn funnel_config(&self) -> FunnelConfig {
        FunnelConfig {
            max_broad_scan_results: self.max_broad_scan_results,
            deep_dive_candidates: self.deep_dive_candidates,
            min_price: self.funnel_min_price,
            max_price: self.funnel_max_price,
            min_day_volume: self.funnel_min_day_volume,
            max_spread_pct: self.funnel_max_spread_pct,
            enable_technicals: self.enable_technicals,
            enable_news: self.enable_news,
            enable_options_flow: self.enable_options_flow,
            degraded_penalty: self.degraded_penalty,
        }
    }

    pub fn watchlist_config(&self) -> WatchlistConfig {
        WatchlistConfig {
            max_size: self.max_watchlist_size,
            min_opportunity_score: self.min_opportunity_score,
            addition_margin: self.addition_margin,
            momentum_decay_threshold: self.momentum_decay_threshold,
            volume_decline_threshold: self.volume_decline_threshold,
            prune_on_technical_breakdown: true,
            max_age: Duration::hours(self.watchlist_max_age_hours),
        }
    }

    pub fn risk_parameters(&self) -> Result<RiskParameters> {
        let ladder = match self.profit_ladder.as_str() {
            "aggressive" => ProfitLadder::aggressive(),
            "stepped" => ProfitLadder::stepped(),
            other => bail!("unknown PROFIT_LADDER '{other}' (expected aggressive or stepped)"),
        };
        Ok(RiskParameters {
            max_position_risk_pct: self.max_position_risk_pct,
            min_position_size_pct: self.min_position_size_pct,
            max_position_size_pct: self.max_position_size_pct,
            max_portfolio_risk_pct: self.max_portfolio_risk_pct,
            max_daily_drawdown_pct: self.max_daily_drawdown_pct,
            max_position_loss_pct: self.max_position_loss_pct,
            trailing_stop_activation_pct: self.trailing_stop_activation_pct,
            trailing_stop_distance_pct: self.trailing_stop_distance_pct,
            max_position_age_days: self.max_position_age_days,
            max_position_hold_days: self.max_position_hold_days,
            profit_ladder: ladder,
        })
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            stale_order_threshold: Duration::seconds(self.stale_order_threshold_seconds),
        }
    }

    pub fn regime_cadence(&self) -> Duration {
        Duration::seconds(self.regime_interval_seconds)
    }
}
