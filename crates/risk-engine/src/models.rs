use std::collections::BTreeSet;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered profit-taking ladder: unrealized-gain thresholds (percent) paired
/// with the fraction of the original position to exit at each tier.
///
/// Levels must be strictly ascending and each tier fires at most once per
/// position lifetime, so the fractions may not sum above 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitLadder {
    pub levels_pct: Vec<f64>,
    pub fractions: Vec<f64>,
}

impl ProfitLadder {
    /// Concentrated three-tier ladder: +10% / +20% / +30%.
    pub fn aggressive() -> Self {
        Self {
            levels_pct: vec![10.0, 20.0, 30.0],
            fractions: vec![0.25, 0.35, 0.40],
        }
    }

    /// Earlier, smaller steps: +5% / +8% / +12% / +20%.
    pub fn stepped() -> Self {
        Self {
            levels_pct: vec![5.0, 8.0, 12.0, 20.0],
            fractions: vec![0.20, 0.30, 0.30, 0.20],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels_pct.len() != self.fractions.len() {
            bail!(
                "profit ladder has {} levels but {} fractions",
                self.levels_pct.len(),
                self.fractions.len()
            );
        }
        if self.levels_pct.windows(2).any(|w| w[0] >= w[1]) {
            bail!("profit ladder levels must be strictly ascending");
        }
        if self.fractions.iter().any(|f| *f <= 0.0 || *f > 1.0) {
            bail!("profit ladder fractions must be in (0, 1]");
        }
        let total: f64 = self.fractions.iter().sum();
        if total > 1.0 + f64::EPSILON {
            bail!("profit ladder fractions sum to {total:.2}, exceeding the full position");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Max risk (stop distance × qty) per position, percent of equity.
    pub max_position_risk_pct: f64,
    /// Position notional bounds, percent of equity.
    pub min_position_size_pct: f64,
    pub max_position_size_pct: f64,
    /// Aggregate open risk cap, percent of equity.
    pub max_portfolio_risk_pct: f64,
    /// Daily realized+unrealized loss that trips the sizing halt.
    pub max_daily_drawdown_pct: f64,
    /// Unrealized loss forcing a close (negative, e.g. -5.0).
    pub max_position_loss_pct: f64,
    pub trailing_stop_activation_pct: f64,
    /// Distance the trailing stop sits below the high-water P&L.
    pub trailing_stop_distance_pct: f64,
    /// Forced turnover: close regardless of P&L past this age.
    pub max_position_age_days: i64,
    /// Absolute hold ceiling.
    pub max_position_hold_days: i64,
    pub profit_ladder: ProfitLadder,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_position_risk_pct: 3.0,
            min_position_size_pct: 25.0,
            max_position_size_pct: 40.0,
            max_portfolio_risk_pct: 12.0,
            max_daily_drawdown_pct: 6.0,
            max_position_loss_pct: -5.0,
            trailing_stop_activation_pct: 8.0,
            trailing_stop_distance_pct: 4.0,
            max_position_age_days: 2,
            max_position_hold_days: 30,
            profit_ladder: ProfitLadder::aggressive(),
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> Result<()> {
        if self.max_position_risk_pct <= 0.0 || self.max_position_risk_pct > 5.0 {
            bail!(
                "max_position_risk_pct {} outside sane range (0, 5]",
                self.max_position_risk_pct
            );
        }
        if self.min_position_size_pct > self.max_position_size_pct {
            bail!(
                "min_position_size_pct {} exceeds max_position_size_pct {}",
                self.min_position_size_pct,
                self.max_position_size_pct
            );
        }
        if self.max_daily_drawdown_pct <= 0.0 || self.max_daily_drawdown_pct > 10.0 {
            bail!(
                "max_daily_drawdown_pct {} outside sane range (0, 10]",
                self.max_daily_drawdown_pct
            );
        }
        if self.max_position_age_days > self.max_position_hold_days {
            bail!("max_position_age_days exceeds max_position_hold_days");
        }
        self.profit_ladder.validate()
    }
}

/// A sizing proposal to validate. All bounds are checked; violating any one
/// rejects the whole request; there is no partial sizing.
#[derive(Debug, Clone)]
pub struct SizingProposal {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_price: f64,
}

impl SizingProposal {
    pub fn stop_distance(&self) -> f64 {
        self.entry_price - self.stop_price
    }

    pub fn notional(&self) -> f64 {
        self.qty * self.entry_price
    }

    pub fn risk_amount(&self) -> f64 {
        self.qty * self.stop_distance()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SizedPosition {
    pub symbol: String,
    pub qty: f64,
    pub notional: f64,
    pub notional_pct: f64,
    pub risk_amount: f64,
}

/// Locally tracked open position state the risk engine mutates.
/// `profit_tiers_taken` makes each ladder tier fire exactly once even when
/// price oscillates across a threshold repeatedly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub unrealized_pnl_pct: f64,
    /// Best unrealized P&L seen so far; anchor for the trailing stop.
    pub high_water_pnl_pct: f64,
    pub trailing_stop_active: bool,
    /// Trailing stop level, expressed as unrealized P&L percent.
    pub trailing_stop_pnl_pct: Option<f64>,
    pub profit_tiers_taken: BTreeSet<usize>,
}

impl TrackedPosition {
    pub fn new(symbol: impl Into<String>, qty: f64, entry_price: f64, opened_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            entry_price,
            opened_at,
            unrealized_pnl_pct: 0.0,
            high_water_pnl_pct: 0.0,
            trailing_stop_active: false,
            trailing_stop_pnl_pct: None,
            profit_tiers_taken: BTreeSet::new(),
        }
    }

    /// Record the latest mark. High water only moves up.
    pub fn update_pnl(&mut self, unrealized_pnl_pct: f64) {
        self.unrealized_pnl_pct = unrealized_pnl_pct;
        if unrealized_pnl_pct > self.high_water_pnl_pct {
            self.high_water_pnl_pct = unrealized_pnl_pct;
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_days()
    }

    /// Mark a profit tier taken. Called after the scale-out order is placed;
    /// until then the tier keeps being reported on every evaluation.
    pub fn consume_tier(&mut self, tier: usize) {
        self.profit_tiers_taken.insert(tier);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ForcedTurnover,
    MaxHoldExceeded,
    StopLoss,
    TrailingStop,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ForcedTurnover => "forced_turnover",
            CloseReason::MaxHoldExceeded => "max_hold_exceeded",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TrailingStop => "trailing_stop",
        }
    }
}

/// What to do with an open position after evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PositionAction {
    Hold,
    /// Exit this fraction of the original position (ladder tier).
    ScaleOut { fraction: f64, tier: usize },
    /// New trailing stop level (P&L percent). Only ever tightens.
    TrailingStopUpdate { stop_pnl_pct: f64 },
    Close { reason: CloseReason },
}
