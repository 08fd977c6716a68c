use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::*;

/// Why a sizing request was rejected. Fatal to the request, never to the
/// process: the caller simply does not open the position.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum SizingRejection {
    #[error("stop price must sit below entry price")]
    InvalidStop,

    #[error("position risk ${risk:.0} exceeds {max_pct}% of equity (${max:.0})")]
    RiskBoundExceeded { risk: f64, max: f64, max_pct: f64 },

    #[error("notional {notional_pct:.1}% of equity outside [{min_pct}%, {max_pct}%]")]
    NotionalOutOfBounds {
        notional_pct: f64,
        min_pct: f64,
        max_pct: f64,
    },

    #[error("aggregate portfolio risk ${aggregate:.0} would exceed {max_pct}% of equity")]
    PortfolioRiskExceeded { aggregate: f64, max_pct: f64 },

    #[error("daily drawdown {loss_pct:.1}% tripped the {limit_pct}% circuit breaker")]
    DrawdownHalt { loss_pct: f64, limit_pct: f64 },
}

/// Daily drawdown circuit breaker. Once tripped, all new sizing requests
/// are rejected for the remainder of the trading day; open positions keep
/// being evaluated for exits.
#[derive(Debug, Clone)]
struct DrawdownBreaker {
    day: NaiveDate,
    realized_pnl: f64,
    tripped_loss_pct: Option<f64>,
}

impl DrawdownBreaker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            realized_pnl: 0.0,
            tripped_loss_pct: None,
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.day {
            self.day = today;
            self.realized_pnl = 0.0;
            self.tripped_loss_pct = None;
        }
    }
}

pub struct RiskEngine {
    params: RiskParameters,
    breaker: DrawdownBreaker,
}

impl RiskEngine {
    pub fn new(params: RiskParameters) -> anyhow::Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            breaker: DrawdownBreaker::new(Utc::now()),
        })
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    pub fn is_halted(&self) -> bool {
        self.breaker.tripped_loss_pct.is_some()
    }

    /// Record realized P&L from a fill (scale-out or close).
    pub fn record_realized_pnl(&mut self, pnl: f64, now: DateTime<Utc>) {
        self.breaker.roll_day(now);
        self.breaker.realized_pnl += pnl;
    }

    /// Re-check the daily drawdown breaker against current account state.
    /// Returns true when trading is halted.
    pub fn check_drawdown(&mut self, equity: f64, unrealized_pnl: f64, now: DateTime<Utc>) -> bool {
        self.breaker.roll_day(now);
        if equity <= 0.0 {
            return self.is_halted();
        }
        let day_pnl = self.breaker.realized_pnl + unrealized_pnl;
        let loss_pct = -(day_pnl / equity) * 100.0;
        if loss_pct > self.params.max_daily_drawdown_pct && !self.is_halted() {
            warn!(
                loss_pct = format!("{loss_pct:.2}"),
                limit_pct = self.params.max_daily_drawdown_pct,
                "daily drawdown limit breached, halting new entries for the day"
            );
            self.breaker.tripped_loss_pct = Some(loss_pct);
        }
        self.is_halted()
    }

    /// Validate a sizing proposal against every bound. Any violation
    /// rejects the whole request; there is no partial sizing.
    ///
    /// `open_portfolio_risk` is the summed risk amount of positions already
    /// open; `regime_cap_pct` is the current regime's position cap, applied
    /// when tighter than the configured maximum.
    pub fn size_position(
        &mut self,
        equity: f64,
        proposal: &SizingProposal,
        open_portfolio_risk: f64,
        regime_cap_pct: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<SizedPosition, SizingRejection> {
        self.breaker.roll_day(now);
        if let Some(loss_pct) = self.breaker.tripped_loss_pct {
            return Err(SizingRejection::DrawdownHalt {
                loss_pct,
                limit_pct: self.params.max_daily_drawdown_pct,
            });
        }

        let stop_distance = proposal.stop_distance();
        if stop_distance <= 0.0 || proposal.qty <= 0.0 || proposal.entry_price <= 0.0 {
            return Err(SizingRejection::InvalidStop);
        }

        let risk = proposal.risk_amount();
        let max_risk = equity * self.params.max_position_risk_pct / 100.0;
        if risk > max_risk {
            return Err(SizingRejection::RiskBoundExceeded {
                risk,
                max: max_risk,
                max_pct: self.params.max_position_risk_pct,
            });
        }

        let notional = proposal.notional();
        let notional_pct = notional / equity * 100.0;
        let max_notional_pct = regime_cap_pct
            .map(|cap| cap.min(self.params.max_position_size_pct))
            .unwrap_or(self.params.max_position_size_pct);
        if notional_pct < self.params.min_position_size_pct || notional_pct > max_notional_pct {
            return Err(SizingRejection::NotionalOutOfBounds {
                notional_pct,
                min_pct: self.params.min_position_size_pct,
                max_pct: max_notional_pct,
            });
        }

        let aggregate = open_portfolio_risk + risk;
        let max_portfolio_risk = equity * self.params.max_portfolio_risk_pct / 100.0;
        if aggregate > max_portfolio_risk {
            return Err(SizingRejection::PortfolioRiskExceeded {
                aggregate,
                max_pct: self.params.max_portfolio_risk_pct,
            });
        }

        Ok(SizedPosition {
            symbol: proposal.symbol.clone(),
            qty: proposal.qty,
            notional,
            notional_pct,
            risk_amount: risk,
        })
    }

    /// Evaluate one open position. Checks run in a fixed order: forced
    /// turnover, stop loss, trailing stop breach, profit ladder, trailing
    /// stop activation/tightening.
    pub fn evaluate_position(
        &self,
        position: &mut TrackedPosition,
        now: DateTime<Utc>,
    ) -> PositionAction {
        let age_days = position.age_days(now);
        if age_days >= self.params.max_position_hold_days {
            return PositionAction::Close {
                reason: CloseReason::MaxHoldExceeded,
            };
        }
        if age_days >= self.params.max_position_age_days {
            info!(
                symbol = %position.symbol,
                age_days,
                "position past turnover age, closing regardless of P&L"
            );
            return PositionAction::Close {
                reason: CloseReason::ForcedTurnover,
            };
        }

        let pnl = position.unrealized_pnl_pct;
        if pnl <= self.params.max_position_loss_pct {
            return PositionAction::Close {
                reason: CloseReason::StopLoss,
            };
        }

        if position.trailing_stop_active {
            if let Some(stop) = position.trailing_stop_pnl_pct {
                if pnl <= stop {
                    return PositionAction::Close {
                        reason: CloseReason::TrailingStop,
                    };
                }
            }
        }

        // Profit ladder: the lowest crossed, unconsumed tier is reported.
        // The caller consumes it only once the exit order is actually
        // placed, so a denied or failed submission is retried next scan.
        let ladder = &self.params.profit_ladder;
        for (tier, level) in ladder.levels_pct.iter().enumerate() {
            if pnl >= *level && !position.profit_tiers_taken.contains(&tier) {
                return PositionAction::ScaleOut {
                    fraction: ladder.fractions[tier],
                    tier,
                };
            }
        }

        // Trailing stop activates above the threshold and only tightens.
        if pnl >= self.params.trailing_stop_activation_pct || position.trailing_stop_active {
            let candidate = position.high_water_pnl_pct - self.params.trailing_stop_distance_pct;
            let current = position.trailing_stop_pnl_pct;
            let tightened = match current {
                Some(existing) => candidate > existing,
                None => position.trailing_stop_active || pnl >= self.params.trailing_stop_activation_pct,
            };
            if tightened {
                position.trailing_stop_active = true;
                position.trailing_stop_pnl_pct = Some(candidate);
                return PositionAction::TrailingStopUpdate {
                    stop_pnl_pct: candidate,
                };
            }
        }

        PositionAction::Hold
    }
}
