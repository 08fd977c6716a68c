use chrono::{Duration, Utc};

use crate::engine::{RiskEngine, SizingRejection};
use crate::models::*;

fn engine() -> RiskEngine {
    RiskEngine::new(RiskParameters::default()).unwrap()
}

/// Engine with the trailing stop pushed out of reach, so ladder tests see
/// only ladder actions.
fn ladder_engine() -> RiskEngine {
    RiskEngine::new(RiskParameters {
        trailing_stop_activation_pct: 100.0,
        ..Default::default()
    })
    .unwrap()
}

fn proposal(qty: f64, entry: f64, stop: f64) -> SizingProposal {
    SizingProposal {
        symbol: "TEST".to_string(),
        qty,
        entry_price: entry,
        stop_price: stop,
    }
}

#[test]
fn oversized_risk_rejected_reduced_qty_accepted() {
    let mut eng = engine();
    let now = Utc::now();
    let equity = 100_000.0;

    // 500 shares, $8 stop distance => $4,000 risk against a $3,000 budget.
    let naive = proposal(500.0, 80.0, 72.0);
    let rejection = eng.size_position(equity, &naive, 0.0, None, now).unwrap_err();
    assert!(matches!(rejection, SizingRejection::RiskBoundExceeded { .. }));

    // 375 shares => $3,000 risk, $30,000 notional = 30% of equity.
    let reduced = proposal(375.0, 80.0, 72.0);
    let sized = eng.size_position(equity, &reduced, 0.0, None, now).unwrap();
    assert_eq!(sized.risk_amount, 3_000.0);
    assert!((25.0..=40.0).contains(&sized.notional_pct));
}

#[test]
fn notional_bounds_are_hard() {
    let mut eng = engine();
    let now = Utc::now();
    let equity = 100_000.0;

    // $2,000 notional is far below the 25% floor even though risk is tiny.
    let tiny = proposal(25.0, 80.0, 79.0);
    assert!(matches!(
        eng.size_position(equity, &tiny, 0.0, None, now),
        Err(SizingRejection::NotionalOutOfBounds { .. })
    ));

    // 45% of equity breaches the 40% ceiling; risk also must stay small,
    // so use a tight stop.
    let huge = proposal(562.0, 80.0, 79.0);
    assert!(matches!(
        eng.size_position(equity, &huge, 0.0, None, now),
        Err(SizingRejection::NotionalOutOfBounds { .. })
    ));
}

#[test]
fn regime_cap_tightens_notional_ceiling() {
    let mut eng = engine();
    let now = Utc::now();
    // 30% notional passes the engine cap but not an 8% regime cap.
    let p = proposal(375.0, 80.0, 72.0);
    assert!(eng.size_position(100_000.0, &p, 0.0, None, now).is_ok());
    assert!(matches!(
        eng.size_position(100_000.0, &p, 0.0, Some(8.0), now),
        Err(SizingRejection::NotionalOutOfBounds { .. })
    ));
}

#[test]
fn aggregate_portfolio_risk_rejected() {
    let mut eng = engine();
    let now = Utc::now();
    // $3,000 new risk on top of $10,000 open risk breaches the 12% cap.
    let p = proposal(375.0, 80.0, 72.0);
    let rejection = eng
        .size_position(100_000.0, &p, 10_000.0, None, now)
        .unwrap_err();
    assert!(matches!(rejection, SizingRejection::PortfolioRiskExceeded { .. }));
}

#[test]
fn drawdown_halt_rejects_sizing_but_not_evaluation() {
    let mut eng = engine();
    let now = Utc::now();
    let equity = 100_000.0;

    // 6.5% daily loss against a 6% limit trips the breaker.
    assert!(eng.check_drawdown(equity, -6_500.0, now));
    assert!(eng.is_halted());

    let p = proposal(375.0, 80.0, 72.0);
    assert!(matches!(
        eng.size_position(equity, &p, 0.0, None, now),
        Err(SizingRejection::DrawdownHalt { .. })
    ));

    // Existing positions are still evaluated and can be closed.
    let mut pos = TrackedPosition::new("LOSER", 100.0, 50.0, now);
    pos.update_pnl(-7.0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::Close {
            reason: CloseReason::StopLoss
        }
    );
}

#[test]
fn drawdown_halt_resets_next_day() {
    let mut eng = engine();
    let t0 = Utc::now();
    assert!(eng.check_drawdown(100_000.0, -6_500.0, t0));

    let next_day = t0 + Duration::days(1);
    assert!(!eng.check_drawdown(100_000.0, 0.0, next_day));
    let p = proposal(375.0, 80.0, 72.0);
    assert!(eng.size_position(100_000.0, &p, 0.0, None, next_day).is_ok());
}

#[test]
fn profit_tier_fires_once_despite_oscillation() {
    let eng = ladder_engine();
    let now = Utc::now();
    let mut pos = TrackedPosition::new("RUNNER", 100.0, 50.0, now);

    pos.update_pnl(11.0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::ScaleOut {
            fraction: 0.25,
            tier: 0
        }
    );
    pos.consume_tier(0);

    // Dip below and re-cross tier 0: consumed, must not re-fire.
    pos.update_pnl(8.5);
    assert_eq!(eng.evaluate_position(&mut pos, now), PositionAction::Hold);
    pos.update_pnl(12.0);
    assert_eq!(eng.evaluate_position(&mut pos, now), PositionAction::Hold);

    // Tier 1 at +20% still fires.
    pos.update_pnl(21.0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::ScaleOut {
            fraction: 0.35,
            tier: 1
        }
    );
}

#[test]
fn ladder_tiers_fire_in_ascending_order_on_gap() {
    let eng = ladder_engine();
    let now = Utc::now();
    let mut pos = TrackedPosition::new("GAPPER", 100.0, 50.0, now);

    // A gap straight past two tiers takes them one scale-out at a time,
    // lowest first.
    pos.update_pnl(25.0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::ScaleOut {
            fraction: 0.25,
            tier: 0
        }
    );
    pos.consume_tier(0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::ScaleOut {
            fraction: 0.35,
            tier: 1
        }
    );
    pos.consume_tier(1);
    assert_eq!(eng.evaluate_position(&mut pos, now), PositionAction::Hold);
}

#[test]
fn unplaced_tier_is_reported_again() {
    let eng = ladder_engine();
    let now = Utc::now();
    let mut pos = TrackedPosition::new("RETRY", 100.0, 50.0, now);

    // Until the caller records the scale-out as placed, every evaluation
    // reports the same tier.
    pos.update_pnl(11.0);
    for _ in 0..3 {
        assert_eq!(
            eng.evaluate_position(&mut pos, now),
            PositionAction::ScaleOut {
                fraction: 0.25,
                tier: 0
            }
        );
    }
    assert!(pos.profit_tiers_taken.is_empty());

    pos.consume_tier(0);
    assert_eq!(eng.evaluate_position(&mut pos, now), PositionAction::Hold);
}

#[test]
fn trailing_stop_only_tightens() {
    let eng = engine();
    let now = Utc::now();
    let mut pos = TrackedPosition::new("TRAIL", 100.0, 50.0, now);

    // Take ladder tier 0 first so it does not shadow trailing updates.
    pos.update_pnl(10.5);
    assert!(matches!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::ScaleOut { tier: 0, .. }
    ));
    pos.consume_tier(0);

    // Above the 8% activation: trailing stop arms at high-water - 4%.
    let action = eng.evaluate_position(&mut pos, now);
    assert_eq!(
        action,
        PositionAction::TrailingStopUpdate { stop_pnl_pct: 6.5 }
    );

    // P&L slips but stays above the stop: no loosening.
    pos.update_pnl(9.0);
    assert_eq!(eng.evaluate_position(&mut pos, now), PositionAction::Hold);
    assert_eq!(pos.trailing_stop_pnl_pct, Some(6.5));

    // New high tightens the stop.
    pos.update_pnl(14.0);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::TrailingStopUpdate { stop_pnl_pct: 10.0 }
    );

    // Falling through the stop closes.
    pos.update_pnl(9.5);
    assert_eq!(
        eng.evaluate_position(&mut pos, now),
        PositionAction::Close {
            reason: CloseReason::TrailingStop
        }
    );
}

#[test]
fn forced_turnover_closes_regardless_of_pnl() {
    let eng = engine();
    let opened = Utc::now();
    let mut pos = TrackedPosition::new("STALE", 100.0, 50.0, opened);
    pos.update_pnl(4.0);

    let later = opened + Duration::days(2);
    assert_eq!(
        eng.evaluate_position(&mut pos, later),
        PositionAction::Close {
            reason: CloseReason::ForcedTurnover
        }
    );
}

#[test]
fn max_hold_outranks_turnover_reason() {
    let eng = engine();
    let opened = Utc::now();
    let mut pos = TrackedPosition::new("ANCIENT", 100.0, 50.0, opened);

    let later = opened + Duration::days(31);
    assert_eq!(
        eng.evaluate_position(&mut pos, later),
        PositionAction::Close {
            reason: CloseReason::MaxHoldExceeded
        }
    );
}

#[test]
fn mismatched_ladder_rejected_at_startup() {
    let params = RiskParameters {
        profit_ladder: ProfitLadder {
            levels_pct: vec![10.0, 20.0],
            fractions: vec![0.5],
        },
        ..Default::default()
    };
    assert!(RiskEngine::new(params).is_err());
}

#[test]
fn ladder_fractions_may_not_exceed_full_position() {
    let ladder = ProfitLadder {
        levels_pct: vec![5.0, 10.0],
        fractions: vec![0.6, 0.6],
    };
    assert!(ladder.validate().is_err());
    assert!(ProfitLadder::aggressive().validate().is_ok());
    assert!(ProfitLadder::stepped().validate().is_ok());
}
