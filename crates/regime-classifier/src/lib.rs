//! Market regime classification.
//!
//! Maps a snapshot of market-wide signals to one of a fixed set of regimes.
//! Each regime carries an immutable screening-parameter profile consumed
//! read-only by the opportunity funnel and the risk engine.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    /// Broad advance with a clear upward index trend
    BullTrending,

    /// Broad decline with a clear downward index trend
    BearTrending,

    /// High volatility, no directional resolution
    VolatileRange,

    /// Capital moving between sectors faster than the index moves
    SectorRotation,

    /// Compressed ranges, breakout setups
    LowVolatility,
}

impl MarketRegime {
    pub const ALL: [MarketRegime; 5] = [
        MarketRegime::VolatileRange,
        MarketRegime::BullTrending,
        MarketRegime::BearTrending,
        MarketRegime::SectorRotation,
        MarketRegime::LowVolatility,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MarketRegime::BullTrending => "Bull Trending",
            MarketRegime::BearTrending => "Bear Trending",
            MarketRegime::VolatileRange => "Volatile Range",
            MarketRegime::SectorRotation => "Sector Rotation",
            MarketRegime::LowVolatility => "Low Volatility",
        }
    }

    /// Risk multiplier applied on top of base position sizing
    /// (1.0 = normal risk).
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            MarketRegime::BullTrending => 1.2,
            MarketRegime::BearTrending => 0.8,
            MarketRegime::VolatileRange => 0.5,
            MarketRegime::SectorRotation => 1.0,
            MarketRegime::LowVolatility => 1.1,
        }
    }

    /// Fail-safe regime used when classification is unavailable: the most
    /// conservative profile in the table (smallest position cap).
    pub fn fail_safe() -> MarketRegime {
        MarketRegime::VolatileRange
    }
}

/// What kind of symbols the broad scan should favor in a regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFocus {
    Gainers,
    OversoldBounces,
    BothDirections,
    SectorLeaders,
    Breakouts,
}

/// Immutable per-regime screening parameter bundle. Built once at startup,
/// selected (never mutated) by the classifier, and read by the funnel and
/// the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeProfile {
    pub regime: MarketRegime,
    pub focus: ScanFocus,
    /// Daily change floor; candidates moving less are uninteresting here.
    pub min_daily_change_pct: Option<f64>,
    /// Daily change ceiling (bear regimes hunt deep pullbacks).
    pub max_daily_change_pct: Option<f64>,
    pub min_volume_ratio: f64,
    pub preferred_sectors: Vec<String>,
    pub avoided_sectors: Vec<String>,
    /// Cap on single-position notional as percent of equity.
    pub max_position_size_pct: f64,
}

impl RegimeProfile {
    fn sectors(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }
}

/// The full regime → profile table. One instance is constructed at startup
/// and passed by reference into every component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeProfileTable {
    profiles: Vec<RegimeProfile>,
}

impl RegimeProfileTable {
    pub fn standard() -> Self {
        let profiles = vec![
            RegimeProfile {
                regime: MarketRegime::BullTrending,
                focus: ScanFocus::Gainers,
                min_daily_change_pct: Some(-0.5),
                max_daily_change_pct: None,
                min_volume_ratio: 1.1,
                preferred_sectors: RegimeProfile::sectors(&[
                    "Technology",
                    "Consumer Discretionary",
                    "Communication",
                ]),
                avoided_sectors: RegimeProfile::sectors(&["Utilities", "Consumer Staples"]),
                max_position_size_pct: 8.0,
            },
            RegimeProfile {
                regime: MarketRegime::BearTrending,
                focus: ScanFocus::OversoldBounces,
                min_daily_change_pct: None,
                max_daily_change_pct: Some(-3.0),
                min_volume_ratio: 2.0,
                preferred_sectors: RegimeProfile::sectors(&[
                    "Healthcare",
                    "Utilities",
                    "Consumer Staples",
                ]),
                avoided_sectors: RegimeProfile::sectors(&["Technology", "Consumer Discretionary"]),
                max_position_size_pct: 6.0,
            },
            RegimeProfile {
                regime: MarketRegime::VolatileRange,
                focus: ScanFocus::BothDirections,
                min_daily_change_pct: None,
                max_daily_change_pct: None,
                min_volume_ratio: 2.0,
                preferred_sectors: Vec::new(),
                avoided_sectors: Vec::new(),
                max_position_size_pct: 4.0,
            },
            RegimeProfile {
                regime: MarketRegime::SectorRotation,
                focus: ScanFocus::SectorLeaders,
                min_daily_change_pct: Some(0.5),
                max_daily_change_pct: None,
                min_volume_ratio: 1.2,
                preferred_sectors: Vec::new(),
                avoided_sectors: Vec::new(),
                max_position_size_pct: 7.0,
            },
            RegimeProfile {
                regime: MarketRegime::LowVolatility,
                focus: ScanFocus::Breakouts,
                min_daily_change_pct: None,
                max_daily_change_pct: None,
                min_volume_ratio: 1.3,
                preferred_sectors: Vec::new(),
                avoided_sectors: Vec::new(),
                max_position_size_pct: 8.0,
            },
        ];
        Self { profiles }
    }

    pub fn get(&self, regime: MarketRegime) -> &RegimeProfile {
        self.profiles
            .iter()
            .find(|p| p.regime == regime)
            .expect("profile table covers every regime")
    }
}

/// Snapshot of market-wide signals used for classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSignals {
    /// Fraction of symbols advancing today (0.0 - 1.0).
    pub breadth: f64,
    /// Volatility percentile rank vs recent history (0 - 100).
    pub volatility_rank: f64,
    /// Dispersion of sector returns (0.0 - 1.0); high means rotation.
    pub sector_dispersion: f64,
    /// Normalized index trend slope; positive is up.
    pub index_trend: f64,
}

/// Deterministic, pure classification over a signal snapshot.
/// Always returns exactly one regime.
pub fn classify(signals: &MarketSignals) -> MarketRegime {
    let mut scores = [
        (MarketRegime::VolatileRange, 0.0f64),
        (MarketRegime::BullTrending, 0.0),
        (MarketRegime::BearTrending, 0.0),
        (MarketRegime::SectorRotation, 0.0),
        (MarketRegime::LowVolatility, 0.0),
    ];

    if signals.volatility_rank >= 70.0 {
        scores[0].1 += 40.0;
    }
    if signals.volatility_rank <= 30.0 {
        scores[4].1 += 35.0;
    }
    if signals.index_trend > 0.01 && signals.breadth > 0.55 {
        scores[1].1 += 50.0;
    }
    if signals.index_trend < -0.01 && signals.breadth < 0.45 {
        scores[2].1 += 50.0;
    }
    if signals.sector_dispersion > 0.6 && signals.index_trend.abs() <= 0.01 {
        scores[3].1 += 45.0;
    }
    // Directionless tape with elevated volatility leans volatile-range.
    if signals.index_trend.abs() <= 0.01 && signals.volatility_rank >= 50.0 {
        scores[0].1 += 15.0;
    }

    // Stable max: ties resolve toward the earlier (more conservative) entry.
    let mut best = scores[0];
    for candidate in &scores[1..] {
        if candidate.1 > best.1 {
            best = *candidate;
        }
    }
    best.0
}

/// Tracks the current regime on a fixed re-evaluation cadence.
///
/// Re-classifying on every funnel cycle would thrash the dependent
/// parameter sets; the tracker only re-evaluates after `cadence` has
/// elapsed, and a failed signal collection carries the previous regime
/// forward instead of crashing the pipeline.
pub struct RegimeTracker {
    current: MarketRegime,
    cadence: Duration,
    last_evaluated: Option<DateTime<Utc>>,
}

impl RegimeTracker {
    pub fn new(cadence: Duration) -> Self {
        Self {
            current: MarketRegime::fail_safe(),
            cadence,
            last_evaluated: None,
        }
    }

    pub fn current(&self) -> MarketRegime {
        self.current
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_evaluated {
            Some(last) => now - last >= self.cadence,
            None => true,
        }
    }

    /// Re-evaluate if due. `signals` is the (fallible) snapshot collection
    /// result; on failure the stale regime is carried forward.
    pub fn refresh(&mut self, now: DateTime<Utc>, signals: Result<MarketSignals>) -> MarketRegime {
        if !self.due(now) {
            return self.current;
        }
        match signals {
            Ok(signals) => {
                let regime = classify(&signals);
                if regime != self.current {
                    info!(
                        from = self.current.name(),
                        to = regime.name(),
                        breadth = signals.breadth,
                        volatility_rank = signals.volatility_rank,
                        "market regime changed"
                    );
                }
                self.current = regime;
                self.last_evaluated = Some(now);
            }
            Err(e) => {
                warn!(
                    regime = self.current.name(),
                    error = %e,
                    "regime classification failed, carrying previous regime forward"
                );
            }
        }
        self.current
    }
}
