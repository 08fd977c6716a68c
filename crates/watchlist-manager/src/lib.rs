//! Bounded, continuously pruned watchlist.
//!
//! The opportunity funnel writes into this set; the lifecycle manager reads
//! from it. The watchlist alone decides evictions; the funnel only
//! proposes. Size never exceeds the configured maximum at any observable
//! point.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistConfig {
    pub max_size: usize,
    /// Candidates scoring below this are not even considered.
    pub min_opportunity_score: f64,
    /// A newcomer must beat the weakest entry by more than this margin to
    /// replace it at capacity. Prevents churn from marginal improvements.
    pub addition_margin: f64,
    pub momentum_decay_threshold: f64,
    pub volume_decline_threshold: f64,
    pub prune_on_technical_breakdown: bool,
    pub max_age: Duration,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            max_size: 25,
            min_opportunity_score: 0.6,
            addition_margin: 0.05,
            momentum_decay_threshold: 0.5,
            volume_decline_threshold: 0.7,
            prune_on_technical_breakdown: true,
            max_age: Duration::hours(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub added_at: DateTime<Utc>,
    pub opportunity_score: f64,
    pub last_refresh: DateTime<Utc>,
    /// Momentum signal relative to when the entry was added (1.0 = intact).
    pub momentum: f64,
    /// Current volume relative to the volume that earned the spot.
    pub volume_ratio: f64,
    pub technical_breakdown: bool,
}

impl WatchlistEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.added_at
    }
}

/// What the funnel hands over for a selected candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEntry {
    pub symbol: String,
    pub opportunity_score: f64,
}

/// Live signal refresh for an existing entry.
#[derive(Debug, Clone, Copy)]
pub struct EntrySignals {
    pub opportunity_score: f64,
    pub momentum: f64,
    pub volume_ratio: f64,
    pub technical_breakdown: bool,
}

/// Pruning rules, checked in this fixed order. The first matching rule
/// removes the entry; an entry is removed at most once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    TechnicalBreakdown,
    MomentumDecay,
    VolumeDecline,
    MaxAge,
}

impl PruneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PruneReason::TechnicalBreakdown => "technical_breakdown",
            PruneReason::MomentumDecay => "momentum_decay",
            PruneReason::VolumeDecline => "volume_decline",
            PruneReason::MaxAge => "max_age",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    pub symbol: String,
    pub reason: PruneReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProposalOutcome {
    pub added: Vec<String>,
    /// (evicted, newcomer) pairs from at-capacity replacement.
    pub replaced: Vec<(String, String)>,
    pub rejected: Vec<String>,
}

pub struct WatchlistManager {
    config: WatchlistConfig,
    entries: Vec<WatchlistEntry>,
}

impl WatchlistManager {
    pub fn new(config: WatchlistConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.iter().any(|e| e.symbol == symbol)
    }

    /// Slots the funnel may fill this cycle: capacity minus entries that
    /// are still fresh (aged-out entries are about to be pruned anyway).
    pub fn open_slots(&self, now: DateTime<Utc>) -> usize {
        let fresh = self
            .entries
            .iter()
            .filter(|e| e.age(now) <= self.config.max_age)
            .count();
        self.config.max_size.saturating_sub(fresh)
    }

    /// Insert funnel selections. Existing symbols are refreshed in place.
    /// At capacity a newcomer replaces the weakest entry only when it beats
    /// that entry's score by more than the addition margin.
    pub fn propose(&mut self, candidates: &[ProposedEntry], now: DateTime<Utc>) -> ProposalOutcome {
        let mut outcome = ProposalOutcome::default();

        for candidate in candidates {
            if candidate.opportunity_score < self.config.min_opportunity_score {
                outcome.rejected.push(candidate.symbol.clone());
                continue;
            }

            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|e| e.symbol == candidate.symbol)
            {
                existing.opportunity_score = existing.opportunity_score.max(candidate.opportunity_score);
                existing.last_refresh = now;
                continue;
            }

            if self.entries.len() < self.config.max_size {
                self.entries.push(Self::fresh_entry(candidate, now));
                outcome.added.push(candidate.symbol.clone());
                continue;
            }

            // At capacity: replacement only for a clear improvement.
            let weakest_idx = self
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.opportunity_score
                        .partial_cmp(&b.opportunity_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);

            match weakest_idx {
                Some(i)
                    if candidate.opportunity_score
                        > self.entries[i].opportunity_score + self.config.addition_margin =>
                {
                    let evicted = std::mem::replace(
                        &mut self.entries[i],
                        Self::fresh_entry(candidate, now),
                    );
                    info!(
                        evicted = %evicted.symbol,
                        newcomer = %candidate.symbol,
                        "watchlist replacement"
                    );
                    outcome.replaced.push((evicted.symbol, candidate.symbol.clone()));
                }
                _ => outcome.rejected.push(candidate.symbol.clone()),
            }
        }

        debug_assert!(self.entries.len() <= self.config.max_size);
        outcome
    }

    /// Update an entry's live signals (typically from position-monitoring
    /// budget calls). Unknown symbols are ignored.
    pub fn refresh(&mut self, symbol: &str, signals: EntrySignals, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.symbol == symbol) {
            entry.opportunity_score = signals.opportunity_score;
            entry.momentum = signals.momentum;
            entry.volume_ratio = signals.volume_ratio;
            entry.technical_breakdown = signals.technical_breakdown;
            entry.last_refresh = now;
        }
    }

    /// Evaluate every entry against the pruning rules and remove matches.
    /// Calling twice with no elapsed time and no new signals is a no-op the
    /// second time.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Removal> {
        let config = &self.config;
        let mut removals = Vec::new();

        self.entries.retain(|entry| {
            let reason = Self::prune_reason(config, entry, now);
            match reason {
                Some(reason) => {
                    debug!(symbol = %entry.symbol, reason = reason.as_str(), "pruning watchlist entry");
                    removals.push(Removal {
                        symbol: entry.symbol.clone(),
                        reason,
                    });
                    false
                }
                None => true,
            }
        });

        removals
    }

    /// Entries ordered by opportunity score, best first.
    pub fn snapshot(&self) -> Vec<WatchlistEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| {
            b.opportunity_score
                .partial_cmp(&a.opportunity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }

    fn fresh_entry(candidate: &ProposedEntry, now: DateTime<Utc>) -> WatchlistEntry {
        WatchlistEntry {
            symbol: candidate.symbol.clone(),
            added_at: now,
            opportunity_score: candidate.opportunity_score,
            last_refresh: now,
            momentum: 1.0,
            volume_ratio: 1.0,
            technical_breakdown: false,
        }
    }

    fn prune_reason(
        config: &WatchlistConfig,
        entry: &WatchlistEntry,
        now: DateTime<Utc>,
    ) -> Option<PruneReason> {
        if config.prune_on_technical_breakdown && entry.technical_breakdown {
            return Some(PruneReason::TechnicalBreakdown);
        }
        if entry.momentum < config.momentum_decay_threshold {
            return Some(PruneReason::MomentumDecay);
        }
        if entry.volume_ratio < config.volume_decline_threshold {
            return Some(PruneReason::VolumeDecline);
        }
        if entry.age(now) > config.max_age {
            return Some(PruneReason::MaxAge);
        }
        None
    }
}
