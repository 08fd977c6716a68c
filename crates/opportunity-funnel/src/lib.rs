//! Three-stage opportunity funnel.
//!
//! Narrows the whole market down to a handful of watchlist proposals per
//! cycle: broad scan (budget-gated market-wide queries) → zero-cost local
//! filtering → bounded deep dive (budget-gated per-symbol detail) → final
//! selection. Every external call is arbitrated by the budget scheduler
//! first; a denied query is skipped for this cycle, never retried inline.

use std::collections::{BTreeMap, HashSet};

use broker_gateway::{BrokerageGateway, MarketSnapshot};
use budget_scheduler::{BudgetRequest, BudgetScheduler, CallCategory, Priority};
use regime_classifier::{RegimeProfile, ScanFocus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use watchlist_manager::ProposedEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    Broad,
    Filtered,
    DeepDive,
    Selected,
}

/// A symbol moving through the funnel. Created at the broad stage, promoted
/// or dropped at each stage boundary.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub symbol: String,
    pub stage: FunnelStage,
    pub score: f64,
    pub regime_fit: f64,
    /// Signal-name → value trail accumulated across stages.
    pub evidence: BTreeMap<String, f64>,
    /// Set when the deep dive could not obtain any detail component and the
    /// candidate was scored on broad-stage data alone.
    pub degraded: bool,
    pub last_price: f64,
    pub change_pct: f64,
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Candidate cap after broad-scan deduplication.
    pub max_broad_scan_results: usize,
    /// Hard cap on stage-3 candidates; ranking is truncated beyond it.
    pub deep_dive_candidates: usize,
    pub min_price: f64,
    pub max_price: f64,
    pub min_day_volume: i64,
    /// Quotes wider than this are dropped when the spread is known.
    pub max_spread_pct: f64,
    pub enable_technicals: bool,
    pub enable_news: bool,
    pub enable_options_flow: bool,
    /// Multiplier applied to degraded candidates so fully analyzed ones win
    /// ties.
    pub degraded_penalty: f64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            max_broad_scan_results: 500,
            deep_dive_candidates: 100,
            min_price: 5.0,
            max_price: 10_000.0,
            min_day_volume: 500_000,
            max_spread_pct: 1.0,
            enable_technicals: true,
            enable_news: true,
            enable_options_flow: true,
            degraded_penalty: 0.85,
        }
    }
}

/// Per-cycle counters, reported so operators can tell "found nothing" from
/// "could not look".
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FunnelStats {
    pub raw_results: usize,
    pub deduplicated: usize,
    pub filter_survivors: usize,
    pub deep_dived: usize,
    pub degraded: usize,
    pub denied_queries: usize,
    pub failed_queries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelOutcome {
    pub selected: Vec<Candidate>,
    /// True when any stage lost queries to budget denial or gateway failure;
    /// distinguishes a budget-starved cycle from a genuinely empty market.
    pub partial: bool,
    pub stats: FunnelStats,
}

impl FunnelOutcome {
    /// Selected candidates as watchlist insert requests.
    pub fn proposals(&self) -> Vec<ProposedEntry> {
        self.selected
            .iter()
            .map(|c| ProposedEntry {
                symbol: c.symbol.clone(),
                opportunity_score: c.score,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum BroadQuery {
    Movers,
    MostActive,
    SectorMovers,
    NewsMovers,
}

impl BroadQuery {
    const ALL: [BroadQuery; 4] = [
        BroadQuery::Movers,
        BroadQuery::MostActive,
        BroadQuery::SectorMovers,
        BroadQuery::NewsMovers,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            BroadQuery::Movers => "market_movers",
            BroadQuery::MostActive => "most_active",
            BroadQuery::SectorMovers => "sector_movers",
            BroadQuery::NewsMovers => "news_movers",
        }
    }
}

pub struct OpportunityFunnel {
    config: FunnelConfig,
}

impl OpportunityFunnel {
    pub fn new(config: FunnelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    /// One full funnel cycle: broad scan → filter → deep dive → selection.
    ///
    /// `open_slots` is how many watchlist insertions the caller can accept;
    /// the funnel never evicts existing entries itself.
    pub async fn run_cycle(
        &self,
        gateway: &dyn BrokerageGateway,
        scheduler: &BudgetScheduler,
        profile: &RegimeProfile,
        open_slots: usize,
    ) -> FunnelOutcome {
        let mut stats = FunnelStats::default();

        let candidates = self.broad_scan(gateway, scheduler, &mut stats).await;
        let survivors = self.filter_and_score(candidates, profile, &mut stats);
        let mut detailed = self
            .deep_dive(gateway, scheduler, survivors, &mut stats)
            .await;

        // Selection: top N by final score, degraded candidates already
        // penalized so fully analyzed ones win ties.
        detailed.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let take = open_slots.min(detailed.len());
        detailed.truncate(take);
        for candidate in &mut detailed {
            candidate.stage = FunnelStage::Selected;
        }

        let partial = stats.denied_queries > 0 || stats.failed_queries > 0;
        info!(
            selected = detailed.len(),
            partial,
            raw = stats.raw_results,
            deduplicated = stats.deduplicated,
            survivors = stats.filter_survivors,
            deep_dived = stats.deep_dived,
            degraded = stats.degraded,
            "funnel cycle complete"
        );

        FunnelOutcome {
            selected: detailed,
            partial,
            stats,
        }
    }

    /// Stage 1: market-wide queries, submitted to the scheduler as a single
    /// contended tick so they are arbitrated against anything else arriving
    /// at the same instant. Deduplicated by symbol; the first-seen row wins
    /// conflicting metadata.
    async fn broad_scan(
        &self,
        gateway: &dyn BrokerageGateway,
        scheduler: &BudgetScheduler,
        stats: &mut FunnelStats,
    ) -> Vec<MarketSnapshot> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        let requests =
            BroadQuery::ALL.map(|_| BudgetRequest::new(CallCategory::BroadScan, Priority::Discovery));
        let grants = scheduler.request_tick(&requests);

        for (query, grant) in BroadQuery::ALL.into_iter().zip(grants) {
            if let Err(denial) = grant {
                debug!(query = query.as_str(), %denial, "broad query skipped");
                stats.denied_queries += 1;
                continue;
            }

            let rows = match self.fetch(gateway, query).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(query = query.as_str(), error = %err, "broad query failed");
                    stats.failed_queries += 1;
                    continue;
                }
            };

            stats.raw_results += rows.len();
            for snapshot in rows {
                if candidates.len() >= self.config.max_broad_scan_results {
                    break;
                }
                if seen.insert(snapshot.symbol.clone()) {
                    candidates.push(snapshot);
                }
            }
        }

        stats.deduplicated = candidates.len();
        candidates
    }

    async fn fetch(
        &self,
        gateway: &dyn BrokerageGateway,
        query: BroadQuery,
    ) -> anyhow::Result<Vec<MarketSnapshot>> {
        match query {
            BroadQuery::Movers => gateway.market_movers().await,
            BroadQuery::MostActive => gateway.most_active().await,
            BroadQuery::SectorMovers => gateway.sector_movers().await,
            BroadQuery::NewsMovers => gateway.news_movers().await,
        }
    }

    /// Stage 2: purely local hard filters plus composite scoring. No
    /// external calls; deterministic given identical inputs.
    fn filter_and_score(
        &self,
        candidates: Vec<MarketSnapshot>,
        profile: &RegimeProfile,
        stats: &mut FunnelStats,
    ) -> Vec<Candidate> {
        let mut survivors: Vec<Candidate> = candidates
            .into_iter()
            .filter(|snap| self.passes_hard_filters(snap, profile))
            .map(|snap| self.scored_candidate(snap, profile))
            .collect();

        survivors.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        stats.filter_survivors = survivors.len();
        survivors
    }

    fn passes_hard_filters(&self, snap: &MarketSnapshot, profile: &RegimeProfile) -> bool {
        // Warrants, units, preferred shares.
        if snap.symbol.contains('.') || snap.symbol.contains('-') || snap.symbol.len() > 5 {
            return false;
        }
        if snap.last_price < self.config.min_price || snap.last_price > self.config.max_price {
            return false;
        }
        if snap.day_volume < self.config.min_day_volume {
            return false;
        }
        if let Some(spread) = snap.spread_pct {
            if spread > self.config.max_spread_pct {
                return false;
            }
        }
        if snap.volume_ratio() < profile.min_volume_ratio {
            return false;
        }
        if let Some(floor) = profile.min_daily_change_pct {
            if snap.change_pct < floor {
                return false;
            }
        }
        if let Some(ceiling) = profile.max_daily_change_pct {
            if snap.change_pct > ceiling {
                return false;
            }
        }
        if let Some(sector) = &snap.sector {
            if profile.avoided_sectors.iter().any(|s| s == sector) {
                return false;
            }
        }
        true
    }

    fn scored_candidate(&self, snap: MarketSnapshot, profile: &RegimeProfile) -> Candidate {
        let fit = regime_fit(&snap, profile);
        let movement = (snap.change_pct.abs() / 10.0).min(1.0);
        let volume = (snap.volume_ratio() / 3.0).min(1.0);
        let score = 0.4 * movement + 0.3 * volume + 0.3 * fit;

        let mut evidence = BTreeMap::new();
        evidence.insert("change_pct".to_string(), snap.change_pct);
        evidence.insert("volume_ratio".to_string(), snap.volume_ratio());
        evidence.insert("regime_fit".to_string(), fit);

        Candidate {
            symbol: snap.symbol.clone(),
            stage: FunnelStage::Filtered,
            score,
            regime_fit: fit,
            evidence,
            degraded: false,
            last_price: snap.last_price,
            change_pct: snap.change_pct,
            volume_ratio: snap.volume_ratio(),
        }
    }

    /// Stage 3: per-symbol detail for the top survivors, each component
    /// under its own budget request. A candidate whose enabled components
    /// are all denied or all fail keeps its stage-2 score, flagged degraded
    /// and penalized. Issuance is sequential so earlier-ranked candidates
    /// get budget first.
    async fn deep_dive(
        &self,
        gateway: &dyn BrokerageGateway,
        scheduler: &BudgetScheduler,
        mut survivors: Vec<Candidate>,
        stats: &mut FunnelStats,
    ) -> Vec<Candidate> {
        survivors.truncate(self.config.deep_dive_candidates);
        stats.deep_dived = survivors.len();

        for candidate in &mut survivors {
            candidate.stage = FunnelStage::DeepDive;

            let mut detail_sum = 0.0;
            let mut detail_count = 0u32;

            if self.enabled_component(
                scheduler,
                stats,
                self.config.enable_technicals,
            ) {
                match gateway.get_technicals(&candidate.symbol).await {
                    Ok(detail) => {
                        let component = if detail.breakdown {
                            0.0
                        } else {
                            ((detail.trend_score + 1.0) / 2.0) * 0.5 + detail.momentum_score * 0.5
                        };
                        candidate
                            .evidence
                            .insert("trend_score".to_string(), detail.trend_score);
                        candidate
                            .evidence
                            .insert("momentum_score".to_string(), detail.momentum_score);
                        detail_sum += component;
                        detail_count += 1;
                    }
                    Err(err) => {
                        warn!(symbol = %candidate.symbol, error = %err, "technicals fetch failed");
                        stats.failed_queries += 1;
                    }
                }
            }

            if self.enabled_component(scheduler, stats, self.config.enable_news) {
                match gateway.get_news_score(&candidate.symbol).await {
                    Ok(news) => {
                        let mut component = (news.sentiment + 1.0) / 2.0;
                        if news.catalyst {
                            component = (component + 0.2).min(1.0);
                        }
                        candidate
                            .evidence
                            .insert("news_sentiment".to_string(), news.sentiment);
                        detail_sum += component;
                        detail_count += 1;
                    }
                    Err(err) => {
                        warn!(symbol = %candidate.symbol, error = %err, "news fetch failed");
                        stats.failed_queries += 1;
                    }
                }
            }

            if self.enabled_component(
                scheduler,
                stats,
                self.config.enable_options_flow,
            ) {
                match gateway.get_options_flow(&candidate.symbol).await {
                    Ok(flow) => {
                        let mut component = (flow.call_put_ratio / 2.0).min(1.0);
                        if flow.unusual_activity {
                            component = (component + 0.2).min(1.0);
                        }
                        candidate
                            .evidence
                            .insert("call_put_ratio".to_string(), flow.call_put_ratio);
                        detail_sum += component;
                        detail_count += 1;
                    }
                    Err(err) => {
                        warn!(symbol = %candidate.symbol, error = %err, "options flow fetch failed");
                        stats.failed_queries += 1;
                    }
                }
            }

            if detail_count > 0 {
                let detail_avg = detail_sum / detail_count as f64;
                candidate.score = 0.6 * candidate.score + 0.4 * detail_avg;
            } else {
                candidate.degraded = true;
                candidate.score *= self.config.degraded_penalty;
                stats.degraded += 1;
            }
        }

        survivors
    }

    /// Budget-gate a single deep-dive component. Returns whether the
    /// gateway call should be made.
    fn enabled_component(
        &self,
        scheduler: &BudgetScheduler,
        stats: &mut FunnelStats,
        enabled: bool,
    ) -> bool {
        if !enabled {
            return false;
        }
        match scheduler.request(CallCategory::DeepDive, Priority::Analysis) {
            Ok(_) => true,
            Err(denial) => {
                debug!(%denial, "deep-dive component skipped");
                stats.denied_queries += 1;
                false
            }
        }
    }
}

fn regime_fit(snap: &MarketSnapshot, profile: &RegimeProfile) -> f64 {
    let mut fit: f64 = 0.5;
    match profile.focus {
        ScanFocus::Gainers => {
            if snap.change_pct > 0.0 {
                fit += 0.3;
            }
        }
        ScanFocus::OversoldBounces => {
            if snap.change_pct < 0.0 {
                fit += 0.3;
            }
        }
        ScanFocus::BothDirections => fit += 0.15,
        ScanFocus::SectorLeaders => {
            if let Some(sector) = &snap.sector {
                if profile.preferred_sectors.iter().any(|s| s == sector) {
                    fit += 0.3;
                }
            }
        }
        ScanFocus::Breakouts => {
            // Compressed intraday range is the breakout setup.
            if snap.intraday_range() < 0.02 {
                fit += 0.3;
            }
        }
    }
    if let Some(sector) = &snap.sector {
        if profile.preferred_sectors.iter().any(|s| s == sector) {
            fit += 0.2;
        }
    }
    fit.min(1.0)
}

#[cfg(test)]
mod tests;
