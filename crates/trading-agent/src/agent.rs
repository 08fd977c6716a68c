//! Agent wiring: one struct owning every engine component, driven by the
//! two cadenced cycles in `main`.

use std::collections::HashMap;

use anyhow::Result;
use broker_gateway::{BrokerageGateway, OrderSpec, OrderStatusFilter};
use budget_scheduler::{BudgetScheduler, CallCategory, Priority};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use opportunity_funnel::OpportunityFunnel;
use order_lifecycle::OrderLifecycleManager;
use regime_classifier::{RegimeProfile, RegimeProfileTable, RegimeTracker};
use risk_engine::{CloseReason, PositionAction, RiskEngine, SizingProposal, TrackedPosition};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use watchlist_manager::WatchlistManager;

use crate::config::AgentConfig;
use crate::signals;

/// Live broker-side numbers for one position, refreshed each scan.
#[derive(Debug, Clone, Copy)]
struct BrokerMark {
    current_qty: f64,
    unrealized_pl: f64,
}

enum ExitPlan {
    ScaleOut { symbol: String, qty: f64, tier: usize },
    Close { symbol: String, reason: CloseReason, est_pnl: f64 },
}

pub struct Agent {
    config: AgentConfig,
    pub scheduler: BudgetScheduler,
    profiles: RegimeProfileTable,
    regime: RegimeTracker,
    funnel: OpportunityFunnel,
    watchlist: WatchlistManager,
    risk: RiskEngine,
    lifecycle: OrderLifecycleManager,
    /// Locally tracked risk state per open position, keyed by symbol.
    positions: HashMap<String, TrackedPosition>,
    /// Risk amount committed at entry, for the portfolio-level bound.
    open_risk: HashMap<String, f64>,
    /// Last prices seen for funnel selections, used to size entries.
    last_prices: HashMap<String, f64>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let scheduler = BudgetScheduler::new(config.budget_config())?;
        let risk = RiskEngine::new(config.risk_parameters()?)?;
        Ok(Self {
            scheduler,
            profiles: RegimeProfileTable::standard(),
            regime: RegimeTracker::new(config.regime_cadence()),
            funnel: OpportunityFunnel::new(config.funnel_config()),
            watchlist: WatchlistManager::new(config.watchlist_config()),
            risk,
            lifecycle: OrderLifecycleManager::new(config.lifecycle_config()),
            positions: HashMap::new(),
            open_risk: HashMap::new(),
            last_prices: HashMap::new(),
            config,
        })
    }

    pub fn watchlist_len(&self) -> usize {
        self.watchlist.len()
    }

    /// One funnel cycle: regime refresh (if due), watchlist pruning, the
    /// three-stage scan, and new entries from the refreshed watchlist.
    pub async fn funnel_cycle(&mut self, gateway: &dyn BrokerageGateway) -> Result<()> {
        let now = Utc::now();
        if self.config.enforce_market_hours && !market_open(now) {
            debug!("market closed, skipping funnel cycle");
            return Ok(());
        }

        if self.regime.due(now) {
            let collected = signals::collect(gateway, &self.scheduler).await;
            self.regime.refresh(now, collected);
        }
        let profile = self.profiles.get(self.regime.current()).clone();

        let removals = self.watchlist.tick(now);
        for removal in &removals {
            self.last_prices.remove(&removal.symbol);
        }

        let open_slots = self.watchlist.open_slots(now);
        let outcome = self
            .funnel
            .run_cycle(gateway, &self.scheduler, &profile, open_slots)
            .await;
        for candidate in &outcome.selected {
            self.last_prices
                .insert(candidate.symbol.clone(), candidate.last_price);
        }
        let proposals = outcome.proposals();
        let accepted = self.watchlist.propose(&proposals, now);
        info!(
            added = accepted.added.len(),
            replaced = accepted.replaced.len(),
            watchlist = self.watchlist.len(),
            partial = outcome.partial,
            "funnel cycle applied"
        );

        if self.config.trading_enabled {
            self.try_entries(gateway, &profile, now).await?;
        }
        Ok(())
    }

    /// Open new positions from the strongest watchlist entries, every bound
    /// enforced by the risk engine and every order budget-gated.
    async fn try_entries(
        &mut self,
        gateway: &dyn BrokerageGateway,
        profile: &RegimeProfile,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.risk.is_halted() {
            debug!("drawdown halt active, no new entries");
            return Ok(());
        }
        if self
            .scheduler
            .request(CallCategory::PositionMonitoring, Priority::Monitoring)
            .is_err()
        {
            return Ok(());
        }
        let account = match gateway.get_account().await {
            Ok(account) => account,
            Err(err) => {
                warn!(error = %err, "account fetch failed, skipping entries");
                return Ok(());
            }
        };

        let mut entries = 0usize;
        for entry in self.watchlist.snapshot() {
            if entries >= self.config.max_entries_per_cycle {
                break;
            }
            let symbol = entry.symbol.as_str();
            if self.positions.contains_key(symbol) {
                continue;
            }
            if self.lifecycle.has_open_order_for(symbol) {
                // A stale working order blocks this entry; its cancel gets
                // emergency routing.
                self.lifecycle.mark_pending_entry(symbol);
                continue;
            }
            let Some(&price) = self.last_prices.get(symbol) else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }

            let target_notional =
                account.equity * self.config.target_position_size_pct / 100.0;
            let qty = (target_notional / price).floor();
            if qty < 1.0 {
                continue;
            }
            let stop_price = price * (1.0 - self.config.entry_stop_pct / 100.0);
            let proposal = SizingProposal {
                symbol: symbol.to_string(),
                qty,
                entry_price: price,
                stop_price,
            };
            let open_portfolio_risk: f64 = self.open_risk.values().sum();
            let regime_cap = self
                .config
                .apply_regime_position_cap
                .then_some(profile.max_position_size_pct);

            let sized = match self.risk.size_position(
                account.equity,
                &proposal,
                open_portfolio_risk,
                regime_cap,
                now,
            ) {
                Ok(sized) => sized,
                Err(rejection) => {
                    debug!(symbol, %rejection, "entry rejected by risk engine");
                    continue;
                }
            };

            if self
                .scheduler
                .request(CallCategory::TradeExecution, Priority::Execution)
                .is_err()
            {
                debug!("execution budget exhausted, deferring remaining entries");
                break;
            }
            let Some(qty_dec) = Decimal::from_f64(qty) else {
                continue;
            };
            match gateway
                .submit_order(OrderSpec::market_buy(symbol, qty_dec))
                .await
            {
                Ok(order) => {
                    info!(
                        symbol,
                        qty,
                        notional = sized.notional,
                        risk = sized.risk_amount,
                        order_id = %order.id,
                        "entry submitted"
                    );
                    self.open_risk.insert(symbol.to_string(), sized.risk_amount);
                    self.positions
                        .insert(symbol.to_string(), TrackedPosition::new(symbol, qty, price, now));
                    entries += 1;
                }
                Err(err) => {
                    warn!(symbol, error = %err, "entry submission failed");
                }
            }
        }
        Ok(())
    }

    /// One lifecycle scan: reconcile orders, cancel stale ones, reconcile
    /// positions, and apply risk-driven exits.
    pub async fn lifecycle_cycle(&mut self, gateway: &dyn BrokerageGateway) -> Result<()> {
        let now = Utc::now();

        if self
            .scheduler
            .request(CallCategory::PositionMonitoring, Priority::Monitoring)
            .is_ok()
        {
            match gateway.get_orders(OrderStatusFilter::All).await {
                Ok(orders) => self.lifecycle.sync(&orders),
                Err(err) => warn!(error = %err, "order poll failed, scanning stale view"),
            }
        }

        let actions = self.lifecycle.scan(now);
        if !actions.is_empty() {
            let stats = self
                .lifecycle
                .execute(&actions, gateway, &self.scheduler)
                .await;
            info!(
                requested = stats.requested,
                succeeded = stats.succeeded,
                denied = stats.denied,
                failed = stats.failed,
                "stale order sweep"
            );
        }

        let marks = self.reconcile_positions(gateway).await;
        self.apply_exit_rules(gateway, &marks, now).await;
        Ok(())
    }

    /// Pull the broker's open positions and fold them into local tracking.
    /// Vanished positions (fills elsewhere, manual closes) drop out of the
    /// risk maps too.
    async fn reconcile_positions(
        &mut self,
        gateway: &dyn BrokerageGateway,
    ) -> HashMap<String, BrokerMark> {
        let mut marks = HashMap::new();
        if self
            .scheduler
            .request(CallCategory::PositionMonitoring, Priority::Monitoring)
            .is_err()
        {
            return marks;
        }
        let broker_positions = match gateway.get_all_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "position poll failed");
                return marks;
            }
        };

        for position in &broker_positions {
            let qty = position.qty.to_f64().unwrap_or(0.0);
            let entry_price = position.entry_price.to_f64().unwrap_or(0.0);
            let tracked = self
                .positions
                .entry(position.symbol.clone())
                .or_insert_with(|| {
                    TrackedPosition::new(
                        position.symbol.clone(),
                        qty,
                        entry_price,
                        position.opened_at.unwrap_or_else(Utc::now),
                    )
                });
            tracked.update_pnl(position.unrealized_pnl_pct());
            marks.insert(
                position.symbol.clone(),
                BrokerMark {
                    current_qty: qty,
                    unrealized_pl: position.unrealized_pl.to_f64().unwrap_or(0.0),
                },
            );
        }

        self.positions.retain(|symbol, _| marks.contains_key(symbol));
        self.open_risk.retain(|symbol, _| marks.contains_key(symbol));
        marks
    }

    async fn apply_exit_rules(
        &mut self,
        gateway: &dyn BrokerageGateway,
        marks: &HashMap<String, BrokerMark>,
        now: DateTime<Utc>,
    ) {
        if marks.is_empty() {
            return;
        }

        // Drawdown breaker check against current account state.
        if self
            .scheduler
            .request(CallCategory::PositionMonitoring, Priority::Monitoring)
            .is_ok()
        {
            match gateway.get_account().await {
                Ok(account) => {
                    let unrealized: f64 = marks.values().map(|m| m.unrealized_pl).sum();
                    self.risk.check_drawdown(account.equity, unrealized, now);
                }
                Err(err) => warn!(error = %err, "account fetch failed, drawdown not re-checked"),
            }
        }

        let mut plans = Vec::new();
        for (symbol, tracked) in self.positions.iter_mut() {
            let Some(mark) = marks.get(symbol) else {
                continue;
            };
            match self.risk.evaluate_position(tracked, now) {
                PositionAction::Hold => {}
                PositionAction::TrailingStopUpdate { stop_pnl_pct } => {
                    info!(symbol = %symbol, stop_pnl_pct, "trailing stop tightened");
                }
                PositionAction::ScaleOut { fraction, tier } => {
                    // Fraction of the original position, never more than
                    // what is still open.
                    let qty = (tracked.qty * fraction).min(mark.current_qty).floor();
                    if qty >= 1.0 {
                        plans.push(ExitPlan::ScaleOut {
                            symbol: symbol.clone(),
                            qty,
                            tier,
                        });
                    }
                }
                PositionAction::Close { reason } => {
                    plans.push(ExitPlan::Close {
                        symbol: symbol.clone(),
                        reason,
                        est_pnl: mark.unrealized_pl,
                    });
                }
            }
        }

        for plan in plans {
            match plan {
                ExitPlan::ScaleOut { symbol, qty, tier } => {
                    if self
                        .scheduler
                        .request(CallCategory::TradeExecution, Priority::Execution)
                        .is_err()
                    {
                        debug!(symbol = %symbol, "scale-out deferred, execution budget exhausted");
                        continue;
                    }
                    let Some(qty_dec) = Decimal::from_f64(qty) else {
                        continue;
                    };
                    match gateway
                        .submit_order(OrderSpec::market_sell(symbol.as_str(), qty_dec))
                        .await
                    {
                        Ok(_) => {
                            // The tier is only spent once the order is in;
                            // a denied or failed submission re-reports it
                            // next scan.
                            if let Some(tracked) = self.positions.get_mut(&symbol) {
                                tracked.consume_tier(tier);
                            }
                            info!(symbol = %symbol, qty, tier, "profit tier scale-out submitted");
                        }
                        Err(err) => warn!(symbol = %symbol, error = %err, "scale-out failed"),
                    }
                }
                ExitPlan::Close { symbol, reason, est_pnl } => {
                    if self
                        .scheduler
                        .request(CallCategory::TradeExecution, Priority::Execution)
                        .is_err()
                    {
                        debug!(symbol = %symbol, "close deferred, execution budget exhausted");
                        continue;
                    }
                    match gateway.close_position(&symbol).await {
                        Ok(_) => {
                            info!(
                                symbol = %symbol,
                                reason = reason.as_str(),
                                est_pnl,
                                "position closed"
                            );
                            self.risk.record_realized_pnl(est_pnl, now);
                            self.positions.remove(&symbol);
                            self.open_risk.remove(&symbol);
                        }
                        Err(err) => {
                            warn!(symbol = %symbol, error = %err, "close failed, retrying next scan")
                        }
                    }
                }
            }
        }
    }
}

/// Regular US equity session, Eastern time.
fn market_open(now: DateTime<Utc>) -> bool {
    let et = now.with_timezone(&chrono_tz::US::Eastern);
    if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = et.hour() * 60 + et.minute();
    (570..960).contains(&minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_gateway::SimulatedGateway;

    fn test_config() -> AgentConfig {
        // Run regardless of wall-clock time in tests.
        let mut config = make_base();
        config.enforce_market_hours = false;
        config
    }

    fn make_base() -> AgentConfig {
        AgentConfig {
            max_requests_per_minute: 200,
            rate_limit_buffer: 0.85,
            broad_scan_quota: 25,
            deep_dive_quota: 50,
            trade_execution_quota: 35,
            position_monitoring_quota: 40,
            emergency_reserve_quota: 20,
            max_broad_scan_results: 500,
            deep_dive_candidates: 100,
            funnel_min_price: 5.0,
            funnel_max_price: 10_000.0,
            funnel_min_day_volume: 500_000,
            funnel_max_spread_pct: 1.0,
            enable_technicals: true,
            enable_news: true,
            enable_options_flow: true,
            degraded_penalty: 0.85,
            max_watchlist_size: 25,
            min_opportunity_score: 0.3,
            addition_margin: 0.05,
            momentum_decay_threshold: 0.5,
            volume_decline_threshold: 0.7,
            watchlist_max_age_hours: 2,
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
            profit_ladder: "aggressive".to_string(),
            entry_stop_pct: 4.0,
            target_position_size_pct: 30.0,
            apply_regime_position_cap: false,
            max_entries_per_cycle: 2,
            stale_order_threshold_seconds: 120,
            funnel_interval_seconds: 300,
            lifecycle_interval_seconds: 30,
            regime_interval_seconds: 900,
            enforce_market_hours: true,
            trading_enabled: true,
        }
    }

    #[tokio::test]
    async fn full_cycle_respects_global_budget() {
        let gateway = SimulatedGateway::new();
        let mut agent = Agent::new(test_config()).unwrap();

        agent.funnel_cycle(&gateway).await.unwrap();
        agent.lifecycle_cycle(&gateway).await.unwrap();

        let usage = agent.scheduler.usage();
        assert!(usage.global_consumed <= usage.global_cap);
        for (_, consumed, quota) in usage.consumed {
            assert!(consumed <= quota);
        }
    }

    #[tokio::test]
    async fn funnel_cycle_populates_watchlist() {
        let gateway = SimulatedGateway::new();
        let mut agent = Agent::new(test_config()).unwrap();

        agent.funnel_cycle(&gateway).await.unwrap();
        assert!(agent.watchlist_len() <= 25);
    }

    #[tokio::test]
    async fn scale_out_tier_survives_budget_denial() {
        let gateway = SimulatedGateway::new();
        let mut config = test_config();
        config.trade_execution_quota = 0;
        let mut agent = Agent::new(config).unwrap();

        let now = Utc::now();
        let mut pos = TrackedPosition::new("RUNNER", 100.0, 50.0, now);
        pos.update_pnl(11.0);
        agent.positions.insert("RUNNER".to_string(), pos);
        let marks = HashMap::from([(
            "RUNNER".to_string(),
            BrokerMark {
                current_qty: 100.0,
                unrealized_pl: 550.0,
            },
        )]);

        agent.apply_exit_rules(&gateway, &marks, now).await;

        // No execution budget: the tier stays unspent and fires again on
        // the next evaluation instead of being lost.
        assert!(agent.positions["RUNNER"].profit_tiers_taken.is_empty());
        let pos = agent.positions.get_mut("RUNNER").unwrap();
        assert!(matches!(
            agent.risk.evaluate_position(pos, now),
            PositionAction::ScaleOut { tier: 0, .. }
        ));
    }

    #[tokio::test]
    async fn lifecycle_cycle_is_safe_with_no_state() {
        let gateway = SimulatedGateway::new();
        let mut agent = Agent::new(test_config()).unwrap();
        agent.lifecycle_cycle(&gateway).await.unwrap();
        agent.lifecycle_cycle(&gateway).await.unwrap();
    }
}
