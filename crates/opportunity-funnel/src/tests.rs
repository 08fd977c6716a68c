use anyhow::bail;
use async_trait::async_trait;
use broker_gateway::{
    Account, BrokerageGateway, MarketClock, MarketSnapshot, NewsScore, OptionsFlowDetail, Order,
    OrderSpec, OrderStatusFilter, Position, TechnicalDetail,
};
use budget_scheduler::{BudgetConfig, BudgetScheduler};
use regime_classifier::{MarketRegime, RegimeProfileTable};

use super::*;

#[derive(Default)]
struct MockGateway {
    movers: Vec<MarketSnapshot>,
    active: Vec<MarketSnapshot>,
    sector: Vec<MarketSnapshot>,
    news: Vec<MarketSnapshot>,
}

#[async_trait]
impl BrokerageGateway for MockGateway {
    async fn get_account(&self) -> anyhow::Result<Account> {
        bail!("not exercised")
    }

    async fn get_clock(&self) -> anyhow::Result<MarketClock> {
        bail!("not exercised")
    }

    async fn get_orders(&self, _filter: OrderStatusFilter) -> anyhow::Result<Vec<Order>> {
        bail!("not exercised")
    }

    async fn submit_order(&self, _spec: OrderSpec) -> anyhow::Result<Order> {
        bail!("not exercised")
    }

    async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
        bail!("not exercised")
    }

    async fn get_all_positions(&self) -> anyhow::Result<Vec<Position>> {
        bail!("not exercised")
    }

    async fn close_position(&self, _symbol: &str) -> anyhow::Result<Order> {
        bail!("not exercised")
    }

    async fn market_movers(&self) -> anyhow::Result<Vec<MarketSnapshot>> {
        Ok(self.movers.clone())
    }

    async fn most_active(&self) -> anyhow::Result<Vec<MarketSnapshot>> {
        Ok(self.active.clone())
    }

    async fn sector_movers(&self) -> anyhow::Result<Vec<MarketSnapshot>> {
        Ok(self.sector.clone())
    }

    async fn news_movers(&self) -> anyhow::Result<Vec<MarketSnapshot>> {
        Ok(self.news.clone())
    }

    async fn get_technicals(&self, _symbol: &str) -> anyhow::Result<TechnicalDetail> {
        Ok(TechnicalDetail {
            trend_score: 0.6,
            momentum_score: 0.7,
            breakdown: false,
        })
    }

    async fn get_news_score(&self, _symbol: &str) -> anyhow::Result<NewsScore> {
        Ok(NewsScore {
            sentiment: 0.4,
            catalyst: false,
            headline_count: 3,
        })
    }

    async fn get_options_flow(&self, _symbol: &str) -> anyhow::Result<OptionsFlowDetail> {
        Ok(OptionsFlowDetail {
            call_put_ratio: 1.3,
            unusual_activity: false,
        })
    }
}

fn snap(symbol: &str, change_pct: f64) -> MarketSnapshot {
    MarketSnapshot {
        symbol: symbol.to_string(),
        last_price: 25.0,
        day_volume: 3_000_000,
        avg_volume: 1_000_000,
        change_pct,
        day_high: 26.0,
        day_low: 24.0,
        spread_pct: Some(0.2),
        sector: Some("Technology".to_string()),
    }
}

fn scheduler(config: BudgetConfig) -> BudgetScheduler {
    BudgetScheduler::new(config).unwrap()
}

fn volatile_range_profile() -> regime_classifier::RegimeProfile {
    RegimeProfileTable::standard()
        .get(MarketRegime::VolatileRange)
        .clone()
}

#[tokio::test]
async fn dedup_and_deep_dive_caps_hold() {
    // 500 raw rows, 50 symbols duplicated across the two queries.
    let movers: Vec<MarketSnapshot> = (0..250).map(|i| snap(&format!("SA{i}"), 4.0)).collect();
    let active: Vec<MarketSnapshot> = (200..450).map(|i| snap(&format!("SA{i}"), 4.0)).collect();
    let gateway = MockGateway {
        movers,
        active,
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig::default());
    let funnel = OpportunityFunnel::new(FunnelConfig::default());

    let outcome = funnel
        .run_cycle(&gateway, &scheduler, &volatile_range_profile(), 25)
        .await;

    assert_eq!(outcome.stats.raw_results, 500);
    assert!(outcome.stats.deduplicated <= 450);
    assert_eq!(outcome.stats.deduplicated, 450);
    assert_eq!(outcome.stats.deep_dived, 100);
    assert!(outcome.selected.len() <= 25);
}

#[tokio::test]
async fn denied_broad_queries_mark_cycle_partial() {
    let gateway = MockGateway {
        movers: vec![snap("AAA", 5.0)],
        active: vec![snap("BBB", 6.0)],
        sector: vec![snap("CCC", 7.0)],
        news: vec![snap("DDD", 8.0)],
    };
    // Room for only two of the four broad queries.
    let scheduler = scheduler(BudgetConfig {
        broad_scan_quota: 2,
        ..Default::default()
    });
    let funnel = OpportunityFunnel::new(FunnelConfig::default());

    let outcome = funnel
        .run_cycle(&gateway, &scheduler, &volatile_range_profile(), 25)
        .await;

    assert!(outcome.partial);
    assert_eq!(outcome.stats.denied_queries, 2);
    // The granted queries still produced candidates.
    assert_eq!(outcome.stats.deduplicated, 2);
}

#[tokio::test]
async fn budget_starved_deep_dive_degrades_candidates() {
    let gateway = MockGateway {
        movers: vec![snap("DEGR", 5.0)],
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig {
        deep_dive_quota: 0,
        ..Default::default()
    });
    let funnel = OpportunityFunnel::new(FunnelConfig::default());
    let profile = volatile_range_profile();

    let outcome = funnel.run_cycle(&gateway, &scheduler, &profile, 25).await;

    assert!(outcome.partial);
    assert_eq!(outcome.stats.degraded, 1);
    let candidate = &outcome.selected[0];
    assert!(candidate.degraded);

    // Degraded score is exactly the stage-2 score times the penalty.
    let fit = 0.5 + 0.15; // BothDirections focus
    let stage_two = 0.4 * 0.5 + 0.3 * 1.0 + 0.3 * fit;
    let expected = stage_two * funnel.config().degraded_penalty;
    assert!((candidate.score - expected).abs() < 1e-9);
}

#[tokio::test]
async fn fully_analyzed_candidates_beat_degraded_on_equal_signals() {
    // Identical snapshots; budget covers the deep dive for only one of them
    // (three components), so the second is degraded and must rank below.
    let gateway = MockGateway {
        movers: vec![snap("FULL", 5.0), snap("PART", 5.0)],
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig {
        deep_dive_quota: 3,
        ..Default::default()
    });
    let funnel = OpportunityFunnel::new(FunnelConfig::default());

    let outcome = funnel
        .run_cycle(&gateway, &scheduler, &volatile_range_profile(), 25)
        .await;

    assert_eq!(outcome.selected.len(), 2);
    assert!(!outcome.selected[0].degraded);
    assert!(outcome.selected[1].degraded);
    assert!(outcome.selected[0].score > outcome.selected[1].score);
}

#[tokio::test]
async fn hard_filters_drop_unfit_candidates() {
    let mut penny = snap("PENNY", 9.0);
    penny.last_price = 2.0;
    let mut thin = snap("THIN", 9.0);
    thin.day_volume = 10_000;
    let mut wide = snap("WIDE", 9.0);
    wide.spread_pct = Some(4.0);
    let mut utility = snap("UTIL", 9.0);
    utility.sector = Some("Utilities".to_string());

    let gateway = MockGateway {
        movers: vec![
            snap("GOOD", 4.0),
            snap("BRK.A", 4.0),
            snap("TOOLONG", 4.0),
            penny,
            thin,
            wide,
            utility,
        ],
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig::default());
    let funnel = OpportunityFunnel::new(FunnelConfig::default());
    // Bull profile avoids Utilities.
    let profile = RegimeProfileTable::standard()
        .get(MarketRegime::BullTrending)
        .clone();

    let outcome = funnel.run_cycle(&gateway, &scheduler, &profile, 25).await;

    let symbols: Vec<&str> = outcome.selected.iter().map(|c| c.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["GOOD"]);
}

#[tokio::test]
async fn selection_bounded_by_open_slots() {
    let movers: Vec<MarketSnapshot> = (0..20).map(|i| snap(&format!("SB{i}"), 4.0)).collect();
    let gateway = MockGateway {
        movers,
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig::default());
    let funnel = OpportunityFunnel::new(FunnelConfig::default());

    let outcome = funnel
        .run_cycle(&gateway, &scheduler, &volatile_range_profile(), 5)
        .await;

    assert_eq!(outcome.selected.len(), 5);
    assert!(outcome
        .selected
        .iter()
        .all(|c| c.stage == FunnelStage::Selected));
    assert_eq!(outcome.proposals().len(), 5);
}

#[tokio::test]
async fn broad_scan_cap_truncates_candidates() {
    let movers: Vec<MarketSnapshot> = (0..30).map(|i| snap(&format!("SC{i}"), 4.0)).collect();
    let gateway = MockGateway {
        movers,
        ..Default::default()
    };
    let scheduler = scheduler(BudgetConfig::default());
    let funnel = OpportunityFunnel::new(FunnelConfig {
        max_broad_scan_results: 10,
        ..Default::default()
    });

    let outcome = funnel
        .run_cycle(&gateway, &scheduler, &volatile_range_profile(), 25)
        .await;

    assert_eq!(outcome.stats.deduplicated, 10);
}
