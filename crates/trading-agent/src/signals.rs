//! Market-wide signal collection for regime classification.
//!
//! One budget-gated movers query is distilled into the breadth /
//! volatility / dispersion / trend snapshot the classifier consumes. A
//! denial or gateway failure surfaces as an error so the regime tracker
//! carries the previous regime forward.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use broker_gateway::BrokerageGateway;
use budget_scheduler::{BudgetScheduler, CallCategory, Priority};
use regime_classifier::MarketSignals;

pub async fn collect(
    gateway: &dyn BrokerageGateway,
    scheduler: &BudgetScheduler,
) -> Result<MarketSignals> {
    scheduler
        .request(CallCategory::BroadScan, Priority::Monitoring)
        .map_err(|denial| anyhow!("signal collection denied budget: {denial}"))?;

    let rows = gateway.market_movers().await?;
    if rows.is_empty() {
        bail!("movers query returned no rows");
    }

    let n = rows.len() as f64;
    let advancing = rows.iter().filter(|s| s.change_pct > 0.0).count() as f64;
    let breadth = advancing / n;

    let mean_change: f64 = rows.iter().map(|s| s.change_pct).sum::<f64>() / n;
    let index_trend = mean_change / 100.0;

    // Average intraday range; a 4% mean range maps to the top of the rank.
    let mean_range: f64 = rows.iter().map(|s| s.intraday_range()).sum::<f64>() / n;
    let volatility_rank = (mean_range / 0.04 * 100.0).clamp(0.0, 100.0);

    // Spread of per-sector mean returns; 3 points of spread saturates.
    let mut by_sector: HashMap<&str, (f64, u32)> = HashMap::new();
    for row in &rows {
        if let Some(sector) = &row.sector {
            let entry = by_sector.entry(sector.as_str()).or_insert((0.0, 0));
            entry.0 += row.change_pct;
            entry.1 += 1;
        }
    }
    let sector_dispersion = if by_sector.len() >= 2 {
        let means: Vec<f64> = by_sector.values().map(|(sum, n)| sum / *n as f64).collect();
        let avg = means.iter().sum::<f64>() / means.len() as f64;
        let variance = means.iter().map(|m| (m - avg).powi(2)).sum::<f64>() / means.len() as f64;
        (variance.sqrt() / 3.0).min(1.0)
    } else {
        0.0
    };

    Ok(MarketSignals {
        breadth,
        volatility_rank,
        sector_dispersion,
        index_trend,
    })
}
