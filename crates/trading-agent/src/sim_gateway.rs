//! Deterministic simulated brokerage.
//!
//! Stands in for the real transport so the whole engine can run end to end
//! without network access. Market data is synthesized from a hash of
//! (symbol, salt, tick) so repeated runs are reproducible while still
//! drifting over time. Market orders fill immediately; stop and limit
//! orders stay working, which is what exercises the stale-order path.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_gateway::{
    Account, BrokerageGateway, MarketClock, MarketSnapshot, NewsScore, OptionsFlowDetail, Order,
    OrderSide, OrderSpec, OrderStatus, OrderStatusFilter, OrderType, Position, TechnicalDetail,
};
use chrono::{Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

const STARTING_CASH: f64 = 100_000.0;

const UNIVERSE: &[(&str, &str)] = &[
    ("AAPL", "Technology"),
    ("MSFT", "Technology"),
    ("NVDA", "Technology"),
    ("AMD", "Technology"),
    ("AVGO", "Technology"),
    ("CRM", "Technology"),
    ("ORCL", "Technology"),
    ("AMZN", "Consumer Discretionary"),
    ("TSLA", "Consumer Discretionary"),
    ("HD", "Consumer Discretionary"),
    ("NKE", "Consumer Discretionary"),
    ("GOOGL", "Communication"),
    ("META", "Communication"),
    ("NFLX", "Communication"),
    ("DIS", "Communication"),
    ("JPM", "Financials"),
    ("BAC", "Financials"),
    ("GS", "Financials"),
    ("MS", "Financials"),
    ("UNH", "Healthcare"),
    ("JNJ", "Healthcare"),
    ("PFE", "Healthcare"),
    ("LLY", "Healthcare"),
    ("XOM", "Energy"),
    ("CVX", "Energy"),
    ("COP", "Energy"),
    ("NEE", "Utilities"),
    ("DUK", "Utilities"),
    ("SO", "Utilities"),
    ("PG", "Consumer Staples"),
    ("KO", "Consumer Staples"),
    ("PEP", "Consumer Staples"),
    ("CAT", "Industrials"),
    ("DE", "Industrials"),
    ("BA", "Industrials"),
    ("UPS", "Industrials"),
];

/// Hash-derived value in [0, 1).
fn noise(symbol: &str, salt: &str, tick: u64) -> f64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    salt.hash(&mut hasher);
    tick.hash(&mut hasher);
    (hasher.finish() % 10_000) as f64 / 10_000.0
}

struct SimState {
    orders: HashMap<String, Order>,
    positions: HashMap<String, Position>,
    cash: f64,
    next_order_id: u64,
}

pub struct SimulatedGateway {
    state: Mutex<SimState>,
    /// Advances on every market-wide query so synthetic data drifts.
    tick: AtomicU64,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                orders: HashMap::new(),
                positions: HashMap::new(),
                cash: STARTING_CASH,
                next_order_id: 1,
            }),
            tick: AtomicU64::new(0),
        }
    }

    fn advance_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    fn snapshot(symbol: &str, sector: &str, tick: u64) -> MarketSnapshot {
        // Coarse tick so prices hold still across the queries of one cycle.
        let epoch = tick / 8;
        let base = 10.0 + noise(symbol, "price", 0) * 290.0;
        let drift = (noise(symbol, "drift", epoch) - 0.45) * 0.12;
        let last_price = (base * (1.0 + drift)).max(1.0);
        let day_volume = (1_000_000.0 + noise(symbol, "vol", epoch) * 9_000_000.0) as i64;
        let avg_volume = (day_volume as f64 / (1.0 + 2.0 * noise(symbol, "avgvol", 0))) as i64;
        let change_pct = drift * 100.0;
        let range = last_price * (0.01 + noise(symbol, "range", epoch) * 0.04);

        MarketSnapshot {
            symbol: symbol.to_string(),
            last_price,
            day_volume,
            avg_volume,
            change_pct,
            day_high: last_price + range / 2.0,
            day_low: last_price - range / 2.0,
            spread_pct: Some(noise(symbol, "spread", epoch) * 0.8),
            sector: Some(sector.to_string()),
        }
    }

    fn all_snapshots(&self, tick: u64) -> Vec<MarketSnapshot> {
        UNIVERSE
            .iter()
            .map(|(symbol, sector)| Self::snapshot(symbol, sector, tick))
            .collect()
    }

    fn mark_price(symbol: &str, entry: f64, tick: u64) -> f64 {
        let epoch = tick / 8;
        (entry * (1.0 + (noise(symbol, "mark", epoch) - 0.48) * 0.2)).max(0.01)
    }

    fn fill_order(state: &mut SimState, order: &mut Order, tick: u64) {
        let price = UNIVERSE
            .iter()
            .find(|(s, _)| *s == order.symbol)
            .map(|(s, sec)| Self::snapshot(s, sec, tick).last_price)
            .unwrap_or(100.0);

        order.status = OrderStatus::Filled;
        order.filled_qty = order.requested_qty;
        order.filled_avg_price = Decimal::from_f64(price);

        let qty = order.requested_qty.to_f64().unwrap_or(0.0);
        match order.side {
            OrderSide::Buy => {
                state.cash -= qty * price;
                let position = state
                    .positions
                    .entry(order.symbol.clone())
                    .or_insert_with(|| Position {
                        symbol: order.symbol.clone(),
                        qty: Decimal::ZERO,
                        entry_price: Decimal::from_f64(price).unwrap_or_default(),
                        current_price: Decimal::from_f64(price).unwrap_or_default(),
                        market_value: Decimal::ZERO,
                        unrealized_pl: Decimal::ZERO,
                        unrealized_plpc: 0.0,
                        opened_at: Some(Utc::now()),
                    });
                position.qty += order.requested_qty;
            }
            OrderSide::Sell => {
                state.cash += qty * price;
                let remove = if let Some(position) = state.positions.get_mut(&order.symbol) {
                    position.qty -= order.requested_qty;
                    position.qty <= Decimal::ZERO
                } else {
                    false
                };
                if remove {
                    state.positions.remove(&order.symbol);
                }
            }
        }
    }

    fn refresh_positions(state: &mut SimState, tick: u64) {
        for position in state.positions.values_mut() {
            let entry = position.entry_price.to_f64().unwrap_or(1.0);
            let mark = Self::mark_price(&position.symbol, entry, tick);
            let qty = position.qty.to_f64().unwrap_or(0.0);
            position.current_price = Decimal::from_f64(mark).unwrap_or_default();
            position.market_value = Decimal::from_f64(mark * qty).unwrap_or_default();
            position.unrealized_pl = Decimal::from_f64((mark - entry) * qty).unwrap_or_default();
            position.unrealized_plpc = if entry > 0.0 { (mark - entry) / entry } else { 0.0 };
        }
    }
}

#[async_trait]
impl BrokerageGateway for SimulatedGateway {
    async fn get_account(&self) -> Result<Account> {
        let mut state = self.state.lock().expect("sim state lock poisoned");
        let tick = self.current_tick();
        Self::refresh_positions(&mut state, tick);
        let market_value: f64 = state
            .positions
            .values()
            .map(|p| p.market_value.to_f64().unwrap_or(0.0))
            .sum();
        Ok(Account {
            equity: state.cash + market_value,
            cash: state.cash,
            buying_power: (state.cash + market_value) * 2.0,
            day_trade_count: 0,
            pattern_day_trader: false,
        })
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        let now = Utc::now();
        Ok(MarketClock {
            is_open: true,
            next_open: now,
            next_close: now + Duration::hours(6),
        })
    }

    async fn get_orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>> {
        let state = self.state.lock().expect("sim state lock poisoned");
        Ok(state
            .orders
            .values()
            .filter(|o| match filter {
                OrderStatusFilter::Open => o.status.is_open(),
                OrderStatusFilter::Closed => o.status.is_terminal(),
                OrderStatusFilter::All => true,
            })
            .cloned()
            .collect())
    }

    async fn submit_order(&self, spec: OrderSpec) -> Result<Order> {
        let mut state = self.state.lock().expect("sim state lock poisoned");
        let tick = self.current_tick();
        let id = format!("sim-{}", state.next_order_id);
        state.next_order_id += 1;

        let mut order = Order {
            id: id.clone(),
            symbol: spec.symbol,
            side: spec.side,
            order_type: spec.order_type,
            status: OrderStatus::New,
            created_at: Some(Utc::now()),
            requested_qty: spec.qty,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
        };

        // Market orders fill at once; stop/limit orders stay working.
        if spec.order_type == OrderType::Market {
            Self::fill_order(&mut state, &mut order, tick);
        }

        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("sim state lock poisoned");
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        if order.status.is_terminal() {
            return Err(anyhow!(
                "order {order_id} already {}",
                order.status.as_str()
            ));
        }
        order.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>> {
        let mut state = self.state.lock().expect("sim state lock poisoned");
        let tick = self.current_tick();
        Self::refresh_positions(&mut state, tick);
        Ok(state.positions.values().cloned().collect())
    }

    async fn close_position(&self, symbol: &str) -> Result<Order> {
        let qty = {
            let state = self.state.lock().expect("sim state lock poisoned");
            state
                .positions
                .get(symbol)
                .map(|p| p.qty)
                .ok_or_else(|| anyhow!("no open position in {symbol}"))?
        };
        self.submit_order(OrderSpec::market_sell(symbol, qty)).await
    }

    async fn market_movers(&self) -> Result<Vec<MarketSnapshot>> {
        let tick = self.advance_tick();
        let mut rows = self.all_snapshots(tick);
        rows.sort_by(|a, b| {
            b.change_pct
                .abs()
                .partial_cmp(&a.change_pct.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(15);
        Ok(rows)
    }

    async fn most_active(&self) -> Result<Vec<MarketSnapshot>> {
        let tick = self.advance_tick();
        let mut rows = self.all_snapshots(tick);
        rows.sort_by_key(|s| std::cmp::Reverse(s.day_volume));
        rows.truncate(15);
        Ok(rows)
    }

    async fn sector_movers(&self) -> Result<Vec<MarketSnapshot>> {
        let tick = self.advance_tick();
        let mut rows = self.all_snapshots(tick);
        // Leaders of the strongest sector this tick.
        let leader_sector = rows
            .iter()
            .max_by(|a, b| {
                a.change_pct
                    .partial_cmp(&b.change_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .and_then(|s| s.sector.clone());
        rows.retain(|s| s.sector == leader_sector);
        rows.truncate(10);
        Ok(rows)
    }

    async fn news_movers(&self) -> Result<Vec<MarketSnapshot>> {
        let tick = self.advance_tick();
        let mut rows = self.all_snapshots(tick);
        rows.retain(|s| noise(&s.symbol, "news", tick / 8) > 0.6);
        rows.truncate(10);
        Ok(rows)
    }

    async fn get_technicals(&self, symbol: &str) -> Result<TechnicalDetail> {
        let epoch = self.current_tick() / 8;
        Ok(TechnicalDetail {
            trend_score: noise(symbol, "trend", epoch) * 2.0 - 1.0,
            momentum_score: noise(symbol, "momentum", epoch),
            breakdown: noise(symbol, "breakdown", epoch) > 0.92,
        })
    }

    async fn get_news_score(&self, symbol: &str) -> Result<NewsScore> {
        let epoch = self.current_tick() / 8;
        Ok(NewsScore {
            sentiment: noise(symbol, "sentiment", epoch) * 2.0 - 1.0,
            catalyst: noise(symbol, "catalyst", epoch) > 0.8,
            headline_count: (noise(symbol, "headlines", epoch) * 20.0) as u32,
        })
    }

    async fn get_options_flow(&self, symbol: &str) -> Result<OptionsFlowDetail> {
        let epoch = self.current_tick() / 8;
        Ok(OptionsFlowDetail {
            call_put_ratio: 0.3 + noise(symbol, "cpr", epoch) * 2.0,
            unusual_activity: noise(symbol, "unusual", epoch) > 0.85,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_buy_fills_and_opens_position() {
        let gw = SimulatedGateway::new();
        let order = gw
            .submit_order(OrderSpec::market_buy("AAPL", dec!(10)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        let positions = gw.get_all_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "AAPL");
        assert_eq!(positions[0].qty, dec!(10));
    }

    #[tokio::test]
    async fn stop_order_stays_working_until_canceled() {
        let gw = SimulatedGateway::new();
        let order = gw
            .submit_order(OrderSpec::stop_sell("MSFT", dec!(5), dec!(100)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);

        let open = gw.get_orders(OrderStatusFilter::Open).await.unwrap();
        assert_eq!(open.len(), 1);

        gw.cancel_order(&order.id).await.unwrap();
        assert!(gw.get_orders(OrderStatusFilter::Open).await.unwrap().is_empty());

        // Double cancel is rejected, not silently accepted.
        assert!(gw.cancel_order(&order.id).await.is_err());
    }

    #[tokio::test]
    async fn close_position_flattens() {
        let gw = SimulatedGateway::new();
        gw.submit_order(OrderSpec::market_buy("NVDA", dec!(4)))
            .await
            .unwrap();
        gw.close_position("NVDA").await.unwrap();
        assert!(gw.get_all_positions().await.unwrap().is_empty());
        assert!(gw.close_position("NVDA").await.is_err());
    }

    #[tokio::test]
    async fn synthetic_data_is_reproducible() {
        let a = SimulatedGateway::new();
        let b = SimulatedGateway::new();
        let movers_a = a.market_movers().await.unwrap();
        let movers_b = b.market_movers().await.unwrap();
        let symbols_a: Vec<&str> = movers_a.iter().map(|s| s.symbol.as_str()).collect();
        let symbols_b: Vec<&str> = movers_b.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols_a, symbols_b);
    }

    #[tokio::test]
    async fn account_equity_reflects_cash_and_positions() {
        let gw = SimulatedGateway::new();
        let before = gw.get_account().await.unwrap();
        assert_eq!(before.equity, STARTING_CASH);

        gw.submit_order(OrderSpec::market_buy("JPM", dec!(10)))
            .await
            .unwrap();
        let after = gw.get_account().await.unwrap();
        assert!(after.cash < STARTING_CASH);
        assert!(after.equity > 0.0);
    }
}
