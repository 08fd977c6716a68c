//! Broker-agnostic gateway contract and unified types.
//!
//! The engine treats every gateway call as budget-consuming and as capable
//! of failing. Session management, retries, backoff, and reconnection are
//! the gateway implementation's responsibility. The core never assumes
//! session state and reacts to a failed call the same way it reacts to a
//! denied budget request: skip now, retry next cycle.

pub mod raw;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

pub use raw::{normalize_order, normalize_position, parse_timestamp, RawOrder, RawPosition};
pub use types::{
    Account, MarketClock, MarketSnapshot, NewsScore, OptionsFlowDetail, Order, OrderSide,
    OrderSpec, OrderStatus, OrderStatusFilter, OrderType, Position, TechnicalDetail,
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request rejected by brokerage: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// The single external collaborator of the trading core.
///
/// Account/order/position endpoints serve the lifecycle side; the
/// market-wide query endpoints serve funnel stage 1 and the per-symbol
/// detail endpoints serve funnel stage 3.
#[async_trait]
pub trait BrokerageGateway: Send + Sync {
    async fn get_account(&self) -> Result<Account>;

    async fn get_clock(&self) -> Result<MarketClock>;

    async fn get_orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>>;

    async fn submit_order(&self, spec: OrderSpec) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn get_all_positions(&self) -> Result<Vec<Position>>;

    /// Close an entire position with a market order.
    async fn close_position(&self, symbol: &str) -> Result<Order>;

    // --- market-wide discovery queries (funnel stage 1) ---

    /// Top gainers and losers.
    async fn market_movers(&self) -> Result<Vec<MarketSnapshot>>;

    /// Volume leaders.
    async fn most_active(&self) -> Result<Vec<MarketSnapshot>>;

    /// Leaders within rotating sectors.
    async fn sector_movers(&self) -> Result<Vec<MarketSnapshot>>;

    /// Symbols moving on news.
    async fn news_movers(&self) -> Result<Vec<MarketSnapshot>>;

    // --- per-symbol detail (funnel stage 3) ---

    async fn get_technicals(&self, symbol: &str) -> Result<TechnicalDetail>;

    async fn get_news_score(&self, symbol: &str) -> Result<NewsScore>;

    async fn get_options_flow(&self, symbol: &str) -> Result<OptionsFlowDetail>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_can_reach_every_other_state() {
        for next in [
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(OrderStatus::New.can_transition_to(next));
        }
        assert!(!OrderStatus::New.can_transition_to(OrderStatus::New));
    }

    #[test]
    fn partial_fill_cannot_be_rejected() {
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Filled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Canceled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Expired));
        assert!(!OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Rejected));
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            for next in [OrderStatus::New, OrderStatus::Filled, OrderStatus::Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
