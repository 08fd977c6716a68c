use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Brokerage order status.
///
/// The only legal transitions are:
/// `New -> {PartiallyFilled, Filled, Canceled, Rejected, Expired}` and
/// `PartiallyFilled -> {Filled, Canceled, Expired}`. Everything else is
/// terminal; a reported transition out of a terminal state is an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" | "accepted" | "pending_new" => Some(OrderStatus::New),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "canceled" | "cancelled" => Some(OrderStatus::Canceled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states are dropped from local tracking on the next scan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::New => next != OrderStatus::New,
            OrderStatus::PartiallyFilled => matches!(
                next,
                OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired
            ),
            _ => false,
        }
    }
}

/// Normalized order view. The brokerage owns the order; this is a read/track
/// snapshot. `created_at` is `None` when the raw record carried no parseable
/// timestamp (the order then contributes no staleness verdict).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
}

/// Normalized open position snapshot from the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pl: Decimal,
    /// Unrealized P&L as a fraction of cost basis (0.05 = +5%).
    pub unrealized_plpc: f64,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn unrealized_pnl_pct(&self) -> f64 {
        self.unrealized_plpc * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub day_trade_count: i32,
    pub pattern_day_trader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// Order submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl OrderSpec {
    pub fn market_buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn market_sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
        }
    }

    pub fn stop_sell(symbol: impl Into<String>, qty: Decimal, stop_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Sell,
            order_type: OrderType::Stop,
            limit_price: None,
            stop_price: Some(stop_price),
        }
    }
}

/// Which orders to fetch from the brokerage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatusFilter {
    Open,
    Closed,
    All,
}

/// One row of a market-wide discovery query (movers, volume leaders, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub day_volume: i64,
    pub avg_volume: i64,
    pub change_pct: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub spread_pct: Option<f64>,
    pub sector: Option<String>,
}

impl MarketSnapshot {
    /// Today's volume relative to average volume; 0 when no baseline exists.
    pub fn volume_ratio(&self) -> f64 {
        if self.avg_volume > 0 {
            self.day_volume as f64 / self.avg_volume as f64
        } else {
            0.0
        }
    }

    /// Intraday range as a fraction of last price.
    pub fn intraday_range(&self) -> f64 {
        if self.last_price > 0.0 {
            (self.day_high - self.day_low) / self.last_price
        } else {
            0.0
        }
    }
}

/// Deep-dive technical detail for a single candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalDetail {
    /// Trend quality, -1.0 (broken down) to 1.0 (strong trend).
    pub trend_score: f64,
    /// Momentum quality, 0.0 to 1.0.
    pub momentum_score: f64,
    pub breakdown: bool,
}

/// Deep-dive news/catalyst detail for a single candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsScore {
    /// Sentiment, -1.0 to 1.0.
    pub sentiment: f64,
    pub catalyst: bool,
    pub headline_count: u32,
}

/// Deep-dive options flow detail for a single candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsFlowDetail {
    pub call_put_ratio: f64,
    pub unusual_activity: bool,
}
