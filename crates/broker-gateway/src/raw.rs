//! Normalization boundary for loosely-typed gateway records.
//!
//! Brokerage APIs ship orders and positions as string-heavy JSON where any
//! field may be missing. Everything "field may be missing" is handled here,
//! once: a raw record either normalizes into a typed core record or is
//! dropped with a warning. A bad timestamp alone does not drop the record;
//! the order simply has an unknown age.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::types::{Order, OrderSide, OrderStatus, OrderType, Position};

/// Order record as delivered by the brokerage, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOrder {
    pub id: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    #[serde(rename = "type")]
    pub order_type: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
    pub qty: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
}

/// Position record as delivered by the brokerage, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPosition {
    pub symbol: Option<String>,
    pub qty: Option<String>,
    pub avg_entry_price: Option<String>,
    pub current_price: Option<String>,
    pub market_value: Option<String>,
    pub unrealized_pl: Option<String>,
    pub unrealized_plpc: Option<String>,
    pub opened_at: Option<String>,
}

/// Lenient timestamp parse. Accepts RFC 3339 plus the bare formats brokers
/// actually emit. Returns `None` on failure, never an error.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_decimal(input: Option<&String>) -> Decimal {
    input
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or_default()
}

/// Convert a raw order into the core representation.
///
/// Returns `None` (and logs) when the record is unusable: missing id,
/// symbol, or an unrecognized status. An unparseable `created_at` keeps the
/// order with `created_at: None`.
pub fn normalize_order(raw: &RawOrder) -> Option<Order> {
    let id = match raw.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            warn!("dropping order record without id: {:?}", raw.symbol);
            return None;
        }
    };
    let symbol = match raw.symbol.as_deref() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            warn!(order_id = %id, "dropping order record without symbol");
            return None;
        }
    };
    let status = match raw.status.as_deref().and_then(OrderStatus::parse) {
        Some(status) => status,
        None => {
            warn!(
                order_id = %id,
                status = ?raw.status,
                "dropping order record with unrecognized status"
            );
            return None;
        }
    };

    let side = match raw.side.as_deref() {
        Some("sell") | Some("sell_short") => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let order_type = match raw.order_type.as_deref() {
        Some("limit") => OrderType::Limit,
        Some("stop") => OrderType::Stop,
        Some("stop_limit") => OrderType::StopLimit,
        _ => OrderType::Market,
    };

    let created_at = match raw.created_at.as_deref() {
        Some(ts) => {
            let parsed = parse_timestamp(ts);
            if parsed.is_none() {
                warn!(order_id = %id, timestamp = %ts, "unparseable order timestamp, age unknown");
            }
            parsed
        }
        None => None,
    };

    Some(Order {
        id,
        symbol,
        side,
        order_type,
        status,
        created_at,
        requested_qty: parse_decimal(raw.qty.as_ref()),
        filled_qty: parse_decimal(raw.filled_qty.as_ref()),
        filled_avg_price: raw
            .filled_avg_price
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok()),
    })
}

/// Convert a raw position into the core representation. `None` when the
/// record lacks a symbol or a usable quantity.
pub fn normalize_position(raw: &RawPosition) -> Option<Position> {
    let symbol = match raw.symbol.as_deref() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            warn!("dropping position record without symbol");
            return None;
        }
    };
    let qty = match raw.qty.as_ref().and_then(|s| Decimal::from_str(s).ok()) {
        Some(q) => q,
        None => {
            warn!(symbol = %symbol, qty = ?raw.qty, "dropping position record with unusable qty");
            return None;
        }
    };

    Some(Position {
        symbol,
        qty,
        entry_price: parse_decimal(raw.avg_entry_price.as_ref()),
        current_price: parse_decimal(raw.current_price.as_ref()),
        market_value: parse_decimal(raw.market_value.as_ref()),
        unrealized_pl: parse_decimal(raw.unrealized_pl.as_ref()),
        unrealized_plpc: raw
            .unrealized_plpc
            .as_ref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0),
        opened_at: raw.opened_at.as_deref().and_then(parse_timestamp),
    })
}
