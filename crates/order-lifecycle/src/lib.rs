//! Order lifecycle tracking and stale-order cleanup.
//!
//! Polls outstanding orders on a fixed cadence, classifies staleness, and
//! queues cancellations through the budget scheduler. Cancellation is
//! fire-and-forget per order: a failed or budget-denied cancel is simply
//! retried on the next scan cycle, never synchronously, so per-cycle
//! latency stays bounded.

use std::collections::{HashMap, HashSet};

use broker_gateway::{BrokerageGateway, Order, OrderStatus};
use budget_scheduler::{BudgetScheduler, CallCategory, Priority};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long an order may sit in `new` before it is considered stale.
    pub stale_order_threshold: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_order_threshold: Duration::seconds(120),
        }
    }
}

/// Staleness classification for one order.
///
/// `Unknown` covers orders without a usable creation timestamp: they
/// contribute no verdict either way and are only logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum StalenessVerdict {
    Stale(String),
    NotStale(String),
    Unknown(String),
}

impl StalenessVerdict {
    pub fn is_stale(&self) -> bool {
        matches!(self, StalenessVerdict::Stale(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            StalenessVerdict::Stale(r) | StalenessVerdict::NotStale(r) | StalenessVerdict::Unknown(r) => r,
        }
    }
}

/// An order is stale iff its status is still `new` and its age exceeds the
/// threshold. Any other status is not stale by definition, and a missing
/// creation time yields no verdict at all.
pub fn assess_staleness(
    order: &Order,
    threshold: Duration,
    now: DateTime<Utc>,
) -> StalenessVerdict {
    if order.status != OrderStatus::New {
        return StalenessVerdict::NotStale(format!(
            "status is {}, not new",
            order.status.as_str()
        ));
    }

    let created_at = match order.created_at {
        Some(ts) => ts,
        None => {
            return StalenessVerdict::Unknown("no creation time available".to_string());
        }
    };

    let age = now - created_at;
    if age > threshold {
        StalenessVerdict::Stale(format!(
            "age {} exceeds {} threshold",
            format_age(age),
            format_age(threshold)
        ))
    } else {
        StalenessVerdict::NotStale(format!(
            "age {} within {} threshold",
            format_age(age),
            format_age(threshold)
        ))
    }
}

/// Age rendered in minutes with one decimal, e.g. "2.5m".
fn format_age(age: Duration) -> String {
    let minutes = age.num_seconds() as f64 / 60.0;
    format!("{minutes:.1}m")
}

/// A queued cancellation. Routed through the emergency reserve when the
/// symbol is blocking a pending new entry, otherwise through the normal
/// execution budget.
#[derive(Debug, Clone, Serialize)]
pub struct CancelRequest {
    pub order_id: String,
    pub symbol: String,
    pub category: CallCategory,
    pub priority: Priority,
    pub reason: String,
}

/// Per-cycle cancellation accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CancelCycleStats {
    pub requested: usize,
    pub denied: usize,
    pub failed: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    order: Order,
}

/// Tracks the set of outstanding orders and derives per-scan actions.
///
/// The brokerage owns order state; this is a read/track view. Terminal
/// orders are dropped from tracking on the scan after they turn terminal.
pub struct OrderLifecycleManager {
    config: LifecycleConfig,
    tracked: HashMap<String, TrackedOrder>,
    /// Symbols where a stale working order is blocking a new entry; their
    /// cancels route through the protected emergency reserve.
    pending_entries: HashSet<String>,
}

impl OrderLifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            tracked: HashMap::new(),
            pending_entries: HashSet::new(),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracking(&self, order_id: &str) -> bool {
        self.tracked.contains_key(order_id)
    }

    pub fn status_of(&self, order_id: &str) -> Option<OrderStatus> {
        self.tracked.get(order_id).map(|t| t.order.status)
    }

    /// Whether any tracked open order exists for this symbol. Used to keep
    /// entries from stacking on top of an unfilled working order.
    pub fn has_open_order_for(&self, symbol: &str) -> bool {
        self.tracked
            .values()
            .any(|t| t.order.symbol == symbol && t.order.status.is_open())
    }

    /// Flag a symbol as blocked pending a new entry. Cleared automatically
    /// once no tracked order for it remains.
    pub fn mark_pending_entry(&mut self, symbol: impl Into<String>) {
        self.pending_entries.insert(symbol.into());
    }

    /// Reconcile local tracking against a fresh order poll.
    ///
    /// A reported transition out of a locally terminal state is an anomaly:
    /// it is logged and the local terminal state wins. Other invalid
    /// transitions are likewise kept out of local state.
    pub fn sync(&mut self, orders: &[Order]) {
        for incoming in orders {
            match self.tracked.get_mut(&incoming.id) {
                Some(tracked) => {
                    let current = tracked.order.status;
                    if current == incoming.status {
                        tracked.order = incoming.clone();
                        continue;
                    }
                    if current.is_terminal() {
                        warn!(
                            order_id = %incoming.id,
                            local = current.as_str(),
                            reported = incoming.status.as_str(),
                            "brokerage reported transition out of terminal state, keeping local"
                        );
                        continue;
                    }
                    if !current.can_transition_to(incoming.status) {
                        warn!(
                            order_id = %incoming.id,
                            local = current.as_str(),
                            reported = incoming.status.as_str(),
                            "invalid order state transition reported, keeping local"
                        );
                        continue;
                    }
                    debug!(
                        order_id = %incoming.id,
                        from = current.as_str(),
                        to = incoming.status.as_str(),
                        "order state transition"
                    );
                    tracked.order = incoming.clone();
                }
                None => {
                    if incoming.status.is_open() {
                        self.tracked.insert(
                            incoming.id.clone(),
                            TrackedOrder {
                                order: incoming.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// One lifecycle scan: drop terminal orders, classify staleness, and
    /// queue cancellations. At most one cancel per symbol per scan so
    /// same-symbol cancellations stay serialized across cycles.
    pub fn scan(&mut self, now: DateTime<Utc>) -> Vec<CancelRequest> {
        self.tracked.retain(|id, tracked| {
            if tracked.order.status.is_terminal() {
                debug!(order_id = %id, status = tracked.order.status.as_str(), "dropping terminal order");
                false
            } else {
                true
            }
        });
        let live_symbols: HashSet<&str> =
            self.tracked.values().map(|t| t.order.symbol.as_str()).collect();
        self.pending_entries.retain(|s| live_symbols.contains(s.as_str()));

        let threshold = self.config.stale_order_threshold;
        let mut symbols_queued: HashSet<String> = HashSet::new();
        let mut actions = Vec::new();

        let mut tracked: Vec<&TrackedOrder> = self.tracked.values().collect();
        tracked.sort_by(|a, b| a.order.id.cmp(&b.order.id));

        for tracked in tracked {
            let order = &tracked.order;
            match assess_staleness(order, threshold, now) {
                StalenessVerdict::Stale(reason) => {
                    if !symbols_queued.insert(order.symbol.clone()) {
                        continue;
                    }
                    let (category, priority) = if self.pending_entries.contains(&order.symbol) {
                        (CallCategory::EmergencyReserve, Priority::Emergency)
                    } else {
                        (CallCategory::TradeExecution, Priority::Execution)
                    };
                    info!(
                        order_id = %order.id,
                        symbol = %order.symbol,
                        reason = %reason,
                        category = category.as_str(),
                        "queuing stale order for cancellation"
                    );
                    actions.push(CancelRequest {
                        order_id: order.id.clone(),
                        symbol: order.symbol.clone(),
                        category,
                        priority,
                        reason,
                    });
                }
                StalenessVerdict::Unknown(reason) => {
                    warn!(order_id = %order.id, reason = %reason, "order age unknown, skipping");
                }
                StalenessVerdict::NotStale(_) => {}
            }
        }

        actions
    }

    /// Issue queued cancellations, each gated by the budget scheduler.
    /// Denials and gateway failures leave the order tracked so the next
    /// scan retries it.
    pub async fn execute(
        &mut self,
        actions: &[CancelRequest],
        gateway: &dyn BrokerageGateway,
        scheduler: &BudgetScheduler,
    ) -> CancelCycleStats {
        let mut stats = CancelCycleStats {
            requested: actions.len(),
            ..Default::default()
        };

        for action in actions {
            match scheduler.request(action.category, action.priority) {
                Ok(_) => {}
                Err(denial) => {
                    debug!(order_id = %action.order_id, %denial, "cancel deferred to next scan");
                    stats.denied += 1;
                    continue;
                }
            }

            match gateway.cancel_order(&action.order_id).await {
                Ok(()) => {
                    info!(order_id = %action.order_id, symbol = %action.symbol, "cancel submitted");
                    stats.succeeded += 1;
                }
                Err(err) => {
                    warn!(
                        order_id = %action.order_id,
                        error = %err,
                        "cancel failed, will retry next scan"
                    );
                    stats.failed += 1;
                }
            }
        }

        stats
    }
}
