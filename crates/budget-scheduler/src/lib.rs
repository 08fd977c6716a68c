//! Priority-based API call budget scheduler.
//!
//! Tracks a rolling per-minute call allowance partitioned into named
//! category quotas. Every outbound brokerage call is arbitrated here before
//! it reaches the gateway. Grant/deny decisions and counter updates are
//! atomic with respect to all callers. This mutex is the single
//! synchronization point of the whole engine.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Named budget categories with fixed per-window quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallCategory {
    BroadScan,
    DeepDive,
    TradeExecution,
    PositionMonitoring,
    /// Protected reserve. Other categories never borrow from it, even idle.
    EmergencyReserve,
}

impl CallCategory {
    pub const ALL: [CallCategory; 5] = [
        CallCategory::BroadScan,
        CallCategory::DeepDive,
        CallCategory::TradeExecution,
        CallCategory::PositionMonitoring,
        CallCategory::EmergencyReserve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallCategory::BroadScan => "broad_scan",
            CallCategory::DeepDive => "deep_dive",
            CallCategory::TradeExecution => "trade_execution",
            CallCategory::PositionMonitoring => "position_monitoring",
            CallCategory::EmergencyReserve => "emergency_reserve",
        }
    }

    fn index(&self) -> usize {
        match self {
            CallCategory::BroadScan => 0,
            CallCategory::DeepDive => 1,
            CallCategory::TradeExecution => 2,
            CallCategory::PositionMonitoring => 3,
            CallCategory::EmergencyReserve => 4,
        }
    }
}

/// Request priority. Lower numeric value services first when multiple
/// components contend within the same scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Emergency = 1,
    Execution = 2,
    Monitoring = 3,
    Discovery = 4,
    Analysis = 5,
}

/// Per-window budget configuration. Quotas must fit under the buffered
/// global cap; a contradictory allocation is a startup error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_requests_per_minute: u32,
    /// Fraction of the raw limit actually usable (headroom for the broker).
    pub rate_limit_buffer: f64,
    pub broad_scan_quota: u32,
    pub deep_dive_quota: u32,
    pub trade_execution_quota: u32,
    pub position_monitoring_quota: u32,
    pub emergency_reserve_quota: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 200,
            rate_limit_buffer: 0.85,
            broad_scan_quota: 25,
            deep_dive_quota: 50,
            trade_execution_quota: 35,
            position_monitoring_quota: 40,
            emergency_reserve_quota: 20,
        }
    }
}

impl BudgetConfig {
    pub fn quota(&self, category: CallCategory) -> u32 {
        match category {
            CallCategory::BroadScan => self.broad_scan_quota,
            CallCategory::DeepDive => self.deep_dive_quota,
            CallCategory::TradeExecution => self.trade_execution_quota,
            CallCategory::PositionMonitoring => self.position_monitoring_quota,
            CallCategory::EmergencyReserve => self.emergency_reserve_quota,
        }
    }

    pub fn global_cap(&self) -> u32 {
        (self.max_requests_per_minute as f64 * self.rate_limit_buffer).floor() as u32
    }

    pub fn total_allocation(&self) -> u32 {
        CallCategory::ALL.iter().map(|c| self.quota(*c)).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rate_limit_buffer) || self.rate_limit_buffer == 0.0 {
            bail!(
                "rate_limit_buffer {} must be in (0, 1]",
                self.rate_limit_buffer
            );
        }
        let total = self.total_allocation();
        let cap = self.global_cap();
        if total > cap {
            bail!("API budget allocation ({total}) exceeds buffered limit ({cap})");
        }
        Ok(())
    }
}

/// A successful budget grant.
#[derive(Debug, Clone, Serialize)]
pub struct Grant {
    pub category: CallCategory,
    pub cost: u32,
    pub category_remaining: u32,
    pub global_remaining: u32,
}

/// Why a request was denied. Non-fatal by contract: callers skip the call
/// for this cycle, they never abort on it.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum Denied {
    #[error("global budget exhausted ({consumed}/{cap} this window)")]
    GlobalExhausted { consumed: u32, cap: u32 },

    #[error("category {} quota exhausted ({consumed}/{quota} this window)", category.as_str())]
    CategoryExhausted {
        category: CallCategory,
        consumed: u32,
        quota: u32,
    },
}

/// One request in a batched scheduling tick.
#[derive(Debug, Clone, Copy)]
pub struct BudgetRequest {
    pub category: CallCategory,
    pub priority: Priority,
    pub cost: u32,
}

impl BudgetRequest {
    pub fn new(category: CallCategory, priority: Priority) -> Self {
        Self {
            category,
            priority,
            cost: 1,
        }
    }
}

/// Recorded grant/deny decision, kept for observability. The scheduler
/// itself holds no business logic about what a call is for.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    pub category: CallCategory,
    pub priority: Priority,
    pub cost: u32,
    pub granted: bool,
    pub denial: Option<String>,
}

/// Point-in-time usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    pub window_start: DateTime<Utc>,
    pub global_consumed: u32,
    pub global_cap: u32,
    pub consumed: Vec<(CallCategory, u32, u32)>,
}

const DECISION_LOG_CAPACITY: usize = 256;

struct SchedulerState {
    window_start: DateTime<Utc>,
    consumed: [u32; 5],
    global_consumed: u32,
    arrival_seq: u64,
    decisions: VecDeque<DecisionRecord>,
}

pub struct BudgetScheduler {
    config: BudgetConfig,
    state: Mutex<SchedulerState>,
}

impl BudgetScheduler {
    pub fn new(config: BudgetConfig) -> Result<Self> {
        config.validate()?;
        let window_start = floor_to_minute(Utc::now());
        Ok(Self {
            config,
            state: Mutex::new(SchedulerState {
                window_start,
                consumed: [0; 5],
                global_consumed: 0,
                arrival_seq: 0,
                decisions: VecDeque::with_capacity(DECISION_LOG_CAPACITY),
            }),
        })
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Request budget for one call. Non-blocking: the answer is immediate,
    /// and a denial means "skip this cycle", never "wait".
    pub fn request(&self, category: CallCategory, priority: Priority) -> Result<Grant, Denied> {
        self.request_with_cost(category, priority, 1)
    }

    pub fn request_with_cost(
        &self,
        category: CallCategory,
        priority: Priority,
        cost: u32,
    ) -> Result<Grant, Denied> {
        self.request_at(category, priority, cost, Utc::now())
    }

    /// Clock-injected variant used by the window-reset tests.
    pub fn request_at(
        &self,
        category: CallCategory,
        priority: Priority,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Grant, Denied> {
        let mut state = self.state.lock().expect("budget scheduler lock poisoned");
        state.arrival_seq += 1;
        Self::grant_locked(&self.config, &mut state, category, priority, cost, now)
    }

    /// Arbitrate a batch of requests arriving in the same scheduling tick.
    ///
    /// Requests are serviced through a min-heap keyed by
    /// `(priority, arrival_order)`: lower priority value first, insertion
    /// order breaking ties, so contention is FIFO-fair within a priority
    /// class. Results come back in submission order.
    pub fn request_tick(&self, requests: &[BudgetRequest]) -> Vec<Result<Grant, Denied>> {
        self.request_tick_at(requests, Utc::now())
    }

    pub fn request_tick_at(
        &self,
        requests: &[BudgetRequest],
        now: DateTime<Utc>,
    ) -> Vec<Result<Grant, Denied>> {
        let mut state = self.state.lock().expect("budget scheduler lock poisoned");

        let mut heap = BinaryHeap::with_capacity(requests.len());
        for (idx, req) in requests.iter().enumerate() {
            state.arrival_seq += 1;
            let arrival = state.arrival_seq;
            heap.push(Reverse((req.priority, arrival, idx)));
        }

        let mut results: Vec<Option<Result<Grant, Denied>>> = vec![None; requests.len()];
        while let Some(Reverse((priority, _, idx))) = heap.pop() {
            let req = &requests[idx];
            results[idx] = Some(Self::grant_locked(
                &self.config,
                &mut state,
                req.category,
                priority,
                req.cost,
                now,
            ));
        }
        results.into_iter().map(|r| r.expect("all serviced")).collect()
    }

    pub fn usage(&self) -> BudgetUsage {
        let state = self.state.lock().expect("budget scheduler lock poisoned");
        BudgetUsage {
            window_start: state.window_start,
            global_consumed: state.global_consumed,
            global_cap: self.config.global_cap(),
            consumed: CallCategory::ALL
                .iter()
                .map(|c| (*c, state.consumed[c.index()], self.config.quota(*c)))
                .collect(),
        }
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        let state = self.state.lock().expect("budget scheduler lock poisoned");
        state.decisions.iter().cloned().collect()
    }

    fn grant_locked(
        config: &BudgetConfig,
        state: &mut SchedulerState,
        category: CallCategory,
        priority: Priority,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Grant, Denied> {
        Self::maybe_reset_window(state, now);

        let cap = config.global_cap();
        let quota = config.quota(category);

        // Global cap wins over category headroom.
        let decision = if state.global_consumed + cost > cap {
            Err(Denied::GlobalExhausted {
                consumed: state.global_consumed,
                cap,
            })
        } else if state.consumed[category.index()] + cost > quota {
            Err(Denied::CategoryExhausted {
                category,
                consumed: state.consumed[category.index()],
                quota,
            })
        } else {
            state.consumed[category.index()] += cost;
            state.global_consumed += cost;
            Ok(Grant {
                category,
                cost,
                category_remaining: quota - state.consumed[category.index()],
                global_remaining: cap - state.global_consumed,
            })
        };

        match &decision {
            Ok(grant) => debug!(
                category = category.as_str(),
                cost,
                remaining = grant.category_remaining,
                "budget granted"
            ),
            Err(denied) => warn!(category = category.as_str(), %denied, "budget denied"),
        }

        if state.decisions.len() == DECISION_LOG_CAPACITY {
            state.decisions.pop_front();
        }
        state.decisions.push_back(DecisionRecord {
            at: now,
            category,
            priority,
            cost,
            granted: decision.is_ok(),
            denial: decision.as_ref().err().map(|d| d.to_string()),
        });

        decision
    }

    /// Reset all consumed counters at each wall-clock minute boundary.
    /// Runs under the state lock, so the reset is atomic for all callers.
    fn maybe_reset_window(state: &mut SchedulerState, now: DateTime<Utc>) {
        let window = floor_to_minute(now);
        if window > state.window_start {
            state.consumed = [0; 5];
            state.global_consumed = 0;
            state.window_start = window;
            debug!(window_start = %window, "budget window reset");
        }
    }
}

fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler() -> BudgetScheduler {
        BudgetScheduler::new(BudgetConfig::default()).unwrap()
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, minute, second).unwrap()
    }

    #[test]
    fn contradictory_allocation_rejected_at_startup() {
        let config = BudgetConfig {
            broad_scan_quota: 100,
            deep_dive_quota: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(BudgetScheduler::new(config).is_err());
    }

    #[test]
    fn category_quota_exhaustion_denies_without_blocking() {
        let sched = scheduler();
        let now = at(0, 0);
        for _ in 0..25 {
            sched
                .request_at(CallCategory::BroadScan, Priority::Discovery, 1, now)
                .unwrap();
        }
        let denied = sched
            .request_at(CallCategory::BroadScan, Priority::Discovery, 1, now)
            .unwrap_err();
        assert!(matches!(denied, Denied::CategoryExhausted { consumed: 25, .. }));

        // Other categories still have room in the same window.
        assert!(sched
            .request_at(CallCategory::DeepDive, Priority::Analysis, 1, now)
            .is_ok());
    }

    #[test]
    fn global_cap_wins_even_when_category_has_room() {
        // Quotas sum exactly to the cap; leave emergency untouched so
        // the other four can exhaust the non-reserve allocation.
        let config = BudgetConfig {
            max_requests_per_minute: 20,
            rate_limit_buffer: 1.0,
            broad_scan_quota: 10,
            deep_dive_quota: 10,
            trade_execution_quota: 0,
            position_monitoring_quota: 0,
            emergency_reserve_quota: 0,
        };
        let sched = BudgetScheduler::new(config).unwrap();
        let now = at(0, 0);
        for _ in 0..10 {
            sched
                .request_at(CallCategory::BroadScan, Priority::Discovery, 1, now)
                .unwrap();
            sched
                .request_at(CallCategory::DeepDive, Priority::Analysis, 1, now)
                .unwrap();
        }
        // Both categories and the global cap are now at 20/20. A category
        // with quota zero reports the global denial, not the category one.
        let denied = sched
            .request_at(CallCategory::TradeExecution, Priority::Execution, 1, now)
            .unwrap_err();
        assert!(matches!(denied, Denied::GlobalExhausted { .. }));
    }

    #[test]
    fn consumed_never_exceeds_buffered_cap() {
        let sched = scheduler();
        let now = at(0, 30);
        let mut granted = 0u32;
        for _ in 0..500 {
            for category in CallCategory::ALL {
                if sched
                    .request_at(category, Priority::Monitoring, 1, now)
                    .is_ok()
                {
                    granted += 1;
                }
            }
        }
        let usage = sched.usage();
        assert_eq!(usage.global_consumed, granted);
        assert!(usage.global_consumed <= usage.global_cap);
        let total: u32 = usage.consumed.iter().map(|(_, c, _)| c).sum();
        assert_eq!(total, usage.global_consumed);
    }

    #[test]
    fn window_resets_at_minute_boundary() {
        let sched = scheduler();
        for _ in 0..25 {
            sched
                .request_at(CallCategory::BroadScan, Priority::Discovery, 1, at(0, 59))
                .unwrap();
        }
        assert!(sched
            .request_at(CallCategory::BroadScan, Priority::Discovery, 1, at(0, 59))
            .is_err());

        // One second later the minute rolls over and the quota is fresh.
        assert!(sched
            .request_at(CallCategory::BroadScan, Priority::Discovery, 1, at(1, 0))
            .is_ok());
        assert_eq!(sched.usage().global_consumed, 1);
    }

    #[test]
    fn emergency_reserve_is_never_borrowed() {
        let sched = scheduler();
        let now = at(0, 0);
        for _ in 0..25 {
            sched
                .request_at(CallCategory::BroadScan, Priority::Discovery, 1, now)
                .unwrap();
        }
        // Broad scan is exhausted; the idle emergency reserve does not help it.
        assert!(sched
            .request_at(CallCategory::BroadScan, Priority::Discovery, 1, now)
            .is_err());
        // The reserve itself still serves emergency requests.
        assert!(sched
            .request_at(CallCategory::EmergencyReserve, Priority::Emergency, 1, now)
            .is_ok());
    }

    #[test]
    fn tick_services_by_priority_then_arrival() {
        // Execution quota of 1: in a contended tick the Emergency-priority
        // request must win even though it was submitted last.
        let config = BudgetConfig {
            max_requests_per_minute: 200,
            rate_limit_buffer: 0.85,
            trade_execution_quota: 1,
            ..Default::default()
        };
        let sched = BudgetScheduler::new(config).unwrap();
        let requests = [
            BudgetRequest::new(CallCategory::TradeExecution, Priority::Execution),
            BudgetRequest::new(CallCategory::TradeExecution, Priority::Emergency),
        ];
        let results = sched.request_tick_at(&requests, at(0, 0));
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn tick_is_fifo_within_priority_class() {
        let config = BudgetConfig {
            trade_execution_quota: 2,
            ..Default::default()
        };
        let sched = BudgetScheduler::new(config).unwrap();
        let requests = [
            BudgetRequest::new(CallCategory::TradeExecution, Priority::Execution),
            BudgetRequest::new(CallCategory::TradeExecution, Priority::Execution),
            BudgetRequest::new(CallCategory::TradeExecution, Priority::Execution),
        ];
        let results = sched.request_tick_at(&requests, at(0, 0));
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
    }

    #[test]
    fn every_decision_is_recorded() {
        let sched = scheduler();
        let now = at(0, 0);
        sched
            .request_at(CallCategory::DeepDive, Priority::Analysis, 1, now)
            .unwrap();
        for _ in 0..25 {
            let _ = sched.request_at(CallCategory::BroadScan, Priority::Discovery, 1, now);
        }
        let _ = sched.request_at(CallCategory::BroadScan, Priority::Discovery, 1, now);

        let log = sched.recent_decisions();
        assert_eq!(log.len(), 27);
        assert!(log[0].granted);
        let last = log.last().unwrap();
        assert!(!last.granted);
        assert!(last.denial.as_deref().unwrap().contains("quota exhausted"));
    }
}
