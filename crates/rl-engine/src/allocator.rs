//! Budget allocation across recipients (ad groups, channels or campaigns).
//!
//! Every strategy turns recipient metrics into weights, splits the budget
//! proportionally and hands the raw split to [`project_allocations`], which
//! enforces per-recipient bounds and the total-budget cap.

use campaign_core::config::AllocatorConfig;
use campaign_core::error::OptimizerError;
use campaign_core::telemetry::{RecoveryKind, RecoveryTelemetry};
use campaign_core::types::{BudgetAllocation, ConstraintSet, PerformanceSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

const ROAS_SHARE: f64 = 0.4;
const CTR_SHARE: f64 = 0.3;
const CONVERSION_RATE_SHARE: f64 = 0.3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Performance figures the strategies weigh a recipient by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipientMetrics {
    pub roas: f64,
    pub ctr: f64,
    pub conversion_rate: f64,
    pub cpa: f64,
}

impl From<&PerformanceSnapshot> for RecipientMetrics {
    fn from(snapshot: &PerformanceSnapshot) -> Self {
        Self {
            roas: snapshot.roas(),
            ctr: snapshot.ctr(),
            conversion_rate: snapshot.conversion_rate(),
            cpa: snapshot.cpa(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default)]
    pub metrics: RecipientMetrics,
}

impl Recipient {
    pub fn new(id: impl Into<String>, metrics: RecipientMetrics) -> Self {
        Self {
            id: id.into(),
            metrics,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    Equal,
    PerformanceBased,
    RoasOptimized,
    CpaOptimized,
}

impl AllocationStrategy {
    pub const ALL: [AllocationStrategy; 4] = [
        AllocationStrategy::Equal,
        AllocationStrategy::PerformanceBased,
        AllocationStrategy::RoasOptimized,
        AllocationStrategy::CpaOptimized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::Equal => "equal",
            AllocationStrategy::PerformanceBased => "performance_based",
            AllocationStrategy::RoasOptimized => "roas_optimized",
            AllocationStrategy::CpaOptimized => "cpa_optimized",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                OptimizerError::InvalidInput(format!("unknown allocation strategy: {s}"))
            })
    }
}

/// One day of a multi-day plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAllocation {
    pub day: usize,
    pub allocation: BudgetAllocation,
}

// ---------------------------------------------------------------------------
// BudgetAllocator
// ---------------------------------------------------------------------------

/// Stateless allocator; safe to share across threads.
pub struct BudgetAllocator {
    config: AllocatorConfig,
    telemetry: Arc<RecoveryTelemetry>,
}

impl BudgetAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            telemetry: Arc::new(RecoveryTelemetry::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<RecoveryTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn allocate(
        &self,
        strategy: AllocationStrategy,
        total_budget: f64,
        recipients: &[Recipient],
        constraints: &ConstraintSet,
    ) -> BudgetAllocation {
        let total = self.sanitize_total(total_budget);
        let recipients = dedup_recipients(recipients);
        if recipients.is_empty() {
            return BudgetAllocation::empty(total);
        }

        let weights = self.weights(strategy, &recipients);
        let raw = recipients
            .iter()
            .zip(weights.iter())
            .map(|(recipient, weight)| (recipient.id.clone(), total * weight));
        let allocation = project_allocations(total, raw, constraints);

        debug!(
            strategy = %strategy,
            recipients = recipients.len(),
            total_budget = total,
            total_allocated = allocation.total_allocated,
            "budget allocated"
        );
        allocation
    }

    /// Normalized weights in recipient order; an equal split when every
    /// weight is zero.
    pub fn weights(&self, strategy: AllocationStrategy, recipients: &[&Recipient]) -> Vec<f64> {
        let raw: Vec<f64> = recipients
            .iter()
            .map(|recipient| {
                let metrics = self.sanitize_metrics(&recipient.metrics);
                self.raw_weight(strategy, &metrics)
            })
            .collect();

        let sum: f64 = raw.iter().sum();
        if sum.is_finite() && sum > 0.0 {
            raw.iter().map(|w| w / sum).collect()
        } else {
            let n = recipients.len() as f64;
            vec![1.0 / n; recipients.len()]
        }
    }

    /// Negative and non-finite budgets become 0.
    pub fn sanitize_total(&self, total_budget: f64) -> f64 {
        if total_budget.is_finite() && total_budget >= 0.0 {
            total_budget
        } else {
            warn!(total_budget, "invalid total budget, allocating nothing");
            self.telemetry.record(RecoveryKind::InvalidInput);
            0.0
        }
    }

    /// Split `total_budget` evenly over `days` and re-solve each day. After each
    /// day `update_metrics` may rewrite the recipients' metrics for the next one.
    pub fn allocate_over_horizon<F>(
        &self,
        strategy: AllocationStrategy,
        total_budget: f64,
        days: usize,
        recipients: &[Recipient],
        constraints: &ConstraintSet,
        mut update_metrics: F,
    ) -> Vec<DailyAllocation>
    where
        F: FnMut(usize, &BudgetAllocation, &mut [Recipient]),
    {
        if days == 0 {
            return Vec::new();
        }
        let daily_budget = self.sanitize_total(total_budget) / days as f64;
        let mut current = recipients.to_vec();
        let mut plan = Vec::with_capacity(days);

        for day in 0..days {
            let allocation = self.allocate(strategy, daily_budget, &current, constraints);
            update_metrics(day, &allocation, &mut current);
            plan.push(DailyAllocation { day, allocation });
        }
        plan
    }

    fn raw_weight(&self, strategy: AllocationStrategy, m: &RecipientMetrics) -> f64 {
        let c = &self.config;
        match strategy {
            AllocationStrategy::Equal => 1.0,
            AllocationStrategy::PerformanceBased => {
                ROAS_SHARE * capped(m.roas, c.roas_cap)
                    + CTR_SHARE * capped(m.ctr, c.ctr_cap)
                    + CONVERSION_RATE_SHARE * capped(m.conversion_rate, c.conversion_rate_cap)
            }
            AllocationStrategy::RoasOptimized => m.roas.max(c.roas_floor),
            AllocationStrategy::CpaOptimized => {
                if m.cpa > 0.0 {
                    1.0 / m.cpa.max(c.cpa_floor)
                } else {
                    c.zero_cpa_weight
                }
            }
        }
    }

    fn sanitize_metrics(&self, metrics: &RecipientMetrics) -> RecipientMetrics {
        let mut replaced = 0;
        let mut clean = |value: f64| {
            if value.is_finite() {
                value.max(0.0)
            } else {
                replaced += 1;
                0.0
            }
        };
        let sanitized = RecipientMetrics {
            roas: clean(metrics.roas),
            ctr: clean(metrics.ctr),
            conversion_rate: clean(metrics.conversion_rate),
            cpa: clean(metrics.cpa),
        };
        self.telemetry.record_n(RecoveryKind::InvalidInput, replaced);
        sanitized
    }
}

impl Default for BudgetAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

/// Clamp each amount to its recipient's bounds, then scale everything down by
/// one factor if the sum exceeds `total_budget`. When the cap forces a scale
/// down, minimums may end up unmet; the total is never exceeded.
pub fn project_allocations<I>(
    total_budget: f64,
    raw: I,
    constraints: &ConstraintSet,
) -> BudgetAllocation
where
    I: IntoIterator<Item = (String, f64)>,
{
    let total = if total_budget.is_finite() {
        total_budget.max(0.0)
    } else {
        0.0
    };

    let mut allocations = BTreeMap::new();
    for (id, amount) in raw {
        if allocations.contains_key(&id) {
            continue;
        }
        let bounds = constraints.for_recipient(&id);
        let min = if bounds.min_allocation.is_finite() {
            bounds.min_allocation.max(0.0)
        } else {
            0.0
        };
        let max = if bounds.max_allocation.is_nan() {
            f64::INFINITY
        } else {
            bounds.max_allocation.max(0.0)
        };
        let amount = if amount.is_finite() { amount } else { 0.0 };
        // max wins over an inconsistent min
        allocations.insert(id, amount.max(min).min(max));
    }

    let sum: f64 = allocations.values().sum();
    if sum > total {
        let factor = if sum > 0.0 { total / sum } else { 0.0 };
        for amount in allocations.values_mut() {
            *amount *= factor;
        }
    }

    let total_allocated = allocations.values().sum();
    BudgetAllocation {
        allocations,
        total_budget: total,
        total_allocated,
    }
}

fn capped(value: f64, cap: f64) -> f64 {
    if cap > 0.0 {
        value.min(cap) / cap
    } else {
        0.0
    }
}

fn dedup_recipients(recipients: &[Recipient]) -> Vec<&Recipient> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .filter(|recipient| seen.insert(recipient.id.as_str()))
        .collect()
}
