//! Recommendation assembly. Bid strategy and budget items come from the
//! learned models; creative, targeting and schedule items are threshold
//! heuristics over the campaign snapshot.

use crate::bandit::ArmSelection;
use campaign_core::config::RecommendationConfig;
use campaign_core::types::{
    AdGroupSnapshot, BudgetAllocation, CampaignSnapshot, CampaignStaticAttributes,
    PerformanceSnapshot, Recommendation, RecommendationCategory, RecommendationPriority,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(config: RecommendationConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        attributes: &CampaignStaticAttributes,
        snapshot: &CampaignSnapshot,
        selection: &ArmSelection,
        allocation: &BudgetAllocation,
    ) -> Vec<Recommendation> {
        let campaign = &snapshot.campaign;
        let mut out = vec![self.bid_strategy(attributes, selection)];
        if let Some(rec) = self.budget_allocation(allocation, &snapshot.ad_groups) {
            out.push(rec);
        }
        if let Some(rec) = self.creative(campaign) {
            out.push(rec);
        }
        if let Some(rec) = self.targeting(attributes, campaign) {
            out.push(rec);
        }
        if let Some(rec) = self.schedule(attributes, campaign) {
            out.push(rec);
        }
        out
    }

    /// Sum of the credited items, capped.
    pub fn expected_improvement(&self, recommendations: &[Recommendation]) -> f64 {
        let total: f64 = recommendations.iter().map(|r| r.expected_improvement).sum();
        total.clamp(0.0, self.config.improvement.max_total)
    }

    fn bid_strategy(
        &self,
        attributes: &CampaignStaticAttributes,
        selection: &ArmSelection,
    ) -> Recommendation {
        let c = &self.config;
        let strategy = selection.strategy;
        let priority = if selection.confidence >= c.high_confidence {
            RecommendationPriority::High
        } else if selection.confidence >= c.min_confidence {
            RecommendationPriority::Medium
        } else {
            RecommendationPriority::Low
        };

        let unchanged = attributes.current_strategy == Some(strategy);
        let applied = selection.confidence >= c.min_confidence && !unchanged;
        let message = if unchanged {
            format!("Keep the current {strategy} bid strategy")
        } else if applied {
            format!("Switch bidding to {strategy}")
        } else {
            format!("Consider {strategy} bidding once more data is available")
        };

        Recommendation {
            category: RecommendationCategory::BidStrategy,
            priority,
            message,
            detail: json!({
                "strategy": strategy,
                "current_strategy": attributes.current_strategy,
                "confidence": selection.confidence,
                "expected_reward": selection.expected_reward,
                "explored": selection.explored,
            }),
            expected_improvement: if applied { c.improvement.bid_strategy } else { 0.0 },
        }
    }

    /// Allocation summary, with each funded ad group's current performance next
    /// to its amount.
    fn budget_allocation(
        &self,
        allocation: &BudgetAllocation,
        ad_groups: &[AdGroupSnapshot],
    ) -> Option<Recommendation> {
        if allocation.is_empty() {
            return None;
        }
        let mut groups: BTreeMap<&str, Value> = BTreeMap::new();
        for group in ad_groups {
            let id = group.ad_group_id.as_str();
            let Some(amount) = allocation.allocations.get(id) else {
                continue;
            };
            let perf = &group.performance;
            groups.entry(id).or_insert_with(|| {
                json!({
                    "amount": amount,
                    "spend": finite(perf.spend),
                    "roas": finite(perf.roas()),
                    "ctr": finite(perf.ctr()),
                    "conversion_rate": finite(perf.conversion_rate()),
                    "cpa": finite(perf.cpa()),
                })
            });
        }
        let credited = allocation.total_allocated > 0.0;
        Some(Recommendation {
            category: RecommendationCategory::BudgetAllocation,
            priority: RecommendationPriority::Medium,
            message: format!(
                "Redistribute {:.2} of the daily budget across {} ad groups",
                allocation.total_allocated,
                allocation.allocations.len()
            ),
            detail: json!({
                "allocations": allocation.allocations,
                "total_allocated": allocation.total_allocated,
                "unallocated": allocation.unallocated(),
                "ad_groups": groups,
            }),
            expected_improvement: if credited {
                self.config.improvement.budget_allocation
            } else {
                0.0
            },
        })
    }

    fn creative(&self, snapshot: &PerformanceSnapshot) -> Option<Recommendation> {
        let c = &self.config;
        let ctr = finite(snapshot.ctr());
        if snapshot.impressions < c.min_impressions || ctr >= c.low_ctr {
            return None;
        }
        Some(Recommendation {
            category: RecommendationCategory::Creative,
            priority: RecommendationPriority::Medium,
            message: format!(
                "CTR {:.2}% is below {:.2}%; refresh ad creatives",
                ctr * 100.0,
                c.low_ctr * 100.0
            ),
            detail: json!({ "ctr": ctr, "impressions": snapshot.impressions }),
            expected_improvement: c.improvement.creative,
        })
    }

    fn targeting(
        &self,
        attributes: &CampaignStaticAttributes,
        snapshot: &PerformanceSnapshot,
    ) -> Option<Recommendation> {
        let c = &self.config;
        let conversion_rate = finite(snapshot.conversion_rate());
        let cpa = finite(snapshot.cpa());

        let weak_conversion =
            snapshot.clicks >= c.min_clicks && conversion_rate < c.low_conversion_rate;
        let cpa_over_target = attributes
            .cpa_target
            .filter(|t| t.is_finite() && *t > 0.0)
            .filter(|t| cpa > c.cpa_tolerance * t);

        if !weak_conversion && cpa_over_target.is_none() {
            return None;
        }

        let (priority, message) = match cpa_over_target {
            Some(target) => (
                RecommendationPriority::High,
                format!("CPA {cpa:.2} exceeds target {target:.2}; refine audience targeting"),
            ),
            None => (
                RecommendationPriority::Medium,
                format!(
                    "Conversion rate {:.2}% is low; refine audience targeting",
                    conversion_rate * 100.0
                ),
            ),
        };
        Some(Recommendation {
            category: RecommendationCategory::Targeting,
            priority,
            message,
            detail: json!({
                "conversion_rate": conversion_rate,
                "clicks": snapshot.clicks,
                "cpa": cpa,
                "cpa_target": attributes.cpa_target,
            }),
            expected_improvement: c.improvement.targeting,
        })
    }

    fn schedule(
        &self,
        attributes: &CampaignStaticAttributes,
        snapshot: &PerformanceSnapshot,
    ) -> Option<Recommendation> {
        let c = &self.config;
        let budget = attributes.daily_budget;
        if !(budget.is_finite() && budget > 0.0) {
            return None;
        }
        let utilization = finite(snapshot.spend).max(0.0) / budget;

        let (priority, message) = if utilization < c.underspend_ratio {
            (
                RecommendationPriority::Low,
                format!(
                    "Only {:.0}% of the daily budget spent; widen the delivery schedule",
                    utilization * 100.0
                ),
            )
        } else if utilization >= c.overspend_ratio {
            (
                RecommendationPriority::Medium,
                format!(
                    "{:.0}% of the daily budget spent; delivery is budget limited, consider dayparting",
                    utilization * 100.0
                ),
            )
        } else {
            return None;
        };

        Some(Recommendation {
            category: RecommendationCategory::Schedule,
            priority,
            message,
            detail: json!({ "utilization": utilization, "daily_budget": budget }),
            expected_improvement: c.improvement.schedule,
        })
    }
}

impl Default for RecommendationEngine {
    fn default() -> Self {
        Self::new(RecommendationConfig::default())
    }
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
