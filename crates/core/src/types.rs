use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Aggregated delivery metrics for a campaign or ad-group reporting window.
///
/// Produced by the external reporting collaborator. Every field is optional on
/// the wire; the derived ratios fall back to values computed from the raw
/// counters when they are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSnapshot {
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub conversion_value: f64,
    pub ctr: Option<f64>,
    pub cpa: Option<f64>,
    pub roas: Option<f64>,
    pub conversion_rate: Option<f64>,
}

impl PerformanceSnapshot {
    /// Build a snapshot from raw counters, leaving derived ratios to be computed.
    pub fn from_counters(
        spend: f64,
        impressions: u64,
        clicks: u64,
        conversions: f64,
        conversion_value: f64,
    ) -> Self {
        Self {
            spend,
            impressions,
            clicks,
            conversions,
            conversion_value,
            ..Default::default()
        }
    }

    /// Click-through rate (`clicks / impressions`).
    pub fn ctr(&self) -> f64 {
        self.ctr
            .unwrap_or_else(|| ratio(self.clicks as f64, self.impressions as f64))
    }

    /// Cost per acquisition (`spend / conversions`), 0.0 without conversions.
    pub fn cpa(&self) -> f64 {
        self.cpa
            .unwrap_or_else(|| ratio(self.spend, self.conversions))
    }

    /// Return on ad spend (`conversion_value / spend`).
    pub fn roas(&self) -> f64 {
        self.roas
            .unwrap_or_else(|| ratio(self.conversion_value, self.spend))
    }

    /// Conversions per click.
    pub fn conversion_rate(&self) -> f64 {
        self.conversion_rate
            .unwrap_or_else(|| ratio(self.conversions, self.clicks as f64))
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 && numerator.is_finite() && denominator.is_finite() {
        numerator / denominator
    } else {
        0.0
    }
}

/// Performance of a single ad group inside a campaign snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdGroupSnapshot {
    pub ad_group_id: String,
    #[serde(default)]
    pub performance: PerformanceSnapshot,
}

/// Campaign-level performance plus the ad groups that share its budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    #[serde(default)]
    pub campaign: PerformanceSnapshot,
    #[serde(default)]
    pub ad_groups: Vec<AdGroupSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Conversions,
    Traffic,
    Awareness,
    Sales,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Google,
    Meta,
    LinkedIn,
    TikTok,
    Other,
}

/// Bid strategies the bandit chooses between. The discriminant is the arm index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStrategy {
    TargetCpa = 0,
    TargetRoas = 1,
    MaximizeConversions = 2,
    MaximizeClicks = 3,
    ManualCpc = 4,
}

impl BidStrategy {
    pub const ALL: [BidStrategy; 5] = [
        BidStrategy::TargetCpa,
        BidStrategy::TargetRoas,
        BidStrategy::MaximizeConversions,
        BidStrategy::MaximizeClicks,
        BidStrategy::ManualCpc,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BidStrategy::TargetCpa => "target_cpa",
            BidStrategy::TargetRoas => "target_roas",
            BidStrategy::MaximizeConversions => "maximize_conversions",
            BidStrategy::MaximizeClicks => "maximize_clicks",
            BidStrategy::ManualCpc => "manual_cpc",
        }
    }
}

impl fmt::Display for BidStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static campaign attributes held by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStaticAttributes {
    pub campaign_id: Uuid,
    #[serde(default)]
    pub daily_budget: f64,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub roas_target: Option<f64>,
    #[serde(default)]
    pub cpa_target: Option<f64>,
    #[serde(default)]
    pub current_strategy: Option<BidStrategy>,
}

impl CampaignStaticAttributes {
    pub fn new(campaign_id: Uuid, daily_budget: f64) -> Self {
        Self {
            campaign_id,
            daily_budget,
            objective: Objective::default(),
            platform: Platform::default(),
            roas_target: None,
            cpa_target: None,
            current_strategy: None,
        }
    }
}

/// Optimization goals toggled on the campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationGoals {
    pub maximize_conversions: bool,
    pub maximize_roas: bool,
    pub minimize_cpa: bool,
    pub maximize_clicks: bool,
}

impl OptimizationGoals {
    /// Stable key fragment naming the active goals, `"none"` when empty.
    pub fn signature(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if self.maximize_conversions {
            parts.push("conversions");
        }
        if self.maximize_roas {
            parts.push("roas");
        }
        if self.minimize_cpa {
            parts.push("cpa");
        }
        if self.maximize_clicks {
            parts.push("clicks");
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join("+")
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.maximize_conversions || self.maximize_roas || self.minimize_cpa || self.maximize_clicks)
    }
}

/// Budget bounds for one allocation recipient.
///
/// An infinite `max_allocation` means unbounded. It is omitted on the wire,
/// and an absent or `null` maximum reads back as unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraint {
    #[serde(default)]
    pub min_allocation: f64,
    #[serde(
        default = "unbounded",
        deserialize_with = "deserialize_bound",
        skip_serializing_if = "is_unbounded"
    )]
    pub max_allocation: f64,
}

fn unbounded() -> f64 {
    f64::INFINITY
}

fn is_unbounded(value: &f64) -> bool {
    value.is_infinite() && value.is_sign_positive()
}

fn deserialize_bound<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
}

impl AllocationConstraint {
    pub fn new(min_allocation: f64, max_allocation: f64) -> Self {
        Self {
            min_allocation,
            max_allocation,
        }
    }

    pub fn at_most(max_allocation: f64) -> Self {
        Self::new(0.0, max_allocation)
    }

    pub fn at_least(min_allocation: f64) -> Self {
        Self::new(min_allocation, f64::INFINITY)
    }
}

impl Default for AllocationConstraint {
    fn default() -> Self {
        Self::new(0.0, f64::INFINITY)
    }
}

/// Constraints for a whole allocation: an optional default plus per-recipient overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSet {
    pub default: Option<AllocationConstraint>,
    pub per_recipient: BTreeMap<String, AllocationConstraint>,
}

impl ConstraintSet {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn uniform(constraint: AllocationConstraint) -> Self {
        Self {
            default: Some(constraint),
            per_recipient: BTreeMap::new(),
        }
    }

    pub fn with(mut self, recipient_id: impl Into<String>, constraint: AllocationConstraint) -> Self {
        self.per_recipient.insert(recipient_id.into(), constraint);
        self
    }

    /// Effective constraint for a recipient.
    pub fn for_recipient(&self, recipient_id: &str) -> AllocationConstraint {
        self.per_recipient
            .get(recipient_id)
            .copied()
            .or(self.default)
            .unwrap_or_default()
    }
}

/// Output of the budget allocator: amounts keyed by recipient id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub allocations: BTreeMap<String, f64>,
    pub total_budget: f64,
    pub total_allocated: f64,
}

impl BudgetAllocation {
    pub fn empty(total_budget: f64) -> Self {
        Self {
            allocations: BTreeMap::new(),
            total_budget,
            total_allocated: 0.0,
        }
    }

    pub fn get(&self, recipient_id: &str) -> Option<f64> {
        self.allocations.get(recipient_id).copied()
    }

    pub fn unallocated(&self) -> f64 {
        (self.total_budget - self.total_allocated).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    BidStrategy,
    BudgetAllocation,
    Creative,
    Targeting,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    High,
    Medium,
    Low,
}

/// One advisory item of an optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: RecommendationCategory,
    pub priority: RecommendationPriority,
    pub message: String,
    pub detail: serde_json::Value,
    /// Improvement credited to this item; 0.0 when the item is informational.
    pub expected_improvement: f64,
}

/// The single output of an optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub result_id: Uuid,
    pub campaign_id: Uuid,
    pub selected_strategy: BidStrategy,
    pub confidence: f64,
    pub expected_reward: f64,
    pub expected_improvement: f64,
    pub budget_allocation: BTreeMap<String, f64>,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn recommendations_for(
        &self,
        category: RecommendationCategory,
    ) -> impl Iterator<Item = &Recommendation> {
        self.recommendations
            .iter()
            .filter(move |r| r.category == category)
    }
}
