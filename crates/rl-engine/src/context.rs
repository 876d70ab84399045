//! Context extraction: encodes campaign attributes, a performance snapshot
//! and the active goals into the fixed-length vector shared by the bandit and
//! the budget policy.
//!
//! Layout (20 dims):
//!   [0]      bias (constant 1.0)
//!   [1]      daily budget / 1000, clipped to [0, 10]
//!   [2]      ROAS target / 10, clipped to [0, 1]
//!   [3..7)   objective one-hot (conversions, traffic, awareness, sales)
//!   [7..10)  platform one-hot (google, meta, other)
//!   [10]     CTR
//!   [11]     conversion rate
//!   [12]     ROAS / 10
//!   [13]     CPA / 100
//!   [14]     spend / 1000, clipped to [0, 10]
//!   [15]     ln(1 + conversions) / 10
//!   [16..20) goal flags (conversions, roas, cpa, clicks)

use campaign_core::types::{
    CampaignStaticAttributes, Objective, OptimizationGoals, PerformanceSnapshot, Platform,
};
use ndarray::Array1;

pub const CONTEXT_DIM: usize = 20;

/// Fixed-dimension numeric encoding of a campaign's situation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextVector(Array1<f64>);

impl ContextVector {
    /// Wrap raw values; shorter input is zero-padded, longer input truncated.
    pub fn from_values(values: &[f64]) -> Self {
        let mut data = Array1::<f64>::zeros(CONTEXT_DIM);
        for (slot, value) in data.iter_mut().zip(values.iter()) {
            *slot = if value.is_finite() { *value } else { 0.0 };
        }
        Self(data)
    }

    pub fn as_array(&self) -> &Array1<f64> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.0.to_vec()
    }
}

/// Context plus the number of malformed inputs replaced with 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextExtraction {
    pub vector: ContextVector,
    pub sanitized_fields: u64,
}

/// Encode `(attributes, snapshot, goals)`. Never fails; malformed numbers become 0.
pub fn extract(
    attributes: &CampaignStaticAttributes,
    snapshot: &PerformanceSnapshot,
    goals: &OptimizationGoals,
) -> ContextVector {
    extract_with_report(attributes, snapshot, goals).vector
}

pub fn extract_with_report(
    attributes: &CampaignStaticAttributes,
    snapshot: &PerformanceSnapshot,
    goals: &OptimizationGoals,
) -> ContextExtraction {
    let mut sanitizer = Sanitizer::default();
    let mut v = Array1::<f64>::zeros(CONTEXT_DIM);

    v[0] = 1.0;
    v[1] = (sanitizer.clean(attributes.daily_budget) / 1000.0).clamp(0.0, 10.0);
    v[2] = (sanitizer.clean(attributes.roas_target.unwrap_or(0.0)) / 10.0).clamp(0.0, 1.0);

    let objective_slot = match attributes.objective {
        Objective::Conversions => 3,
        Objective::Traffic => 4,
        Objective::Awareness => 5,
        Objective::Sales => 6,
    };
    v[objective_slot] = 1.0;

    let platform_slot = match attributes.platform {
        Platform::Google => 7,
        Platform::Meta => 8,
        Platform::LinkedIn | Platform::TikTok | Platform::Other => 9,
    };
    v[platform_slot] = 1.0;

    v[10] = sanitizer.clean(snapshot.ctr()).clamp(0.0, 1.0);
    v[11] = sanitizer.clean(snapshot.conversion_rate()).clamp(0.0, 1.0);
    v[12] = (sanitizer.clean(snapshot.roas()) / 10.0).clamp(0.0, 1.0);
    v[13] = (sanitizer.clean(snapshot.cpa()) / 100.0).clamp(0.0, 1.0);
    v[14] = (sanitizer.clean(snapshot.spend) / 1000.0).clamp(0.0, 10.0);
    v[15] = (sanitizer.clean(snapshot.conversions).max(0.0).ln_1p() / 10.0).clamp(0.0, 1.0);

    v[16] = flag(goals.maximize_conversions);
    v[17] = flag(goals.maximize_roas);
    v[18] = flag(goals.minimize_cpa);
    v[19] = flag(goals.maximize_clicks);

    ContextExtraction {
        vector: ContextVector(v),
        sanitized_fields: sanitizer.replaced,
    }
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

#[derive(Default)]
struct Sanitizer {
    replaced: u64,
}

impl Sanitizer {
    fn clean(&mut self, value: f64) -> f64 {
        if value.is_finite() {
            value
        } else {
            self.replaced += 1;
            0.0
        }
    }
}
