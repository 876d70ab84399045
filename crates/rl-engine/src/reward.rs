//! Reward shaping: blends normalized ROAS, CPA headroom and conversion volume
//! into a single score in [0, 1], weighted by the campaign's active goals.

use campaign_core::config::RewardConfig;
use campaign_core::types::{CampaignStaticAttributes, OptimizationGoals, PerformanceSnapshot};
use rand::Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone)]
pub struct RewardModel {
    config: RewardConfig,
}

/// The three normalized reward components, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardTerms {
    pub roas: f64,
    pub cpa: f64,
    pub conversions: f64,
}

impl RewardModel {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn terms(
        &self,
        snapshot: &PerformanceSnapshot,
        attributes: &CampaignStaticAttributes,
    ) -> RewardTerms {
        let roas_cap = attributes
            .roas_target
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| 2.0 * t)
            .unwrap_or(self.config.roas_cap);
        let cpa_cap = attributes
            .cpa_target
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| 2.0 * t)
            .unwrap_or(self.config.cpa_cap);

        let conversions = finite_or_zero(snapshot.conversions).max(0.0);
        let roas = (finite_or_zero(snapshot.roas()) / roas_cap).clamp(0.0, 1.0);
        let cpa = if conversions > 0.0 {
            (1.0 - finite_or_zero(snapshot.cpa()) / cpa_cap).clamp(0.0, 1.0)
        } else {
            0.0
        };

        RewardTerms {
            roas,
            cpa,
            conversions: (conversions / self.config.conversions_cap).clamp(0.0, 1.0),
        }
    }

    /// Noise-free reward.
    pub fn base_reward(
        &self,
        snapshot: &PerformanceSnapshot,
        attributes: &CampaignStaticAttributes,
        goals: &OptimizationGoals,
    ) -> f64 {
        let terms = self.terms(snapshot, attributes);
        let (w_roas, w_cpa, w_conv) = self.weights(goals);
        (w_roas * terms.roas + w_cpa * terms.cpa + w_conv * terms.conversions).clamp(0.0, 1.0)
    }

    /// Reward with a small Gaussian exploration perturbation, clipped to [0, 1].
    pub fn reward<R: Rng + ?Sized>(
        &self,
        snapshot: &PerformanceSnapshot,
        attributes: &CampaignStaticAttributes,
        goals: &OptimizationGoals,
        rng: &mut R,
    ) -> f64 {
        let base = self.base_reward(snapshot, attributes, goals);
        let noise = if self.config.noise_std > 0.0 {
            rng.sample::<f64, _>(StandardNormal) * self.config.noise_std
        } else {
            0.0
        };
        (base + noise).clamp(0.0, 1.0)
    }

    /// Weights of the active goal terms, renormalized to sum to 1.
    fn weights(&self, goals: &OptimizationGoals) -> (f64, f64, f64) {
        let c = &self.config;
        let any_relevant = goals.maximize_roas
            || goals.minimize_cpa
            || goals.maximize_conversions
            || goals.maximize_clicks;

        let (roas, cpa, conv) = if any_relevant {
            (
                if goals.maximize_roas { c.roas_weight } else { 0.0 },
                if goals.minimize_cpa { c.cpa_weight } else { 0.0 },
                if goals.maximize_conversions || goals.maximize_clicks {
                    c.conversions_weight
                } else {
                    0.0
                },
            )
        } else {
            (c.roas_weight, c.cpa_weight, c.conversions_weight)
        };

        let total = roas + cpa + conv;
        if total > 0.0 {
            (roas / total, cpa / total, conv / total)
        } else {
            (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    fn model() -> RewardModel {
        RewardModel::new(RewardConfig::default())
    }

    fn attributes() -> CampaignStaticAttributes {
        CampaignStaticAttributes::new(Uuid::nil(), 1000.0)
    }

    #[test]
    fn test_terms_use_default_caps() {
        // roas 5, cpa 25, 50 conversions
        let snap = PerformanceSnapshot::from_counters(1250.0, 50_000, 1000, 50.0, 6250.0);
        let terms = model().terms(&snap, &attributes());
        assert!((terms.roas - 0.5).abs() < 1e-12);
        assert!((terms.cpa - 0.75).abs() < 1e-12);
        assert!((terms.conversions - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_targets_set_caps() {
        let snap = PerformanceSnapshot::from_counters(100.0, 1000, 100, 10.0, 300.0);
        let mut attrs = attributes();
        attrs.roas_target = Some(3.0);
        attrs.cpa_target = Some(10.0);
        let terms = model().terms(&snap, &attrs);
        assert!((terms.roas - 0.5).abs() < 1e-12);
        assert!((terms.cpa - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_goal_weighting() {
        let snap = PerformanceSnapshot::from_counters(1250.0, 50_000, 1000, 50.0, 6250.0);
        let roas_only = OptimizationGoals {
            maximize_roas: true,
            ..Default::default()
        };
        let reward = model().base_reward(&snap, &attributes(), &roas_only);
        assert!((reward - 0.5).abs() < 1e-12);

        let all = model().base_reward(&snap, &attributes(), &OptimizationGoals::default());
        assert!((all - (0.4 * 0.5 + 0.3 * 0.75 + 0.3 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_no_conversions_gives_no_cpa_credit() {
        let snap = PerformanceSnapshot::from_counters(100.0, 1000, 10, 0.0, 0.0);
        let cpa_only = OptimizationGoals {
            minimize_cpa: true,
            ..Default::default()
        };
        assert_eq!(model().base_reward(&snap, &attributes(), &cpa_only), 0.0);
    }

    #[test]
    fn test_noisy_reward_stays_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(5);
        let model = RewardModel::new(RewardConfig {
            noise_std: 0.5,
            ..RewardConfig::default()
        });
        let snap = PerformanceSnapshot::from_counters(10.0, 100, 10, 10.0, 1000.0);
        for _ in 0..500 {
            let r = model.reward(&snap, &attributes(), &OptimizationGoals::default(), &mut rng);
            assert!((0.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn test_malformed_snapshot_is_zero_reward() {
        let snap = PerformanceSnapshot {
            roas: Some(f64::NAN),
            cpa: Some(f64::INFINITY),
            ..Default::default()
        };
        assert_eq!(
            model().base_reward(&snap, &attributes(), &OptimizationGoals::default()),
            0.0
        );
    }
}
