//! Contextual bandit for bid-strategy selection: linear Thompson Sampling
//! with a Gaussian posterior per arm and an ε exploration floor.
//!
//! Each arm keeps the usual Bayesian linear-regression sufficient statistics:
//!
//! ```text
//!   A = λI + Σ x xᵀ          (precision)
//!   b = Σ r x                (reward-weighted context)
//!   θ̂ = A⁻¹ b,  θ ~ N(θ̂, v² A⁻¹)
//! ```
//!
//! In [`CovarianceMode::Shared`] a single precision matrix is accumulated over
//! every arm's observations while `b` stays per-arm.

use crate::context::ContextVector;
use crate::linalg;
use campaign_core::config::{BanditConfig, CovarianceMode};
use campaign_core::error::{OptimizerError, OptimizerResult};
use campaign_core::telemetry::{RecoveryKind, RecoveryTelemetry};
use campaign_core::types::BidStrategy;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Outcome of [`ContextualBandit::select_arm`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmSelection {
    pub strategy: BidStrategy,
    pub confidence: f64,
    /// Posterior mean reward of the chosen arm for this context, clipped to [0, 1].
    pub expected_reward: f64,
    pub explored: bool,
}

impl ArmSelection {
    /// Arm index of the selected strategy.
    pub fn arm(&self) -> usize {
        self.strategy.index()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub strategy: BidStrategy,
    pub pulls: u64,
    pub cumulative_reward: f64,
    pub mean_reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditStats {
    pub covariance_mode: CovarianceMode,
    pub total_pulls: u64,
    pub arms: Vec<ArmStats>,
}

pub struct ContextualBandit {
    dim: usize,
    config: BanditConfig,
    /// One matrix per arm, or a single shared one.
    precision: Vec<Array2<f64>>,
    /// `b`, one column per arm.
    rewards: Array2<f64>,
    pulls: Vec<u64>,
    cumulative_reward: Vec<f64>,
    rng: StdRng,
    telemetry: Arc<RecoveryTelemetry>,
}

impl ContextualBandit {
    pub const N_ARMS: usize = BidStrategy::COUNT;

    pub fn new(
        dim: usize,
        config: BanditConfig,
        seed: Option<u64>,
        telemetry: Arc<RecoveryTelemetry>,
    ) -> Self {
        let slots = match config.covariance_mode {
            CovarianceMode::Independent => Self::N_ARMS,
            CovarianceMode::Shared => 1,
        };
        let prior = linalg::scaled_identity(dim, config.prior_precision);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            dim,
            precision: vec![prior; slots],
            rewards: Array2::zeros((dim, Self::N_ARMS)),
            pulls: vec![0; Self::N_ARMS],
            cumulative_reward: vec![0.0; Self::N_ARMS],
            config,
            rng,
            telemetry,
        }
    }

    /// Pick a bid strategy for `context`: uniform with probability ε,
    /// otherwise the argmax of one posterior draw per arm.
    pub fn select_arm(&mut self, context: &ContextVector) -> ArmSelection {
        if context.len() != self.dim {
            warn!(
                got = context.len(),
                expected = self.dim,
                "context dimension mismatch, selecting uniformly"
            );
            self.telemetry.record(RecoveryKind::InvalidInput);
            let arm = self.rng.gen_range(0..Self::N_ARMS);
            return ArmSelection {
                strategy: BidStrategy::ALL[arm],
                confidence: 0.0,
                expected_reward: 0.0,
                explored: true,
            };
        }

        let x = context.as_array();
        let covariances = self.posterior_covariances();
        let explored = self.rng.gen::<f64>() < self.config.exploration_rate;

        let arm = if explored {
            self.rng.gen_range(0..Self::N_ARMS)
        } else {
            let mut best_arm = 0;
            let mut best_score = f64::NEG_INFINITY;
            for arm in 0..Self::N_ARMS {
                let cov = &covariances[self.slot(arm)];
                let mean = cov.dot(&self.rewards.column(arm));
                let theta = self.sample_theta(&mean, cov, arm);
                let score = x.dot(&theta);
                if score > best_score {
                    best_score = score;
                    best_arm = arm;
                }
            }
            best_arm
        };

        let cov = &covariances[self.slot(arm)];
        let (expected_reward, confidence) = self.estimate(x, cov, arm);

        ArmSelection {
            strategy: BidStrategy::ALL[arm],
            confidence,
            expected_reward,
            explored,
        }
    }

    /// Fold one observed reward into the chosen arm's posterior.
    pub fn observe(
        &mut self,
        context: &ContextVector,
        arm: usize,
        reward: f64,
    ) -> OptimizerResult<()> {
        if arm >= Self::N_ARMS {
            return Err(OptimizerError::InvalidInput(format!(
                "arm index {arm} out of range (0..{})",
                Self::N_ARMS
            )));
        }
        if context.len() != self.dim {
            return Err(OptimizerError::InvalidInput(format!(
                "context dimension {} does not match model dimension {}",
                context.len(),
                self.dim
            )));
        }

        let reward = if reward.is_finite() {
            reward.clamp(0.0, 1.0)
        } else {
            self.telemetry.record(RecoveryKind::InvalidInput);
            warn!(arm, "non-finite bandit reward replaced with 0");
            0.0
        };

        let x = context.as_array();
        let slot = self.slot(arm);
        let a = &mut self.precision[slot];
        for i in 0..self.dim {
            for j in 0..self.dim {
                a[[i, j]] += x[i] * x[j];
            }
        }
        self.rewards.column_mut(arm).scaled_add(reward, x);
        self.pulls[arm] += 1;
        self.cumulative_reward[arm] += reward;
        Ok(())
    }

    /// `1 / (1 + v²·xᵀA⁻¹x)` for `arm`, in [0, 1]. 0.0 when the posterior is unusable.
    pub fn confidence(&self, context: &ContextVector, arm: usize) -> f64 {
        if arm >= Self::N_ARMS {
            return 0.0;
        }
        match linalg::invert_spd(&self.precision[self.slot(arm)]) {
            Some(cov) => self.estimate(context.as_array(), &cov, arm).1,
            None => 0.0,
        }
    }

    pub fn stats(&self) -> BanditStats {
        let arms = BidStrategy::ALL
            .iter()
            .enumerate()
            .map(|(i, strategy)| ArmStats {
                strategy: *strategy,
                pulls: self.pulls[i],
                cumulative_reward: self.cumulative_reward[i],
                mean_reward: if self.pulls[i] > 0 {
                    self.cumulative_reward[i] / self.pulls[i] as f64
                } else {
                    0.0
                },
            })
            .collect();

        BanditStats {
            covariance_mode: self.config.covariance_mode,
            total_pulls: self.pulls.iter().sum(),
            arms,
        }
    }

    pub fn total_pulls(&self) -> u64 {
        self.pulls.iter().sum()
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    fn slot(&self, arm: usize) -> usize {
        match self.config.covariance_mode {
            CovarianceMode::Independent => arm,
            CovarianceMode::Shared => 0,
        }
    }

    /// `A⁻¹` per slot; singular slots are reset to the prior first.
    fn posterior_covariances(&mut self) -> Vec<Array2<f64>> {
        let mut covariances = Vec::with_capacity(self.precision.len());
        for slot in 0..self.precision.len() {
            let inverse = match linalg::invert_spd(&self.precision[slot]) {
                Some(inverse) => inverse,
                None => {
                    self.recover(slot, "precision matrix is not positive definite");
                    linalg::scaled_identity(self.dim, 1.0 / self.config.prior_precision)
                }
            };
            covariances.push(inverse);
        }
        covariances
    }

    fn sample_theta(&mut self, mean: &Array1<f64>, cov: &Array2<f64>, arm: usize) -> Array1<f64> {
        let scale = self.config.posterior_scale;
        let scaled = cov * (scale * scale);
        if let Some(theta) = linalg::sample_mvn(mean, &scaled, &mut self.rng) {
            return theta;
        }

        self.recover(self.slot(arm), "posterior covariance could not be factored");
        let prior_std = scale / self.config.prior_precision.sqrt();
        (0..self.dim)
            .map(|_| self.rng.sample::<f64, _>(StandardNormal) * prior_std)
            .collect()
    }

    fn estimate(&self, x: &Array1<f64>, cov: &Array2<f64>, arm: usize) -> (f64, f64) {
        let theta = cov.dot(&self.rewards.column(arm));
        let mean = x.dot(&theta);
        let scale = self.config.posterior_scale;
        let variance = scale * scale * linalg::quadratic_form(x, cov);

        let expected = if mean.is_finite() {
            mean.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let confidence = if variance.is_finite() && variance >= 0.0 {
            (1.0 / (1.0 + variance)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (expected, confidence)
    }

    /// Reset one posterior slot to the prior. Pull counters are kept.
    fn recover(&mut self, slot: usize, reason: &str) {
        warn!(slot, reason, "bandit posterior reset to prior");
        self.telemetry.record(RecoveryKind::NumericInstability);
        self.precision[slot] = linalg::scaled_identity(self.dim, self.config.prior_precision);
        match self.config.covariance_mode {
            CovarianceMode::Independent => self.rewards.column_mut(slot).fill(0.0),
            CovarianceMode::Shared => self.rewards.fill(0.0),
        }
    }

    #[cfg(test)]
    fn poison(&mut self, slot: usize) {
        self.precision[slot][[0, 0]] = -1.0;
    }
}
