use crate::error::{OptimizerError, OptimizerResult};
use serde::{Deserialize, Serialize};

/// Root optimizer configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_OPTIMIZER__` or from an inline TOML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Base seed for every model RNG. `None` seeds from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_pending_outcomes")]
    pub max_pending_outcomes: usize,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub recommendations: RecommendationConfig,
}

/// How arm posteriors share their precision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceMode {
    /// One precision matrix per arm (standard linear Thompson sampling).
    #[default]
    Independent,
    /// A single precision matrix accumulated over every arm's observations.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,
    #[serde(default = "default_prior_precision")]
    pub prior_precision: f64,
    /// Scale `v` applied to the posterior covariance when sampling.
    #[serde(default = "default_posterior_scale")]
    pub posterior_scale: f64,
    #[serde(default)]
    pub covariance_mode: CovarianceMode,
}

/// Which update rule trains the budget policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRuleKind {
    #[default]
    RewardWeightedRegression,
    ReinforceWithBaseline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_discount")]
    pub discount: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
    #[serde(default = "default_epsilon_floor")]
    pub epsilon_floor: f64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_policy_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub update_rule: UpdateRuleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default = "default_roas_weight")]
    pub roas_weight: f64,
    #[serde(default = "default_cpa_weight")]
    pub cpa_weight: f64,
    #[serde(default = "default_conversions_weight")]
    pub conversions_weight: f64,
    #[serde(default = "default_reward_roas_cap")]
    pub roas_cap: f64,
    #[serde(default = "default_cpa_cap")]
    pub cpa_cap: f64,
    #[serde(default = "default_conversions_cap")]
    pub conversions_cap: f64,
    #[serde(default = "default_noise_std")]
    pub noise_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_allocator_roas_cap")]
    pub roas_cap: f64,
    #[serde(default = "default_ctr_cap")]
    pub ctr_cap: f64,
    #[serde(default = "default_conversion_rate_cap")]
    pub conversion_rate_cap: f64,
    #[serde(default = "default_weight_floor")]
    pub roas_floor: f64,
    #[serde(default = "default_weight_floor")]
    pub cpa_floor: f64,
    #[serde(default = "default_weight_floor")]
    pub zero_cpa_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    #[serde(default = "default_low_ctr")]
    pub low_ctr: f64,
    #[serde(default = "default_min_impressions")]
    pub min_impressions: u64,
    #[serde(default = "default_low_conversion_rate")]
    pub low_conversion_rate: f64,
    #[serde(default = "default_min_clicks")]
    pub min_clicks: u64,
    #[serde(default = "default_cpa_tolerance")]
    pub cpa_tolerance: f64,
    #[serde(default = "default_underspend_ratio")]
    pub underspend_ratio: f64,
    #[serde(default = "default_overspend_ratio")]
    pub overspend_ratio: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,
    #[serde(default)]
    pub improvement: ImprovementWeights,
}

/// Constants summed into the expected-improvement scalar per applied category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementWeights {
    #[serde(default = "default_bid_strategy_gain")]
    pub bid_strategy: f64,
    #[serde(default = "default_budget_allocation_gain")]
    pub budget_allocation: f64,
    #[serde(default = "default_creative_gain")]
    pub creative: f64,
    #[serde(default = "default_targeting_gain")]
    pub targeting: f64,
    #[serde(default = "default_schedule_gain")]
    pub schedule: f64,
    #[serde(default = "default_max_improvement")]
    pub max_total: f64,
}

// Default functions
fn default_max_pending_outcomes() -> usize {
    10_000
}
fn default_exploration_rate() -> f64 {
    0.05
}
fn default_prior_precision() -> f64 {
    1.0
}
fn default_posterior_scale() -> f64 {
    1.0
}
fn default_hidden_dim() -> usize {
    32
}
fn default_learning_rate() -> f64 {
    0.01
}
fn default_discount() -> f64 {
    0.95
}
fn default_epsilon() -> f64 {
    0.3
}
fn default_epsilon_decay() -> f64 {
    0.995
}
fn default_epsilon_floor() -> f64 {
    0.05
}
fn default_replay_capacity() -> usize {
    1000
}
fn default_policy_batch_size() -> usize {
    32
}
fn default_roas_weight() -> f64 {
    0.4
}
fn default_cpa_weight() -> f64 {
    0.3
}
fn default_conversions_weight() -> f64 {
    0.3
}
fn default_reward_roas_cap() -> f64 {
    10.0
}
fn default_cpa_cap() -> f64 {
    100.0
}
fn default_conversions_cap() -> f64 {
    100.0
}
fn default_noise_std() -> f64 {
    0.01
}
fn default_allocator_roas_cap() -> f64 {
    10.0
}
fn default_ctr_cap() -> f64 {
    0.1
}
fn default_conversion_rate_cap() -> f64 {
    0.2
}
fn default_weight_floor() -> f64 {
    0.01
}
fn default_low_ctr() -> f64 {
    0.01
}
fn default_min_impressions() -> u64 {
    1000
}
fn default_low_conversion_rate() -> f64 {
    0.02
}
fn default_min_clicks() -> u64 {
    100
}
fn default_cpa_tolerance() -> f64 {
    1.5
}
fn default_underspend_ratio() -> f64 {
    0.5
}
fn default_overspend_ratio() -> f64 {
    0.95
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_high_confidence() -> f64 {
    0.6
}
fn default_bid_strategy_gain() -> f64 {
    0.05
}
fn default_budget_allocation_gain() -> f64 {
    0.08
}
fn default_creative_gain() -> f64 {
    0.04
}
fn default_targeting_gain() -> f64 {
    0.06
}
fn default_schedule_gain() -> f64 {
    0.03
}
fn default_max_improvement() -> f64 {
    0.25
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_rate: default_exploration_rate(),
            prior_precision: default_prior_precision(),
            posterior_scale: default_posterior_scale(),
            covariance_mode: CovarianceMode::default(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            learning_rate: default_learning_rate(),
            discount: default_discount(),
            epsilon: default_epsilon(),
            epsilon_decay: default_epsilon_decay(),
            epsilon_floor: default_epsilon_floor(),
            replay_capacity: default_replay_capacity(),
            batch_size: default_policy_batch_size(),
            update_rule: UpdateRuleKind::default(),
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            roas_weight: default_roas_weight(),
            cpa_weight: default_cpa_weight(),
            conversions_weight: default_conversions_weight(),
            roas_cap: default_reward_roas_cap(),
            cpa_cap: default_cpa_cap(),
            conversions_cap: default_conversions_cap(),
            noise_std: default_noise_std(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            roas_cap: default_allocator_roas_cap(),
            ctr_cap: default_ctr_cap(),
            conversion_rate_cap: default_conversion_rate_cap(),
            roas_floor: default_weight_floor(),
            cpa_floor: default_weight_floor(),
            zero_cpa_weight: default_weight_floor(),
        }
    }
}

impl Default for ImprovementWeights {
    fn default() -> Self {
        Self {
            bid_strategy: default_bid_strategy_gain(),
            budget_allocation: default_budget_allocation_gain(),
            creative: default_creative_gain(),
            targeting: default_targeting_gain(),
            schedule: default_schedule_gain(),
            max_total: default_max_improvement(),
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            low_ctr: default_low_ctr(),
            min_impressions: default_min_impressions(),
            low_conversion_rate: default_low_conversion_rate(),
            min_clicks: default_min_clicks(),
            cpa_tolerance: default_cpa_tolerance(),
            underspend_ratio: default_underspend_ratio(),
            overspend_ratio: default_overspend_ratio(),
            min_confidence: default_min_confidence(),
            high_confidence: default_high_confidence(),
            improvement: ImprovementWeights::default(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_pending_outcomes: default_max_pending_outcomes(),
            bandit: BanditConfig::default(),
            policy: PolicyConfig::default(),
            reward: RewardConfig::default(),
            allocator: AllocatorConfig::default(),
            recommendations: RecommendationConfig::default(),
        }
    }
}

impl OptimizerConfig {
    /// Default configuration with a fixed seed, for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn load() -> OptimizerResult<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CAMPAIGN_OPTIMIZER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> OptimizerResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> OptimizerResult<()> {
        check_probability("bandit.exploration_rate", self.bandit.exploration_rate)?;
        check_positive("bandit.prior_precision", self.bandit.prior_precision)?;
        check_positive("bandit.posterior_scale", self.bandit.posterior_scale)?;

        let policy = &self.policy;
        if policy.hidden_dim == 0 {
            return Err(OptimizerError::Config("policy.hidden_dim must be > 0".into()));
        }
        check_positive("policy.learning_rate", policy.learning_rate)?;
        check_probability("policy.discount", policy.discount)?;
        check_probability("policy.epsilon", policy.epsilon)?;
        check_probability("policy.epsilon_floor", policy.epsilon_floor)?;
        if !(policy.epsilon_decay > 0.0 && policy.epsilon_decay <= 1.0) {
            return Err(OptimizerError::Config(format!(
                "policy.epsilon_decay must be in (0, 1], got {}",
                policy.epsilon_decay
            )));
        }
        if policy.batch_size == 0 || policy.batch_size > policy.replay_capacity {
            return Err(OptimizerError::Config(format!(
                "policy.batch_size must be in [1, replay_capacity={}], got {}",
                policy.replay_capacity, policy.batch_size
            )));
        }

        let reward = &self.reward;
        for (name, value) in [
            ("reward.roas_weight", reward.roas_weight),
            ("reward.cpa_weight", reward.cpa_weight),
            ("reward.conversions_weight", reward.conversions_weight),
            ("reward.noise_std", reward.noise_std),
        ] {
            check_non_negative(name, value)?;
        }
        if reward.roas_weight + reward.cpa_weight + reward.conversions_weight <= 0.0 {
            return Err(OptimizerError::Config(
                "reward weights must not all be zero".into(),
            ));
        }
        check_positive("reward.roas_cap", reward.roas_cap)?;
        check_positive("reward.cpa_cap", reward.cpa_cap)?;
        check_positive("reward.conversions_cap", reward.conversions_cap)?;

        let allocator = &self.allocator;
        check_positive("allocator.roas_cap", allocator.roas_cap)?;
        check_positive("allocator.ctr_cap", allocator.ctr_cap)?;
        check_positive("allocator.conversion_rate_cap", allocator.conversion_rate_cap)?;
        check_positive("allocator.roas_floor", allocator.roas_floor)?;
        check_positive("allocator.cpa_floor", allocator.cpa_floor)?;
        check_positive("allocator.zero_cpa_weight", allocator.zero_cpa_weight)?;

        if self.max_pending_outcomes == 0 {
            return Err(OptimizerError::Config(
                "max_pending_outcomes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn check_probability(name: &str, value: f64) -> OptimizerResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(OptimizerError::Config(format!(
            "{name} must be in [0, 1], got {value}"
        )))
    }
}

fn check_positive(name: &str, value: f64) -> OptimizerResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(OptimizerError::Config(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

fn check_non_negative(name: &str, value: f64) -> OptimizerResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(OptimizerError::Config(format!(
            "{name} must be non-negative, got {value}"
        )))
    }
}
