//! Budget-allocation policy: a two-layer feed-forward network mapping the
//! campaign context onto a probability simplex over ad groups, trained online
//! from a bounded replay buffer.
//!
//! The loss gradient is delegated to a [`PolicyUpdateRule`], so the learning
//! signal can be swapped without touching the network or the orchestrator.

use crate::context::ContextVector;
use campaign_core::config::{PolicyConfig, UpdateRuleKind};
use campaign_core::error::{OptimizerError, OptimizerResult};
use campaign_core::telemetry::{RecoveryKind, RecoveryTelemetry};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One `(state, action, reward)` experience.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Array1<f64>,
    pub action: Array1<f64>,
    pub reward: f64,
}

/// Learning signal for the policy network.
pub trait PolicyUpdateRule: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Gradient of the per-transition loss with respect to the output logits,
    /// together with the loss value.
    fn logit_gradient(
        &self,
        probabilities: &Array1<f64>,
        transition: &Transition,
    ) -> (Array1<f64>, f64);

    /// Called with the sampled batch's rewards before any gradient is computed.
    fn begin_batch(&mut self, _rewards: &[f64]) {}

    /// Called with the sampled batch's rewards after the gradients are computed.
    fn end_batch(&mut self, _rewards: &[f64]) {}
}

/// Regress the softmax output toward `(1 − r)·p + r·a`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardWeightedRegression;

impl PolicyUpdateRule for RewardWeightedRegression {
    fn name(&self) -> &'static str {
        "reward_weighted_regression"
    }

    fn logit_gradient(
        &self,
        probabilities: &Array1<f64>,
        transition: &Transition,
    ) -> (Array1<f64>, f64) {
        let r = transition.reward;
        let target = probabilities * (1.0 - r) + &transition.action * r;
        let error = probabilities - &target;
        let loss = 0.5 * error.dot(&error);
        (softmax_backward(probabilities, &error), loss)
    }
}

/// Policy gradient on `Σ aᵢ log pᵢ` scaled by the advantage over a running
/// mean reward.
#[derive(Debug, Clone)]
pub struct ReinforceWithBaseline {
    baseline: Option<f64>,
    momentum: f64,
}

impl ReinforceWithBaseline {
    pub fn new(momentum: f64) -> Self {
        Self {
            baseline: None,
            momentum: momentum.clamp(0.0, 1.0),
        }
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }
}

impl Default for ReinforceWithBaseline {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl PolicyUpdateRule for ReinforceWithBaseline {
    fn name(&self) -> &'static str {
        "reinforce_with_baseline"
    }

    fn logit_gradient(
        &self,
        probabilities: &Array1<f64>,
        transition: &Transition,
    ) -> (Array1<f64>, f64) {
        let advantage = transition.reward - self.baseline.unwrap_or(0.0);
        let log_likelihood: f64 = transition
            .action
            .iter()
            .zip(probabilities.iter())
            .map(|(a, p)| a * p.max(1e-12).ln())
            .sum();
        let gradient = (probabilities - &transition.action) * advantage;
        (gradient, -advantage * log_likelihood)
    }

    fn begin_batch(&mut self, rewards: &[f64]) {
        if self.baseline.is_none() && !rewards.is_empty() {
            self.baseline = Some(mean(rewards));
        }
    }

    fn end_batch(&mut self, rewards: &[f64]) {
        if rewards.is_empty() {
            return;
        }
        let batch_mean = mean(rewards);
        let current = self.baseline.unwrap_or(batch_mean);
        self.baseline = Some(current + self.momentum * (batch_mean - current));
    }
}

pub fn update_rule_for(kind: UpdateRuleKind) -> Box<dyn PolicyUpdateRule> {
    match kind {
        UpdateRuleKind::RewardWeightedRegression => Box::new(RewardWeightedRegression),
        UpdateRuleKind::ReinforceWithBaseline => Box::new(ReinforceWithBaseline::default()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyAction {
    /// Budget share per recipient; non-negative and summing to 1.
    pub probabilities: Array1<f64>,
    pub explored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub batch_size: usize,
    pub mean_loss: f64,
    pub epsilon: f64,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStats {
    pub state_dim: usize,
    pub action_dim: usize,
    pub hidden_dim: usize,
    pub epsilon: f64,
    pub replay_len: usize,
    pub replay_capacity: usize,
    pub train_steps: u64,
    pub update_rule: String,
}

#[derive(Debug, Clone)]
struct PolicyNetwork {
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

struct ForwardPass {
    pre_activation: Array1<f64>,
    hidden: Array1<f64>,
    probabilities: Array1<f64>,
}

impl PolicyNetwork {
    fn new(state_dim: usize, hidden_dim: usize, action_dim: usize, rng: &mut StdRng) -> Self {
        let bound1 = 1.0 / (state_dim.max(1) as f64).sqrt();
        let bound2 = 1.0 / (hidden_dim.max(1) as f64).sqrt();
        let w1 = Array2::from_shape_fn((hidden_dim, state_dim), |_| rng.gen_range(-bound1..bound1));
        let w2 = Array2::from_shape_fn((action_dim, hidden_dim), |_| rng.gen_range(-bound2..bound2));
        Self {
            w1,
            b1: Array1::zeros(hidden_dim),
            w2,
            b2: Array1::zeros(action_dim),
        }
    }

    fn forward(&self, state: &Array1<f64>) -> ForwardPass {
        let pre_activation = self.w1.dot(state) + &self.b1;
        let hidden = pre_activation.mapv(|v| v.max(0.0));
        let logits = self.w2.dot(&hidden) + &self.b2;
        ForwardPass {
            probabilities: softmax(&logits),
            pre_activation,
            hidden,
        }
    }

    fn apply(&mut self, grads: &Gradients, step: f64) {
        self.w1.scaled_add(-step, &grads.w1);
        self.b1.scaled_add(-step, &grads.b1);
        self.w2.scaled_add(-step, &grads.w2);
        self.b2.scaled_add(-step, &grads.b2);
    }

    fn is_finite(&self) -> bool {
        self.w1.iter().all(|v| v.is_finite())
            && self.b1.iter().all(|v| v.is_finite())
            && self.w2.iter().all(|v| v.is_finite())
            && self.b2.iter().all(|v| v.is_finite())
    }
}

struct Gradients {
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

impl Gradients {
    fn zeros_like(network: &PolicyNetwork) -> Self {
        Self {
            w1: Array2::zeros(network.w1.raw_dim()),
            b1: Array1::zeros(network.b1.raw_dim()),
            w2: Array2::zeros(network.w2.raw_dim()),
            b2: Array1::zeros(network.b2.raw_dim()),
        }
    }

    fn accumulate(
        &mut self,
        network: &PolicyNetwork,
        pass: &ForwardPass,
        logit_grad: &Array1<f64>,
        state: &Array1<f64>,
    ) {
        self.w2 += &outer(logit_grad, &pass.hidden);
        self.b2 += logit_grad;

        let hidden_grad = network.w2.t().dot(logit_grad);
        let relu_mask = pass.pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let pre_grad = hidden_grad * relu_mask;
        self.w1 += &outer(&pre_grad, state);
        self.b1 += &pre_grad;
    }
}

pub struct BudgetPolicy {
    state_dim: usize,
    action_dim: usize,
    config: PolicyConfig,
    network: PolicyNetwork,
    epsilon: f64,
    replay: VecDeque<Transition>,
    update_rule: Box<dyn PolicyUpdateRule>,
    train_steps: u64,
    rng: StdRng,
    telemetry: Arc<RecoveryTelemetry>,
}

impl BudgetPolicy {
    pub fn new(
        state_dim: usize,
        action_dim: usize,
        config: PolicyConfig,
        seed: Option<u64>,
        telemetry: Arc<RecoveryTelemetry>,
    ) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let network = PolicyNetwork::new(state_dim, config.hidden_dim, action_dim, &mut rng);

        Self {
            state_dim,
            action_dim,
            network,
            epsilon: config.epsilon,
            replay: VecDeque::with_capacity(config.replay_capacity),
            update_rule: update_rule_for(config.update_rule),
            train_steps: 0,
            config,
            rng,
            telemetry,
        }
    }

    /// Replace the learning signal.
    pub fn with_update_rule(mut self, rule: Box<dyn PolicyUpdateRule>) -> Self {
        self.update_rule = rule;
        self
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Rebuild the network when the number of recipients changes.
    pub fn ensure_action_dim(&mut self, action_dim: usize) {
        if action_dim == self.action_dim {
            return;
        }
        info!(
            from = self.action_dim,
            to = action_dim,
            "recipient count changed, reinitializing budget policy"
        );
        self.network = PolicyNetwork::new(
            self.state_dim,
            self.config.hidden_dim,
            action_dim,
            &mut self.rng,
        );
        self.action_dim = action_dim;
        self.replay.clear();
    }

    /// ε-greedy: a uniform draw from the simplex with probability ε, else the
    /// network's softmax output.
    pub fn act(&mut self, state: &ContextVector) -> PolicyAction {
        if state.len() != self.state_dim {
            warn!(
                expected = self.state_dim,
                actual = state.len(),
                "state dimension mismatch, falling back to uniform split"
            );
            self.telemetry.record(RecoveryKind::InvalidInput);
            return PolicyAction {
                probabilities: uniform(self.action_dim),
                explored: false,
            };
        }

        let explored = self.rng.gen::<f64>() < self.epsilon;
        let probabilities = if explored {
            self.random_simplex()
        } else {
            self.network.forward(state.as_array()).probabilities
        };

        let sum = probabilities.sum();
        let probabilities = if probabilities.iter().all(|p| p.is_finite() && *p >= 0.0) && sum > 0.0 {
            probabilities / sum
        } else {
            warn!("policy produced an invalid distribution, falling back to uniform split");
            self.telemetry.record(RecoveryKind::NumericInstability);
            uniform(self.action_dim)
        };

        PolicyAction {
            probabilities,
            explored,
        }
    }

    /// Append an experience, evicting the oldest one at capacity.
    pub fn observe(
        &mut self,
        state: &ContextVector,
        action: &Array1<f64>,
        reward: f64,
    ) -> OptimizerResult<()> {
        if action.len() != self.action_dim {
            return Err(OptimizerError::InvalidInput(format!(
                "action dimension {} does not match policy dimension {}",
                action.len(),
                self.action_dim
            )));
        }
        if state.len() != self.state_dim {
            return Err(OptimizerError::InvalidInput(format!(
                "state dimension {} does not match policy dimension {}",
                state.len(),
                self.state_dim
            )));
        }

        let reward = if reward.is_finite() {
            reward.clamp(0.0, 1.0)
        } else {
            self.telemetry.record(RecoveryKind::InvalidInput);
            0.0
        };

        if self.replay.len() >= self.config.replay_capacity {
            self.replay.pop_front();
        }
        self.replay.push_back(Transition {
            state: state.as_array().clone(),
            action: action.clone(),
            reward,
        });
        Ok(())
    }

    pub fn ready_to_train(&self) -> bool {
        self.replay.len() >= self.config.batch_size
    }

    /// One gradient step on a sampled batch, then ε decay. `None` until the
    /// buffer holds a full batch.
    pub fn train(&mut self) -> Option<TrainingReport> {
        let batch_size = self.config.batch_size;
        if batch_size == 0 || self.replay.len() < batch_size {
            return None;
        }

        let len = self.replay.len();
        let indices: Vec<usize> = (0..batch_size).map(|_| self.rng.gen_range(0..len)).collect();
        let rewards: Vec<f64> = indices.iter().map(|&i| self.replay[i].reward).collect();
        self.update_rule.begin_batch(&rewards);

        let mut grads = Gradients::zeros_like(&self.network);
        let mut total_loss = 0.0;
        for &i in &indices {
            let transition = &self.replay[i];
            let pass = self.network.forward(&transition.state);
            let (logit_grad, loss) = self
                .update_rule
                .logit_gradient(&pass.probabilities, transition);
            grads.accumulate(&self.network, &pass, &logit_grad, &transition.state);
            total_loss += loss;
        }
        self.update_rule.end_batch(&rewards);

        let previous = self.network.clone();
        self.network
            .apply(&grads, self.config.learning_rate / batch_size as f64);
        let rolled_back = !self.network.is_finite();
        if rolled_back {
            warn!(
                rule = self.update_rule.name(),
                "non-finite policy weights after update, step rolled back"
            );
            self.telemetry.record(RecoveryKind::NumericInstability);
            self.network = previous;
        }

        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_floor);
        self.train_steps += 1;

        let report = TrainingReport {
            batch_size,
            mean_loss: total_loss / batch_size as f64,
            epsilon: self.epsilon,
            rolled_back,
        };
        debug!(
            step = self.train_steps,
            mean_loss = report.mean_loss,
            epsilon = report.epsilon,
            "budget policy trained"
        );
        Some(report)
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            state_dim: self.state_dim,
            action_dim: self.action_dim,
            hidden_dim: self.config.hidden_dim,
            epsilon: self.epsilon,
            replay_len: self.replay.len(),
            replay_capacity: self.config.replay_capacity,
            train_steps: self.train_steps,
            update_rule: self.update_rule.name().to_string(),
        }
    }

    /// Network output without exploration.
    pub fn greedy(&self, state: &ContextVector) -> Array1<f64> {
        if state.len() != self.state_dim {
            return uniform(self.action_dim);
        }
        self.network.forward(state.as_array()).probabilities
    }

    fn random_simplex(&mut self) -> Array1<f64> {
        let draws: Array1<f64> = (0..self.action_dim)
            .map(|_| self.rng.sample::<f64, _>(Exp1))
            .collect();
        let total = draws.sum();
        if total > 0.0 {
            draws / total
        } else {
            uniform(self.action_dim)
        }
    }
}

pub fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max = logits.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let exps = logits.mapv(|v| (v - max).exp());
    let sum = exps.sum();
    if sum.is_finite() && sum > 0.0 {
        exps / sum
    } else {
        uniform(logits.len())
    }
}

/// Pull a gradient on the probabilities back through the softmax.
pub fn softmax_backward(probabilities: &Array1<f64>, grad: &Array1<f64>) -> Array1<f64> {
    let inner = probabilities.dot(grad);
    probabilities * &(grad - inner)
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    a.view()
        .insert_axis(Axis(1))
        .dot(&b.view().insert_axis(Axis(0)))
}

fn uniform(n: usize) -> Array1<f64> {
    if n == 0 {
        Array1::zeros(0)
    } else {
        Array1::from_elem(n, 1.0 / n as f64)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CONTEXT_DIM;
    use ndarray::array;

    fn config() -> PolicyConfig {
        PolicyConfig {
            epsilon: 0.0,
            epsilon_floor: 0.0,
            learning_rate: 0.5,
            batch_size: 8,
            replay_capacity: 64,
            hidden_dim: 16,
            ..PolicyConfig::default()
        }
    }

    fn policy(config: PolicyConfig, action_dim: usize) -> BudgetPolicy {
        BudgetPolicy::new(
            CONTEXT_DIM,
            action_dim,
            config,
            Some(17),
            Arc::new(RecoveryTelemetry::new()),
        )
    }

    fn state() -> ContextVector {
        ContextVector::from_values(&[1.0, 0.5, 0.2, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    fn assert_simplex(p: &Array1<f64>) {
        assert!(p.iter().all(|v| *v >= 0.0));
        assert!((p.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_act_returns_simplex() {
        let mut exploit = policy(config(), 4);
        let action = exploit.act(&state());
        assert!(!action.explored);
        assert_eq!(action.probabilities.len(), 4);
        assert_simplex(&action.probabilities);

        let mut explore = policy(
            PolicyConfig {
                epsilon: 1.0,
                ..config()
            },
            4,
        );
        for _ in 0..50 {
            let action = explore.act(&state());
            assert!(action.explored);
            assert_simplex(&action.probabilities);
        }
    }

    #[test]
    fn test_replay_buffer_is_bounded() {
        let mut p = policy(config(), 2);
        let action = array![0.5, 0.5];
        for i in 0..100 {
            p.observe(&state(), &action, (i % 10) as f64 / 10.0).unwrap();
        }
        assert_eq!(p.replay_len(), 64);
        // oldest evicted: first retained reward belongs to i = 36
        assert!((p.replay[0].reward - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_observe_validates_dimensions() {
        let mut p = policy(config(), 3);
        assert!(matches!(
            p.observe(&state(), &array![1.0, 0.0], 1.0),
            Err(OptimizerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_train_waits_for_full_batch() {
        let mut p = policy(config(), 2);
        let action = array![1.0, 0.0];
        for _ in 0..7 {
            p.observe(&state(), &action, 1.0).unwrap();
            assert!(p.train().is_none());
        }
        p.observe(&state(), &action, 1.0).unwrap();
        let report = p.train().unwrap();
        assert_eq!(report.batch_size, 8);
        assert!(!report.rolled_back);
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let mut p = policy(
            PolicyConfig {
                epsilon: 0.5,
                epsilon_decay: 0.5,
                epsilon_floor: 0.1,
                ..config()
            },
            2,
        );
        let action = array![0.5, 0.5];
        for _ in 0..8 {
            p.observe(&state(), &action, 0.5).unwrap();
        }
        for _ in 0..10 {
            p.train();
            assert!(p.epsilon() >= 0.1);
        }
        assert!((p.epsilon() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_reward_weighted_regression_moves_toward_rewarded_action() {
        let mut p = policy(config(), 3);
        let before = p.greedy(&state())[0];
        let rewarded = array![1.0, 0.0, 0.0];
        for _ in 0..200 {
            p.observe(&state(), &rewarded, 1.0).unwrap();
            p.train();
        }
        let after = p.greedy(&state());
        assert_simplex(&after);
        assert!(after[0] > before + 0.1, "before {before}, after {}", after[0]);
    }

    #[test]
    fn test_reinforce_prefers_better_action() {
        let mut p = policy(
            PolicyConfig {
                update_rule: UpdateRuleKind::ReinforceWithBaseline,
                ..config()
            },
            2,
        );
        assert_eq!(p.stats().update_rule, "reinforce_with_baseline");
        let before = p.greedy(&state())[0];
        for i in 0..300 {
            if i % 2 == 0 {
                p.observe(&state(), &array![1.0, 0.0], 0.9).unwrap();
            } else {
                p.observe(&state(), &array![0.0, 1.0], 0.1).unwrap();
            }
            p.train();
        }
        assert!(p.greedy(&state())[0] > before + 0.1);
    }

    #[derive(Debug)]
    struct Frozen;

    impl PolicyUpdateRule for Frozen {
        fn name(&self) -> &'static str {
            "frozen"
        }

        fn logit_gradient(&self, p: &Array1<f64>, _t: &Transition) -> (Array1<f64>, f64) {
            (Array1::zeros(p.len()), 0.0)
        }
    }

    #[derive(Debug)]
    struct Exploding;

    impl PolicyUpdateRule for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn logit_gradient(&self, p: &Array1<f64>, _t: &Transition) -> (Array1<f64>, f64) {
            (Array1::from_elem(p.len(), f64::NAN), 0.0)
        }
    }

    #[test]
    fn test_custom_update_rule_is_used() {
        let mut p = policy(config(), 3).with_update_rule(Box::new(Frozen));
        let before = p.greedy(&state());
        for _ in 0..20 {
            p.observe(&state(), &array![1.0, 0.0, 0.0], 1.0).unwrap();
            p.train();
        }
        assert_eq!(p.greedy(&state()), before);
        assert_eq!(p.stats().update_rule, "frozen");
    }

    #[test]
    fn test_non_finite_step_is_rolled_back() {
        let telemetry = Arc::new(RecoveryTelemetry::new());
        let mut p = BudgetPolicy::new(CONTEXT_DIM, 2, config(), Some(1), telemetry.clone())
            .with_update_rule(Box::new(Exploding));
        let before = p.greedy(&state());
        for _ in 0..8 {
            p.observe(&state(), &array![0.5, 0.5], 0.5).unwrap();
        }
        let report = p.train().unwrap();
        assert!(report.rolled_back);
        assert_eq!(p.greedy(&state()), before);
        assert_eq!(telemetry.snapshot().numeric_instability, 1);
    }

    #[test]
    fn test_recipient_change_reinitializes() {
        let mut p = policy(config(), 2);
        p.observe(&state(), &array![0.5, 0.5], 0.5).unwrap();
        p.ensure_action_dim(5);
        assert_eq!(p.action_dim(), 5);
        assert_eq!(p.replay_len(), 0);
        assert_eq!(p.act(&state()).probabilities.len(), 5);
    }

    #[test]
    fn test_softmax_is_stable() {
        let p = softmax(&array![1000.0, 1000.0, -1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-12);
        assert!(p[2] < 1e-12);
    }
}
