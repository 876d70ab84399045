//! Optimization orchestrator: owns one bandit and one budget policy per
//! (campaign, goal set) and runs the decide/learn pipeline over them.
//!
//! Models live in a `DashMap` of `Arc<Mutex<_>>`. The map shard lock is only
//! held long enough to clone the `Arc`, so passes for different keys run in
//! parallel while passes for the same key are serialized by its mutex.

use crate::allocator::{self, AllocationStrategy, BudgetAllocator, Recipient};
use crate::bandit::{ArmSelection, BanditStats, ContextualBandit};
use crate::context::{self, ContextVector, CONTEXT_DIM};
use crate::policy::{BudgetPolicy, PolicyStats};
use crate::recommendations::RecommendationEngine;
use crate::reward::RewardModel;
use campaign_core::config::OptimizerConfig;
use campaign_core::error::{OptimizerError, OptimizerResult};
use campaign_core::telemetry::{RecoveryKind, RecoverySnapshot, RecoveryTelemetry};
use campaign_core::types::{
    BudgetAllocation, CampaignSnapshot, CampaignStaticAttributes, ConstraintSet,
    OptimizationGoals, OptimizationResult, PerformanceSnapshot, Recommendation,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ndarray::Array1;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Registry key: models are kept apart per campaign and per goal set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub campaign_id: Uuid,
    pub goal_signature: String,
}

impl ModelKey {
    pub fn new(campaign_id: Uuid, goals: &OptimizationGoals) -> Self {
        Self {
            campaign_id,
            goal_signature: goals.signature(),
        }
    }

    /// Stable per-key seed offset (FNV-1a over the key text).
    fn seed_offset(&self) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in self.to_string().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.campaign_id, self.goal_signature)
    }
}

struct CampaignModel {
    bandit: ContextualBandit,
    policy: BudgetPolicy,
}

/// Everything needed to learn from a decision once its outcome is known.
#[derive(Debug, Clone)]
struct PendingDecision {
    key: ModelKey,
    goals: OptimizationGoals,
    context: ContextVector,
    arm: usize,
    /// Budget shares handed out by the policy; `None` without ad groups.
    action: Option<Array1<f64>>,
    created_at: DateTime<Utc>,
}

/// Insertion-ordered, bounded map of decisions awaiting an outcome.
#[derive(Default)]
struct PendingStore {
    order: VecDeque<Uuid>,
    decisions: HashMap<Uuid, PendingDecision>,
}

impl PendingStore {
    /// Insert, dropping the oldest entries beyond `capacity`. Returns how many
    /// were dropped.
    fn insert(&mut self, id: Uuid, decision: PendingDecision, capacity: usize) -> usize {
        let capacity = capacity.max(1);
        let mut dropped = 0;
        while self.decisions.len() >= capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.decisions.remove(&oldest).is_some() {
                        dropped += 1;
                    }
                }
                None => break,
            }
        }
        self.order.push_back(id);
        self.decisions.insert(id, decision);
        dropped
    }

    fn take(&mut self, id: &Uuid) -> Option<PendingDecision> {
        let decision = self.decisions.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(decision)
    }

    fn retain<F: Fn(&PendingDecision) -> bool>(&mut self, keep: F) {
        self.decisions.retain(|_, decision| keep(decision));
        let decisions = &self.decisions;
        self.order.retain(|id| decisions.contains_key(id));
    }

    fn clear(&mut self) {
        self.order.clear();
        self.decisions.clear();
    }

    fn len(&self) -> usize {
        self.decisions.len()
    }
}

/// Output of the decide stage, before anything is learned.
struct Decision {
    context: ContextVector,
    selection: ArmSelection,
    action: Option<Array1<f64>>,
    allocation: BudgetAllocation,
    recommendations: Vec<Recommendation>,
    expected_improvement: f64,
}

// ---------------------------------------------------------------------------
// OptimizationEngine
// ---------------------------------------------------------------------------

pub struct OptimizationEngine {
    config: OptimizerConfig,
    campaigns: DashMap<Uuid, CampaignStaticAttributes>,
    models: DashMap<ModelKey, Arc<Mutex<CampaignModel>>>,
    pending: Mutex<PendingStore>,
    reward_model: RewardModel,
    allocator: BudgetAllocator,
    recommender: RecommendationEngine,
    telemetry: Arc<RecoveryTelemetry>,
}

impl OptimizationEngine {
    /// Build from a config the caller has already validated. Debug builds
    /// assert validity; release builds log the failure and carry on. Use
    /// [`try_new`](Self::try_new) to reject an invalid config instead.
    pub fn new(config: OptimizerConfig) -> Self {
        if let Err(err) = config.validate() {
            warn!(error = %err, "optimizer configuration failed validation");
        }
        debug_assert!(config.validate().is_ok(), "invalid optimizer configuration");
        let telemetry = Arc::new(RecoveryTelemetry::new());
        info!(
            seeded = config.seed.is_some(),
            covariance_mode = ?config.bandit.covariance_mode,
            update_rule = ?config.policy.update_rule,
            "Optimization engine initialized"
        );
        Self {
            campaigns: DashMap::new(),
            models: DashMap::new(),
            pending: Mutex::new(PendingStore::default()),
            reward_model: RewardModel::new(config.reward.clone()),
            allocator: BudgetAllocator::new(config.allocator.clone())
                .with_telemetry(telemetry.clone()),
            recommender: RecommendationEngine::new(config.recommendations.clone()),
            telemetry,
            config,
        }
    }

    /// Validate `config` before building the engine.
    pub fn try_new(config: OptimizerConfig) -> OptimizerResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Build from `CAMPAIGN_OPTIMIZER__*` environment variables.
    pub fn from_env() -> OptimizerResult<Self> {
        Self::try_new(OptimizerConfig::load()?)
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    // --- Campaign registry ------------------------------------------------

    /// Register or replace a campaign's static attributes.
    pub fn register_campaign(
        &self,
        attributes: CampaignStaticAttributes,
    ) -> Option<CampaignStaticAttributes> {
        let campaign_id = attributes.campaign_id;
        debug!(%campaign_id, daily_budget = attributes.daily_budget, "campaign registered");
        self.campaigns.insert(campaign_id, attributes)
    }

    /// Forget a campaign together with its models and pending decisions.
    pub fn unregister_campaign(&self, campaign_id: Uuid) -> Option<CampaignStaticAttributes> {
        let removed = self.campaigns.remove(&campaign_id).map(|(_, attrs)| attrs);
        if removed.is_some() {
            self.reset_campaign(campaign_id);
        }
        removed
    }

    pub fn campaign(&self, campaign_id: Uuid) -> OptimizerResult<CampaignStaticAttributes> {
        self.campaigns
            .get(&campaign_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OptimizerError::campaign_not_found(campaign_id))
    }

    pub fn campaign_count(&self) -> usize {
        self.campaigns.len()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // --- Optimization -----------------------------------------------------

    /// Single-pass optimization: decide, then learn from the same snapshot.
    pub fn optimize(
        &self,
        campaign_id: Uuid,
        snapshot: &CampaignSnapshot,
        goals: &OptimizationGoals,
        constraints: &ConstraintSet,
    ) -> OptimizerResult<OptimizationResult> {
        let attributes = self.campaign(campaign_id)?;
        let key = ModelKey::new(campaign_id, goals);
        let model = self.model(&key);
        let mut model = model.lock();

        let decision = self.decide(&mut model, &attributes, snapshot, goals, constraints);
        let reward = self.learn(
            &mut model,
            &attributes,
            goals,
            &decision.context,
            decision.selection.arm(),
            decision.action.as_ref(),
            &snapshot.campaign,
        )?;
        drop(model);

        let result = self.to_result(campaign_id, &decision);
        info!(
            %campaign_id,
            strategy = %result.selected_strategy,
            confidence = result.confidence,
            reward,
            "Optimization pass complete"
        );
        Ok(result)
    }

    /// Decide without learning. The decision is kept under the result id until
    /// [`record_outcome`](Self::record_outcome) supplies the observed performance.
    pub fn recommend(
        &self,
        campaign_id: Uuid,
        snapshot: &CampaignSnapshot,
        goals: &OptimizationGoals,
        constraints: &ConstraintSet,
    ) -> OptimizerResult<OptimizationResult> {
        let attributes = self.campaign(campaign_id)?;
        let key = ModelKey::new(campaign_id, goals);
        let model = self.model(&key);
        let decision = {
            let mut model = model.lock();
            self.decide(&mut model, &attributes, snapshot, goals, constraints)
        };

        let result = self.to_result(campaign_id, &decision);
        let pending = PendingDecision {
            key,
            goals: *goals,
            context: decision.context,
            arm: decision.selection.arm(),
            action: decision.action,
            created_at: result.generated_at,
        };
        let dropped = self
            .pending
            .lock()
            .insert(result.result_id, pending, self.config.max_pending_outcomes);
        if dropped > 0 {
            warn!(dropped, "pending outcome store full, oldest decisions dropped");
        }

        info!(
            %campaign_id,
            result_id = %result.result_id,
            strategy = %result.selected_strategy,
            confidence = result.confidence,
            "Recommendation issued"
        );
        Ok(result)
    }

    /// Learn from the performance observed after acting on `result_id`.
    /// Returns the reward credited to the decision.
    pub fn record_outcome(
        &self,
        result_id: Uuid,
        outcome: &PerformanceSnapshot,
    ) -> OptimizerResult<f64> {
        let pending = self
            .pending
            .lock()
            .take(&result_id)
            .ok_or_else(|| OptimizerError::result_not_found(result_id))?;
        let attributes = self.campaign(pending.key.campaign_id)?;
        let model = self
            .models
            .get(&pending.key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OptimizerError::model_not_found(&pending.key))?;

        let mut model = model.lock();
        let reward = self.learn(
            &mut model,
            &attributes,
            &pending.goals,
            &pending.context,
            pending.arm,
            pending.action.as_ref(),
            outcome,
        )?;

        info!(
            campaign_id = %pending.key.campaign_id,
            %result_id,
            reward,
            waited_ms = (Utc::now() - pending.created_at).num_milliseconds(),
            "Outcome recorded"
        );
        Ok(reward)
    }

    /// Allocate a budget with one of the static strategies; no model involved.
    pub fn allocate(
        &self,
        strategy: AllocationStrategy,
        total_budget: f64,
        recipients: &[Recipient],
        constraints: &ConstraintSet,
    ) -> BudgetAllocation {
        self.allocator
            .allocate(strategy, total_budget, recipients, constraints)
    }

    pub fn allocator(&self) -> &BudgetAllocator {
        &self.allocator
    }

    // --- Introspection & maintenance --------------------------------------

    pub fn bandit_stats(
        &self,
        campaign_id: Uuid,
        goals: &OptimizationGoals,
    ) -> OptimizerResult<BanditStats> {
        let model = self.existing_model(&ModelKey::new(campaign_id, goals))?;
        let stats = model.lock().bandit.stats();
        Ok(stats)
    }

    pub fn policy_stats(
        &self,
        campaign_id: Uuid,
        goals: &OptimizationGoals,
    ) -> OptimizerResult<PolicyStats> {
        let model = self.existing_model(&ModelKey::new(campaign_id, goals))?;
        let stats = model.lock().policy.stats();
        Ok(stats)
    }

    /// Drop every model and pending decision of one campaign. Returns the
    /// number of models removed.
    pub fn reset_campaign(&self, campaign_id: Uuid) -> usize {
        let before = self.models.len();
        self.models.retain(|key, _| key.campaign_id != campaign_id);
        let removed = before.saturating_sub(self.models.len());
        self.pending
            .lock()
            .retain(|decision| decision.key.campaign_id != campaign_id);
        info!(%campaign_id, removed, "campaign models reset");
        removed
    }

    pub fn reset_all(&self) {
        self.models.clear();
        self.pending.lock().clear();
        info!("all optimization models reset");
    }

    pub fn telemetry(&self) -> RecoverySnapshot {
        self.telemetry.snapshot()
    }

    // --- Internals --------------------------------------------------------

    fn model(&self, key: &ModelKey) -> Arc<Mutex<CampaignModel>> {
        if let Some(existing) = self.models.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .models
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.build_model(key))));
        Arc::clone(entry.value())
    }

    fn existing_model(&self, key: &ModelKey) -> OptimizerResult<Arc<Mutex<CampaignModel>>> {
        self.models
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OptimizerError::model_not_found(key))
    }

    fn build_model(&self, key: &ModelKey) -> CampaignModel {
        let seed = self.config.seed.map(|base| base ^ key.seed_offset());
        debug!(%key, seeded = seed.is_some(), "creating optimization model");
        CampaignModel {
            bandit: ContextualBandit::new(
                CONTEXT_DIM,
                self.config.bandit.clone(),
                seed,
                self.telemetry.clone(),
            ),
            // resized to the ad group count on first use
            policy: BudgetPolicy::new(
                CONTEXT_DIM,
                1,
                self.config.policy.clone(),
                seed.map(|s| s.wrapping_add(0x9e3779b97f4a7c15)),
                self.telemetry.clone(),
            ),
        }
    }

    fn decide(
        &self,
        model: &mut CampaignModel,
        attributes: &CampaignStaticAttributes,
        snapshot: &CampaignSnapshot,
        goals: &OptimizationGoals,
        constraints: &ConstraintSet,
    ) -> Decision {
        let extraction = context::extract_with_report(attributes, &snapshot.campaign, goals);
        if extraction.sanitized_fields > 0 {
            warn!(
                campaign_id = %attributes.campaign_id,
                fields = extraction.sanitized_fields,
                "malformed snapshot fields replaced with 0"
            );
            self.telemetry
                .record_n(RecoveryKind::InvalidInput, extraction.sanitized_fields);
        }
        let context = extraction.vector;

        let selection = model.bandit.select_arm(&context);

        let mut seen = HashSet::new();
        let ad_groups: Vec<&str> = snapshot
            .ad_groups
            .iter()
            .map(|group| group.ad_group_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect();

        // a non-finite budget was already counted by the extractor
        let budget = if attributes.daily_budget.is_finite() {
            self.allocator.sanitize_total(attributes.daily_budget)
        } else {
            0.0
        };
        let (action, allocation) = if ad_groups.is_empty() {
            (None, BudgetAllocation::empty(budget))
        } else {
            model.policy.ensure_action_dim(ad_groups.len());
            let action = model.policy.act(&context);
            let raw = ad_groups
                .iter()
                .zip(action.probabilities.iter())
                .map(|(id, share)| (id.to_string(), share * budget));
            let allocation = allocator::project_allocations(budget, raw, constraints);
            (Some(action.probabilities), allocation)
        };

        let recommendations =
            self.recommender
                .build(attributes, snapshot, &selection, &allocation);
        let expected_improvement = self.recommender.expected_improvement(&recommendations);

        debug!(
            campaign_id = %attributes.campaign_id,
            strategy = %selection.strategy,
            confidence = selection.confidence,
            explored = selection.explored,
            ad_groups = ad_groups.len(),
            "decision made"
        );

        Decision {
            context,
            selection,
            action,
            allocation,
            recommendations,
            expected_improvement,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn learn(
        &self,
        model: &mut CampaignModel,
        attributes: &CampaignStaticAttributes,
        goals: &OptimizationGoals,
        context: &ContextVector,
        arm: usize,
        action: Option<&Array1<f64>>,
        outcome: &PerformanceSnapshot,
    ) -> OptimizerResult<f64> {
        let reward = self
            .reward_model
            .reward(outcome, attributes, goals, model.bandit.rng_mut());
        model.bandit.observe(context, arm, reward)?;

        if let Some(action) = action {
            if action.len() == model.policy.action_dim() {
                model.policy.observe(context, action, reward)?;
                if let Some(report) = model.policy.train() {
                    debug!(
                        campaign_id = %attributes.campaign_id,
                        mean_loss = report.mean_loss,
                        epsilon = report.epsilon,
                        rolled_back = report.rolled_back,
                        "budget policy updated"
                    );
                }
            } else {
                debug!(
                    campaign_id = %attributes.campaign_id,
                    "ad group count changed since the decision, policy update skipped"
                );
            }
        }
        Ok(reward)
    }

    fn to_result(&self, campaign_id: Uuid, decision: &Decision) -> OptimizationResult {
        OptimizationResult {
            result_id: Uuid::new_v4(),
            campaign_id,
            selected_strategy: decision.selection.strategy,
            confidence: decision.selection.confidence,
            expected_reward: decision.selection.expected_reward,
            expected_improvement: decision.expected_improvement,
            budget_allocation: decision.allocation.allocations.clone(),
            recommendations: decision.recommendations.clone(),
            generated_at: Utc::now(),
        }
    }
}

impl Default for OptimizationEngine {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}
