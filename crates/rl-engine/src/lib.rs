//! Campaign optimization engine: contextual Thompson-sampling bandit for bid
//! strategies, a learned budget policy over ad groups, static allocation
//! strategies, and the orchestrator that ties them into optimization passes.

pub mod allocator;
pub mod bandit;
pub mod context;
pub mod linalg;
pub mod orchestrator;
pub mod policy;
pub mod recommendations;
pub mod reward;

pub use allocator::{
    project_allocations, AllocationStrategy, BudgetAllocator, DailyAllocation, Recipient,
    RecipientMetrics,
};
pub use bandit::{ArmSelection, BanditStats, ContextualBandit};
pub use context::{ContextVector, CONTEXT_DIM};
pub use orchestrator::{ModelKey, OptimizationEngine};
pub use policy::{
    BudgetPolicy, PolicyAction, PolicyStats, PolicyUpdateRule, ReinforceWithBaseline,
    RewardWeightedRegression, TrainingReport, Transition,
};
pub use recommendations::RecommendationEngine;
pub use reward::RewardModel;
