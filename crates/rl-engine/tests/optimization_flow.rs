//! End-to-end optimization flows through the public engine API.

#[cfg(test)]
mod tests {
    use campaign_core::config::{CovarianceMode, OptimizerConfig};
    use campaign_core::types::{
        AdGroupSnapshot, AllocationConstraint, BidStrategy, CampaignSnapshot,
        CampaignStaticAttributes, ConstraintSet, OptimizationGoals, PerformanceSnapshot,
        RecommendationCategory,
    };
    use campaign_rl_engine::{AllocationStrategy, OptimizationEngine, Recipient, RecipientMetrics};
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
            .with_test_writer()
            .try_init();
    }

    fn seeded_engine(seed: u64) -> OptimizationEngine {
        init_tracing();
        OptimizationEngine::new(OptimizerConfig::seeded(seed))
    }

    fn register(engine: &OptimizationEngine, id: Uuid, budget: f64) {
        engine.register_campaign(CampaignStaticAttributes::new(id, budget));
    }

    fn good_outcome() -> PerformanceSnapshot {
        // roas 8, cpa 6.25, 80 conversions
        PerformanceSnapshot::from_counters(500.0, 20_000, 800, 80.0, 4000.0)
    }

    fn poor_outcome() -> PerformanceSnapshot {
        PerformanceSnapshot::from_counters(500.0, 20_000, 100, 2.0, 200.0)
    }

    fn snapshot(ad_groups: &[&str]) -> CampaignSnapshot {
        CampaignSnapshot {
            campaign: PerformanceSnapshot::from_counters(450.0, 15_000, 450, 18.0, 1350.0),
            ad_groups: ad_groups
                .iter()
                .map(|id| AdGroupSnapshot {
                    ad_group_id: id.to_string(),
                    performance: PerformanceSnapshot::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let engine = seeded_engine(1);
        let goals = OptimizationGoals::default();
        let constraints = ConstraintSet::default();

        let err = engine
            .recommend(Uuid::new_v4(), &snapshot(&["a"]), &goals, &constraints)
            .unwrap_err();
        assert!(err.is_not_found());

        let err = engine
            .record_outcome(Uuid::new_v4(), &good_outcome())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_two_phase_feedback() {
        let engine = seeded_engine(2);
        let id = Uuid::new_v4();
        register(&engine, id, 1000.0);
        let goals = OptimizationGoals::default();

        let result = engine
            .recommend(id, &snapshot(&["a", "b"]), &goals, &ConstraintSet::default())
            .unwrap();
        assert_eq!(engine.bandit_stats(id, &goals).unwrap().total_pulls, 0);
        assert_eq!(engine.pending_count(), 1);

        let reward = engine.record_outcome(result.result_id, &good_outcome()).unwrap();
        assert!(reward > 0.7 && reward <= 1.0, "reward {reward}");
        assert_eq!(engine.bandit_stats(id, &goals).unwrap().total_pulls, 1);

        // an outcome can only be recorded once
        assert!(engine
            .record_outcome(result.result_id, &good_outcome())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_bandit_learns_rewarded_strategy() {
        let engine = seeded_engine(3);
        let id = Uuid::new_v4();
        register(&engine, id, 1000.0);
        let goals = OptimizationGoals::default();
        let rounds = 300;

        for _ in 0..rounds {
            let result = engine
                .recommend(id, &snapshot(&[]), &goals, &ConstraintSet::default())
                .unwrap();
            let outcome = if result.selected_strategy == BidStrategy::TargetRoas {
                good_outcome()
            } else {
                poor_outcome()
            };
            engine.record_outcome(result.result_id, &outcome).unwrap();
        }

        let stats = engine.bandit_stats(id, &goals).unwrap();
        assert_eq!(stats.total_pulls, rounds);
        let best = &stats.arms[BidStrategy::TargetRoas.index()];
        assert!(best.pulls > rounds / 2, "target_roas pulled {} times", best.pulls);
        assert!(best.mean_reward > 0.7);
    }

    #[test]
    fn test_policy_trains_through_optimize() {
        let engine = seeded_engine(4);
        let id = Uuid::new_v4();
        register(&engine, id, 600.0);
        let goals = OptimizationGoals {
            maximize_roas: true,
            ..Default::default()
        };
        let batch_size = engine.config().policy.batch_size;

        for _ in 0..(batch_size + 5) {
            let result = engine
                .optimize(id, &snapshot(&["a", "b", "c"]), &goals, &ConstraintSet::default())
                .unwrap();
            let total: f64 = result.budget_allocation.values().sum();
            assert!((total - 600.0).abs() < 1e-6);
        }

        let stats = engine.policy_stats(id, &goals).unwrap();
        assert_eq!(stats.action_dim, 3);
        assert!(stats.train_steps >= 5);
        assert!(stats.epsilon < engine.config().policy.epsilon);
    }

    #[test]
    fn test_constraints_bound_every_allocation() {
        let engine = seeded_engine(5);
        let id = Uuid::new_v4();
        register(&engine, id, 1000.0);
        let constraints = ConstraintSet::uniform(AllocationConstraint::new(50.0, 200.0))
            .with("a", AllocationConstraint::at_most(10.0));

        for _ in 0..20 {
            let result = engine
                .optimize(
                    id,
                    &snapshot(&["a", "b", "c"]),
                    &OptimizationGoals::default(),
                    &constraints,
                )
                .unwrap();
            let total: f64 = result.budget_allocation.values().sum();
            assert!(total <= 1000.0 + 1e-9);
            assert!(result.budget_allocation["a"] <= 10.0 + 1e-9);
            for id in ["b", "c"] {
                let amount = result.budget_allocation[id];
                assert!((50.0 - 1e-9..=200.0 + 1e-9).contains(&amount));
            }
        }
    }

    #[test]
    fn test_malformed_snapshot_degrades() {
        let engine = seeded_engine(6);
        let id = Uuid::new_v4();
        register(&engine, id, 500.0);
        let snapshot = CampaignSnapshot {
            campaign: PerformanceSnapshot {
                spend: f64::NAN,
                roas: Some(f64::INFINITY),
                ..Default::default()
            },
            ad_groups: Vec::new(),
        };

        let result = engine
            .optimize(id, &snapshot, &OptimizationGoals::default(), &ConstraintSet::default())
            .unwrap();
        assert!(result.budget_allocation.is_empty());
        assert_eq!(
            result
                .recommendations_for(RecommendationCategory::BidStrategy)
                .count(),
            1
        );
        // spend and roas, each replaced once by the extractor
        assert_eq!(engine.telemetry().invalid_input, 2);
    }

    #[test]
    fn test_zero_budget_campaign() {
        let engine = seeded_engine(7);
        let id = Uuid::new_v4();
        register(&engine, id, 0.0);
        let result = engine
            .optimize(
                id,
                &snapshot(&["a", "b"]),
                &OptimizationGoals::default(),
                &ConstraintSet::default(),
            )
            .unwrap();
        assert!(result.budget_allocation.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_seeded_engines_are_reproducible() {
        let id = Uuid::from_u128(0x5eed);
        let run = || {
            let engine = seeded_engine(11);
            register(&engine, id, 800.0);
            (0..10)
                .map(|_| {
                    let result = engine
                        .optimize(
                            id,
                            &snapshot(&["a", "b"]),
                            &OptimizationGoals::default(),
                            &ConstraintSet::default(),
                        )
                        .unwrap();
                    (result.selected_strategy, result.budget_allocation)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_concurrent_campaigns() {
        let engine = Arc::new(seeded_engine(8));
        let ids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            register(&engine, *id, 1000.0);
        }
        let shared = Uuid::new_v4();
        register(&engine, shared, 1000.0);

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let engine = Arc::clone(&engine);
                let id = *id;
                thread::spawn(move || {
                    for _ in 0..25 {
                        engine
                            .optimize(
                                id,
                                &snapshot(&["a", "b"]),
                                &OptimizationGoals::default(),
                                &ConstraintSet::default(),
                            )
                            .unwrap();
                        engine
                            .optimize(
                                shared,
                                &snapshot(&["a"]),
                                &OptimizationGoals::default(),
                                &ConstraintSet::default(),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let goals = OptimizationGoals::default();
        for id in &ids {
            assert_eq!(engine.bandit_stats(*id, &goals).unwrap().total_pulls, 25);
        }
        assert_eq!(engine.bandit_stats(shared, &goals).unwrap().total_pulls, 200);
        assert_eq!(engine.model_count(), 9);
    }

    #[test]
    fn test_static_allocation_passthrough() {
        let engine = seeded_engine(9);
        let recipients = vec![
            Recipient::new(
                "search",
                RecipientMetrics {
                    roas: 4.0,
                    ..Default::default()
                },
            ),
            Recipient::new(
                "social",
                RecipientMetrics {
                    roas: 1.0,
                    ..Default::default()
                },
            ),
        ];
        let allocation = engine.allocate(
            AllocationStrategy::RoasOptimized,
            500.0,
            &recipients,
            &ConstraintSet::default(),
        );
        assert!((allocation.get("search").unwrap() - 400.0).abs() < 1e-9);
        assert!((allocation.get("social").unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_from_toml() {
        init_tracing();
        let config = OptimizerConfig::from_toml_str(
            r#"
            seed = 7

            [bandit]
            covariance_mode = "shared"

            [policy]
            update_rule = "reinforce_with_baseline"
            "#,
        )
        .unwrap();
        let engine = OptimizationEngine::try_new(config).unwrap();
        let id = Uuid::new_v4();
        register(&engine, id, 100.0);
        let goals = OptimizationGoals::default();
        engine
            .optimize(id, &snapshot(&["a"]), &goals, &ConstraintSet::default())
            .unwrap();

        assert_eq!(
            engine.bandit_stats(id, &goals).unwrap().covariance_mode,
            CovarianceMode::Shared
        );
        assert_eq!(
            engine.policy_stats(id, &goals).unwrap().update_rule,
            "reinforce_with_baseline"
        );
    }

    #[test]
    fn test_unregister_drops_models() {
        let engine = seeded_engine(10);
        let id = Uuid::new_v4();
        register(&engine, id, 100.0);
        engine
            .optimize(id, &snapshot(&[]), &OptimizationGoals::default(), &ConstraintSet::default())
            .unwrap();
        assert!(engine.unregister_campaign(id).is_some());
        assert_eq!(engine.model_count(), 0);
        assert!(engine
            .optimize(id, &snapshot(&[]), &OptimizationGoals::default(), &ConstraintSet::default())
            .unwrap_err()
            .is_not_found());
    }
}
