//! Model selection against a small catalog with a synthetic clock.

use chatpilot_lib::catalog::{Modality, ModelCatalog, ModelDescriptor, Speed, TaskType};
use chatpilot_lib::config::schema::OrchestratorConfig;
use chatpilot_lib::orchestrator::{Clock, ManualClock, ModelOrchestrator, SelectOptions};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

fn catalog() -> ModelCatalog {
    let models = vec![
        ModelDescriptor::new("model-a", "Model A", Modality::Text).with_profile(3, 0.2, Speed::Slow, &[]),
        ModelDescriptor::new("model-b", "Model B", Modality::Text).with_profile(2, 0.8, Speed::VeryFast, &[]),
        ModelDescriptor::new("model-c", "Model C", Modality::Text).with_profile(2, 0.5, Speed::Fast, &[]),
    ];
    let routes: HashMap<TaskType, Vec<String>> = [(
        TaskType::Coding,
        vec!["model-b".to_string(), "model-a".to_string()],
    )]
    .into_iter()
    .collect();
    ModelCatalog::new(models, routes, vec!["model-c".to_string()])
}

fn orchestrator() -> (ModelOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let orch = ModelOrchestrator::with_clock(
        Arc::new(catalog()),
        &OrchestratorConfig::default(),
        clock.clone(),
    );
    (orch, clock)
}

#[test]
fn test_cheapest_candidate_wins() {
    let (orch, _) = orchestrator();
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-a");
}

#[test]
fn test_repeated_failures_exclude_until_cooldown_elapses() {
    let (orch, clock) = orchestrator();
    for _ in 0..3 {
        orch.report_failure("model-a");
    }
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-b");

    // 30s, then 60s, then 120s
    clock.advance(Duration::seconds(119));
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-b");

    clock.advance(Duration::seconds(2));
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-a");
}

#[test]
fn test_cooldown_is_capped() {
    let (orch, clock) = orchestrator();
    let start = clock.now();
    for _ in 0..10 {
        orch.report_failure("model-a");
    }
    assert_eq!(
        orch.cooldown_until("model-a"),
        Some(start + Duration::seconds(600))
    );
}

#[test]
fn test_all_candidates_excluded_uses_fallback() {
    let (orch, _) = orchestrator();
    orch.report_failure("model-a");
    let options = SelectOptions {
        avoid: vec!["model-b".to_string()],
        ..SelectOptions::default()
    };
    assert_eq!(orch.select(TaskType::Coding, &options), "model-c");
}

#[test]
fn test_cost_breaks_speed_ordering() {
    let (orch, _) = orchestrator();
    let options = SelectOptions {
        prefer_speed: true,
        ..SelectOptions::default()
    };
    // final ordering is by cost; speed only orders equal-cost entries
    assert_eq!(orch.select(TaskType::Coding, &options), "model-a");
}

#[test]
fn test_preferred_lock_and_release() {
    let (orch, _) = orchestrator();
    assert!(orch.set_preferred_model(Some("model-b")));
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-b");
    orch.set_preferred_model(None);
    assert_eq!(orch.select(TaskType::Coding, &SelectOptions::default()), "model-a");
}
