//! Wiring of the shared session context, without launching a browser.

use chatpilot_lib::autonomy::PlanStatus;
use chatpilot_lib::catalog::{Modality, TaskType};
use chatpilot_lib::config::schema::AppConfig;
use chatpilot_lib::orchestrator::SelectOptions;
use chatpilot_lib::{PilotError, SessionContext};
use tokio::sync::mpsc;

#[test]
fn test_context_exposes_catalog() {
    let ctx = SessionContext::new(AppConfig::default());
    let models = ctx.client.available_models();
    assert!(models.iter().any(|m| m.id == "gemini-3-pro" && m.modality == Modality::Text));
    assert!(models.iter().any(|m| m.id == "gpt-image-1.5" && m.modality == Modality::Image));
    assert!(models.iter().any(|m| m.modality == Modality::Search));
    assert_eq!(ctx.client.current_model(), None);
}

#[test]
fn test_orchestrator_shares_catalog() {
    let ctx = SessionContext::new(AppConfig::default());
    let chosen = ctx.orchestrator.select(TaskType::Research, &SelectOptions::default());
    assert!(ctx.catalog.contains(&chosen));
}

#[tokio::test]
async fn test_send_before_initialize_fails_fast() {
    let ctx = SessionContext::new(AppConfig::default());
    let (tx, mut rx) = mpsc::channel(4);
    let err = ctx.client.send_message("hello", tx).await.unwrap_err();
    assert!(matches!(err, PilotError::NotInitialized));
    // sender dropped: stream closed with no tokens
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_autonomy_idle_status() {
    let ctx = SessionContext::new(AppConfig::default());
    let status = ctx.autonomy.status();
    assert!(!status.is_running);
    assert_eq!(status.total_steps, 0);
    assert_eq!(status.plan_status, None::<PlanStatus>);
    assert!(ctx.autonomy.resume().await.is_err());
}
