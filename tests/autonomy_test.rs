//! Plan execution through the public `ChatBackend` seam, plus the local tool runner.

use async_trait::async_trait;
use chatpilot_lib::acquisition::{Completion, CompletionReason, TokenEvent};
use chatpilot_lib::autonomy::{
    parse_plan, parse_tool_calls, AutonomyEngine, ChatBackend, ExecuteOptions, LocalToolRunner,
    PlanStatus, ToolKind, ToolRunner,
};
use chatpilot_lib::catalog::{Modality, ModelCatalog};
use chatpilot_lib::config::schema::{AutonomyConfig, OrchestratorConfig};
use chatpilot_lib::orchestrator::ModelOrchestrator;
use chatpilot_lib::{PilotError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Answers the planner with three steps and fails every attempt at step two.
struct FlakyBackend;

#[async_trait]
impl ChatBackend for FlakyBackend {
    async fn select_model(&self, _model_id: &str) -> Result<Modality> {
        Ok(Modality::Text)
    }

    async fn send_message(&self, text: &str, tokens: mpsc::Sender<TokenEvent>) -> Result<Completion> {
        let answer = if text.contains("GOAL:") {
            r#"[{"action": "Create notes.md"}, {"action": "Compile the docs"}, {"action": "Create summary.md"}]"#
                .to_string()
        } else if text.contains("CURRENT TASK: Compile the docs") {
            return Err(PilotError::TransientIo("Execution context was destroyed".to_string()));
        } else {
            "<tool_call>\n<tool>create_file</tool>\n<path>out.md</path>\n<content>\nhello\n</content>\n</tool_call>".to_string()
        };
        let _ = tokens
            .send(TokenEvent {
                full_text: answer.clone(),
                delta: answer.clone(),
                image_url: None,
            })
            .await;
        Ok(Completion {
            text: answer.clone(),
            raw_text: answer,
            image_url: None,
            sources: Vec::new(),
            chat_id: None,
            reason: CompletionReason::StreamFinished,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_step_plan_survives_failed_middle_step() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(ModelOrchestrator::new(
        Arc::new(ModelCatalog::builtin()),
        &OrchestratorConfig::default(),
    ));
    let config = AutonomyConfig {
        work_dir: dir.path().to_path_buf(),
        ..AutonomyConfig::default()
    };
    let tools = Arc::new(LocalToolRunner::new(dir.path(), Duration::from_secs(5)));
    let engine = AutonomyEngine::new(Arc::new(FlakyBackend), orchestrator, tools, config);

    let plan = engine.generate_plan("Write docs", "").await.unwrap();
    assert_eq!(plan.steps.len(), 3);

    let status = engine.execute_plan(ExecuteOptions::default()).await.unwrap();
    assert_eq!(status, PlanStatus::Completed);

    let report = engine.status();
    assert_eq!(report.total_steps, 3);
    assert_eq!(report.step_results.len(), 3);
    assert!(report.step_results[0].success);
    assert!(!report.step_results[1].success);
    assert!(report.step_results[2].success);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.md")).unwrap().trim(),
        "hello"
    );
}

#[test]
fn test_plan_parsing_tolerates_surrounding_prose() {
    let steps = parse_plan("Sure!\n[{\"step\": 1, \"action\": \"Init repo\", \"type\": \"config\"}]\nGood luck.").unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].action, "Init repo");
    assert!(matches!(parse_plan("nothing here"), Err(PilotError::PlanParse(_))));
}

#[test]
fn test_unknown_tools_are_skipped() {
    let answer = "<tool_call><tool>launch_rocket</tool></tool_call>\
                  <tool_call><tool>run_command</tool><command>ls</command></tool_call>";
    let calls = parse_tool_calls(answer);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool, ToolKind::RunCommand);
    assert_eq!(calls[0].command.as_deref(), Some("ls"));
}

#[tokio::test]
async fn test_tool_runner_reads_what_it_wrote() {
    let dir = tempfile::tempdir().unwrap();
    let runner = LocalToolRunner::new(dir.path(), Duration::from_secs(5));
    let calls = parse_tool_calls(
        "<tool_call><tool>create_file</tool><path>src/a.txt</path><content>alpha</content></tool_call>\
         <tool_call><tool>read_file</tool><path>src/a.txt</path></tool_call>",
    );
    assert_eq!(calls.len(), 2);

    let written = runner.run(&calls[0]).await;
    assert!(written.success, "{}", written.output);
    let read = runner.run(&calls[1]).await;
    assert!(read.success);
    assert!(read.output.contains("alpha"));
}
