use crate::acquisition::{Completion, TokenEvent};
use crate::autonomy::plan::{parse_plan, Plan, PlanStatus, Step, StepResult};
use crate::autonomy::prompts::{planner_prompt, step_prompt, system_prompt};
use crate::autonomy::tools::{parse_tool_calls, ToolOutcome, ToolRunner};
use crate::catalog::{Modality, TaskType};
use crate::config::schema::AutonomyConfig;
use crate::error::{PilotError, Result};
use crate::orchestrator::{infer_task_type, ModelOrchestrator, SelectOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const TOKEN_BUFFER: usize = 256;

/// The chat surface the executor drives.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn select_model(&self, model_id: &str) -> Result<Modality>;

    async fn send_message(&self, text: &str, tokens: mpsc::Sender<TokenEvent>) -> Result<Completion>;

    /// Abandon the message in flight, if any.
    fn stop(&self) {}
}

/// Progress reported to subscribers while planning and executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum AutonomyEvent {
    Status(String),
    StepStart {
        step: usize,
        total: usize,
        action: String,
        model: String,
    },
    Token(String),
    ToolResult(ToolOutcome),
    StepComplete(StepResult),
    StepFailed(StepResult),
    Complete {
        status: PlanStatus,
        succeeded: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub start_from_step: usize,
    /// Last step index to run
    pub stop_after_step: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutonomyStatus {
    pub is_running: bool,
    pub current_step: Option<usize>,
    pub total_steps: usize,
    pub step_results: Vec<StepResult>,
    pub plan_status: Option<PlanStatus>,
}

pub struct AutonomyEngine {
    backend: Arc<dyn ChatBackend>,
    orchestrator: Arc<ModelOrchestrator>,
    tools: Arc<dyn ToolRunner>,
    config: AutonomyConfig,
    token_capacity: usize,
    plan: Mutex<Option<Plan>>,
    running: AtomicBool,
    pause_requested: AtomicBool,
    halt: Mutex<CancellationToken>,
    events: broadcast::Sender<AutonomyEvent>,
}

impl AutonomyEngine {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        orchestrator: Arc<ModelOrchestrator>,
        tools: Arc<dyn ToolRunner>,
        config: AutonomyConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            backend,
            orchestrator,
            tools,
            config,
            token_capacity: TOKEN_BUFFER,
            plan: Mutex::new(None),
            running: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            halt: Mutex::new(CancellationToken::new()),
            events,
        }
    }

    pub fn with_token_capacity(mut self, capacity: usize) -> Self {
        self.token_capacity = capacity.max(1);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutonomyEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AutonomyEvent) {
        match &event {
            AutonomyEvent::Token(_) => {}
            AutonomyEvent::Status(msg) => tracing::info!("{}", msg),
            other => tracing::debug!("Autonomy event: {:?}", other),
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn plan(&self) -> Option<Plan> {
        self.plan.lock().clone()
    }

    /// Send one prompt to `model`, relaying token deltas as events.
    async fn converse(&self, model: &str, prompt: &str) -> Result<Completion> {
        self.backend.select_model(model).await?;

        let (tx, mut rx) = mpsc::channel::<TokenEvent>(self.token_capacity);
        let events = self.events.clone();
        let relay = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                if !token.delta.is_empty() {
                    let _ = events.send(AutonomyEvent::Token(token.delta));
                }
            }
        });

        let result = self.backend.send_message(prompt, tx).await;
        if let Err(e) = relay.await {
            tracing::debug!("Token relay ended abnormally: {}", e);
        }
        result
    }

    /// Ask a planning model to break `goal` into steps.
    pub async fn generate_plan(&self, goal: &str, context: &str) -> Result<Plan> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PilotError::Autonomy("Already executing a plan.".to_string()));
        }
        self.emit(AutonomyEvent::Status("Generating execution plan...".to_string()));

        let model = self
            .orchestrator
            .select(TaskType::Planning, &SelectOptions::default());
        let completion = match self.converse(&model, &planner_prompt(goal, context)).await {
            Ok(c) => {
                self.orchestrator.report_success(&model);
                c
            }
            Err(e) => {
                self.orchestrator.report_failure(&model);
                return Err(e);
            }
        };

        let steps = parse_plan(&completion.raw_text)?;
        let plan = Plan::new(goal, steps);
        tracing::info!("Plan {} with {} steps for: {}", plan.id, plan.steps.len(), goal);
        *self.plan.lock() = Some(plan.clone());
        Ok(plan)
    }

    /// Run the current plan. Failed steps are recorded and skipped over; the
    /// plan only ends `Failed` when halted.
    pub async fn execute_plan(&self, options: ExecuteOptions) -> Result<PlanStatus> {
        let (steps, mut results) = {
            let mut guard = self.plan.lock();
            let plan = guard.as_mut().ok_or_else(|| {
                PilotError::Autonomy("No plan to execute. Generate a plan first.".to_string())
            })?;
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(PilotError::Autonomy("Already executing a plan.".to_string()));
            }
            plan.status = PlanStatus::Running;
            plan.results.retain(|r| r.step_index < options.start_from_step);
            (plan.steps.clone(), plan.results.clone())
        };

        self.pause_requested.store(false, Ordering::SeqCst);
        let halt = CancellationToken::new();
        *self.halt.lock() = halt.clone();

        let total = steps.len();
        let mut status = PlanStatus::Completed;
        let mut last_model: Option<String> = None;

        for index in options.start_from_step..total {
            if halt.is_cancelled() {
                status = PlanStatus::Failed;
                break;
            }
            if self.pause_requested.load(Ordering::SeqCst) {
                status = PlanStatus::Paused;
                self.emit(AutonomyEvent::Status("Execution paused by user.".to_string()));
                break;
            }
            if let Some(stop) = options.stop_after_step {
                if index > stop {
                    status = PlanStatus::Paused;
                    self.emit(AutonomyEvent::Status(format!("Stopped after step {}.", stop + 1)));
                    break;
                }
            }

            let result = self
                .execute_step(index, total, &steps[index], &results, &mut last_model, &halt)
                .await;
            results.push(result.clone());
            if let Some(plan) = self.plan.lock().as_mut() {
                plan.results.push(result);
                plan.cursor = Some(index);
            }
        }

        if halt.is_cancelled() {
            status = PlanStatus::Failed;
            self.emit(AutonomyEvent::Status("Execution halted.".to_string()));
        }

        if let Some(plan) = self.plan.lock().as_mut() {
            plan.status = status;
        }
        self.running.store(false, Ordering::SeqCst);

        if status == PlanStatus::Completed {
            let succeeded = results.iter().filter(|r| r.success).count();
            self.emit(AutonomyEvent::Complete {
                status,
                succeeded,
                failed: results.len() - succeeded,
            });
        }
        Ok(status)
    }

    async fn execute_step(
        &self,
        index: usize,
        total: usize,
        step: &Step,
        previous: &[StepResult],
        last_model: &mut Option<String>,
        halt: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();
        let task = infer_task_type(&step.action);
        let attempts = self.config.max_step_retries.max(1);
        let options = SelectOptions {
            forced_model: step.model.clone(),
            ..SelectOptions::default()
        };

        let mut model = self.orchestrator.select(task, &options);
        self.emit(AutonomyEvent::StepStart {
            step: index + 1,
            total,
            action: step.action.clone(),
            model: model.clone(),
        });
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                model = self.orchestrator.select(task, &options);
            }
            let mut prompt = step_prompt(step, previous, self.config.context_window);
            // A model switch starts a fresh conversation
            if last_model.as_deref() != Some(model.as_str()) {
                prompt = format!("{}\n\n{}", system_prompt(&self.config.work_dir), prompt);
            }

            match self.converse(&model, &prompt).await {
                Ok(completion) => {
                    *last_model = Some(model.clone());
                    self.orchestrator.report_success(&model);

                    let mut tool_outcomes = Vec::new();
                    for call in parse_tool_calls(&completion.raw_text) {
                        let outcome = self.tools.run(&call).await;
                        self.emit(AutonomyEvent::ToolResult(outcome.clone()));
                        tool_outcomes.push(outcome);
                    }

                    let result = StepResult {
                        step_index: index,
                        action: step.action.clone(),
                        model,
                        success: true,
                        output: Some(completion.raw_text),
                        error: None,
                        tool_outcomes,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                    self.emit(AutonomyEvent::StepComplete(result.clone()));
                    return result;
                }
                Err(e) => {
                    *last_model = None;
                    last_error = e.to_string();
                    self.orchestrator.report_failure(&model);
                    self.emit(AutonomyEvent::Status(format!(
                        "Step {} failed (attempt {}/{}): {}",
                        index + 1,
                        attempt,
                        attempts,
                        e
                    )));
                    if halt.is_cancelled() {
                        break;
                    }
                    if attempt < attempts {
                        let wait = Duration::from_millis(
                            self.config.retry_base_delay_ms.saturating_mul(1 << attempt.min(16)),
                        );
                        self.emit(AutonomyEvent::Status(format!(
                            "Retrying in {}s...",
                            wait.as_secs()
                        )));
                        tokio::select! {
                            _ = halt.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }

        let result = StepResult {
            step_index: index,
            action: step.action.clone(),
            model,
            success: false,
            output: None,
            error: Some(last_error),
            tool_outcomes: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.emit(AutonomyEvent::StepFailed(result.clone()));
        self.emit(AutonomyEvent::Status(format!(
            "Step {} failed after {} attempts. Continuing...",
            index + 1,
            attempts
        )));
        result
    }

    /// Stop after the current step finishes.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.emit(AutonomyEvent::Status(
            "Execution pausing after current step...".to_string(),
        ));
    }

    /// Continue from the step after the cursor.
    pub async fn resume(&self) -> Result<PlanStatus> {
        let next = self
            .plan
            .lock()
            .as_ref()
            .map(Plan::next_step)
            .ok_or_else(|| PilotError::Autonomy("No plan to resume.".to_string()))?;
        self.execute_plan(ExecuteOptions {
            start_from_step: next,
            stop_after_step: None,
        })
        .await
    }

    /// Abort the run. The message in flight is abandoned and the plan is
    /// marked failed.
    pub fn halt(&self) {
        self.halt.lock().cancel();
        self.backend.stop();
        if !self.running.load(Ordering::SeqCst) {
            if let Some(plan) = self.plan.lock().as_mut() {
                plan.status = PlanStatus::Failed;
            }
        }
        self.emit(AutonomyEvent::Status("Halting execution...".to_string()));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AutonomyStatus {
        let guard = self.plan.lock();
        AutonomyStatus {
            is_running: self.running.load(Ordering::SeqCst),
            current_step: guard.as_ref().and_then(|p| p.cursor),
            total_steps: guard.as_ref().map(|p| p.steps.len()).unwrap_or(0),
            step_results: guard
                .as_ref()
                .map(|p| p.results.clone())
                .unwrap_or_default(),
            plan_status: guard.as_ref().map(|p| p.status),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::acquisition::CompletionReason;
    use crate::autonomy::tools::ToolInvocation;

    /// Backend answering from a closure over the prompt.
    pub struct ScriptedBackend<F> {
        pub answer: F,
        pub selected: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl<F> ScriptedBackend<F>
    where
        F: Fn(&str) -> Result<String> + Send + Sync,
    {
        pub fn new(answer: F) -> Self {
            Self {
                answer,
                selected: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl<F> ChatBackend for ScriptedBackend<F>
    where
        F: Fn(&str) -> Result<String> + Send + Sync,
    {
        async fn select_model(&self, model_id: &str) -> Result<Modality> {
            self.selected.lock().push(model_id.to_string());
            Ok(Modality::Text)
        }

        async fn send_message(&self, text: &str, tokens: mpsc::Sender<TokenEvent>) -> Result<Completion> {
            self.prompts.lock().push(text.to_string());
            let answer = (self.answer)(text)?;
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

    #[derive(Default)]
    pub struct RecordingTools {
        pub calls: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ToolRunner for RecordingTools {
        async fn run(&self, call: &ToolInvocation) -> ToolOutcome {
            self.calls.lock().push(call.clone());
            ToolOutcome {
                tool: call.tool,
                success: true,
                output: "ok".to_string(),
            }
        }
    }
}
