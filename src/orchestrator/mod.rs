//! Picks the cheapest available upstream model for a task, keeping failed
//! models on an escalating cooldown.

pub mod clock;
pub mod cooldown;

use crate::catalog::{ModelCatalog, ModelInfo, TaskType};
use crate::config::schema::OrchestratorConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::Cooldown;

/// Keyword table for task inference; earlier rows win.
const TASK_KEYWORDS: &[(TaskType, &[&str])] = &[
    (TaskType::Research, &["research", "find", "look up", "search", "documentation"]),
    (TaskType::Planning, &["plan", "architect", "design", "structure"]),
    (TaskType::Testing, &["test", "spec", "verify"]),
    (TaskType::Debugging, &["debug", "fix", "error", "bug"]),
    (TaskType::Refactoring, &["refactor", "clean", "improve", "optimize"]),
    (TaskType::SimpleEdit, &["rename", "move", "delete"]),
    (TaskType::ImageGeneration, &["logo", "image", "icon", "asset"]),
    (TaskType::Algorithms, &["algorithm", "sort", "graph", "tree"]),
];

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub forced_model: Option<String>,
    pub prefer_speed: bool,
    pub avoid: Vec<String>,
}

#[derive(Default)]
struct OrchestratorState {
    cooldowns: HashMap<String, Cooldown>,
    preferred: Option<String>,
}

pub struct ModelOrchestrator {
    catalog: Arc<ModelCatalog>,
    base_cooldown: Duration,
    max_cooldown: Duration,
    clock: Arc<dyn Clock>,
    state: RwLock<OrchestratorState>,
}

impl ModelOrchestrator {
    pub fn new(catalog: Arc<ModelCatalog>, config: &OrchestratorConfig) -> Self {
        Self::with_clock(catalog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        catalog: Arc<ModelCatalog>,
        config: &OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            base_cooldown: Duration::seconds(config.base_cooldown_secs as i64),
            max_cooldown: Duration::seconds(config.max_cooldown_secs as i64),
            clock,
            state: RwLock::new(OrchestratorState::default()),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Forced model, then the preferred-model lock, then the cheapest routed
    /// candidate that is neither avoided nor cooling down.
    pub fn select(&self, task: TaskType, options: &SelectOptions) -> String {
        if let Some(forced) = &options.forced_model {
            if self.catalog.contains(forced) {
                return forced.clone();
            }
            tracing::debug!("Ignoring unknown forced model {}", forced);
        }

        let state = self.state.read();
        if let Some(preferred) = &state.preferred {
            return preferred.clone();
        }

        let now = self.clock.now();
        let mut candidates: Vec<&String> = self
            .catalog
            .candidates(task)
            .iter()
            .filter(|id| !options.avoid.iter().any(|a| a == *id))
            .filter(|id| {
                state
                    .cooldowns
                    .get(id.as_str())
                    .map(|c| !c.is_active(now))
                    .unwrap_or(true)
            })
            .collect();

        if candidates.is_empty() {
            candidates = self.catalog.fallback().iter().collect();
        }

        if options.prefer_speed {
            candidates.sort_by_key(|id| self.catalog.speed(id).rank());
        }
        candidates.sort_by(|a, b| {
            self.catalog
                .cost_weight(a)
                .total_cmp(&self.catalog.cost_weight(b))
        });

        let chosen = candidates
            .first()
            .map(|id| id.to_string())
            .unwrap_or_default();
        tracing::debug!("Selected {} for {} task", chosen, task);
        chosen
    }

    /// Start, or escalate, the cooldown for `model_id`.
    pub fn report_failure(&self, model_id: &str) {
        let now = self.clock.now();
        let mut state = self.state.write();
        let next = match state.cooldowns.get(model_id) {
            Some(current) => current.extend(now, self.base_cooldown, self.max_cooldown),
            None => Cooldown::start(now, self.base_cooldown),
        };
        tracing::info!(
            "Model {} on cooldown for {}s",
            model_id,
            (next.until - now).num_seconds()
        );
        state.cooldowns.insert(model_id.to_string(), next);
    }

    pub fn report_success(&self, model_id: &str) {
        self.state.write().cooldowns.remove(model_id);
    }

    pub fn cooldown_until(&self, model_id: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.state
            .read()
            .cooldowns
            .get(model_id)
            .filter(|c| c.is_active(now))
            .map(|c| c.until)
    }

    /// Lock selection to one model, or clear the lock with `None`. Unknown
    /// ids are ignored and reported with `false`.
    pub fn set_preferred_model(&self, model_id: Option<&str>) -> bool {
        match model_id {
            Some(id) if !self.catalog.contains(id) => {
                tracing::warn!("Cannot prefer unknown model {}", id);
                false
            }
            _ => {
                self.state.write().preferred = model_id.map(str::to_string);
                tracing::info!("Preferred model: {}", model_id.unwrap_or("auto"));
                true
            }
        }
    }

    pub fn preferred_model(&self) -> Option<String> {
        self.state.read().preferred.clone()
    }

    pub fn infer_task_type(&self, description: &str) -> TaskType {
        infer_task_type(description)
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        self.catalog.available_models()
    }
}

pub fn infer_task_type(description: &str) -> TaskType {
    let lower = description.to_lowercase();
    TASK_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(task, _)| *task)
        .unwrap_or(TaskType::Coding)
}
