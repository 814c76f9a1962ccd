use crate::autonomy::tools::ToolOutcome;
use crate::error::{PilotError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

/// One atomic unit of a plan, as produced by the planner model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub step: Option<u32>,
    pub action: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Model pinned by the planner, used when it is known
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub verification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub action: String,
    pub model: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub tool_outcomes: Vec<ToolOutcome>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub goal: String,
    pub steps: Vec<Step>,
    pub status: PlanStatus,
    /// Index of the last step that produced a result
    pub cursor: Option<usize>,
    pub results: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: &str, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.to_string(),
            steps,
            status: PlanStatus::Pending,
            cursor: None,
            results: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Where `resume` picks up.
    pub fn next_step(&self) -> usize {
        self.cursor.map(|c| c + 1).unwrap_or(0)
    }
}

/// Extract the step array from a planner answer: the span from the first
/// `[` to the last `]` must be a non-empty JSON array of steps.
pub fn parse_plan(answer: &str) -> Result<Vec<Step>> {
    let (Some(start), Some(end)) = (answer.find('['), answer.rfind(']')) else {
        return Err(PilotError::PlanParse(
            "No valid plan JSON found in response".to_string(),
        ));
    };
    if end < start {
        return Err(PilotError::PlanParse(
            "No valid plan JSON found in response".to_string(),
        ));
    }

    let steps: Vec<Step> = serde_json::from_str(&answer[start..=end])
        .map_err(|e| PilotError::PlanParse(format!("Failed to parse plan: {}", e)))?;

    if steps.is_empty() {
        return Err(PilotError::PlanParse("Plan has no steps".to_string()));
    }
    if let Some(i) = steps.iter().position(|s| s.action.trim().is_empty()) {
        return Err(PilotError::PlanParse(format!("Step {} has no action", i + 1)));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_from_fenced_answer() {
        let answer = r#"Here is the plan:
```json
[
  {"step": 1, "action": "Create Cargo.toml", "type": "config", "model": "gpt-5.2", "verification": "file exists"},
  {"step": 2, "action": "Write main.rs"}
]
```
Let me know."#;
        let steps = parse_plan(answer).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind.as_deref(), Some("config"));
        assert_eq!(steps[0].model.as_deref(), Some("gpt-5.2"));
        assert_eq!(steps[1].verification, None);
    }

    #[test]
    fn test_parse_plan_rejects_prose() {
        let err = parse_plan("I could not come up with a plan.").unwrap_err();
        assert!(matches!(err, PilotError::PlanParse(_)));
    }

    #[test]
    fn test_parse_plan_rejects_empty_and_malformed() {
        assert!(matches!(parse_plan("[]"), Err(PilotError::PlanParse(_))));
        assert!(matches!(
            parse_plan(r#"[{"step": 1}]"#),
            Err(PilotError::PlanParse(_))
        ));
        assert!(matches!(
            parse_plan(r#"[{"action": "  "}]"#),
            Err(PilotError::PlanParse(_))
        ));
    }

    #[test]
    fn test_next_step_follows_cursor() {
        let mut plan = Plan::new("goal", parse_plan(r#"[{"action": "a"}, {"action": "b"}]"#).unwrap());
        assert_eq!(plan.next_step(), 0);
        plan.cursor = Some(0);
        assert_eq!(plan.next_step(), 1);
    }
}
