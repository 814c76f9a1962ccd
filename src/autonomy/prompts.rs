use crate::autonomy::plan::{Step, StepResult};
use std::path::Path;

const DEFAULT_VERIFICATION: &str = "Verify the action completed successfully.";

/// Instructions that teach the model the tool-call grammar.
pub fn system_prompt(work_dir: &Path) -> String {
    format!(
        r#"You are an autonomous coding agent working in {dir}.

Complete each task you are given. Prefer tool calls over explanations, one file per call.

# Tools

<tool_call>
<tool>create_file</tool>
<path>relative/path/file.ext</path>
<content>
file content here
</content>
</tool_call>

<tool_call>
<tool>read_file</tool>
<path>relative/path/file.ext</path>
</tool_call>

<tool_call>
<tool>run_command</tool>
<command>cargo test</command>
</tool_call>

<tool_call>
<tool>grep</tool>
<query>searchPattern</query>
<path>optional/directory</path>
</tool_call>

`write_file` and `edit_file` take the same fields as `create_file` and replace the whole file.
Keep replies short: confirm what was done in one or two lines."#,
        dir = work_dir.display()
    )
}

pub fn planner_prompt(goal: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "No specific context provided."
    } else {
        context
    };
    format!(
        r#"You are a senior software architect creating an execution plan.

GOAL: {goal}

PROJECT CONTEXT:
{context}

Create a step-by-step plan. Each step must be atomic, verifiable, and ordered by dependencies.

Output ONLY a JSON array:
[
  {{
    "step": 1,
    "action": "Description of what to do",
    "type": "research|code|test|config",
    "model": "suggested model id",
    "verification": "How to verify completion"
  }}
]

RULES:
- Include setup and configuration steps
- Include verification steps (tests, build, lint)
- Be specific about file paths and commands"#
    )
}

/// Prompt for one step, carrying the outcome of the last `window` steps.
pub fn step_prompt(step: &Step, previous: &[StepResult], window: usize) -> String {
    let recent = &previous[previous.len().saturating_sub(window)..];
    let context = if recent.is_empty() {
        "This is the first step.".to_string()
    } else {
        recent
            .iter()
            .map(|r| {
                format!(
                    "[Step {}] {} {}: {}",
                    r.step_index + 1,
                    if r.success { "✓" } else { "✗" },
                    r.action,
                    if r.success {
                        "Completed"
                    } else {
                        r.error.as_deref().unwrap_or("Failed")
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let verification = step
        .verification
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_VERIFICATION);

    format!(
        "CURRENT TASK: {}\n\nCONTEXT FROM PREVIOUS STEPS:\n{}\n\nVERIFICATION: {}\n\n\
         Execute this step now. Use tool calls for file operations and commands.\n\
         After completion, briefly confirm what was done.",
        step.action, context, verification
    )
}
