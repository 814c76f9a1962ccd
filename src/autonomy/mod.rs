//! Goal-driven multi-step execution: a planning model breaks a goal into
//! steps, each step is sent to a routed model and tool calls in its answer
//! run against the local work directory.

pub mod executor;
pub mod plan;
pub mod prompts;
pub mod tools;

pub use executor::{AutonomyEngine, AutonomyEvent, AutonomyStatus, ChatBackend, ExecuteOptions};
pub use plan::{parse_plan, Plan, PlanStatus, Step, StepResult};
pub use tools::{parse_tool_calls, LocalToolRunner, ToolInvocation, ToolKind, ToolOutcome, ToolRunner};
