//! Tool invocations embedded in model answers, and their local execution.
//!
//! Markers look like:
//! `<tool_call><tool>create_file</tool><path>src/a.rs</path><content>..</content></tool_call>`

use crate::error::PilotError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tokio::process::Command;
use walkdir::WalkDir;

const MAX_GREP_MATCHES: usize = 200;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolKind {
    CreateFile,
    WriteFile,
    EditFile,
    ReadFile,
    RunCommand,
    Grep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: ToolKind,
    pub path: Option<String>,
    pub content: Option<String>,
    pub command: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: ToolKind,
    pub success: bool,
    pub output: String,
}

impl ToolOutcome {
    fn ok(tool: ToolKind, output: impl Into<String>) -> Self {
        Self {
            tool,
            success: true,
            output: output.into(),
        }
    }

    fn failed(tool: ToolKind, output: impl Into<String>) -> Self {
        Self {
            tool,
            success: false,
            output: output.into(),
        }
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

static BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("tool_call pattern"));
static TOOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool>\s*(.*?)\s*</tool>").expect("tool pattern"));
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<path>\s*(.*?)\s*</path>").expect("path pattern"));
static CONTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<content>(.*?)</content>").expect("content pattern"));
static COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<command>\s*(.*?)\s*</command>").expect("command pattern"));
static QUERY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<query>\s*(.*?)\s*</query>").expect("query pattern"));

/// Every well-formed invocation in `answer`, in order. Blocks without a
/// recognizable tool name are logged and skipped.
pub fn parse_tool_calls(answer: &str) -> Vec<ToolInvocation> {
    let mut calls = Vec::new();
    for found in BLOCK_RE.captures_iter(answer) {
        let Some(body) = found.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let name = capture(&TOOL_RE, body).unwrap_or_default();
        let kind = match name.parse::<ToolKind>() {
            Ok(kind) => kind,
            Err(_) => {
                let err = PilotError::UnparseableToolOutput(format!(
                    "unknown or missing tool name {:?}",
                    name
                ));
                tracing::warn!("Skipping tool call: {}", err);
                continue;
            }
        };
        calls.push(ToolInvocation {
            tool: kind,
            path: capture(&PATH_RE, body),
            content: capture(&CONTENT_RE, body).map(|c| {
                let c = c.strip_prefix('\n').unwrap_or(&c);
                c.strip_suffix('\n').unwrap_or(c).to_string()
            }),
            command: capture(&COMMAND_RE, body),
            query: capture(&QUERY_RE, body),
        });
    }
    calls
}

/// Executes tool invocations on behalf of the autonomy engine.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, call: &ToolInvocation) -> ToolOutcome;
}

/// Runs tools against the local filesystem and shell, rooted at `work_dir`.
pub struct LocalToolRunner {
    work_dir: PathBuf,
    command_timeout: Duration,
}

impl LocalToolRunner {
    pub fn new(work_dir: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            command_timeout,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.work_dir.join(path)
    }

    async fn write_file(&self, tool: ToolKind, path: Option<&str>, content: Option<&str>) -> ToolOutcome {
        let (Some(path), Some(content)) = (path, content) else {
            return ToolOutcome::failed(tool, "Missing path or content");
        };
        let full = self.resolve(path);
        if let Some(dir) = full.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return ToolOutcome::failed(tool, e.to_string());
            }
        }
        let existed = tokio::fs::try_exists(&full).await.unwrap_or(false);
        match tokio::fs::write(&full, content).await {
            Ok(()) => ToolOutcome::ok(
                tool,
                format!(
                    "{} {} ({} lines)",
                    if existed { "updated" } else { "created" },
                    path,
                    content.lines().count()
                ),
            ),
            Err(e) => ToolOutcome::failed(tool, e.to_string()),
        }
    }

    async fn read_file(&self, path: Option<&str>) -> ToolOutcome {
        let Some(path) = path else {
            return ToolOutcome::failed(ToolKind::ReadFile, "Missing path");
        };
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(content) => ToolOutcome::ok(ToolKind::ReadFile, content),
            Err(e) => ToolOutcome::failed(ToolKind::ReadFile, format!("{}: {}", path, e)),
        }
    }

    async fn run_command(&self, command: Option<&str>) -> ToolOutcome {
        let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
            return ToolOutcome::failed(ToolKind::RunCommand, "Missing command");
        };
        let (shell, flag) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut cmd = Command::new(shell);
        cmd.arg(flag)
            .arg(command)
            .current_dir(&self.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!("Running command: {}", command);
        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Err(_) => {
                return ToolOutcome::failed(
                    ToolKind::RunCommand,
                    format!("Timed out after {}s", self.command_timeout.as_secs()),
                )
            }
            Ok(Err(e)) => return ToolOutcome::failed(ToolKind::RunCommand, e.to_string()),
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push_str("\n--- stderr ---\n");
            }
            text.push_str(&stderr);
        }

        if output.status.success() {
            ToolOutcome::ok(ToolKind::RunCommand, text)
        } else {
            ToolOutcome::failed(
                ToolKind::RunCommand,
                format!(
                    "Command failed with exit code {}\n{}",
                    output.status.code().unwrap_or(-1),
                    text
                ),
            )
        }
    }

    async fn grep(&self, query: Option<&str>, path: Option<&str>) -> ToolOutcome {
        let Some(query) = query.filter(|q| !q.is_empty()) else {
            return ToolOutcome::failed(ToolKind::Grep, "Missing query");
        };
        let regex = match Regex::new(query) {
            Ok(re) => re,
            Err(_) => match Regex::new(&regex::escape(query)) {
                Ok(re) => re,
                Err(e) => return ToolOutcome::failed(ToolKind::Grep, e.to_string()),
            },
        };
        let root = path.map(|p| self.resolve(p)).unwrap_or_else(|| self.work_dir.clone());

        let found = tokio::task::spawn_blocking(move || search_tree(&root, &regex)).await;
        match found {
            Ok(lines) if lines.is_empty() => ToolOutcome::ok(ToolKind::Grep, "No matches found"),
            Ok(lines) => ToolOutcome::ok(ToolKind::Grep, lines.join("\n")),
            Err(e) => ToolOutcome::failed(ToolKind::Grep, e.to_string()),
        }
    }
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.') || n == "node_modules" || n == "target")
            .unwrap_or(false)
}

fn search_tree(root: &Path, regex: &Regex) -> Vec<String> {
    let mut matches = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok());

    for entry in walker {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let shown = entry.path().strip_prefix(root).unwrap_or(entry.path());
        for (i, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}: {}", shown.display(), i + 1, line.trim_end()));
                if matches.len() >= MAX_GREP_MATCHES {
                    return matches;
                }
            }
        }
    }
    matches
}

#[async_trait]
impl ToolRunner for LocalToolRunner {
    async fn run(&self, call: &ToolInvocation) -> ToolOutcome {
        let outcome = match call.tool {
            ToolKind::CreateFile | ToolKind::WriteFile | ToolKind::EditFile => {
                self.write_file(call.tool, call.path.as_deref(), call.content.as_deref())
                    .await
            }
            ToolKind::ReadFile => self.read_file(call.path.as_deref()).await,
            ToolKind::RunCommand => self.run_command(call.command.as_deref()).await,
            ToolKind::Grep => self.grep(call.query.as_deref(), call.path.as_deref()).await,
        };
        if !outcome.success {
            tracing::warn!("Tool {} failed: {}", call.tool, outcome.output);
        }
        outcome
    }
}
