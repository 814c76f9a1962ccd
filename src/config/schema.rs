use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub autonomy: AutonomyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Chrome executable path
    #[serde(default = "default_chrome_path")]
    pub chrome_path: PathBuf,

    /// Persistent automation identity (Chrome user data dir)
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,

    /// Existing Chrome user data dir to seed cookies and storage from on first run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_profile_dir: Option<PathBuf>,

    #[serde(default)]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra Chrome flags
    #[serde(default)]
    pub custom_args: Vec<String>,

    /// How long to wait for the DevTools endpoint after spawning Chrome
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,

    /// Budget for the no-op liveness probe in `get_page`
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Kill Chrome processes already holding `profile_dir` before launching
    #[serde(default = "default_true")]
    pub kill_stale_processes: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: default_chrome_path(),
            profile_dir: default_profile_dir(),
            template_profile_dir: None,
            headless: false,
            window_width: default_window_width(),
            window_height: default_window_height(),
            lang: default_lang(),
            user_agent: default_user_agent(),
            custom_args: Vec::new(),
            launch_timeout_ms: default_launch_timeout_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            kill_stale_processes: true,
        }
    }
}

impl BrowserConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used by `initialize` when none is given
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
        }
    }
}

/// Polling and completion thresholds for one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Unchanged ticks (network channel active) before the answer is declared stalled
    #[serde(default = "default_stall_ticks")]
    pub stall_ticks: u32,

    /// Unchanged ticks before a content-observed answer is considered settled
    #[serde(default = "default_content_settle_ticks")]
    pub content_settle_ticks: u32,

    /// Silence allowed before the one-shot fallback read of the answer region
    #[serde(default = "default_initial_grace_ms")]
    pub initial_grace_ms: u64,

    #[serde(default = "default_message_ceiling_ms")]
    pub message_ceiling_ms: u64,

    /// Ceiling used once a challenge has interrupted the message
    #[serde(default = "default_challenge_ceiling_ms")]
    pub challenge_ceiling_ms: u64,

    /// Check for anti-bot challenges every N polls
    #[serde(default = "default_challenge_check_every")]
    pub challenge_check_every: u32,

    #[serde(default = "default_challenge_stabilize_ms")]
    pub challenge_stabilize_ms: u64,

    #[serde(default = "default_token_channel_capacity")]
    pub token_channel_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stall_ticks: default_stall_ticks(),
            content_settle_ticks: default_content_settle_ticks(),
            initial_grace_ms: default_initial_grace_ms(),
            message_ceiling_ms: default_message_ceiling_ms(),
            challenge_ceiling_ms: default_challenge_ceiling_ms(),
            challenge_check_every: default_challenge_check_every(),
            challenge_stabilize_ms: default_challenge_stabilize_ms(),
            token_channel_capacity: default_token_channel_capacity(),
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initial_grace(&self) -> Duration {
        Duration::from_millis(self.initial_grace_ms)
    }

    pub fn message_ceiling(&self) -> Duration {
        Duration::from_millis(self.message_ceiling_ms)
    }

    pub fn challenge_ceiling(&self) -> Duration {
        Duration::from_millis(self.challenge_ceiling_ms)
    }

    pub fn challenge_stabilize(&self) -> Duration {
        Duration::from_millis(self.challenge_stabilize_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_transient_delay_ms")]
    pub transient_delay_ms: u64,

    /// How long to wait for the message input to appear
    #[serde(default = "default_input_wait_ms")]
    pub input_wait_ms: u64,

    /// Pause between typing and clicking send
    #[serde(default = "default_submit_settle_ms")]
    pub submit_settle_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            transient_delay_ms: default_transient_delay_ms(),
            input_wait_ms: default_input_wait_ms(),
            submit_settle_ms: default_submit_settle_ms(),
        }
    }
}

impl RetryConfig {
    pub fn transient_delay(&self) -> Duration {
        Duration::from_millis(self.transient_delay_ms)
    }
}

/// Idle pointer-movement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_presence_min_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_presence_max_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_move_steps")]
    pub move_steps: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: default_presence_min_ms(),
            max_interval_ms: default_presence_max_ms(),
            move_steps: default_move_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_base_cooldown_secs")]
    pub base_cooldown_secs: u64,

    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_cooldown_secs: default_base_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Base of the exponential backoff between step retries
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Number of previous step results folded into each step prompt
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Root for tool file operations and commands
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            max_step_retries: default_max_step_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            context_window: default_context_window(),
            work_dir: default_work_dir(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_chrome_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from("C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/usr/bin/google-chrome")
    }
}

fn default_profile_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("chatpilot").join("chrome-profile"))
        .unwrap_or_else(|| PathBuf::from("chrome-profile"))
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36".to_string()
}

fn default_lang() -> String {
    "en-US".to_string()
}

fn default_base_url() -> String {
    "https://lmarena.ai".to_string()
}

fn default_model() -> String {
    "gemini-3-pro".to_string()
}

fn default_true() -> bool {
    true
}

fn default_window_width() -> u32 {
    1400
}

fn default_window_height() -> u32 {
    900
}

fn default_launch_timeout_ms() -> u64 {
    15_000
}

fn default_health_check_timeout_ms() -> u64 {
    3_000
}

fn default_navigation_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_stall_ticks() -> u32 {
    300
}

fn default_content_settle_ticks() -> u32 {
    20
}

fn default_initial_grace_ms() -> u64 {
    30_000
}

fn default_message_ceiling_ms() -> u64 {
    300_000
}

fn default_challenge_ceiling_ms() -> u64 {
    600_000
}

fn default_challenge_check_every() -> u32 {
    10
}

fn default_challenge_stabilize_ms() -> u64 {
    3_000
}

fn default_token_channel_capacity() -> usize {
    256
}

fn default_max_attempts() -> u32 {
    3
}

fn default_transient_delay_ms() -> u64 {
    2_000
}

fn default_input_wait_ms() -> u64 {
    5_000
}

fn default_submit_settle_ms() -> u64 {
    300
}

fn default_presence_min_ms() -> u64 {
    15_000
}

fn default_presence_max_ms() -> u64 {
    25_000
}

fn default_move_steps() -> u32 {
    25
}

fn default_base_cooldown_secs() -> u64 {
    30
}

fn default_max_cooldown_secs() -> u64 {
    600
}

fn default_max_step_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_context_window() -> usize {
    3
}

fn default_command_timeout_ms() -> u64 {
    120_000
}
