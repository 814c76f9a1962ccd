use crate::config::schema::AppConfig;
use crate::error::{PilotError, Result};
use std::path::Path;

/// Validate Chrome executable path
pub fn validate_chrome_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(PilotError::Validation(format!(
            "Chrome executable not found at {:?}",
            path
        )));
    }

    if !path.is_file() {
        return Err(PilotError::Validation(format!(
            "Chrome path {:?} is not a file",
            path
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = path.metadata().map_err(|e| {
            PilotError::Validation(format!("Cannot read Chrome file metadata: {}", e))
        })?;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(PilotError::Validation(format!(
                "Chrome executable {:?} is not executable",
                path
            )));
        }
    }

    Ok(())
}

/// Reject configurations the engine cannot run with. Chrome path existence is
/// checked at launch time, not here.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.browser.profile_dir.as_os_str().is_empty() {
        return Err(PilotError::Validation(
            "Profile directory cannot be empty".to_string(),
        ));
    }

    if config.browser.lang.is_empty() {
        return Err(PilotError::Validation(
            "Language code cannot be empty".to_string(),
        ));
    }

    let base = &config.upstream.base_url;
    if !base.starts_with("http://") && !base.starts_with("https://") {
        return Err(PilotError::Validation(format!(
            "Invalid upstream base_url: {}. Must start with http:// or https://",
            base
        )));
    }

    let acq = &config.acquisition;
    if acq.poll_interval_ms == 0 {
        return Err(PilotError::Validation(
            "acquisition.poll_interval_ms must be positive".to_string(),
        ));
    }
    if acq.stall_ticks == 0 || acq.content_settle_ticks == 0 || acq.challenge_check_every == 0 {
        return Err(PilotError::Validation(
            "acquisition tick thresholds must be positive".to_string(),
        ));
    }
    if acq.challenge_ceiling_ms < acq.message_ceiling_ms {
        return Err(PilotError::Validation(format!(
            "acquisition.challenge_ceiling_ms ({}) must not be below message_ceiling_ms ({})",
            acq.challenge_ceiling_ms, acq.message_ceiling_ms
        )));
    }
    if acq.token_channel_capacity == 0 {
        return Err(PilotError::Validation(
            "acquisition.token_channel_capacity must be positive".to_string(),
        ));
    }

    if config.retry.max_attempts == 0 {
        return Err(PilotError::Validation(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }

    let presence = &config.presence;
    if presence.min_interval_ms > presence.max_interval_ms {
        return Err(PilotError::Validation(format!(
            "presence.min_interval_ms ({}) exceeds max_interval_ms ({})",
            presence.min_interval_ms, presence.max_interval_ms
        )));
    }

    let orch = &config.orchestrator;
    if orch.base_cooldown_secs > orch.max_cooldown_secs {
        return Err(PilotError::Validation(format!(
            "orchestrator.base_cooldown_secs ({}) exceeds max_cooldown_secs ({})",
            orch.base_cooldown_secs, orch.max_cooldown_secs
        )));
    }

    if config.autonomy.max_step_retries == 0 {
        return Err(PilotError::Validation(
            "autonomy.max_step_retries must be at least 1".to_string(),
        ));
    }

    Ok(())
}
