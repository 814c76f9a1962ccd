//! Typing and sending a message through the page's composer.

use crate::error::{PilotError, Result};
use crate::session::page::{eval_as, Page};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

const INPUT_PRESENT_SCRIPT: &str = "/*cp:input_present*/ !!document.querySelector('textarea')";

const SUBMIT_STATE_SCRIPT: &str = r#"/*cp:submit_state*/
(() => {
  const input = document.querySelector('textarea');
  const prose = Array.from(document.querySelectorAll('.prose'));
  return {
    inputValue: input ? input.value : '',
    userBlocks: document.querySelectorAll('.self-end').length,
    answerBlocks: prose.filter((el) => !el.closest('.self-end')).length,
  };
})()
"#;

const SEND_CLICK_SCRIPT: &str = r#"/*cp:send_click*/
(() => {
  const btn = document.querySelector('button[aria-label*="Send"]') ||
    document.querySelector('button[aria-label*="send"]') ||
    document.querySelector('button[data-testid="send-button"]') ||
    document.querySelector('form button[type="submit"]');
  if (btn && !btn.disabled) { btn.click(); return true; }
  return false;
})()
"#;

/// React ignores plain `value` writes; go through the native setter and
/// dispatch the events the framework listens to.
fn fill_script(message: &str) -> Result<String> {
    let literal = serde_json::to_string(message)
        .map_err(|e| PilotError::Validation(format!("Message not encodable: {}", e)))?;
    Ok(format!(
        r#"/*cp:fill_input*/
(() => {{
  const input = document.querySelector('textarea');
  if (!input) return false;
  input.focus();
  const setter = Object.getOwnPropertyDescriptor(window.HTMLTextAreaElement.prototype, 'value').set;
  setter.call(input, {});
  input.dispatchEvent(new Event('input', {{ bubbles: true }}));
  input.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return true;
}})()
"#,
        literal
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitState {
    #[serde(default)]
    pub input_value: String,
    #[serde(default)]
    pub user_blocks: u32,
    #[serde(default)]
    pub answer_blocks: u32,
}

/// What to do with the outbound message after an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmitAction {
    /// The message is already in the conversation; only re-observe
    AlreadySubmitted,
    /// Text is still in the input; press send again
    ClickSend,
    /// Input was cleared without the message landing; type it again
    Retype,
}

pub fn resubmit_action(state: &SubmitState, message: &str, baseline_user_blocks: u32) -> ResubmitAction {
    if state.user_blocks > baseline_user_blocks {
        ResubmitAction::AlreadySubmitted
    } else if !message.trim().is_empty() && state.input_value.trim() == message.trim() {
        ResubmitAction::ClickSend
    } else {
        ResubmitAction::Retype
    }
}

pub async fn submit_state(page: &dyn Page) -> Result<SubmitState> {
    let state: Option<SubmitState> = eval_as(page, SUBMIT_STATE_SCRIPT).await?;
    Ok(state.unwrap_or_default())
}

/// Wait until the message input exists.
pub async fn wait_for_input(page: &dyn Page, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let present: Option<bool> = eval_as(page, INPUT_PRESENT_SCRIPT).await?;
        if present == Some(true) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PilotError::TransientIo(format!(
                "Message input not found after {}ms",
                timeout.as_millis()
            )));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Press send, falling back to Enter when no button is found.
pub async fn press_send(page: &dyn Page) -> Result<()> {
    let clicked: Option<bool> = eval_as(page, SEND_CLICK_SCRIPT).await?;
    if clicked != Some(true) {
        tracing::debug!("No send button found, pressing Enter");
        page.press_key("Enter").await?;
    }
    Ok(())
}

pub async fn submit(page: &dyn Page, message: &str, settle: Duration) -> Result<()> {
    let filled: Option<bool> = eval_as(page, &fill_script(message)?).await?;
    if filled != Some(true) {
        return Err(PilotError::TransientIo(
            "Message input disappeared before typing".to_string(),
        ));
    }
    tokio::time::sleep(settle).await;
    press_send(page).await?;
    tracing::info!(
        "Sent message: {}",
        message.chars().take(50).collect::<String>()
    );
    Ok(())
}
