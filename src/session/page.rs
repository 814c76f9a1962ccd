use crate::error::{PilotError, Result};
use crate::session::cdp::CdpConnection;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// The operations the engine needs from a live browser tab.
///
/// Handles are tied to one browser launch (`generation`). After a relaunch every
/// call on an older handle fails with `SessionCrashed`.
#[async_trait]
pub trait Page: Send + Sync {
    fn generation(&self) -> u64;

    /// Evaluate an expression in the page and return its JSON value. Promises are awaited.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Register a script to run before any page script on every new document.
    async fn add_init_script(&self, source: &str) -> Result<()>;

    async fn set_user_agent(&self, user_agent: &str, accept_language: &str) -> Result<()>;

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    async fn click_at(&self, x: f64, y: f64) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    async fn close(&self);
}

pub type PageHandle = Arc<dyn Page>;

/// Scripts start with a `/*cp:<label>*/` marker used in traces.
pub fn script_label(script: &str) -> Option<&str> {
    let rest = script.trim_start().strip_prefix("/*cp:")?;
    let end = rest.find("*/")?;
    Some(&rest[..end])
}

/// Evaluate and deserialize the result.
pub async fn eval_as<T: DeserializeOwned>(page: &dyn Page, script: &str) -> Result<T> {
    let value = page.evaluate(script).await?;
    serde_json::from_value(value).map_err(|e| {
        PilotError::Cdp(format!(
            "Unexpected result from {}: {}",
            script_label(script).unwrap_or("script"),
            e
        ))
    })
}

/// `Page` backed by a DevTools connection.
pub struct CdpPage {
    conn: CdpConnection,
    generation: u64,
}

impl CdpPage {
    /// Wrap a connection and enable the domains the engine uses.
    pub async fn attach(conn: CdpConnection, generation: u64) -> Result<Self> {
        conn.send_command("Page.enable", json!({})).await?;
        conn.send_command("Runtime.enable", json!({})).await?;
        tracing::debug!("CDP domains enabled (generation {})", generation);
        Ok(Self { conn, generation })
    }

    async fn mouse_event(&self, kind: &str, x: f64, y: f64) -> Result<()> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.conn
            .send_command("Input.dispatchMouseEvent", params)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Page for CdpPage {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        tracing::trace!("evaluate {}", script_label(script).unwrap_or("<inline>"));
        let result = self
            .conn
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("script threw");
            return Err(PilotError::Cdp(format!(
                "{} threw: {}",
                script_label(script).unwrap_or("script"),
                message
            )));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let result = self
            .conn
            .send_command("Page.navigate", json!({ "url": url }))
            .await?;
        match result.get("errorText").and_then(|v| v.as_str()) {
            Some(err) if err.contains("ERR_ABORTED") => {
                tracing::warn!("Navigation to {} aborted, continuing", url);
                Ok(())
            }
            Some(err) => Err(PilotError::Cdp(format!(
                "Navigation to {} failed: {}",
                url, err
            ))),
            None => {
                tracing::info!("Navigated to: {}", url);
                Ok(())
            }
        }
    }

    async fn add_init_script(&self, source: &str) -> Result<()> {
        self.conn
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": source }),
            )
            .await?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str, accept_language: &str) -> Result<()> {
        self.conn
            .send_command(
                "Emulation.setUserAgentOverride",
                json!({ "userAgent": user_agent, "acceptLanguage": accept_language }),
            )
            .await?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.mouse_event("mouseMoved", x, y).await
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.mouse_event("mouseMoved", x, y).await?;
        self.mouse_event("mousePressed", x, y).await?;
        self.mouse_event("mouseReleased", x, y).await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key_code = match key {
            "Enter" => 13,
            "Tab" => 9,
            "Escape" => 27,
            "Backspace" => 8,
            _ => key.chars().next().map(|c| c as i32).unwrap_or(0),
        };
        let text = if key == "Enter" { "\r" } else { "" };

        for kind in ["keyDown", "keyUp"] {
            let key_text = if kind == "keyDown" { text } else { "" };
            self.conn
                .send_command(
                    "Input.dispatchKeyEvent",
                    json!({
                        "type": kind,
                        "key": key,
                        "code": key,
                        "text": key_text,
                        "windowsVirtualKeyCode": key_code
                    }),
                )
                .await?;
        }
        tracing::debug!("Pressed key: {}", key);
        Ok(())
    }

    async fn close(&self) {
        self.conn.close().await;
    }
}
