use crate::error::Result;
use crate::session::page::{eval_as, Page};
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Blocked-page signatures, most specific first.
const DETECT_SCRIPT: &str = r#"/*cp:challenge*/
(() => {
  const visible = (el) => {
    if (!el) return false;
    const r = el.getBoundingClientRect();
    return r.width > 0 && r.height > 0;
  };
  const title = (document.title || '').toLowerCase();
  const body = ((document.body && document.body.innerText) || '').toLowerCase();
  if (visible(document.querySelector('iframe[title*="challenge"]')) ||
      visible(document.querySelector('iframe[src*="bframe"]'))) {
    return { kind: 'puzzle', detail: 'image puzzle visible' };
  }
  if (title.includes('rate limited') || document.querySelector('#cf-error-details')) {
    return { kind: 'rate_limited', detail: document.title };
  }
  if (title.includes('just a moment') || document.querySelector('#challenge-running') ||
      document.querySelector('[data-ray]')) {
    return { kind: 'interstitial', detail: document.title };
  }
  if (document.querySelector('iframe[src*="challenges.cloudflare.com"]')) {
    return { kind: 'checkbox', detail: 'turnstile' };
  }
  const dialog = document.querySelector('div[role="dialog"]');
  if (dialog) {
    const text = (dialog.innerText || '').toLowerCase();
    if (dialog.querySelector('iframe[title*="reCAPTCHA"]') || text.includes('security verification')) {
      return { kind: 'checkbox', detail: 'recaptcha dialog' };
    }
  }
  if (document.querySelector('iframe[title*="reCAPTCHA"]')) {
    return { kind: 'checkbox', detail: 'recaptcha' };
  }
  if (body.includes('security verification')) {
    return { kind: 'interstitial', detail: 'security verification' };
  }
  return { kind: 'clear', detail: '' };
})()
"#;

/// Locates the checkbox widget, or reports a puzzle that needs a human.
const LOCATE_SCRIPT: &str = r#"/*cp:challenge_target*/
(() => {
  const visible = (el) => {
    if (!el) return null;
    const r = el.getBoundingClientRect();
    return r.width > 0 && r.height > 0 ? r : null;
  };
  if (visible(document.querySelector('iframe[title*="challenge"]')) ||
      visible(document.querySelector('iframe[src*="bframe"]'))) {
    return { kind: 'puzzle' };
  }
  const frame = document.querySelector('iframe[title*="reCAPTCHA"]') ||
    document.querySelector('iframe[src*="challenges.cloudflare.com"]');
  const r = visible(frame);
  if (!r) return { kind: 'none' };
  return { kind: 'checkbox', x: r.left + Math.min(30, r.width / 2), y: r.top + r.height / 2 };
})()
"#;

const TERMS_SCRIPT: &str = r#"/*cp:terms*/
(() => {
  const agree = (btn) => {
    const t = (btn.textContent || '').toLowerCase().trim();
    return t === 'i agree' || t === 'agree' || t === 'accept' || t === 'i accept';
  };
  let clickedCheckbox = false;
  for (const dialog of document.querySelectorAll('[role="dialog"], .modal, form')) {
    dialog.querySelectorAll('input[type="checkbox"]').forEach((cb) => {
      if (!cb.checked) { cb.click(); clickedCheckbox = true; }
    });
    for (const btn of dialog.querySelectorAll('button')) {
      if (agree(btn)) { btn.click(); return 'agreed'; }
    }
  }
  for (const btn of document.querySelectorAll('button')) {
    if (agree(btn)) { btn.click(); return 'agreed'; }
  }
  return clickedCheckbox ? 'checkboxes' : 'none';
})()
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Full-page "checking your browser" wait
    Interstitial,
    /// reCAPTCHA / Turnstile checkbox
    Checkbox,
    /// Image selection puzzle; never automated
    ImagePuzzle,
    /// Upstream edge rate limiting
    RateLimited,
}

impl ChallengeKind {
    pub fn requires_human(&self) -> bool {
        matches!(self, ChallengeKind::ImagePuzzle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    Clear,
    Blocked { kind: ChallengeKind, detail: String },
}

impl ChallengeStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ChallengeStatus::Blocked { .. })
    }
}

/// Outcome of one automated resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Clicked,
    NotFound,
    ManualRequired,
}

#[derive(Deserialize)]
struct Detection {
    kind: String,
    #[serde(default)]
    detail: String,
}

#[derive(Deserialize)]
struct Target {
    kind: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

pub async fn detect(page: &dyn Page) -> Result<ChallengeStatus> {
    let found: Option<Detection> = eval_as(page, DETECT_SCRIPT).await?;
    let Some(found) = found else {
        return Ok(ChallengeStatus::Clear);
    };
    let kind = match found.kind.as_str() {
        "puzzle" => ChallengeKind::ImagePuzzle,
        "rate_limited" => ChallengeKind::RateLimited,
        "interstitial" => ChallengeKind::Interstitial,
        "checkbox" => ChallengeKind::Checkbox,
        _ => return Ok(ChallengeStatus::Clear),
    };
    Ok(ChallengeStatus::Blocked {
        kind,
        detail: found.detail,
    })
}

/// Single best-effort click on a checkbox challenge. Image puzzles are
/// reported, never attempted.
pub async fn attempt_resolution(page: &dyn Page) -> Result<Resolution> {
    let target: Option<Target> = eval_as(page, LOCATE_SCRIPT).await?;
    let Some(target) = target else {
        return Ok(Resolution::NotFound);
    };

    match target.kind.as_str() {
        "puzzle" => {
            tracing::warn!("Image puzzle detected; solve it manually in the browser window");
            Ok(Resolution::ManualRequired)
        }
        "checkbox" => {
            let (x, y) = jitter(target.x, target.y);
            page.move_mouse(x - 40.0, y - 25.0).await?;
            tokio::time::sleep(Duration::from_millis(120)).await;
            page.click_at(x, y).await?;
            tracing::info!("Clicked challenge checkbox at ({:.0}, {:.0})", x, y);
            Ok(Resolution::Clicked)
        }
        _ => Ok(Resolution::NotFound),
    }
}

fn jitter(x: f64, y: f64) -> (f64, f64) {
    let mut rng = rand::thread_rng();
    (x + rng.gen_range(-3.0..3.0), y + rng.gen_range(-3.0..3.0))
}

/// Accept the terms-of-use dialog if one is showing. Returns true once agreed.
pub async fn accept_terms(page: &dyn Page) -> Result<bool> {
    for _ in 0..2 {
        let result: Option<String> = eval_as(page, TERMS_SCRIPT).await?;
        match result.as_deref() {
            Some("agreed") => {
                tracing::info!("Accepted terms dialog");
                tokio::time::sleep(Duration::from_millis(1000)).await;
                return Ok(true);
            }
            Some("checkboxes") => {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            _ => break,
        }
    }
    Ok(false)
}
