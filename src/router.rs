use crate::catalog::{Modality, ModelCatalog};
use crate::error::{PilotError, Result};
use crate::session::challenge;
use crate::session::page::{eval_as, Page};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use std::time::Duration;

/// `encodeURIComponent` leaves these unescaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const IMAGE_HINTS: &[&str] = &[
    "image", "flux", "imagen", "dall-e", "reve", "photon", "recraft", "ideogram",
];
const SEARCH_HINTS: &[&str] = &["search", "grounding", "sonar", "diffbot"];

const INPUT_READY_SCRIPT: &str = "/*cp:input_ready*/ !!document.querySelector('textarea')";

/// Strips page furniture so the tab stays light while keeping the composer usable.
const THIN_SCRIPT: &str = r#"/*cp:thin*/
(() => {
  if (!document.getElementById('cp-thin-style')) {
    const style = document.createElement('style');
    style.id = 'cp-thin-style';
    style.textContent = `
      *, *::before, *::after { animation: none !important; transition: none !important; }
      aside, [data-side="left"], .sidebar, header, nav, footer,
      [class*="banner"], [class*="announcement"] { display: none !important; }
      textarea, form { display: block !important; visibility: visible !important; }
    `;
    document.head.appendChild(style);
  }
  let removed = 0;
  const selectors = 'aside, header, nav, footer, .sidebar, [data-side], [class*="banner"], [class*="announcement"], video, canvas';
  document.querySelectorAll(selectors).forEach((el) => {
    if (el.querySelector('textarea') || el.closest('form')) return;
    el.remove();
    removed++;
  });
  return removed;
})()
"#;

/// Where to go for a model and what kind of chat it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub model_id: String,
    pub location: String,
    pub modality: Modality,
}

/// Modality from the model id alone.
pub fn modality_from_id(model_id: &str) -> Option<Modality> {
    let lower = model_id.to_lowercase();
    if IMAGE_HINTS.iter().any(|h| lower.contains(h)) {
        Some(Modality::Image)
    } else if SEARCH_HINTS.iter().any(|h| lower.contains(h)) {
        Some(Modality::Search)
    } else {
        None
    }
}

pub struct Router {
    base_url: String,
    catalog: Arc<ModelCatalog>,
    navigation_timeout: Duration,
}

impl Router {
    pub fn new(base_url: &str, catalog: Arc<ModelCatalog>, navigation_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            catalog,
            navigation_timeout,
        }
    }

    /// Catalog lookup first, then id keywords, then the caller's hint.
    pub fn resolve(&self, model_id: &str, hint: Option<Modality>) -> Route {
        let modality = self
            .catalog
            .get(model_id)
            .map(|m| m.modality)
            .or_else(|| modality_from_id(model_id))
            .or(hint)
            .unwrap_or_default();

        let location = format!(
            "{}/?mode=direct&model={}&chat-modality={}",
            self.base_url,
            utf8_percent_encode(model_id, COMPONENT),
            modality
        );

        Route {
            model_id: model_id.to_string(),
            location,
            modality,
        }
    }

    pub fn chat_location(&self, chat_id: &str) -> String {
        format!(
            "{}/c/{}",
            self.base_url,
            utf8_percent_encode(chat_id, COMPONENT)
        )
    }

    /// Full navigation to `location`, then wait for the composer and thin the page.
    pub async fn navigate(&self, page: &dyn Page, location: &str) -> Result<()> {
        page.navigate(location).await?;

        let deadline = tokio::time::Instant::now() + self.navigation_timeout;
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            // The document may still be swapping in; context errors are expected here
            match eval_as::<Option<bool>>(page, INPUT_READY_SCRIPT).await {
                Ok(Some(true)) => break,
                Ok(_) => {}
                Err(PilotError::SessionCrashed(msg)) => {
                    return Err(PilotError::SessionCrashed(msg))
                }
                Err(e) => tracing::trace!("Waiting for composer: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Message input not visible {}s after navigating to {}",
                    self.navigation_timeout.as_secs(),
                    location
                );
                break;
            }
        }

        match eval_as::<Option<u32>>(page, THIN_SCRIPT).await {
            Ok(removed) => tracing::debug!("Thinned page, removed {} elements", removed.unwrap_or(0)),
            Err(e) => tracing::debug!("Page thinning skipped: {}", e),
        }

        if let Err(e) = challenge::accept_terms(page).await {
            tracing::debug!("Terms check failed: {}", e);
        }
        Ok(())
    }
}
