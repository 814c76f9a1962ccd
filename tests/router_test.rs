//! Chat locations built for catalog and unlisted model ids.

use chatpilot_lib::catalog::{Modality, ModelCatalog};
use chatpilot_lib::router::{modality_from_id, Router};
use std::sync::Arc;
use std::time::Duration;

fn router() -> Router {
    Router::new(
        "https://lmarena.ai",
        Arc::new(ModelCatalog::builtin()),
        Duration::from_secs(60),
    )
}

#[test]
fn test_text_model_location() {
    let route = router().resolve("gpt-5.2", None);
    assert_eq!(route.modality, Modality::Text);
    assert_eq!(
        route.location,
        "https://lmarena.ai/?mode=direct&model=gpt-5.2&chat-modality=text"
    );
}

#[test]
fn test_search_model_location() {
    let route = router().resolve("gemini-3-pro-grounding", None);
    assert_eq!(route.modality, Modality::Search);
    assert!(route.location.ends_with("chat-modality=search"));
}

#[test]
fn test_modality_keywords() {
    assert_eq!(modality_from_id("flux-1-kontext"), Some(Modality::Image));
    assert_eq!(modality_from_id("ppl-sonar"), Some(Modality::Search));
    assert_eq!(modality_from_id("qwen3-coder"), None);
}
