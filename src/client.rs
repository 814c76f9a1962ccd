//! Facade used by presentation layers: one browser, one conversation at a time.

use crate::acquisition::{Completion, TokenEvent};
use crate::autonomy::ChatBackend;
use crate::catalog::{Modality, ModelCatalog, ModelInfo};
use crate::config::schema::UpstreamConfig;
use crate::error::{PilotError, Result};
use crate::router::{Route, Router};
use crate::session::SessionController;
use crate::supervisor::RetrySupervisor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub model: String,
    pub modality: Modality,
}

impl From<&Route> for Selection {
    fn from(route: &Route) -> Self {
        Self {
            model: route.model_id.clone(),
            modality: route.modality,
        }
    }
}

pub struct ArenaClient {
    controller: Arc<SessionController>,
    router: Arc<Router>,
    supervisor: RetrySupervisor,
    catalog: Arc<ModelCatalog>,
    default_model: String,
    current: Mutex<Option<Route>>,
    chat_id: Mutex<Option<String>>,
    in_flight: Mutex<Option<CancellationToken>>,
    /// Serializes initialization; late callers reuse the result
    init_lock: tokio::sync::Mutex<()>,
    /// Navigation and submission share the one tab
    page_lock: tokio::sync::Mutex<()>,
}

impl ArenaClient {
    pub fn new(
        controller: Arc<SessionController>,
        router: Arc<Router>,
        supervisor: RetrySupervisor,
        catalog: Arc<ModelCatalog>,
        upstream: &UpstreamConfig,
    ) -> Self {
        Self {
            controller,
            router,
            supervisor,
            catalog,
            default_model: upstream.default_model.clone(),
            current: Mutex::new(None),
            chat_id: Mutex::new(None),
            in_flight: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            page_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Launch the browser and open a chat with `model_id` (or the configured
    /// default). Calling again with the current model is a no-op.
    pub async fn initialize(&self, model_id: Option<&str>) -> Result<Selection> {
        let _init = self.init_lock.lock().await;

        if let Some(route) = self.current.lock().as_ref() {
            if model_id.map_or(true, |m| m == route.model_id) {
                return Ok(Selection::from(route));
            }
        }

        self.controller.launch().await?;
        let model_id = model_id.unwrap_or(&self.default_model);
        let route = self.open(model_id).await?;
        tracing::info!("Initialized with {} ({})", route.model_id, route.modality);
        Ok(Selection::from(&route))
    }

    /// Navigate to a fresh chat with a catalog model.
    pub async fn select_model(&self, model_id: &str) -> Result<Modality> {
        Ok(self.open(model_id).await?.modality)
    }

    async fn open(&self, model_id: &str) -> Result<Route> {
        if !self.catalog.contains(model_id) {
            return Err(PilotError::UnknownModel(model_id.to_string()));
        }
        let _page = self.page_lock.lock().await;

        let route = self.router.resolve(model_id, None);
        let page = self.controller.get_page().await?;
        self.router.navigate(page.as_ref(), &route.location).await?;

        self.supervisor.set_target(&route.location, page.generation());
        self.controller.set_location(&route.location).await;
        *self.chat_id.lock() = None;
        *self.current.lock() = Some(route.clone());
        tracing::info!("Switched to {}", route.model_id);
        Ok(route)
    }

    /// Reopen a previous conversation by id.
    pub async fn navigate_to_chat(&self, chat_id: &str) -> Result<()> {
        let _page = self.page_lock.lock().await;
        let location = self.router.chat_location(chat_id);
        let page = self.controller.get_page().await?;
        self.router.navigate(page.as_ref(), &location).await?;

        self.supervisor.set_target(&location, page.generation());
        self.controller.set_location(&location).await;
        *self.chat_id.lock() = Some(chat_id.to_string());
        Ok(())
    }

    /// Send `text` in the open chat. Token events go to `tokens`; the channel
    /// closes when this returns.
    pub async fn send_message(&self, text: &str, tokens: mpsc::Sender<TokenEvent>) -> Result<Completion> {
        if self.current.lock().is_none() {
            return Err(PilotError::NotInitialized);
        }
        let _page = self.page_lock.lock().await;

        let cancel = CancellationToken::new();
        *self.in_flight.lock() = Some(cancel.clone());
        let result = self.supervisor.run(text, &tokens, &cancel).await;
        *self.in_flight.lock() = None;

        let completion = result?;
        if let Some(id) = &completion.chat_id {
            let location = self.router.chat_location(id);
            self.supervisor
                .set_target(&location, self.controller.generation());
            self.controller.set_location(&location).await;
            *self.chat_id.lock() = Some(id.clone());
            tracing::debug!("Conversation {}", id);
        }
        Ok(completion)
    }

    /// Abandon the message in flight; the caller gets the partial answer.
    pub fn stop(&self) {
        if let Some(cancel) = self.in_flight.lock().as_ref() {
            tracing::info!("Stopping message in flight");
            cancel.cancel();
        }
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        self.catalog.available_models()
    }

    pub fn current_model(&self) -> Option<String> {
        self.current.lock().as_ref().map(|r| r.model_id.clone())
    }

    pub fn chat_id(&self) -> Option<String> {
        self.chat_id.lock().clone()
    }

    pub async fn close(&self) {
        self.stop();
        self.controller.close().await;
        *self.current.lock() = None;
    }
}

#[async_trait]
impl ChatBackend for ArenaClient {
    /// Keeps the open conversation when the model is unchanged.
    async fn select_model(&self, model_id: &str) -> Result<Modality> {
        let same = self
            .current
            .lock()
            .as_ref()
            .filter(|r| r.model_id == model_id)
            .map(|r| r.modality);
        match same {
            Some(modality) => Ok(modality),
            None => {
                if !self.controller.is_ready().await {
                    self.controller.launch().await?;
                }
                Ok(self.open(model_id).await?.modality)
            }
        }
    }

    async fn send_message(&self, text: &str, tokens: mpsc::Sender<TokenEvent>) -> Result<Completion> {
        ArenaClient::send_message(self, text, tokens).await
    }

    fn stop(&self) {
        ArenaClient::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::testing::{engine_with, ScriptedSource};
    use crate::acquisition::{AcquisitionEngine, SourceSnapshot};
    use crate::config::schema::{AcquisitionConfig, RetryConfig};
    use crate::session::controller::testing::{controller_with, FakeLauncher};
    use crate::session::page::testing::FakePage;
    use crate::supervisor::EngineFactory;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        client: Arc<ArenaClient>,
        controller: Arc<SessionController>,
        page: Arc<FakePage>,
        network: ScriptedSource,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let controller = Arc::new(controller_with(launcher.clone(), dir.path()));
        controller.launch().await.unwrap();
        let page = launcher.last_page().unwrap();
        for label in ["input_ready", "input_present", "fill_input", "send_click"] {
            page.respond_value(label, json!(true));
        }

        let config = AcquisitionConfig {
            stall_ticks: 20,
            message_ceiling_ms: 10_000,
            ..AcquisitionConfig::default()
        };
        let (_, network, content) = engine_with(config.clone());
        let (net, cont) = (network.clone(), content.clone());
        let engine_config = config.clone();
        let factory: EngineFactory = Arc::new(move || {
            AcquisitionEngine::with_sources(
                engine_config.clone(),
                Box::new(net.clone()),
                Box::new(cont.clone()),
            )
        });

        let catalog = Arc::new(ModelCatalog::builtin());
        let router = Arc::new(Router::new(
            "https://arena.test",
            catalog.clone(),
            Duration::from_secs(1),
        ));
        let retry = RetryConfig {
            submit_settle_ms: 0,
            ..RetryConfig::default()
        };
        let supervisor = RetrySupervisor::new(controller.clone(), router.clone(), config, retry)
            .with_engine_factory(factory);
        let client = Arc::new(ArenaClient::new(
            controller.clone(),
            router,
            supervisor,
            catalog,
            &UpstreamConfig::default(),
        ));

        Harness {
            client,
            controller,
            page,
            network,
            _dir: dir,
        }
    }

    fn navigations(page: &FakePage) -> usize {
        page.calls().iter().filter(|c| c.starts_with("navigate:")).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initialize_shares_one_navigation() {
        let h = harness().await;
        let (a, b) = tokio::join!(h.client.initialize(None), h.client.initialize(None));

        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a.model, "gemini-3-pro");
        assert_eq!(a.modality, Modality::Text);
        assert_eq!(navigations(&h.page), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_is_rejected_without_navigation() {
        let h = harness().await;
        let err = h.client.select_model("not-a-model").await.unwrap_err();
        assert!(matches!(err, PilotError::UnknownModel(_)));
        assert_eq!(navigations(&h.page), 0);
    }

    #[tokio::test]
    async fn test_send_requires_initialize() {
        let h = harness().await;
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            h.client.send_message("hi", tx).await,
            Err(PilotError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_records_conversation() {
        let h = harness().await;
        h.client.initialize(Some("gpt-5.2")).await.unwrap();
        h.network.push(SourceSnapshot {
            text: "Hi there".to_string(),
            active: true,
            done: true,
            chat_id: Some("abc-123".to_string()),
            ..SourceSnapshot::default()
        });

        let (tx, mut rx) = mpsc::channel(16);
        let completion = h.client.send_message("hello", tx).await.unwrap();

        assert_eq!(completion.text, "Hi there");
        assert_eq!(rx.recv().await.unwrap().full_text, "Hi there");
        assert_eq!(h.client.chat_id().as_deref(), Some("abc-123"));
        assert_eq!(
            h.controller.last_location().await.as_deref(),
            Some("https://arena.test/c/abc-123")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_keeps_conversation_for_same_model() {
        let h = harness().await;
        h.client.initialize(Some("gpt-5.2")).await.unwrap();
        let backend: &dyn ChatBackend = h.client.as_ref();

        backend.select_model("gpt-5.2").await.unwrap();
        assert_eq!(navigations(&h.page), 1);

        let modality = backend.select_model("gpt-image-1.5").await.unwrap();
        assert_eq!(modality, Modality::Image);
        assert_eq!(navigations(&h.page), 2);
        assert_eq!(h.client.current_model().as_deref(), Some("gpt-image-1.5"));
    }
}
