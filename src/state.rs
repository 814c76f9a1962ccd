use crate::acquisition::network::TAP_SCRIPT;
use crate::autonomy::{AutonomyEngine, LocalToolRunner};
use crate::catalog::ModelCatalog;
use crate::client::ArenaClient;
use crate::config::AppConfig;
use crate::orchestrator::ModelOrchestrator;
use crate::router::Router;
use crate::session::{BrowserLauncher, ChromeLauncher, SessionController};
use crate::supervisor::RetrySupervisor;
use std::sync::Arc;
use std::time::Duration;

/// Everything a front end needs, wired once from configuration.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<AppConfig>,
    pub catalog: Arc<ModelCatalog>,
    pub controller: Arc<SessionController>,
    pub client: Arc<ArenaClient>,
    pub orchestrator: Arc<ModelOrchestrator>,
    pub autonomy: Arc<AutonomyEngine>,
}

impl SessionContext {
    pub fn new(config: AppConfig) -> Self {
        Self::with_launcher(config, Arc::new(ChromeLauncher::default()))
    }

    pub fn with_launcher(config: AppConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let catalog = Arc::new(ModelCatalog::builtin());

        let controller = Arc::new(
            SessionController::new(config.browser.clone(), config.presence.clone(), launcher)
                .with_init_script(TAP_SCRIPT),
        );
        let router = Arc::new(Router::new(
            &config.upstream.base_url,
            catalog.clone(),
            Duration::from_millis(config.upstream.navigation_timeout_ms),
        ));
        let supervisor = RetrySupervisor::new(
            controller.clone(),
            router.clone(),
            config.acquisition.clone(),
            config.retry.clone(),
        );
        let client = Arc::new(ArenaClient::new(
            controller.clone(),
            router,
            supervisor,
            catalog.clone(),
            &config.upstream,
        ));

        let orchestrator = Arc::new(ModelOrchestrator::new(catalog.clone(), &config.orchestrator));
        let tools = Arc::new(LocalToolRunner::new(
            config.autonomy.work_dir.clone(),
            Duration::from_millis(config.autonomy.command_timeout_ms),
        ));
        let autonomy = Arc::new(
            AutonomyEngine::new(
                client.clone(),
                orchestrator.clone(),
                tools,
                config.autonomy.clone(),
            )
            .with_token_capacity(config.acquisition.token_channel_capacity),
        );

        Self {
            config: Arc::new(config),
            catalog,
            controller,
            client,
            orchestrator,
            autonomy,
        }
    }

    /// Close the browser and abandon anything in flight.
    pub async fn shutdown(&self) {
        self.autonomy.halt();
        self.client.close().await;
    }
}
