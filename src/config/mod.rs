pub mod schema;
pub mod storage;
pub mod validation;

pub use schema::{
    AcquisitionConfig, AppConfig, AutonomyConfig, BrowserConfig, OrchestratorConfig,
    PresenceConfig, RetryConfig, UpstreamConfig,
};
pub use storage::{get_config_path, load_config, load_config_from, save_config, save_config_to};
pub use validation::{validate_chrome_path, validate_config};
