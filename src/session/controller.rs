use crate::config::schema::{BrowserConfig, PresenceConfig};
use crate::config::validation::validate_chrome_path;
use crate::error::{PilotError, Result};
use crate::process::{build_command, kill_stale_processes, seed_profile, PortAllocator};
use crate::session::cdp::{discover_page_target, CdpConnection};
use crate::session::challenge::{self, ChallengeStatus, Resolution};
use crate::session::page::{CdpPage, PageHandle};
use crate::session::{presence, stealth};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Browser process started for a session. Killed on drop.
pub struct ChromeProcess {
    child: Child,
}

impl ChromeProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!("Chrome {} already gone: {}", self.child.id(), e);
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct LaunchedBrowser {
    pub page: PageHandle,
    pub process: Option<ChromeProcess>,
}

/// Starts a browser and attaches to its first tab.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &BrowserConfig, generation: u64) -> Result<LaunchedBrowser>;
}

/// Launches a local Chrome with a DevTools port.
#[derive(Default)]
pub struct ChromeLauncher {
    ports: PortAllocator,
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, config: &BrowserConfig, generation: u64) -> Result<LaunchedBrowser> {
        validate_chrome_path(&config.chrome_path)?;

        let port = self.ports.allocate();
        let mut cmd = build_command(config, port);
        tracing::info!("Launching Chrome on DevTools port {}: {:?}", port, cmd);

        let child = cmd
            .spawn()
            .map_err(|e| PilotError::Process(format!("Failed to launch Chrome: {}", e)))?;
        let process = ChromeProcess { child };

        let ws_url = discover_page_target(port, config.launch_timeout()).await?;
        let conn = CdpConnection::connect(&ws_url).await?;
        let page = CdpPage::attach(conn, generation).await?;

        tracing::info!("Chrome {} ready (generation {})", process.pid(), generation);
        Ok(LaunchedBrowser {
            page: Arc::new(page),
            process: Some(process),
        })
    }
}

/// One live browser instance plus its identity profile.
pub struct Session {
    pub id: Uuid,
    pub generation: u64,
    pub page: PageHandle,
    pub profile_dir: PathBuf,
    pub ready: bool,
    pub last_location: Option<String>,
    pub launched_at: DateTime<Utc>,
    process: Option<ChromeProcess>,
    presence_cancel: CancellationToken,
}

/// Owns the browser lifecycle. Launches are serialized; a caller arriving
/// while a launch is in flight waits for it and shares the result.
pub struct SessionController {
    config: BrowserConfig,
    presence: PresenceConfig,
    launcher: Arc<dyn BrowserLauncher>,
    init_scripts: Vec<String>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    page_tx: watch::Sender<Option<PageHandle>>,
}

impl SessionController {
    pub fn new(
        config: BrowserConfig,
        presence: PresenceConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let (page_tx, _) = watch::channel(None);
        Self {
            config,
            presence,
            launcher,
            init_scripts: Vec::new(),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            page_tx,
        }
    }

    /// Extra script installed on every new document of every launch.
    pub fn with_init_script(mut self, source: impl Into<String>) -> Self {
        self.init_scripts.push(source.into());
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Latest page without health-checking or launching.
    pub fn current_page(&self) -> Option<PageHandle> {
        self.page_tx.borrow().clone()
    }

    /// Follow the current page across relaunches.
    pub fn subscribe(&self) -> watch::Receiver<Option<PageHandle>> {
        self.page_tx.subscribe()
    }

    pub async fn launch(&self) -> Result<PageHandle> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.page.clone());
        }
        let session = self.start_session().await?;
        let page = session.page.clone();
        *guard = Some(session);
        Ok(page)
    }

    /// Current page, relaunching the browser when it no longer answers a no-op.
    pub async fn get_page(&self) -> Result<PageHandle> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            let probe = tokio::time::timeout(
                self.config.health_check_timeout(),
                session.page.evaluate("/*cp:ping*/ 1"),
            )
            .await;
            match probe {
                Ok(Ok(_)) => return Ok(session.page.clone()),
                Ok(Err(e)) => tracing::warn!("Page unresponsive ({}), relaunching", e),
                Err(_) => tracing::warn!("Page health check timed out, relaunching"),
            }
            if let Some(old) = guard.take() {
                self.teardown(old).await;
            }
        }

        let session = self.start_session().await?;
        let page = session.page.clone();
        *guard = Some(session);
        Ok(page)
    }

    pub async fn set_location(&self, location: &str) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.last_location = Some(location.to_string());
        }
    }

    pub async fn last_location(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.last_location.clone())
    }

    pub async fn is_ready(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.ready)
            .unwrap_or(false)
    }

    /// Checks the current page as is; a page mid-challenge may not answer
    /// the health probe, so no relaunch happens here.
    pub async fn detect_challenge(&self) -> Result<ChallengeStatus> {
        let page = self.current_page().ok_or(PilotError::NotInitialized)?;
        challenge::detect(page.as_ref()).await
    }

    pub async fn attempt_challenge_resolution(&self) -> Result<Resolution> {
        let page = self.current_page().ok_or(PilotError::NotInitialized)?;
        challenge::attempt_resolution(page.as_ref()).await
    }

    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    pub async fn restart(&self) -> Result<PageHandle> {
        tracing::info!("Restarting browser session");
        let mut guard = self.session.lock().await;
        if let Some(old) = guard.take() {
            self.teardown(old).await;
        }
        let session = self.start_session().await?;
        let page = session.page.clone();
        *guard = Some(session);
        Ok(page)
    }

    async fn start_session(&self) -> Result<Session> {
        let profile_dir = self.config.profile_dir.clone();

        if self.config.kill_stale_processes {
            let killed = kill_stale_processes(&profile_dir);
            if killed > 0 {
                // Give Chrome a moment to release the profile lock
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
        std::fs::create_dir_all(&profile_dir)?;
        if let Some(template) = &self.config.template_profile_dir {
            seed_profile(template, &profile_dir)?;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let launched = self.launcher.launch(&self.config, generation).await?;
        let page = launched.page;

        stealth::apply(page.as_ref(), &self.config).await?;
        for script in &self.init_scripts {
            page.add_init_script(script).await?;
        }

        self.page_tx.send_replace(Some(page.clone()));

        let presence_cancel = CancellationToken::new();
        if self.presence.enabled {
            presence::spawn(
                self.presence.clone(),
                self.page_tx.subscribe(),
                presence_cancel.clone(),
            );
        }

        tracing::info!(
            "Browser session ready (generation {}, profile {:?})",
            generation,
            profile_dir
        );

        Ok(Session {
            id: Uuid::new_v4(),
            generation,
            page,
            profile_dir,
            ready: true,
            last_location: None,
            launched_at: Utc::now(),
            process: launched.process,
            presence_cancel,
        })
    }

    async fn teardown(&self, mut session: Session) {
        session.presence_cancel.cancel();
        self.page_tx.send_replace(None);
        session.page.close().await;
        if let Some(mut process) = session.process.take() {
            process.kill();
        }
        tracing::info!(
            "Session {} (generation {}) closed after {}s",
            session.id,
            session.generation,
            (Utc::now() - session.launched_at).num_seconds()
        );
    }
}
