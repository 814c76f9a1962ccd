//! Drives one outbound message to completion across transient failures,
//! anti-bot interruptions and browser crashes.

pub mod composer;

use crate::acquisition::content::TRIM_HISTORY_SCRIPT;
use crate::acquisition::{AcquisitionEngine, Completion, PollScheduler, TokenEvent};
use crate::config::schema::{AcquisitionConfig, RetryConfig};
use crate::error::{PilotError, Result};
use crate::router::Router;
use crate::session::challenge::{ChallengeKind, ChallengeStatus};
use crate::session::page::{Page, PageHandle};
use crate::session::SessionController;
use composer::resubmit_action;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use composer::{ResubmitAction, SubmitState};

pub type EngineFactory = Arc<dyn Fn() -> AcquisitionEngine + Send + Sync>;

/// Page the conversation lives on, and the browser generation it was opened in.
#[derive(Debug, Clone)]
struct Target {
    location: String,
    generation: u64,
}

/// What one message has been through so far, kept across attempts.
#[derive(Debug, Default)]
struct Outbound {
    /// Longest answer text seen
    partial: String,
    /// User-block count before the first send, once the send was started
    sent_baseline: Option<u32>,
    /// The single challenge click this message is allowed
    clicked: bool,
}

pub struct RetrySupervisor {
    controller: Arc<SessionController>,
    router: Arc<Router>,
    acquisition: AcquisitionConfig,
    retry: RetryConfig,
    engine_factory: EngineFactory,
    target: Mutex<Option<Target>>,
}

impl RetrySupervisor {
    pub fn new(
        controller: Arc<SessionController>,
        router: Arc<Router>,
        acquisition: AcquisitionConfig,
        retry: RetryConfig,
    ) -> Self {
        let engine_config = acquisition.clone();
        Self {
            controller,
            router,
            acquisition,
            retry,
            engine_factory: Arc::new(move || AcquisitionEngine::new(engine_config.clone())),
            target: Mutex::new(None),
        }
    }

    pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
        self.engine_factory = factory;
        self
    }

    /// Record that `location` is open in browser `generation`.
    pub fn set_target(&self, location: &str, generation: u64) {
        *self.target.lock() = Some(Target {
            location: location.to_string(),
            generation,
        });
    }

    pub fn target_location(&self) -> Option<String> {
        self.target.lock().as_ref().map(|t| t.location.clone())
    }

    /// Healthy page, re-opened on the conversation if the browser was relaunched.
    async fn ensure_page(&self) -> Result<PageHandle> {
        let page = self.controller.get_page().await?;
        let stale = self
            .target
            .lock()
            .as_ref()
            .filter(|t| t.generation != page.generation())
            .map(|t| t.location.clone());

        if let Some(location) = stale {
            tracing::info!("Browser relaunched, reopening {}", location);
            self.router.navigate(page.as_ref(), &location).await?;
            self.set_target(&location, page.generation());
            self.controller.set_location(&location).await;
        }
        Ok(page)
    }

    /// Send `message` and wait for the answer, streaming tokens to `tokens`.
    ///
    /// Once the message has gone out, later attempts check the conversation
    /// against the user-block count taken before the first send and only
    /// type it again when it never landed.
    pub async fn run(
        &self,
        message: &str,
        tokens: &mpsc::Sender<TokenEvent>,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut outbound = Outbound::default();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(PilotError::Cancelled {
                    partial: outbound.partial,
                });
            }
            tracing::debug!("Send attempt {}/{}", attempt, max_attempts);

            match self.attempt(message, tokens, cancel, &mut outbound).await {
                Ok(completion) => return Ok(completion),
                Err(PilotError::SessionCrashed(msg)) => {
                    tracing::warn!("Attempt {} lost the browser: {}", attempt, msg);
                    last_error = msg;
                    if let Err(e) = self.controller.restart().await {
                        tracing::error!("Browser restart failed: {}", e);
                        last_error = e.to_string();
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(PilotError::Cancelled { partial: outbound.partial })
                            }
                            _ = tokio::time::sleep(self.retry.transient_delay()) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(PilotError::AttemptsExhausted {
            attempts: max_attempts,
            partial: outbound.partial,
            last_error,
        })
    }

    async fn attempt(
        &self,
        message: &str,
        tokens: &mpsc::Sender<TokenEvent>,
        cancel: &CancellationToken,
        outbound: &mut Outbound,
    ) -> Result<Completion> {
        let page = self.ensure_page().await?;

        if let ChallengeStatus::Blocked { kind, detail } = self.controller.detect_challenge().await? {
            self.confront(kind, detail, &mut outbound.clicked).await?;
        }

        composer::wait_for_input(
            page.as_ref(),
            std::time::Duration::from_millis(self.retry.input_wait_ms),
        )
        .await?;

        let mut engine = (self.engine_factory)();
        let baseline_users = match outbound.sent_baseline {
            Some(baseline) => {
                self.resume(page.as_ref(), &mut engine, message, baseline)
                    .await?;
                baseline
            }
            None => {
                let baseline = composer::submit_state(page.as_ref()).await?.user_blocks;
                engine.arm(page.as_ref()).await?;
                // From here the message may be on its way even if submit fails
                outbound.sent_baseline = Some(baseline);
                composer::submit(
                    page.as_ref(),
                    message,
                    std::time::Duration::from_millis(self.retry.submit_settle_ms),
                )
                .await?;
                baseline
            }
        };

        let started = Instant::now();
        let mut deadline = started + self.acquisition.message_ceiling();
        let mut challenged = false;
        let mut blocked = false;
        let mut scheduler = PollScheduler::new(self.acquisition.poll_interval(), cancel.clone());

        while scheduler.tick().await.is_some() {
            if Instant::now() >= deadline {
                return self.expire(&mut engine, blocked, started);
            }

            if scheduler.is_nth(self.acquisition.challenge_check_every) {
                match self.controller.detect_challenge().await {
                    Ok(ChallengeStatus::Blocked { kind, detail }) => {
                        blocked = true;
                        if !challenged {
                            challenged = true;
                            deadline = started + self.acquisition.challenge_ceiling();
                        }
                        self.confront(kind, detail, &mut outbound.clicked).await?;
                        if self.controller.detect_challenge().await?.is_blocked() {
                            continue;
                        }
                        blocked = false;
                        if engine.text().is_empty() {
                            self.resume(page.as_ref(), &mut engine, message, baseline_users)
                                .await?;
                        }
                        continue;
                    }
                    Ok(ChallengeStatus::Clear) => blocked = false,
                    Err(e @ PilotError::SessionCrashed(_)) => return Err(e),
                    Err(e) => tracing::debug!("Challenge check failed: {}", e),
                }
            }

            match engine.poll(page.as_ref()).await {
                Ok(report) => {
                    if engine.text().len() > outbound.partial.len() {
                        outbound.partial = engine.text().to_string();
                    }
                    if let Some(event) = report.event {
                        if tokens.send(event).await.is_err() {
                            tracing::trace!("Token receiver dropped");
                        }
                    }
                    if let Some(completion) = report.completion {
                        if let Err(e) = page.evaluate(TRIM_HISTORY_SCRIPT).await {
                            tracing::debug!("History trim skipped: {}", e);
                        }
                        return Ok(completion);
                    }
                }
                Err(e @ PilotError::SessionCrashed(_)) => return Err(e),
                Err(e) => tracing::debug!("Poll failed, continuing: {}", e),
            }
        }

        let text = engine.text().to_string();
        Err(PilotError::Cancelled {
            partial: if text.is_empty() {
                outbound.partial.clone()
            } else {
                text
            },
        })
    }

    /// Ceiling reached: partial text wins over an error.
    fn expire(
        &self,
        engine: &mut AcquisitionEngine,
        blocked: bool,
        started: Instant,
    ) -> Result<Completion> {
        if let Some(completion) = engine.finish_partial() {
            tracing::warn!("Response ceiling reached, returning partial answer");
            return Ok(completion);
        }
        if blocked {
            return Err(PilotError::AntiBotChallenge {
                detail: "challenge did not clear before the ceiling".to_string(),
                manual: true,
            });
        }
        Err(PilotError::ResponseTimeout {
            partial: String::new(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Handle a blocked page. Image puzzles and rate limits end the message;
    /// other challenges get one click per message, then a stabilization wait.
    async fn confront(
        &self,
        kind: ChallengeKind,
        detail: String,
        clicked_once: &mut bool,
    ) -> Result<()> {
        tracing::warn!("Anti-bot challenge ({:?}): {}", kind, detail);
        match kind {
            ChallengeKind::ImagePuzzle => Err(PilotError::AntiBotChallenge {
                detail,
                manual: true,
            }),
            ChallengeKind::RateLimited => Err(PilotError::AntiBotChallenge {
                detail,
                manual: false,
            }),
            ChallengeKind::Interstitial | ChallengeKind::Checkbox => {
                if !*clicked_once {
                    *clicked_once = true;
                    let outcome = self.controller.attempt_challenge_resolution().await?;
                    tracing::info!("Challenge resolution: {:?}", outcome);
                }
                tokio::time::sleep(self.acquisition.challenge_stabilize()).await;
                Ok(())
            }
        }
    }

    /// Pick the outbound message back up after an interruption.
    async fn resume(
        &self,
        page: &dyn Page,
        engine: &mut AcquisitionEngine,
        message: &str,
        baseline_users: u32,
    ) -> Result<()> {
        let state = composer::submit_state(page).await?;
        let action = resubmit_action(&state, message, baseline_users);
        tracing::info!("Resuming message: {:?}", action);

        engine.rearm(page).await?;
        match action {
            ResubmitAction::AlreadySubmitted => {}
            ResubmitAction::ClickSend => composer::press_send(page).await?,
            ResubmitAction::Retype => {
                composer::submit(
                    page,
                    message,
                    std::time::Duration::from_millis(self.retry.submit_settle_ms),
                )
                .await?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::testing::{engine_with, ScriptedSource};
    use crate::acquisition::{CompletionReason, SourceSnapshot};
    use crate::catalog::ModelCatalog;
    use crate::session::controller::testing::{controller_with, FakeLauncher};
    use crate::session::page::testing::FakePage;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        supervisor: RetrySupervisor,
        page: Arc<FakePage>,
        network: ScriptedSource,
        _dir: tempfile::TempDir,
    }

    fn acquisition() -> AcquisitionConfig {
        AcquisitionConfig {
            poll_interval_ms: 50,
            stall_ticks: 20,
            content_settle_ticks: 5,
            challenge_check_every: 2,
            challenge_stabilize_ms: 100,
            message_ceiling_ms: 10_000,
            challenge_ceiling_ms: 20_000,
            ..AcquisitionConfig::default()
        }
    }

    async fn harness() -> Harness {
        harness_with(acquisition()).await
    }

    async fn harness_with(config: AcquisitionConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let controller = Arc::new(controller_with(launcher.clone(), dir.path()));
        controller.launch().await.unwrap();
        let page = launcher.last_page().unwrap();
        page.respond_value("input_present", json!(true));
        page.respond_value("fill_input", json!(true));
        page.respond_value("send_click", json!(true));

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

        let router = Arc::new(Router::new(
            "https://arena.test",
            Arc::new(ModelCatalog::builtin()),
            Duration::from_secs(1),
        ));
        let retry = RetryConfig {
            transient_delay_ms: 100,
            submit_settle_ms: 0,
            ..RetryConfig::default()
        };
        let supervisor = RetrySupervisor::new(controller, router, config, retry)
            .with_engine_factory(factory);

        Harness {
            supervisor,
            page,
            network,
            _dir: dir,
        }
    }

    fn finished(text: &str) -> SourceSnapshot {
        SourceSnapshot {
            text: text.to_string(),
            active: true,
            done: true,
            ..SourceSnapshot::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_tokens_and_completes() {
        let h = harness().await;
        h.network.push_text("Hel");
        h.network.push(finished("Hello"));

        let (tx, mut rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.reason, CompletionReason::StreamFinished);
        let mut deltas = Vec::new();
        while let Ok(event) = rx.try_recv() {
            deltas.push(event.delta);
        }
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(h.page.count("eval:trim_history"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_before_output_does_not_resend() {
        let h = harness().await;
        let mut detections = 0;
        h.page.respond("challenge", move |_| {
            detections += 1;
            // pre-send check clear, first in-loop check blocked, then clear
            Ok(if detections == 2 {
                json!({"kind": "checkbox", "detail": "turnstile"})
            } else {
                json!({"kind": "clear"})
            })
        });
        h.page.respond_value("challenge_target", json!({"kind": "none"}));
        let mut states = 0;
        h.page.respond("submit_state", move |_| {
            states += 1;
            Ok(json!({"inputValue": "", "userBlocks": if states == 1 { 0 } else { 1 }, "answerBlocks": 0}))
        });

        for _ in 0..4 {
            h.network.push(SourceSnapshot::default());
        }
        h.network.push(finished("After the challenge"));

        let (tx, _rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "After the challenge");
        assert_eq!(h.page.count("eval:fill_input"), 1);
        assert_eq!(h.page.count("eval:send_click"), 1);
        assert_eq!(*h.network.arms.lock(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_send_does_not_retype_landed_message() {
        let h = harness().await;
        let mut detections = 0;
        h.page.respond("challenge", move |_| {
            detections += 1;
            // blocked mid-stream and again when the retry starts
            Ok(if detections == 2 || detections == 3 {
                json!({"kind": "checkbox", "detail": "turnstile"})
            } else {
                json!({"kind": "clear"})
            })
        });
        // The click target lookup dies with the navigating frame
        let mut lookups = 0;
        h.page.respond("challenge_target", move |_| {
            lookups += 1;
            if lookups == 1 {
                Err(PilotError::TransientIo("Execution context was destroyed".to_string()))
            } else {
                Ok(json!({"kind": "none"}))
            }
        });
        let mut states = 0;
        h.page.respond("submit_state", move |_| {
            states += 1;
            Ok(json!({"inputValue": "", "userBlocks": if states == 1 { 0 } else { 1 }, "answerBlocks": 0}))
        });

        h.network.push(SourceSnapshot::default());
        h.network.push(finished("Answer"));

        let (tx, _rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "Answer");
        assert_eq!(h.page.count("eval:fill_input"), 1);
        assert_eq!(h.page.count("eval:send_click"), 1);
        assert_eq!(h.page.count("eval:submit_state"), 2);
        assert_eq!(h.page.count("eval:challenge_target"), 1);
        assert_eq!(*h.network.arms.lock(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_retypes_message_that_never_landed() {
        let h = harness().await;
        let mut clicks = 0;
        h.page.respond("send_click", move |_| {
            clicks += 1;
            if clicks == 1 {
                Err(PilotError::TransientIo("Target closed".to_string()))
            } else {
                Ok(json!(true))
            }
        });
        h.network.push(finished("Second try"));

        let (tx, _rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "Second try");
        assert_eq!(h.page.count("eval:fill_input"), 2);
        assert_eq!(h.page.count("eval:send_click"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_message_times_out_empty() {
        let h = harness().await;

        let (tx, mut rx) = mpsc::channel(16);
        let err = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PilotError::ResponseTimeout { partial, elapsed_ms } => {
                assert!(partial.is_empty());
                assert!(elapsed_ms >= 10_000);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(h.page.count("eval:fill_input"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_returns_partial_answer() {
        let h = harness_with(AcquisitionConfig {
            stall_ticks: 1_000,
            message_ceiling_ms: 2_000,
            ..acquisition()
        })
        .await;
        h.network.push_text("Partial answer");

        let (tx, _rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.reason, CompletionReason::Ceiling);
        assert_eq!(completion.text, "Partial answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_still_blocking_at_ceiling_needs_human() {
        let h = harness().await;
        let mut detections = 0;
        h.page.respond("challenge", move |_| {
            detections += 1;
            Ok(if detections == 1 {
                json!({"kind": "clear"})
            } else {
                json!({"kind": "interstitial", "detail": "Just a moment..."})
            })
        });
        h.page.respond_value("challenge_target", json!({"kind": "none"}));

        let (tx, _rx) = mpsc::channel(16);
        let err = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PilotError::AntiBotChallenge { manual: true, .. }));
        assert_eq!(h.page.count("eval:fill_input"), 1);
        assert_eq!(h.page.count("eval:challenge_target"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_puzzle_is_terminal() {
        let h = harness().await;
        h.page
            .respond_value("challenge", json!({"kind": "puzzle", "detail": "image puzzle visible"}));

        let (tx, _rx) = mpsc::channel(16);
        let err = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PilotError::AntiBotChallenge { manual: true, .. }));
        assert_eq!(h.page.count("eval:fill_input"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let h = harness().await;
        let mut fills = 0;
        h.page.respond("fill_input", move |_| {
            fills += 1;
            if fills == 1 {
                Err(PilotError::TransientIo("Execution context was destroyed".to_string()))
            } else {
                Ok(json!(true))
            }
        });
        h.network.push(finished("Recovered"));

        let (tx, _rx) = mpsc::channel(16);
        let completion = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completion.text, "Recovered");
        assert_eq!(h.page.count("eval:fill_input"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let h = harness().await;
        h.page.respond("fill_input", |_| {
            Err(PilotError::TransientIo("Target closed".to_string()))
        });

        let (tx, _rx) = mpsc::channel(16);
        let err = h
            .supervisor
            .run("hi", &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PilotError::AttemptsExhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("Target closed"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_partial() {
        let h = harness().await;
        h.network.push_text("Half an ans");

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });

        let (tx, _rx) = mpsc::channel(16);
        let err = h.supervisor.run("hi", &tx, &cancel).await.unwrap_err();
        match err {
            PilotError::Cancelled { partial } => assert_eq!(partial, "Half an ans"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
