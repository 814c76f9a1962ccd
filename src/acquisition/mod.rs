//! Turns page activity into an ordered token stream for one outbound message.
//!
//! Two channels feed the engine: the intercepted network stream (primary) and
//! a content observer over the rendered answer (used only while the network
//! channel has shown no activity). The accumulated text only ever grows
//! between one `arm` and the next.

pub mod codec;
pub mod content;
pub mod network;
pub mod scheduler;

use crate::config::schema::AcquisitionConfig;
use crate::error::Result;
use crate::session::page::Page;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use codec::{SourceRef, StreamDecoder};
pub use content::ContentObserverSource;
pub use network::NetworkStreamSource;
pub use scheduler::PollScheduler;

/// Minimum length for the one-shot fallback read to count as an answer.
const FALLBACK_MIN_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Network,
    Content,
}

/// What one channel currently sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSnapshot {
    pub text: String,
    pub active: bool,
    pub done: bool,
    pub image_url: Option<String>,
    pub sources: Vec<SourceRef>,
    pub chat_id: Option<String>,
    /// Rate-limit / quota message shown instead of an answer
    pub notice: Option<String>,
}

#[async_trait]
pub trait ResponseSource: Send + Sync {
    fn channel(&self) -> Channel;

    /// Prepare to observe the next answer. With `resume`, keep the baseline
    /// taken by the previous arm (the message was already submitted).
    async fn arm(&self, page: &dyn Page, resume: bool) -> Result<()>;

    async fn read(&self, page: &dyn Page) -> Result<SourceSnapshot>;

    /// One-shot read of the visible answer region, ignoring baselines.
    async fn fallback_read(&self, _page: &dyn Page) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Armed,
    Streaming,
    Stalled,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub text: String,
    /// Byte offset up to which text has been emitted as deltas
    pub cursor: usize,
    pub done: bool,
    pub active: bool,
}

/// Incremental update delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEvent {
    pub full_text: String,
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Network channel reported the end of the stream
    StreamFinished,
    /// Content channel stopped changing
    Settled,
    /// Network channel went quiet past the stall threshold
    Stalled,
    /// Nothing arrived within the grace period; visible answer read once
    Fallback,
    /// Rate-limit or quota notice shown instead of an answer
    Notice,
    /// Ceiling reached with partial text
    Ceiling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Answer with image reference and sources appended
    pub text: String,
    pub raw_text: String,
    pub image_url: Option<String>,
    pub sources: Vec<SourceRef>,
    pub chat_id: Option<String>,
    pub reason: CompletionReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub phase: Phase,
    pub active: bool,
    pub delta: String,
    pub event: Option<TokenEvent>,
    pub completion: Option<Completion>,
}

/// Append the image reference, then a numbered source list.
pub fn finalize_text(text: &str, image_url: Option<&str>, sources: &[SourceRef]) -> String {
    let mut out = text.to_string();
    if let Some(url) = image_url {
        out.push_str(&format!("\n\n![Generated Image]({})", url));
    }
    if !sources.is_empty() {
        out.push_str("\n\n---\n\n**Sources:**\n");
        for (i, src) in sources.iter().enumerate() {
            out.push_str(&format!("{}. [{}]({})\n", i + 1, src.title, src.url));
        }
    }
    out
}

/// Byte length of the longest shared prefix, on a char boundary of both.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

pub struct AcquisitionEngine {
    config: AcquisitionConfig,
    network: Box<dyn ResponseSource>,
    content: Box<dyn ResponseSource>,
    state: StreamState,
    phase: Phase,
    channel: Option<Channel>,
    unchanged_ticks: u32,
    armed_at: Option<Instant>,
    fallback_used: bool,
    image_url: Option<String>,
    sources: Vec<SourceRef>,
    chat_id: Option<String>,
}

impl AcquisitionEngine {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self::with_sources(
            config,
            Box::new(NetworkStreamSource::new()),
            Box::new(ContentObserverSource::new()),
        )
    }

    pub fn with_sources(
        config: AcquisitionConfig,
        network: Box<dyn ResponseSource>,
        content: Box<dyn ResponseSource>,
    ) -> Self {
        Self {
            config,
            network,
            content,
            state: StreamState::default(),
            phase: Phase::Idle,
            channel: None,
            unchanged_ticks: 0,
            armed_at: None,
            fallback_used: false,
            image_url: None,
            sources: Vec::new(),
            chat_id: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn text(&self) -> &str {
        &self.state.text
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    /// Reset for a new outbound message and install both channels.
    pub async fn arm(&mut self, page: &dyn Page) -> Result<()> {
        self.arm_inner(page, false).await
    }

    /// Re-install the channels after an interruption, keeping the answer
    /// baseline of the original arm.
    pub async fn rearm(&mut self, page: &dyn Page) -> Result<()> {
        self.arm_inner(page, true).await
    }

    async fn arm_inner(&mut self, page: &dyn Page, resume: bool) -> Result<()> {
        self.reset();
        if let Err(e) = self.network.arm(page, resume).await {
            tracing::warn!("Network tap unavailable, content channel only: {}", e);
        }
        self.content.arm(page, resume).await?;
        self.state.active = true;
        self.phase = Phase::Armed;
        self.armed_at = Some(Instant::now());
        tracing::debug!("Acquisition armed (resume: {})", resume);
        Ok(())
    }

    fn reset(&mut self) {
        self.state = StreamState::default();
        self.phase = Phase::Idle;
        self.channel = None;
        self.unchanged_ticks = 0;
        self.armed_at = None;
        self.fallback_used = false;
        self.image_url = None;
        self.sources.clear();
        self.chat_id = None;
    }

    fn report(&self, delta: String, event: Option<TokenEvent>, completion: Option<Completion>) -> PollReport {
        PollReport {
            phase: self.phase,
            active: self.state.active,
            delta,
            event,
            completion,
        }
    }

    /// Grow the text; shorter snapshots are ignored. Returns the new delta.
    fn absorb(&mut self, text: &str) -> String {
        if text.len() <= self.state.text.len() {
            return String::new();
        }
        let from = if text.starts_with(&self.state.text) {
            self.state.cursor
        } else {
            tracing::debug!("Answer re-rendered; keeping longer snapshot");
            common_prefix_len(&self.state.text, text)
        };
        self.state.text = text.to_string();
        let delta = self.state.text[from..].to_string();
        self.state.cursor = self.state.text.len();
        delta
    }

    /// One polling step. Emits a token event on growth and a completion once
    /// the answer is done, stalled, settled, or replaced by a notice.
    pub async fn poll(&mut self, page: &dyn Page) -> Result<PollReport> {
        if matches!(self.phase, Phase::Idle | Phase::Complete) {
            return Ok(self.report(String::new(), None, None));
        }

        let net = self.network.read(page).await?;
        let use_network = net.active
            && (self.channel != Some(Channel::Content) || net.text.len() >= self.state.text.len());

        let snapshot = if use_network {
            if self.channel != Some(Channel::Network) {
                tracing::debug!("Network channel active");
            }
            self.channel = Some(Channel::Network);
            net
        } else {
            let seen = self.content.read(page).await?;
            if seen.active && self.channel.is_none() {
                tracing::debug!("Content channel active");
                self.channel = Some(Channel::Content);
            }
            seen
        };

        if snapshot.chat_id.is_some() {
            self.chat_id = snapshot.chat_id.clone();
        }
        if !snapshot.sources.is_empty() {
            self.sources = snapshot.sources.clone();
        }

        if self.state.text.is_empty() && self.image_url.is_none() {
            if let Some(notice) = &snapshot.notice {
                tracing::warn!("Upstream notice instead of answer: {}", notice);
                self.state.text = format!("⚠️ **System Notification**\n\n{}", notice);
                self.state.cursor = self.state.text.len();
                let event = TokenEvent {
                    full_text: self.state.text.clone(),
                    delta: self.state.text.clone(),
                    image_url: None,
                };
                let completion = self.complete(CompletionReason::Notice);
                return Ok(self.report(event.delta.clone(), Some(event), Some(completion)));
            }
        }

        let before = self.state.text.len();
        let delta = self.absorb(&snapshot.text);
        let grew = self.state.text.len() > before;

        let image_changed = snapshot.image_url.is_some() && snapshot.image_url != self.image_url;
        if image_changed {
            self.image_url = snapshot.image_url.clone();
        }

        let event = if !delta.is_empty() || image_changed {
            Some(TokenEvent {
                full_text: self.state.text.clone(),
                delta: delta.clone(),
                image_url: self.image_url.clone(),
            })
        } else {
            None
        };

        let has_output = !self.state.text.is_empty() || self.image_url.is_some();

        if snapshot.done && self.channel == Some(Channel::Network) {
            if has_output {
                self.state.done = true;
                let completion = self.complete(CompletionReason::StreamFinished);
                return Ok(self.report(delta, event, Some(completion)));
            }
            // Stream closed empty; let the content channel take over
            self.channel = None;
        }

        if grew || image_changed {
            self.unchanged_ticks = 0;
            self.phase = Phase::Streaming;
            return Ok(self.report(delta, event, None));
        }

        if has_output {
            self.unchanged_ticks += 1;
            let threshold = match self.channel {
                Some(Channel::Network) => self.config.stall_ticks,
                _ => self.config.content_settle_ticks,
            };
            if self.unchanged_ticks >= threshold {
                let reason = if self.channel == Some(Channel::Network) {
                    self.phase = Phase::Stalled;
                    tracing::warn!(
                        "Stream stalled after {} quiet polls, returning {} chars",
                        self.unchanged_ticks,
                        self.state.text.len()
                    );
                    CompletionReason::Stalled
                } else {
                    CompletionReason::Settled
                };
                let completion = self.complete(reason);
                return Ok(self.report(delta, event, Some(completion)));
            }
            return Ok(self.report(delta, event, None));
        }

        let waited = self.armed_at.map(|t| t.elapsed()).unwrap_or_default();
        if !self.fallback_used && waited >= self.config.initial_grace() {
            self.fallback_used = true;
            tracing::info!(
                "No answer after {}s, reading visible answer once",
                waited.as_secs()
            );
            if let Some(text) = self.content.fallback_read(page).await? {
                if text.chars().count() > FALLBACK_MIN_CHARS {
                    let delta = self.absorb(&text);
                    let event = TokenEvent {
                        full_text: self.state.text.clone(),
                        delta: delta.clone(),
                        image_url: None,
                    };
                    let completion = self.complete(CompletionReason::Fallback);
                    return Ok(self.report(delta, Some(event), Some(completion)));
                }
            }
        }

        Ok(self.report(delta, event, None))
    }

    /// Finish with whatever has been collected (ceiling reached).
    pub fn finish_partial(&mut self) -> Option<Completion> {
        if self.state.text.is_empty() && self.image_url.is_none() {
            return None;
        }
        Some(self.complete(CompletionReason::Ceiling))
    }

    fn complete(&mut self, reason: CompletionReason) -> Completion {
        self.phase = Phase::Complete;
        self.state.active = false;
        tracing::info!(
            "Answer complete ({:?}, {} chars, channel {:?})",
            reason,
            self.state.text.len(),
            self.channel
        );
        Completion {
            text: finalize_text(&self.state.text, self.image_url.as_deref(), &self.sources),
            raw_text: self.state.text.clone(),
            image_url: self.image_url.clone(),
            sources: self.sources.clone(),
            chat_id: self.chat_id.clone(),
            reason,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::engine_with;
    use super::*;
    use crate::session::page::testing::FakePage;
    use std::time::Duration;

    fn config() -> AcquisitionConfig {
        AcquisitionConfig {
            stall_ticks: 5,
            content_settle_ticks: 3,
            initial_grace_ms: 1_000,
            ..AcquisitionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_poll_right_after_arm_is_active_and_silent() {
        let page = FakePage::new();
        let (mut engine, _net, _content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        let report = engine.poll(&page).await.unwrap();
        assert!(report.active);
        assert_eq!(report.delta, "");
        assert!(report.event.is_none());
        assert!(report.completion.is_none());
        assert_eq!(report.phase, Phase::Armed);
    }

    #[tokio::test]
    async fn test_deltas_accumulate_and_text_never_shrinks() {
        let page = FakePage::new();
        let (mut engine, net, _content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        net.push_text("Hello");
        net.push_text("Hello, wor");
        net.push_text("Hello");
        net.push_text("Hello, world");

        let mut deltas = Vec::new();
        let mut lengths = Vec::new();
        for _ in 0..4 {
            let report = engine.poll(&page).await.unwrap();
            deltas.push(report.delta);
            lengths.push(engine.text().len());
        }

        assert_eq!(deltas, vec!["Hello", ", wor", "", "ld"]);
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(engine.text(), "Hello, world");
        assert_eq!(engine.phase(), Phase::Streaming);
    }

    #[tokio::test]
    async fn test_rewritten_answer_emits_changed_suffix() {
        let page = FakePage::new();
        let (mut engine, net, _content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        net.push_text("Café au");
        net.push_text("Cafés and more");

        assert_eq!(engine.poll(&page).await.unwrap().delta, "Café au");
        let report = engine.poll(&page).await.unwrap();
        assert_eq!(report.delta, "s and more");
        assert_eq!(report.event.unwrap().full_text, "Cafés and more");
        assert_eq!(engine.state().cursor, "Cafés and more".len());
    }

    #[test]
    fn test_common_prefix_len_stays_on_char_boundary() {
        assert_eq!(common_prefix_len("héllo", "héllo world"), "héllo".len());
        assert_eq!(common_prefix_len("aé", "aè"), 1);
        assert_eq!(common_prefix_len("", "abc"), 0);
    }

    #[tokio::test]
    async fn test_stall_returns_partial_text() {
        let page = FakePage::new();
        let (mut engine, net, _content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        let fifty = "x".repeat(50);
        net.push_text(&fifty);

        let first = engine.poll(&page).await.unwrap();
        assert_eq!(first.event.unwrap().full_text.len(), 50);

        let mut completion = None;
        for _ in 0..5 {
            let report = engine.poll(&page).await.unwrap();
            if report.completion.is_some() {
                completion = report.completion;
                break;
            }
        }
        let completion = completion.expect("stall completes the answer");
        assert_eq!(completion.reason, CompletionReason::Stalled);
        assert_eq!(completion.text, fifty);
        assert_eq!(engine.phase(), Phase::Complete);
    }

    #[tokio::test]
    async fn test_stream_finish_appends_image_then_sources() {
        let page = FakePage::new();
        let (mut engine, net, _content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        net.push(SourceSnapshot {
            text: "Here it is".to_string(),
            active: true,
            done: true,
            image_url: Some("https://cdn.test/a.png".to_string()),
            sources: vec![
                SourceRef { title: "A".to_string(), url: "https://a.test".to_string() },
                SourceRef { title: "B".to_string(), url: "https://b.test".to_string() },
            ],
            ..SourceSnapshot::default()
        });

        let report = engine.poll(&page).await.unwrap();
        let completion = report.completion.unwrap();
        assert_eq!(completion.reason, CompletionReason::StreamFinished);
        assert_eq!(
            completion.text,
            "Here it is\n\n![Generated Image](https://cdn.test/a.png)\n\n---\n\n**Sources:**\n1. [A](https://a.test)\n2. [B](https://b.test)\n"
        );
        assert_eq!(completion.raw_text, "Here it is");
        assert!(engine.state().done);
    }

    #[tokio::test]
    async fn test_content_channel_settles() {
        let page = FakePage::new();
        let (mut engine, _net, content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        content.push(SourceSnapshot {
            text: "Rendered answer".to_string(),
            active: true,
            chat_id: Some("c0ffee".to_string()),
            ..SourceSnapshot::default()
        });

        let mut reports = Vec::new();
        for _ in 0..4 {
            reports.push(engine.poll(&page).await.unwrap());
        }
        assert_eq!(reports[0].delta, "Rendered answer");
        let completion = reports[3].completion.clone().unwrap();
        assert_eq!(completion.reason, CompletionReason::Settled);
        assert_eq!(completion.chat_id.as_deref(), Some("c0ffee"));
    }

    #[tokio::test]
    async fn test_rate_limit_notice_completes() {
        let page = FakePage::new();
        let (mut engine, _net, content) = engine_with(config());
        engine.arm(&page).await.unwrap();

        content.push(SourceSnapshot {
            notice: Some("You've reached the message limit".to_string()),
            ..SourceSnapshot::default()
        });

        let report = engine.poll(&page).await.unwrap();
        let completion = report.completion.unwrap();
        assert_eq!(completion.reason, CompletionReason::Notice);
        assert!(completion.text.contains("reached the message limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_read_after_grace() {
        let page = FakePage::new();
        let (mut engine, _net, content) = engine_with(config());
        *content.fallback.lock() = Some("An answer the observer missed".to_string());
        engine.arm(&page).await.unwrap();

        assert!(engine.poll(&page).await.unwrap().completion.is_none());
        tokio::time::advance(Duration::from_millis(1_100)).await;

        let completion = engine.poll(&page).await.unwrap().completion.unwrap();
        assert_eq!(completion.reason, CompletionReason::Fallback);
        assert_eq!(completion.raw_text, "An answer the observer missed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_fallback_ignored_and_tried_once() {
        let page = FakePage::new();
        let (mut engine, _net, content) = engine_with(config());
        *content.fallback.lock() = Some("ok".to_string());
        engine.arm(&page).await.unwrap();

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(engine.poll(&page).await.unwrap().completion.is_none());

        *content.fallback.lock() = Some("now long enough to count".to_string());
        assert!(engine.poll(&page).await.unwrap().completion.is_none());
        assert!(engine.finish_partial().is_none());
    }

    #[tokio::test]
    async fn test_rearm_resets_state_and_resumes_sources() {
        let page = FakePage::new();
        let (mut engine, net, content) = engine_with(config());
        engine.arm(&page).await.unwrap();
        net.push_text("partial");
        engine.poll(&page).await.unwrap();
        assert_eq!(engine.text(), "partial");

        engine.rearm(&page).await.unwrap();
        assert_eq!(engine.text(), "");
        assert_eq!(*net.arms.lock(), vec![false, true]);
        assert_eq!(*content.arms.lock(), vec![false, true]);
    }
}
