use crate::acquisition::codec::StreamDecoder;
use crate::acquisition::{Channel, ResponseSource, SourceSnapshot};
use crate::error::Result;
use crate::session::page::{eval_as, Page};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

/// Wraps `window.fetch` so streamed answer bodies are teed into a chunk
/// buffer the engine drains. Installed on every new document and again at arm.
pub const TAP_SCRIPT: &str = r#"/*cp:tap*/
(() => {
  window.__cpTapInstall = function () {
    if (!window.__cpTap) {
      window.__cpTap = { chunks: [], active: false, done: false, epoch: 0 };
    }
    if (window.__cpTapInstalled) return;
    window.__cpTapInstalled = true;
    const tap = window.__cpTap;
    const originalFetch = window.fetch;
    window.fetch = async function (...args) {
      const response = await originalFetch.apply(this, args);
      try {
        const url = typeof args[0] === 'string' ? args[0] : (args[0] && args[0].url) || '';
        const type = response.headers.get('content-type') || '';
        if (url.includes('stream') && response.body &&
            (type.includes('text/event-stream') || type.includes('text/plain'))) {
          const epoch = tap.epoch;
          tap.active = true;
          tap.done = false;
          const reader = response.clone().body.getReader();
          const decoder = new TextDecoder();
          (async () => {
            try {
              while (true) {
                const { done, value } = await reader.read();
                if (tap.epoch !== epoch) break;
                if (done) {
                  const tail = decoder.decode();
                  if (tail) tap.chunks.push(tail);
                  tap.done = true;
                  break;
                }
                tap.chunks.push(decoder.decode(value, { stream: true }));
              }
            } catch (e) {
              if (tap.epoch === epoch) tap.done = true;
            }
          })();
        }
      } catch (e) {}
      return response;
    };
  };
  window.__cpTapInstall();
  return true;
})()
"#;

const ARM_SCRIPT: &str = r#"/*cp:tap_arm*/
(() => {
  if (!window.__cpTapInstall) return false;
  window.__cpTapInstall();
  const tap = window.__cpTap;
  tap.epoch += 1;
  tap.chunks = [];
  tap.active = false;
  tap.done = false;
  return true;
})()
"#;

const DRAIN_SCRIPT: &str = r#"/*cp:tap_drain*/
(() => {
  const tap = window.__cpTap;
  if (!tap) return null;
  const chunks = tap.chunks;
  tap.chunks = [];
  return { chunks, active: tap.active, done: tap.done };
})()
"#;

#[derive(Deserialize)]
struct Drained {
    #[serde(default)]
    chunks: Vec<String>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    done: bool,
}

/// Primary channel: decodes the intercepted answer stream.
#[derive(Default)]
pub struct NetworkStreamSource {
    decoder: Mutex<StreamDecoder>,
}

impl NetworkStreamSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseSource for NetworkStreamSource {
    fn channel(&self) -> Channel {
        Channel::Network
    }

    async fn arm(&self, page: &dyn Page, _resume: bool) -> Result<()> {
        *self.decoder.lock() = StreamDecoder::new();
        let armed: Option<bool> = eval_as(page, ARM_SCRIPT).await?;
        if armed != Some(true) {
            // Document loaded before the init script was registered
            page.evaluate(TAP_SCRIPT).await?;
            page.evaluate(ARM_SCRIPT).await?;
        }
        Ok(())
    }

    async fn read(&self, page: &dyn Page) -> Result<SourceSnapshot> {
        let drained: Option<Drained> = eval_as(page, DRAIN_SCRIPT).await?;
        let mut decoder = self.decoder.lock();

        let (active, closed) = match drained {
            Some(d) => {
                for chunk in &d.chunks {
                    decoder.feed(chunk);
                }
                if d.done {
                    decoder.flush();
                }
                (d.active, d.done)
            }
            // Tap gone with the document; keep what was decoded
            None => (false, false),
        };

        let text = decoder.text().to_string();
        Ok(SourceSnapshot {
            active: active || !text.is_empty(),
            done: closed || decoder.is_finished(),
            image_url: decoder.image_url().map(str::to_string),
            sources: decoder.sources().to_vec(),
            notice: decoder.error().map(str::to_string),
            chat_id: None,
            text,
        })
    }
}
