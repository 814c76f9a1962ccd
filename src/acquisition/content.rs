use crate::acquisition::{Channel, ResponseSource, SourceSnapshot};
use crate::error::Result;
use crate::session::page::{eval_as, Page};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

/// Observer installed at arm. Answer blocks are `.prose` elements outside the
/// user's bubbles (`.self-end`); the list renders newest-first, so the new
/// answer is index 0 once the count exceeds the baseline taken here.
const OBSERVE_FN: &str = r#"(baseline) => {
  window.__cpMarkdown = (node) => {
    const clone = node.cloneNode(true);
    const blocks = [];
    clone.querySelectorAll('[data-code-block="true"]').forEach((block) => {
      const lang = block.querySelector('.text-text-secondary.text-sm.font-medium');
      const code = block.querySelector('code');
      const marker = `@@CPCODE${blocks.length}@@`;
      blocks.push({ marker, lang: lang ? lang.textContent.trim().toLowerCase() : '', body: code ? code.textContent : '' });
      block.outerHTML = marker;
    });
    clone.querySelectorAll('pre > code').forEach((code) => {
      const marker = `@@CPCODE${blocks.length}@@`;
      const m = (code.className || '').match(/language-(\w+)/);
      blocks.push({ marker, lang: m ? m[1] : '', body: code.textContent });
      code.closest('pre').outerHTML = marker;
    });
    let html = clone.innerHTML;
    for (let level = 6; level >= 1; level--) {
      const re = new RegExp(`<h${level}[^>]*>(.*?)</h${level}>`, 'gi');
      html = html.replace(re, `\n${'#'.repeat(level)} $1\n`);
    }
    html = html
      .replace(/<(strong|b)(\s[^>]*)?>(.*?)<\/\1>/gi, '**$3**')
      .replace(/<(em|i)(\s[^>]*)?>(.*?)<\/\1>/gi, '*$3*')
      .replace(/<code[^>]*>(.*?)<\/code>/gi, '`$1`')
      .replace(/<li[^>]*>(.*?)<\/li>/gi, '- $1\n')
      .replace(/<p[^>]*>(.*?)<\/p>/gi, '$1\n\n')
      .replace(/<br\s*\/?>/gi, '\n')
      .replace(/<a[^>]*href="(.*?)"[^>]*>(.*?)<\/a>/gi, '[$2]($1)');
    const tmp = document.createElement('div');
    tmp.innerHTML = html;
    let text = tmp.textContent.trim();
    for (const b of blocks) {
      text = text.replace(b.marker, '\n```' + b.lang + '\n' + b.body + '\n```\n');
    }
    return text;
  };
  const answers = () => Array.from(document.querySelectorAll('.prose')).filter((el) => !el.closest('.self-end'));
  const limitNotice = () => {
    const els = Array.from(document.querySelectorAll('.text-interactive-negative, .text-red-600, .text-error, div[role="alert"]'));
    const hit = els.find((el) => {
      const t = (el.innerText || el.textContent || '').toLowerCase();
      return t.includes('rate limit') || t.includes('quota') || t.includes('too many requests') ||
        (t.includes('reach') && t.includes('limit')) || t.includes('please wait');
    });
    return hit ? (hit.innerText || hit.textContent || '').trim() : '';
  };
  const prev = window.__cpContent;
  if (prev) {
    if (prev.observer) prev.observer.disconnect();
    if (prev.timer) clearInterval(prev.timer);
  }
  const initial = answers();
  const state = {
    baseline: baseline === null ? initial.length : Math.min(baseline, initial.length),
    previous: initial.length ? window.__cpMarkdown(initial[0]) : '',
    staleNotice: limitNotice(),
    text: '', image: '', chatId: '', notice: '',
  };
  window.__cpContent = state;
  const check = () => {
    const notice = limitNotice();
    if (notice && notice !== state.staleNotice) state.notice = notice;
    const list = answers();
    if (list.length > state.baseline) {
      const latest = list[0];
      state.text = window.__cpMarkdown(latest);
      const box = latest.closest('li') || (latest.parentElement && latest.parentElement.parentElement);
      if (box) {
        const img = box.querySelector('img[alt="Generated image"]') || box.querySelector('img[src*="blob:"]');
        if (img) state.image = img.src;
      }
    }
    const m = window.location.href.match(/\/c\/([a-f0-9-]+)/);
    if (m) state.chatId = m[1];
  };
  state.timer = setInterval(check, 30);
  state.observer = new MutationObserver(check);
  state.observer.observe(document.body, { childList: true, subtree: true, characterData: true });
  check();
  return state.baseline;
}"#;

const READ_SCRIPT: &str = r#"/*cp:observe_read*/
(() => {
  const s = window.__cpContent;
  if (!s) return null;
  return { text: s.text, image: s.image, chatId: s.chatId, notice: s.notice };
})()
"#;

const FALLBACK_SCRIPT: &str = r#"/*cp:observe_fallback*/
(() => {
  const list = Array.from(document.querySelectorAll('.prose')).filter((el) => !el.closest('.self-end'));
  if (!list.length || !window.__cpMarkdown) return '';
  const text = window.__cpMarkdown(list[0]);
  const s = window.__cpContent;
  return s && text === s.previous ? '' : text;
})()
"#;

/// Removes every exchange but the newest so long sessions stay light.
pub const TRIM_HISTORY_SCRIPT: &str = r#"/*cp:trim_history*/
(() => {
  const blocks = Array.from(document.querySelectorAll('.prose'));
  const items = new Set();
  blocks.slice(2).forEach((el) => {
    const li = el.closest('li');
    if (li) items.add(li);
  });
  items.forEach((li) => li.remove());
  return items.size;
})()
"#;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Observed {
    #[serde(default)]
    text: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    notice: String,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Fallback channel: snapshots the newest answer block as it renders.
#[derive(Default)]
pub struct ContentObserverSource {
    baseline: Mutex<Option<u32>>,
}

impl ContentObserverSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> Option<u32> {
        *self.baseline.lock()
    }
}

#[async_trait]
impl ResponseSource for ContentObserverSource {
    fn channel(&self) -> Channel {
        Channel::Content
    }

    async fn arm(&self, page: &dyn Page, resume: bool) -> Result<()> {
        let keep = if resume { self.baseline() } else { None };
        let arg = keep.map(|b| b.to_string()).unwrap_or_else(|| "null".to_string());
        let script = format!("/*cp:observe*/ ({})({})", OBSERVE_FN, arg);
        let baseline: Option<u32> = eval_as(page, &script).await?;
        *self.baseline.lock() = baseline;
        tracing::debug!("Content observer armed, baseline {:?}", baseline);
        Ok(())
    }

    async fn read(&self, page: &dyn Page) -> Result<SourceSnapshot> {
        let observed: Option<Observed> = eval_as(page, READ_SCRIPT).await?;
        let observed = observed.unwrap_or_default();
        let image_url = non_empty(observed.image);
        Ok(SourceSnapshot {
            active: !observed.text.is_empty() || image_url.is_some(),
            done: false,
            image_url,
            sources: Vec::new(),
            notice: non_empty(observed.notice),
            chat_id: non_empty(observed.chat_id),
            text: observed.text,
        })
    }

    async fn fallback_read(&self, page: &dyn Page) -> Result<Option<String>> {
        let text: Option<String> = eval_as(page, FALLBACK_SCRIPT).await?;
        Ok(text.and_then(non_empty))
    }
}
