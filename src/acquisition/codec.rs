//! Decoder for the upstream's line-oriented stream format.
//!
//! Each line is `<prefix>:<json>`. Text parts (`a0`, or `0` for single-model
//! streams) carry a JSON string; `a2`/`2` carry data arrays that may hold an
//! image; `ah`/`h` carry a source; `ad`/`d` mark the end of the message and
//! `a3`/`3` an upstream error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    carry: String,
    text: String,
    image_url: Option<String>,
    sources: Vec<SourceRef>,
    error: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk. Incomplete trailing lines are kept until the next chunk.
    pub fn feed(&mut self, chunk: &str) {
        self.carry.push_str(chunk);
        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            self.decode_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Decode whatever is left in the carry buffer, used once the stream closed.
    pub fn flush(&mut self) {
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            self.decode_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn decode_line(&mut self, line: &str) {
        let Some((prefix, payload)) = line.split_once(':') else {
            return;
        };
        match prefix {
            "a0" | "0" => match serde_json::from_str::<String>(payload) {
                Ok(token) => self.text.push_str(&token),
                Err(e) => tracing::debug!("Undecodable text part ({}): {}", e, payload),
            },
            "a2" | "2" => {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(payload) {
                    for item in items {
                        if let Some(url) = image_in(&item) {
                            self.image_url = Some(url);
                        }
                    }
                }
            }
            "ah" | "h" => {
                if let Ok(value) = serde_json::from_str::<Value>(payload) {
                    if let Some(source) = source_in(&value) {
                        if !self.sources.contains(&source) {
                            self.sources.push(source);
                        }
                    }
                }
            }
            "a3" | "3" => {
                let message = serde_json::from_str::<String>(payload)
                    .unwrap_or_else(|_| payload.to_string());
                self.error = Some(message);
            }
            "ad" | "d" => self.finished = true,
            _ => {}
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn image_in(item: &Value) -> Option<String> {
    let kind = item.get("type").and_then(|t| t.as_str())?;
    if kind != "image" {
        return None;
    }
    item.get("image")
        .or_else(|| item.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string)
}

fn source_in(value: &Value) -> Option<SourceRef> {
    let url = value.get("url").and_then(|u| u.as_str())?;
    let title = value
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or(url);
    Some(SourceRef {
        title: title.to_string(),
        url: url.to_string(),
    })
}
