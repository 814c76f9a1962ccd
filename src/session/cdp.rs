use crate::error::{PilotError, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Value>>>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// One DevTools WebSocket connection to a page target.
///
/// Responses are routed back to callers by command id; events are ignored.
pub struct CdpConnection {
    ws_tx: Arc<Mutex<WsSink>>,
    responses: Pending,
    msg_id: AtomicU32,
    connected: Arc<AtomicBool>,
    command_timeout: Duration,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| PilotError::Cdp(format!("Failed to connect WebSocket: {}", e)))?;
        let (tx, mut rx) = StreamExt::split(ws_stream);

        let responses: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader_responses = responses.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let Ok(json) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = json.get("id").and_then(|i| i.as_u64()) {
                            if let Some(sender) =
                                reader_responses.lock().await.remove(&(id as u32))
                            {
                                let _ = sender.send(json);
                            }
                        } else {
                            tracing::trace!(
                                "CDP event: {}",
                                text.chars().take(100).collect::<String>()
                            );
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::debug!("DevTools WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("DevTools WebSocket error: {:?}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the senders fails every waiter with "Response channel closed"
            reader_responses.lock().await.clear();
        });

        tracing::info!("Connected to DevTools target {}", ws_url);

        Ok(Self {
            ws_tx: Arc::new(Mutex::new(tx)),
            responses,
            msg_id: AtomicU32::new(1),
            connected,
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a command and return its `result` object.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(PilotError::classify_cdp("WebSocket not connected"));
        }

        let id = self.msg_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.responses.lock().await.insert(id, tx);

        let command = json!({
            "id": id,
            "method": method,
            "params": params
        });

        {
            let mut sink = self.ws_tx.lock().await;
            if let Err(e) = sink.send(WsMessage::Text(command.to_string())).await {
                self.responses.lock().await.remove(&id);
                self.connected.store(false, Ordering::SeqCst);
                return Err(PilotError::classify_cdp(format!(
                    "connection closed while sending {}: {}",
                    method, e
                )));
            }
        }

        let response = match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(PilotError::classify_cdp("Response channel closed")),
            Err(_) => {
                self.responses.lock().await.remove(&id);
                return Err(PilotError::classify_cdp(format!(
                    "Command timeout: {}",
                    method
                )));
            }
        };

        if let Some(err) = response.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown CDP error");
            return Err(PilotError::classify_cdp(format!("{}: {}", method, message)));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut sink = self.ws_tx.lock().await;
        let _ = sink.close().await;
    }
}

/// Poll the DevTools HTTP endpoint until a page target shows up and return
/// its WebSocket debugger URL.
pub async fn discover_page_target(port: u16, timeout: Duration) -> Result<String> {
    let list_url = format!("http://127.0.0.1:{}/json/list", port);
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error = String::new();
    let mut retries = 0u32;

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;
        retries += 1;

        match client.get(&list_url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(targets) => match page_ws_url(&targets) {
                        Some(url) => return Ok(url),
                        None => last_error = "No page target found".to_string(),
                    },
                    Err(e) => last_error = format!("Failed to parse targets response: {}", e),
                }
            }
            Ok(response) => last_error = format!("HTTP error: {}", response.status()),
            Err(e) => last_error = format!("Connection error: {}", e),
        }

        tracing::debug!("DevTools probe {} on port {}: {}", retries, port, last_error);
    }

    Err(PilotError::Process(format!(
        "Chrome DevTools not reachable on port {} after {} probes: {}",
        port, retries, last_error
    )))
}

fn page_ws_url(targets: &Value) -> Option<String> {
    targets
        .as_array()?
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(str::to_string)
}
