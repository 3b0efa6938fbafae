//! Controller-side client: request/response over the gateway websocket,
//! mirrored-telemetry subscription, and high-level convenience operations.

use crate::error::{PagelensError, Result};
use crate::perception::best_match;
use crate::protocol::{
    new_command_id, ActionCandidate, AgentMessage, Command, CommandAck, ControllerRequest,
    SearchFilters, TabSummary,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Acks are gateway-guaranteed within 30 s; leave margin on top.
const ACK_TIMEOUT: Duration = Duration::from_secs(35);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

fn transport(msg: impl Into<String>) -> PagelensError {
    PagelensError::Transport(msg.into())
}

/// One queued typed-response waiter: the response `type` it expects plus the
/// completion channel. `error` responses complete the oldest waiter.
struct ResponseWaiter {
    expect: &'static str,
    tx: oneshot::Sender<Value>,
}

pub struct ControllerClient {
    ws_tx: Arc<Mutex<WsSink>>,
    waiters: Arc<Mutex<Vec<ResponseWaiter>>>,
    pending_acks: Arc<Mutex<HashMap<String, oneshot::Sender<CommandAck>>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentMessage>>>,
}

impl ControllerClient {
    /// Connect to the gateway's controller endpoint
    /// (e.g. `ws://127.0.0.1:9333/controller`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| transport(format!("Failed to connect to gateway: {}", e)))?;
        let (tx, mut rx) = StreamExt::split(ws);

        let waiters: Arc<Mutex<Vec<ResponseWaiter>>> = Arc::new(Mutex::new(Vec::new()));
        let pending_acks: Arc<Mutex<HashMap<String, oneshot::Sender<CommandAck>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let waiters = Arc::clone(&waiters);
            let pending_acks = Arc::clone(&pending_acks);
            tokio::spawn(async move {
                while let Some(msg) = StreamExt::next(&mut rx).await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            route_frame(&text, &waiters, &pending_acks, &events_tx).await;
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Err(e) => {
                            tracing::debug!("Controller socket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }

        Ok(Self {
            ws_tx: Arc::new(Mutex::new(tx)),
            waiters,
            pending_acks,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Take the mirrored-telemetry stream (hello/snapshot/delta/pointer/
    /// event frames, plus acks no local waiter claimed). Single consumer.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<AgentMessage>> {
        self.events_rx.lock().await.take()
    }

    async fn send_frame(&self, request: &ControllerRequest) -> Result<()> {
        let text = serde_json::to_string(request)
            .map_err(|e| transport(format!("Encode error: {}", e)))?;
        self.ws_tx
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| transport(format!("Send failed: {}", e)))
    }

    /// Send a request and wait for its typed response.
    async fn request(&self, request: &ControllerRequest, expect: &'static str) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push(ResponseWaiter { expect, tx });
        self.send_frame(request).await?;
        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(value)) => {
                if value.get("type").and_then(|t| t.as_str()) == Some("error") {
                    let message = value
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("Unknown gateway error");
                    return Err(transport(message));
                }
                Ok(value)
            }
            Ok(Err(_)) => Err(transport("Gateway connection closed")),
            Err(_) => Err(PagelensError::Timeout),
        }
    }

    // ── Protocol operations ─────────────────────────────────────

    pub async fn subscribe(&self, tab_id: Option<u64>) -> Result<Option<u64>> {
        let value = self
            .request(&ControllerRequest::Subscribe { tab_id }, "subscribed")
            .await?;
        Ok(value.get("tabId").and_then(|v| v.as_u64()))
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabSummary>> {
        let value = self.request(&ControllerRequest::ListTabs, "tabs").await?;
        serde_json::from_value(value.get("tabs").cloned().unwrap_or(Value::Null))
            .map_err(|e| PagelensError::MalformedMessage(e.to_string()))
    }

    pub async fn query(
        &self,
        tab_id: u64,
        search: &str,
        filters: Option<SearchFilters>,
    ) -> Result<Vec<ActionCandidate>> {
        let value = self
            .request(
                &ControllerRequest::Query {
                    tab_id,
                    search: search.to_string(),
                    filters,
                },
                "candidates",
            )
            .await?;
        serde_json::from_value(value.get("matches").cloned().unwrap_or(Value::Null))
            .map_err(|e| PagelensError::MalformedMessage(e.to_string()))
    }

    /// Best single match for a search, by match-quality tier.
    pub async fn find(&self, tab_id: u64, search: &str) -> Result<Option<ActionCandidate>> {
        let matches = self.query(tab_id, search, None).await?;
        Ok(best_match(&matches, search, &SearchFilters::default()).cloned())
    }

    /// Submit a command and wait for its single resolving ack.
    pub async fn act(&self, mut command: Command) -> Result<CommandAck> {
        if command.command_id().is_empty() {
            command.set_command_id(new_command_id());
        }
        let command_id = command.command_id().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(command_id.clone(), tx);
        if let Err(e) = self.send_frame(&ControllerRequest::Act { command }).await {
            self.pending_acks.lock().await.remove(&command_id);
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(transport("Gateway connection closed")),
            Err(_) => {
                self.pending_acks.lock().await.remove(&command_id);
                Err(PagelensError::Timeout)
            }
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let value = self
            .request(
                &ControllerRequest::Navigate {
                    url: url.to_string(),
                },
                "navigate_result",
            )
            .await?;
        if value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            Ok(())
        } else {
            let error = value
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("Navigation failed");
            Err(transport(error))
        }
    }

    pub async fn eval(&self, expression: &str) -> Result<Value> {
        let value = self
            .request(
                &ControllerRequest::CdpEval {
                    expression: expression.to_string(),
                },
                "cdp_eval_result",
            )
            .await?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(transport(error));
        }
        Ok(value.get("value").cloned().unwrap_or(Value::Null))
    }

    pub async fn cdp_status(&self) -> Result<Value> {
        self.request(&ControllerRequest::CdpStatus, "cdp_status")
            .await
    }

    // ── Convenience operations ──────────────────────────────────

    pub async fn click(&self, tab_id: u64, id: &str) -> Result<CommandAck> {
        self.act(Command::Click {
            command_id: String::new(),
            tab_id,
            id: id.to_string(),
            button: 0,
            modifiers: vec![],
            click_count: 1,
        })
        .await
    }

    pub async fn type_text(&self, tab_id: u64, id: &str, text: &str) -> Result<CommandAck> {
        self.act(Command::Type {
            command_id: String::new(),
            tab_id,
            id: id.to_string(),
            text: text.to_string(),
            mode: Default::default(),
            clear_first: false,
            delay: 0,
        })
        .await
    }

    pub async fn hover(&self, tab_id: u64, id: &str) -> Result<CommandAck> {
        self.act(Command::Hover {
            command_id: String::new(),
            tab_id,
            id: id.to_string(),
            duration: None,
        })
        .await
    }

    pub async fn focus(&self, tab_id: u64, id: &str) -> Result<CommandAck> {
        self.act(Command::Focus {
            command_id: String::new(),
            tab_id,
            id: id.to_string(),
        })
        .await
    }
}

async fn route_frame(
    text: &str,
    waiters: &Arc<Mutex<Vec<ResponseWaiter>>>,
    pending_acks: &Arc<Mutex<HashMap<String, oneshot::Sender<CommandAck>>>>,
    events_tx: &mpsc::UnboundedSender<AgentMessage>,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Malformed gateway frame, dropping: {}", e);
            return;
        }
    };
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        tracing::warn!("Gateway frame without type, dropping");
        return;
    };

    match kind {
        "ack" => {
            match serde_json::from_value::<CommandAck>(value.clone()) {
                Ok(ack) => {
                    let waiter = pending_acks.lock().await.remove(&ack.command_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(ack);
                        }
                        // A subscribed ack for someone else's command.
                        None => {
                            let _ = events_tx.send(AgentMessage::Ack(ack));
                        }
                    }
                }
                Err(e) => tracing::warn!("Unparseable ack, dropping: {}", e),
            }
        }
        "hello" | "snapshot" | "delta" | "pointer" | "event" | "unload" | "heartbeat" => {
            match serde_json::from_value::<AgentMessage>(value) {
                Ok(msg) => {
                    let _ = events_tx.send(msg);
                }
                Err(e) => tracing::warn!("Unparseable telemetry, dropping: {}", e),
            }
        }
        // Typed responses: complete the first waiter expecting this type;
        // an `error` completes the oldest waiter outright.
        _ => {
            let mut waiters = waiters.lock().await;
            let position = if kind == "error" {
                if waiters.is_empty() {
                    None
                } else {
                    Some(0)
                }
            } else {
                waiters.iter().position(|w| w.expect == kind)
            };
            match position {
                Some(i) => {
                    let waiter = waiters.remove(i);
                    let _ = waiter.tx.send(value);
                }
                None => {
                    tracing::debug!("Unclaimed gateway response: {}", kind);
                }
            }
        }
    }
}
