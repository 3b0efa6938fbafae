//! Agent-side gateway link: one websocket with reconnect, heartbeat, an
//! offline telemetry queue with backpressure, and inbound command routing.

use crate::config::TransportConfig;
use crate::error::{PagelensError, Result};
use crate::protocol::{now_ms, AgentMessage, Command};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// How many hello/snapshot messages survive a queue overflow.
const OVERFLOW_KEEP: usize = 10;

/// Offline telemetry buffer. FIFO until the backpressure threshold, then
/// trimmed to the last few full-state messages (deltas are useless without
/// the snapshots they build on).
pub struct TelemetryQueue {
    buf: VecDeque<AgentMessage>,
    threshold: usize,
}

impl TelemetryQueue {
    pub fn new(threshold: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            threshold,
        }
    }

    pub fn enqueue(&mut self, msg: AgentMessage) {
        self.buf.push_back(msg);
        if self.buf.len() > self.threshold {
            let kept: Vec<AgentMessage> = self
                .buf
                .iter()
                .filter(|m| {
                    matches!(
                        m,
                        AgentMessage::Hello { .. } | AgentMessage::Snapshot { .. }
                    )
                })
                .cloned()
                .collect();
            let skip = kept.len().saturating_sub(OVERFLOW_KEEP);
            let dropped = self.buf.len();
            self.buf = kept.into_iter().skip(skip).collect();
            tracing::warn!(
                "Telemetry queue overflow: trimmed {} messages to {} full-state entries",
                dropped,
                self.buf.len()
            );
        }
    }

    pub fn drain(&mut self) -> Vec<AgentMessage> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Inbound traffic routed to the agent's execution loop.
#[derive(Debug)]
pub enum AgentInbound {
    Command(Command),
    RequestSnapshot,
}

pub struct AgentTransport {
    config: TransportConfig,
    tab_id: u64,
    queue: Mutex<TelemetryQueue>,
    conn_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_tx: mpsc::UnboundedSender<AgentInbound>,
}

impl AgentTransport {
    /// Build the transport; the receiver carries inbound commands to the
    /// executor loop.
    pub fn new(
        config: TransportConfig,
        tab_id: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AgentInbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let threshold = config.backpressure_threshold;
        (
            Arc::new(Self {
                config,
                tab_id,
                queue: Mutex::new(TelemetryQueue::new(threshold)),
                conn_tx: Mutex::new(None),
                inbound_tx,
            }),
            inbound_rx,
        )
    }

    /// Send telemetry, enriching the tab id. Queued when the socket is not
    /// open.
    pub fn send(&self, mut msg: AgentMessage) {
        msg.set_tab_id(self.tab_id);
        let conn = self.conn_tx.lock();
        if let Some(tx) = conn.as_ref() {
            if let Ok(text) = serde_json::to_string(&msg) {
                if tx.send(text).is_ok() {
                    return;
                }
            }
        }
        drop(conn);
        self.queue.lock().enqueue(msg);
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.conn_tx.lock().is_some()
    }

    /// Connection lifecycle: connect, drain the queue, pump frames and the
    /// heartbeat; on close wait the reconnect interval and retry. Gives up
    /// after the configured number of consecutive failed attempts.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match connect_async(self.config.gateway_url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::info!("Connected to gateway: {}", self.config.gateway_url);
                    attempts = 0;
                    self.handle_connection(ws).await;
                    tracing::warn!("Gateway connection closed");
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Gateway connect failed (attempt {}/{}): {}",
                        attempts,
                        self.config.max_reconnect_attempts,
                        e
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        return Err(PagelensError::Transport(format!(
                            "Gave up after {} reconnect attempts",
                            attempts
                        )));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_interval_ms)).await;
        }
    }

    async fn handle_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.conn_tx.lock() = Some(tx.clone());

        // Drain the offline queue FIFO.
        for msg in self.queue.lock().drain() {
            if let Ok(text) = serde_json::to_string(&msg) {
                let _ = tx.send(text);
            }
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await; // the first tick is immediate; skip it

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(text) = outbound else { break };
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => self.route_inbound(&text),
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::warn!("Gateway socket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    let hb = AgentMessage::Heartbeat { timestamp: now_ms() };
                    let Ok(text) = serde_json::to_string(&hb) else { continue };
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }

        *self.conn_tx.lock() = None;
    }

    /// Inbound frames: `request_snapshot` forces a fresh snapshot; anything
    /// with a `commandId` goes to the executor. Malformed frames are logged
    /// and dropped.
    fn route_inbound(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Malformed gateway frame, dropping: {}", e);
                return;
            }
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("request_snapshot") {
            let _ = self.inbound_tx.send(AgentInbound::RequestSnapshot);
            return;
        }
        if value.get("commandId").is_some() {
            match serde_json::from_value::<Command>(value) {
                Ok(command) => {
                    let _ = self.inbound_tx.send(AgentInbound::Command(command));
                }
                Err(e) => tracing::warn!("Unparseable command, dropping: {}", e),
            }
            return;
        }
        tracing::debug!("Ignoring gateway frame without commandId");
    }
}
