//! Remote-debugging collaborator client.
//!
//! Covers the operations the control plane consumes from the browser
//! process: navigation, raw keyboard input, expression evaluation, input
//! forwarding for the agent's synthesized events, and DOM snapshot capture
//! for the mirror. The client attaches to an already-running browser; it
//! never launches one.
//!
//! All protocol traffic funnels through one correlated [`CdpClient::call`]:
//! a frame router owns both the in-flight call table and the one-shot
//! event waiters, and the reader task feeds it frame by frame.

use crate::dom::capture::CAPTURE_STYLES;
use crate::error::{PagelensError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Deadline for one protocol round trip.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the load event after a navigation.
const NAVIGATE_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Virtual key codes for the non-printable keys the protocol names.
const VIRTUAL_KEYS: &[(&str, i32)] = &[
    ("Enter", 13),
    ("Tab", 9),
    ("Escape", 27),
    ("Backspace", 8),
    ("Delete", 46),
    ("ArrowUp", 38),
    ("ArrowDown", 40),
    ("ArrowLeft", 37),
    ("ArrowRight", 39),
    ("Home", 36),
    ("End", 35),
    ("PageUp", 33),
    ("PageDown", 34),
];

fn transport(msg: impl Into<String>) -> PagelensError {
    PagelensError::Transport(msg.into())
}

/// A debuggable target advertised on `/json/list`.
#[derive(Debug, Deserialize)]
struct DebugTarget {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: Option<String>,
}

/// Frame router shared with the reader task. Calls resolve by response id;
/// domain events resolve whoever armed a waiter for that method.
#[derive(Default)]
struct FrameRouter {
    calls: HashMap<u32, oneshot::Sender<Result<Value>>>,
    event_waiters: HashMap<String, Vec<oneshot::Sender<Value>>>,
}

impl FrameRouter {
    fn route(&mut self, frame: &str) {
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return;
        };
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let Some(waiter) = self.calls.remove(&(id as u32)) else {
                return;
            };
            // A protocol-level error resolves the call; it never kills
            // the link.
            let outcome = match value.get("error") {
                Some(error) => Err(transport(format!(
                    "CDP error: {}",
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                ))),
                None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = waiter.send(outcome);
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            if let Some(waiters) = self.event_waiters.remove(method) {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                for waiter in waiters {
                    let _ = waiter.send(params.clone());
                }
            }
        }
    }

    /// Connection teardown: everything still in flight fails out.
    fn close(&mut self) {
        for (_, waiter) in self.calls.drain() {
            let _ = waiter.send(Err(transport("CDP connection closed")));
        }
        self.event_waiters.clear();
    }
}

async fn read_frames(mut source: WsSource, router: Arc<Mutex<FrameRouter>>) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => router.lock().route(&text),
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::debug!("CDP socket error: {}", e);
                break;
            }
            _ => {}
        }
    }
    router.lock().close();
}

pub struct CdpClient {
    sink: tokio::sync::Mutex<WsSink>,
    router: Arc<Mutex<FrameRouter>>,
    next_call_id: AtomicU32,
    current_url: Mutex<String>,
    debug_port: u16,
}

impl CdpClient {
    /// Attach to a running browser by its remote-debugging port: discover
    /// the first page target on `/json/list` and connect to it.
    pub async fn attach(debug_port: u16) -> Result<Self> {
        let list_url = format!("http://127.0.0.1:{}/json/list", debug_port);
        let targets: Vec<DebugTarget> = reqwest::get(&list_url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport(format!("CDP discovery failed: {}", e)))?
            .json()
            .await
            .map_err(|e| transport(format!("Unreadable target list: {}", e)))?;

        let page = targets
            .into_iter()
            .find(|t| t.kind == "page")
            .ok_or_else(|| transport("No page target found"))?;
        let ws_url = page
            .ws_url
            .ok_or_else(|| transport("Page target has no debugger URL"))?;

        tracing::info!("Connecting to CDP WebSocket: {}", ws_url);
        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| transport(format!("Failed to connect WebSocket: {}", e)))?;
        let (sink, source) = stream.split();

        let router = Arc::new(Mutex::new(FrameRouter::default()));
        tokio::spawn(read_frames(source, Arc::clone(&router)));

        let client = Self {
            sink: tokio::sync::Mutex::new(sink),
            router,
            next_call_id: AtomicU32::new(1),
            current_url: Mutex::new(page.url),
            debug_port,
        };
        for domain in ["Page.enable", "Runtime.enable"] {
            client.call(domain, json!({})).await?;
        }
        tracing::info!("CDP domains enabled on port {}", debug_port);
        Ok(client)
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    pub fn current_url(&self) -> String {
        self.current_url.lock().clone()
    }

    /// One protocol round trip. Returns the command's `result` payload;
    /// protocol errors and the 30 s deadline surface as `Err`.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.router.lock().calls.insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        if let Err(e) = self.sink.lock().await.send(WsMessage::Text(frame)).await {
            self.router.lock().calls.remove(&id);
            return Err(transport(format!("CDP send failed: {}", e)));
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(transport("CDP connection closed")),
            Err(_) => {
                self.router.lock().calls.remove(&id);
                Err(PagelensError::Timeout)
            }
        }
    }

    /// Arm a one-shot waiter for a domain event. Arm before issuing the
    /// command that triggers it, or the event can fire unheard.
    fn arm_event(&self, method: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.router
            .lock()
            .event_waiters
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn key_event(&self, kind: &str, mut fields: Value) -> Result<()> {
        fields["type"] = json!(kind);
        self.call("Input.dispatchKeyEvent", fields).await.map(|_| ())
    }

    // ── Collaborator operations ─────────────────────────────────

    /// Navigate to a URL, waiting for the load event (bounded).
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let loaded = self.arm_event("Page.loadEventFired");
        self.call("Page.navigate", json!({ "url": url })).await?;
        *self.current_url.lock() = url.to_string();

        if tokio::time::timeout(NAVIGATE_TIMEOUT, loaded).await.is_err() {
            tracing::warn!("No load event within {:?} for {}", NAVIGATE_TIMEOUT, url);
        }
        tracing::info!("Navigated to: {}", url);
        Ok(())
    }

    /// Type raw text character-by-character, bypassing element targeting.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        for ch in text.chars() {
            let key = ch.to_string();
            let fields = json!({ "key": key, "text": key });
            for kind in ["keyDown", "char", "keyUp"] {
                self.key_event(kind, fields.clone()).await?;
            }
        }
        tracing::debug!("Typed {} chars", text.chars().count());
        Ok(())
    }

    /// Press one key, with optional modifier chords ("Ctrl+A",
    /// "Shift+Enter").
    pub async fn press_key(&self, combo: &str) -> Result<()> {
        let mut parts: Vec<&str> = combo.split('+').collect();
        let key = parts.pop().unwrap_or(combo);
        let modifiers = parts.iter().fold(0u32, |mask, m| mask | modifier_bit(m));

        let code = VIRTUAL_KEYS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, code)| *code)
            .or_else(|| key.chars().next().map(|c| c.to_ascii_uppercase() as i32))
            .unwrap_or(0);
        let fields = json!({
            "key": key,
            "code": key,
            "windowsVirtualKeyCode": code,
            "modifiers": modifiers,
        });

        self.key_event("keyDown", fields.clone()).await?;
        // A plain printable key also needs the char event for editors that
        // ignore bare key transitions. Ctrl/Alt/Meta chords never get one.
        let chorded = modifiers & (1 | 2 | 4) != 0;
        if key.chars().count() == 1 && !chorded {
            let mut with_text = fields.clone();
            with_text["text"] = json!(key);
            self.key_event("char", with_text).await?;
        }
        self.key_event("keyUp", fields).await?;

        tracing::debug!("Pressed key: {}", combo);
        Ok(())
    }

    /// Evaluate an expression; a thrown exception surfaces as an error.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let payload = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = payload.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("JS evaluation error");
            return Err(transport(text));
        }
        Ok(payload
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    // ── Agent input forwarding ──────────────────────────────────

    /// Forward one synthesized mouse event through the Input domain.
    pub async fn dispatch_mouse(
        &self,
        kind: &str,
        x: i32,
        y: i32,
        button: u8,
        click_count: u32,
    ) -> Result<()> {
        let (event_type, button_name) = match kind {
            "mousedown" => ("mousePressed", button_name(button)),
            "mouseup" => ("mouseReleased", button_name(button)),
            _ => ("mouseMoved", "none"),
        };
        self.call(
            "Input.dispatchMouseEvent",
            json!({
                "type": event_type,
                "x": x,
                "y": y,
                "button": button_name,
                "clickCount": click_count,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Forward one synthesized key event through the Input domain.
    pub async fn dispatch_key(&self, kind: &str, key: &str) -> Result<()> {
        let event = match kind {
            "keydown" => "keyDown",
            "keyup" => "keyUp",
            _ => "char",
        };
        self.key_event(event, json!({ "key": key, "text": key })).await
    }

    // ── Mirror capture ──────────────────────────────────────────

    /// Capture the page's DOM snapshot for mirror construction.
    pub async fn capture_dom(&self) -> Result<Value> {
        self.call(
            "DOMSnapshot.captureSnapshot",
            json!({ "computedStyles": CAPTURE_STYLES }),
        )
        .await
    }

    /// Current viewport metrics `(width, height)`.
    pub async fn viewport(&self) -> Result<(u32, u32)> {
        let metrics = self.call("Page.getLayoutMetrics", json!({})).await?;
        let dim = |pointer: &str, fallback: u64| {
            metrics
                .pointer(pointer)
                .and_then(Value::as_u64)
                .unwrap_or(fallback) as u32
        };
        Ok((
            dim("/cssLayoutViewport/clientWidth", 1280),
            dim("/cssLayoutViewport/clientHeight", 768),
        ))
    }
}

fn button_name(button: u8) -> &'static str {
    match button {
        1 => "middle",
        2 => "right",
        _ => "left",
    }
}

fn modifier_bit(name: &str) -> u32 {
    match name {
        "Alt" => 1,
        "Ctrl" | "Control" => 2,
        "Meta" | "Cmd" | "Command" => 4,
        "Shift" => 8,
        _ => 0,
    }
}
