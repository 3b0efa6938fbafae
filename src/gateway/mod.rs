//! The gateway: accepts one-or-more agent sockets and any number of
//! controller sockets, routes telemetry into the world state and out to
//! subscribers, and runs the command pipeline (policy → transmit → pending
//! entry → exactly-once resolution).

pub mod http;

use crate::cdp::CdpClient;
use crate::policy;
use crate::error::PagelensError;
use crate::protocol::{
    new_command_id, AgentControl, AgentMessage, Command, CommandAck, ControllerRequest,
    GatewayResponse,
};
use crate::state::{
    AgentHandle, CommandOrigin, ControllerHandle, GatewayState, PendingCommand,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        // websocket endpoints
        .route("/agent", get(agent_ws))
        .route("/controller", get(controller_ws))
        // read surface + command injection
        .route("/status", get(http::get_status))
        .route("/tabs", get(http::get_tabs))
        .route("/tabs/:tab_id/candidates", get(http::get_candidates))
        .route("/tabs/:tab_id/search", get(http::search_tab))
        .route("/command", post(http::post_command))
        .route("/policy", get(http::get_policy).post(http::set_policy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn run_server(state: Arc<GatewayState>, host: &str, port: u16) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("Gateway listening on {}:{}", host, port);
    axum::serve(listener, router(state))
        .await
        .map_err(crate::error::PagelensError::Io)
}

// ── Agent endpoint ──────────────────────────────────────────────

async fn agent_ws(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = state.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.agents.lock().push(AgentHandle { id: conn_id, tx });
    tracing::info!("Agent {} connected", conn_id);

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_agent_frame(&state, conn_id, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.agents.lock().retain(|a| a.id != conn_id);
    state.tab_owners.lock().retain(|_, owner| *owner != conn_id);
    send_task.abort();
    tracing::info!("Agent {} disconnected", conn_id);
}

/// Each inbound frame is parsed in isolation; a malformed frame logs and is
/// dropped, never killing the connection.
fn handle_agent_frame(state: &Arc<GatewayState>, conn_id: u64, text: &str) {
    match serde_json::from_str::<AgentMessage>(text) {
        Ok(AgentMessage::Ack(ack)) => resolve_agent_ack(state, ack),
        Ok(msg) => {
            let tab_id = msg.tab_id();
            if let AgentMessage::Hello { tab_id, .. } = &msg {
                let previous = state.tab_owners.lock().insert(*tab_id, conn_id);
                if let Some(previous) = previous.filter(|p| *p != conn_id) {
                    tracing::warn!(
                        "Tab {} re-claimed by agent {} (was agent {}); last writer wins",
                        tab_id,
                        conn_id,
                        previous
                    );
                }
            }
            state.world.lock().apply(&msg);
            // Heartbeats are link-level and are not mirrored.
            if tab_id.is_some() {
                state.broadcast_to_subscribers(tab_id, text);
            }
        }
        Err(e) => {
            tracing::warn!("Malformed agent frame, dropping: {}", e);
        }
    }
}

// ── Command pipeline ────────────────────────────────────────────

/// Route an `act` into the pipeline. Every path (policy denial, missing
/// agent, transport failure, timeout, agent ack) resolves exactly once.
pub fn submit_command(state: &Arc<GatewayState>, mut command: Command, origin: CommandOrigin) {
    if command.command_id().is_empty() {
        command.set_command_id(new_command_id());
    }
    let command_id = command.command_id().to_string();
    let tab_id = command.tab_id();
    let kind = command.kind();

    let (url, target_name) = {
        let world = state.world.lock();
        let url = world.tab_url(tab_id);
        let name = command
            .target_id()
            .and_then(|id| world.candidate_name(tab_id, id));
        (url, name)
    };

    let policy_config = state.policy.read().clone();
    let decision = state.policy_engine.lock().check(
        &policy_config,
        &command,
        url.as_deref(),
        target_name.as_deref(),
    );
    if let Err(reason) = decision {
        policy::audit(
            &policy_config,
            &command_id,
            kind,
            tab_id,
            "policy_denied",
            Some(&reason),
        );
        deliver_ack(state, CommandAck::fail(&command_id, reason), origin);
        return;
    }

    let Some(agent_tx) = state.first_agent() else {
        policy::audit(
            &policy_config,
            &command_id,
            kind,
            tab_id,
            "no_agent",
            Some("No extension connected"),
        );
        deliver_ack(
            state,
            CommandAck::fail(&command_id, PagelensError::NoAgent.to_string()),
            origin,
        );
        return;
    };

    let frame = match serde_json::to_string(&command) {
        Ok(f) => f,
        Err(e) => {
            deliver_ack(
                state,
                CommandAck::fail(&command_id, format!("Encode error: {}", e)),
                origin,
            );
            return;
        }
    };

    // Record the pending entry before transmitting so an immediate ack
    // cannot race the insert.
    let timer = {
        let state = Arc::clone(state);
        let command_id = command_id.clone();
        let timeout = state.command_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            resolve_timeout(&state, &command_id);
        })
    };
    state.pending.lock().insert(
        command_id.clone(),
        PendingCommand {
            tab_id,
            kind,
            origin,
            timeout: timer,
        },
    );

    if agent_tx.send(frame).is_err() {
        if let Some(entry) = state.pending.lock().remove(&command_id) {
            entry.timeout.abort();
            policy::audit(
                &policy_config,
                &command_id,
                kind,
                tab_id,
                "transport_error",
                Some("No extension connected"),
            );
            deliver_ack(
                state,
                CommandAck::fail(&command_id, PagelensError::NoAgent.to_string()),
                entry.origin,
            );
        }
        return;
    }
    policy::audit(&policy_config, &command_id, kind, tab_id, "sent", None);
}

/// Deliver a gateway-synthesized ack to the issuer only.
fn deliver_ack(state: &Arc<GatewayState>, ack: CommandAck, origin: CommandOrigin) {
    match origin {
        CommandOrigin::Http(sender) => {
            let _ = sender.send(ack);
        }
        CommandOrigin::Controller(conn_id) => {
            if let Ok(text) = serde_json::to_string(&GatewayResponse::Ack(ack)) {
                state.send_to_controller(conn_id, &text);
            }
        }
    }
}

fn resolve_timeout(state: &Arc<GatewayState>, command_id: &str) {
    let Some(entry) = state.pending.lock().remove(command_id) else {
        return;
    };
    tracing::warn!("Command {} timed out", command_id);
    let policy_config = state.policy.read().clone();
    policy::audit(
        &policy_config,
        command_id,
        entry.kind,
        entry.tab_id,
        "timeout",
        Some("Command timeout"),
    );
    deliver_ack(
        state,
        CommandAck::fail(command_id, PagelensError::Timeout.to_string()),
        entry.origin,
    );
}

/// An inbound ack from the agent. Acks with no pending entry (duplicates
/// after a timeout, or redelivery across reconnect) are dropped silently.
fn resolve_agent_ack(state: &Arc<GatewayState>, ack: CommandAck) {
    let Some(entry) = state.pending.lock().remove(&ack.command_id) else {
        tracing::debug!("Dropping ack with no pending entry: {}", ack.command_id);
        return;
    };
    entry.timeout.abort();

    let outcome = match &ack.status {
        crate::protocol::AckStatus::Ok { .. } => "ok",
        crate::protocol::AckStatus::Fail { .. } => "fail",
        crate::protocol::AckStatus::Verify { .. } => "verify",
    };
    let policy_config = state.policy.read().clone();
    policy::audit(
        &policy_config,
        &ack.command_id,
        entry.kind,
        entry.tab_id,
        outcome,
        None,
    );

    match entry.origin {
        CommandOrigin::Http(sender) => {
            let _ = sender.send(ack);
        }
        CommandOrigin::Controller(conn_id) => {
            let Ok(text) = serde_json::to_string(&GatewayResponse::Ack(ack)) else {
                return;
            };
            // Fan out through the subscription filter; the issuer receives
            // it directly when its filter would exclude the tab.
            state.broadcast_to_subscribers(Some(entry.tab_id), &text);
            if let Some(Some(sub)) = state.subscription_of(conn_id) {
                if sub != entry.tab_id {
                    state.send_to_controller(conn_id, &text);
                }
            }
        }
    }
}

// ── Controller endpoint ─────────────────────────────────────────

async fn controller_ws(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_controller_socket(socket, state))
}

async fn handle_controller_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = state.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.controllers.lock().insert(
        conn_id,
        ControllerHandle {
            id: conn_id,
            tx,
            subscribed_tab_id: None,
        },
    );
    tracing::info!("Controller {} connected", conn_id);

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_controller_frame(&state, conn_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.controllers.lock().remove(&conn_id);
    send_task.abort();
    tracing::info!("Controller {} disconnected", conn_id);
}

async fn handle_controller_frame(state: &Arc<GatewayState>, conn_id: u64, text: &str) {
    let request = match serde_json::from_str::<ControllerRequest>(text) {
        Ok(r) => r,
        Err(e) => {
            respond(
                state,
                conn_id,
                &GatewayResponse::Error {
                    message: format!("Malformed request: {}", e),
                },
            );
            return;
        }
    };

    match request {
        ControllerRequest::Subscribe { tab_id } => {
            if let Some(c) = state.controllers.lock().get_mut(&conn_id) {
                c.subscribed_tab_id = tab_id;
            }
            // Ask the agent for a fresh snapshot so the subscriber starts
            // from current state rather than the delta tail.
            if let Some(agent) = state.first_agent() {
                if let Ok(text) = serde_json::to_string(&AgentControl::RequestSnapshot) {
                    let _ = agent.send(text);
                }
            }
            respond(state, conn_id, &GatewayResponse::Subscribed { tab_id });
        }
        ControllerRequest::ListTabs => {
            let tabs = state.world.lock().tab_summaries();
            respond(state, conn_id, &GatewayResponse::Tabs { tabs });
        }
        ControllerRequest::Query {
            tab_id,
            search,
            filters,
        } => {
            let result = state
                .world
                .lock()
                .search(tab_id, &search, &filters.unwrap_or_default());
            match result {
                Some(matches) => respond(
                    state,
                    conn_id,
                    &GatewayResponse::Candidates { tab_id, matches },
                ),
                None => respond(
                    state,
                    conn_id,
                    &GatewayResponse::Error {
                        message: PagelensError::TabNotFound(tab_id).to_string(),
                    },
                ),
            }
        }
        ControllerRequest::Act { command } => {
            submit_command(state, command, CommandOrigin::Controller(conn_id));
        }
        ControllerRequest::Navigate { url } => {
            let mut guard = state.cdp.lock().await;
            let result = match attach_if_needed(state, &mut guard).await {
                Ok(()) => guard.as_ref().expect("cdp attached").navigate(&url).await,
                Err(e) => Err(e),
            };
            drop(guard);
            let response = match result {
                Ok(()) => GatewayResponse::NavigateResult {
                    ok: true,
                    error: None,
                },
                Err(e) => GatewayResponse::NavigateResult {
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            respond(state, conn_id, &response);
        }
        ControllerRequest::CdpStatus => {
            let guard = state.cdp.lock().await;
            let response = match guard.as_ref() {
                Some(cdp) => GatewayResponse::CdpStatus {
                    connected: true,
                    debug_port: cdp.debug_port(),
                    target_url: Some(cdp.current_url()),
                },
                None => GatewayResponse::CdpStatus {
                    connected: false,
                    debug_port: state.config.remote_debug_port,
                    target_url: None,
                },
            };
            drop(guard);
            respond(state, conn_id, &response);
        }
        ControllerRequest::CdpType { text } => {
            let mut guard = state.cdp.lock().await;
            let result = match attach_if_needed(state, &mut guard).await {
                Ok(()) => guard.as_ref().expect("cdp attached").type_text(&text).await,
                Err(e) => Err(e),
            };
            drop(guard);
            let response = match result {
                Ok(()) => GatewayResponse::CdpTypeResult {
                    ok: true,
                    error: None,
                },
                Err(e) => GatewayResponse::CdpTypeResult {
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            respond(state, conn_id, &response);
        }
        ControllerRequest::CdpKey { key } => {
            let mut guard = state.cdp.lock().await;
            let result = match attach_if_needed(state, &mut guard).await {
                Ok(()) => guard.as_ref().expect("cdp attached").press_key(&key).await,
                Err(e) => Err(e),
            };
            drop(guard);
            let response = match result {
                Ok(()) => GatewayResponse::CdpKeyResult {
                    ok: true,
                    error: None,
                },
                Err(e) => GatewayResponse::CdpKeyResult {
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            respond(state, conn_id, &response);
        }
        ControllerRequest::CdpEval { expression } => {
            let mut guard = state.cdp.lock().await;
            let result = match attach_if_needed(state, &mut guard).await {
                Ok(()) => {
                    guard
                        .as_ref()
                        .expect("cdp attached")
                        .evaluate(&expression)
                        .await
                }
                Err(e) => Err(e),
            };
            drop(guard);
            let response = match result {
                Ok(value) => GatewayResponse::CdpEvalResult {
                    value: Some(value),
                    error: None,
                },
                Err(e) => GatewayResponse::CdpEvalResult {
                    value: None,
                    error: Some(e.to_string()),
                },
            };
            respond(state, conn_id, &response);
        }
    }
}

fn respond(state: &Arc<GatewayState>, conn_id: u64, response: &GatewayResponse) {
    if let Ok(text) = serde_json::to_string(response) {
        state.send_to_controller(conn_id, &text);
    }
}

/// Attach the remote-debugging client on first use. The caller holds the
/// lock across its operation, serializing remote-debugging traffic.
async fn attach_if_needed(
    state: &Arc<GatewayState>,
    slot: &mut Option<CdpClient>,
) -> crate::error::Result<()> {
    if slot.is_none() {
        *slot = Some(CdpClient::attach(state.config.remote_debug_port).await?);
    }
    Ok(())
}
