// End-to-end gateway scenarios over real websockets: an in-process gateway
// on an ephemeral port, a scripted agent connection, and the controller
// client.

use futures::{SinkExt, StreamExt};
use pagelens_lib::config::{DomainMode, GatewayConfig, PolicyConfig};
use pagelens_lib::controller::ControllerClient;
use pagelens_lib::gateway;
use pagelens_lib::protocol::{
    ActionCandidate, AckStatus, AgentMessage, CandidateCtx, CandidateState, Command, CommandAck,
    Rect, SearchFilters, StyleHint, Verification, Viewport,
};
use pagelens_lib::state::GatewayState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

async fn spawn_gateway(
    policy: PolicyConfig,
    command_timeout: Duration,
) -> (String, Arc<GatewayState>) {
    let state = Arc::new(
        GatewayState::new(GatewayConfig::default(), policy).with_command_timeout(command_timeout),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gateway::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}", addr), state)
}

struct ScriptedAgent {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ScriptedAgent {
    async fn connect(base: &str) -> Self {
        let (ws, _) = connect_async(format!("{}/agent", base)).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: &AgentMessage) {
        let text = serde_json::to_string(msg).unwrap();
        self.ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn recv_command(&mut self, timeout: Duration) -> Option<Command> {
        loop {
            let frame = tokio::time::timeout(timeout, self.ws.next()).await.ok()??;
            match frame.ok()? {
                WsMessage::Text(text) => {
                    // skip control frames (request_snapshot)
                    if let Ok(command) = serde_json::from_str::<Command>(&text) {
                        return Some(command);
                    }
                }
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }
}

fn candidate(id: &str, role: &str, name: &str) -> ActionCandidate {
    let rect = Rect {
        x: 10,
        y: 10,
        w: 100,
        h: 30,
    };
    ActionCandidate {
        id: id.to_string(),
        rect,
        rect_n: rect.normalized(1024, 768),
        hit: rect.center(),
        role: role.to_string(),
        tag: role.to_string(),
        name: name.to_string(),
        aria: String::new(),
        placeholder: None,
        value: None,
        href: None,
        state: CandidateState::default(),
        ctx: CandidateCtx::default(),
        style_hint: StyleHint::default(),
        occluded: false,
    }
}

fn viewport() -> Viewport {
    Viewport {
        width: 1024,
        height: 768,
    }
}

async fn hello_and_snapshot(agent: &mut ScriptedAgent, tab_id: u64, url: &str) {
    agent
        .send(&AgentMessage::Hello {
            tab_id,
            url: url.to_string(),
            viewport: viewport(),
            user_agent: "test-agent".to_string(),
        })
        .await;
    agent
        .send(&AgentMessage::Snapshot {
            tab_id,
            url: url.to_string(),
            viewport: viewport(),
            candidates: vec![candidate("a_0", "button", "Sign in")],
        })
        .await;
    // let the gateway process the frames
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn hello_snapshot_then_list_tabs() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    hello_and_snapshot(&mut agent, 1, "https://a/").await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    let tabs = controller.list_tabs().await.unwrap();
    assert_eq!(tabs.len(), 1);
    assert_eq!(tabs[0].tab_id, 1);
    assert_eq!(tabs[0].url, "https://a/");
    assert_eq!(tabs[0].candidate_count, 1);
    assert_eq!(tabs[0].viewport, viewport());
}

#[tokio::test]
async fn act_routes_to_agent_and_returns_its_ack() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    hello_and_snapshot(&mut agent, 1, "https://a/").await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    controller.subscribe(Some(1)).await.unwrap();

    let controller_task = tokio::spawn(async move {
        let ack = controller.click(1, "a_0").await.unwrap();
        (controller, ack)
    });

    let command = agent
        .recv_command(Duration::from_secs(5))
        .await
        .expect("agent should receive the routed command");
    assert_eq!(command.kind(), "click");
    assert_eq!(command.tab_id(), 1);
    let command_id = command.command_id().to_string();
    assert!(command_id.starts_with("cmd_"));

    agent
        .send(&AgentMessage::Ack(CommandAck::verify(
            &command_id,
            Verification {
                id: "a_0".to_string(),
                still_visible: true,
                hit_test_ok: true,
                rect_changed: false,
                new_rect: None,
            },
        )))
        .await;

    let (_controller, ack) = controller_task.await.unwrap();
    assert_eq!(ack.command_id, command_id);
    match ack.status {
        AckStatus::Verify { verification } => {
            assert_eq!(verification.id, "a_0");
            assert!(verification.still_visible);
            assert!(verification.hit_test_ok);
            assert!(!verification.rect_changed);
        }
        other => panic!("expected verify ack, got {:?}", other),
    }
}

#[tokio::test]
async fn unanswered_command_times_out_and_clears_pending() {
    let (base, state) = spawn_gateway(PolicyConfig::default(), Duration::from_millis(300)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    hello_and_snapshot(&mut agent, 1, "https://a/").await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    let ack_task = tokio::spawn(async move {
        let ack = controller.click(1, "a_0").await.unwrap();
        (controller, ack)
    });

    // The agent receives the command but never acknowledges it.
    let command = agent.recv_command(Duration::from_secs(5)).await.unwrap();
    let command_id = command.command_id().to_string();

    let (_controller, ack) = ack_task.await.unwrap();
    assert_eq!(ack.command_id, command_id);
    match ack.status {
        AckStatus::Fail { reason } => assert_eq!(reason, "Command timeout"),
        other => panic!("expected fail ack, got {:?}", other),
    }
    assert!(state.pending.lock().is_empty());

    // A late ack after the timeout is silently dropped.
    agent
        .send(&AgentMessage::Ack(CommandAck::ok(&command_id, None)))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.pending.lock().is_empty());
}

#[tokio::test]
async fn no_agent_fails_immediately() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    let ack = controller.click(1, "a_0").await.unwrap();
    match ack.status {
        AckStatus::Fail { reason } => assert_eq!(reason, "No extension connected"),
        other => panic!("expected fail ack, got {:?}", other),
    }
}

#[tokio::test]
async fn delta_updates_world_and_mirrors_to_subscribers() {
    let (base, state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    agent
        .send(&AgentMessage::Hello {
            tab_id: 1,
            url: "https://a/".to_string(),
            viewport: viewport(),
            user_agent: String::new(),
        })
        .await;
    agent
        .send(&AgentMessage::Snapshot {
            tab_id: 1,
            url: "https://a/".to_string(),
            viewport: viewport(),
            candidates: vec![
                candidate("a_0", "button", "Sign in"),
                candidate("a_2", "button", "Save"),
            ],
        })
        .await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    controller.subscribe(Some(1)).await.unwrap();
    let mut events = controller.events().await.unwrap();

    let mut update = pagelens_lib::protocol::CandidateUpdate::new("a_2");
    update.state = Some(CandidateState {
        disabled: true,
        ..Default::default()
    });
    agent
        .send(&AgentMessage::Delta {
            tab_id: 1,
            removed: vec!["a_0".to_string()],
            added: vec![candidate("a_1", "link", "Help")],
            updated: vec![update],
        })
        .await;

    // The subscriber sees the mirrored delta.
    let mirrored = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match mirrored {
        AgentMessage::Delta {
            removed, added, ..
        } => {
            assert_eq!(removed, vec!["a_0".to_string()]);
            assert_eq!(added.len(), 1);
        }
        other => panic!("expected delta, got {:?}", other),
    }

    // And the world state applied it.
    let world = state.world.lock();
    let tab = world.tab(1).unwrap();
    assert!(!tab.candidates.contains_key("a_0"));
    assert!(tab.candidates.contains_key("a_1"));
    assert!(tab.candidates["a_2"].state.disabled);
}

#[tokio::test]
async fn query_filters_by_role_and_search_text() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    agent
        .send(&AgentMessage::Snapshot {
            tab_id: 1,
            url: "https://a/".to_string(),
            viewport: viewport(),
            candidates: vec![
                candidate("a_0", "button", "Sign in"),
                candidate("a_1", "link", "Sign in help"),
                candidate("a_2", "button", "Cancel"),
            ],
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    let matches = controller
        .query(
            1,
            "sign in",
            Some(SearchFilters {
                role: Some("button".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, "a_0");

    // Unknown tab surfaces as a gateway error.
    let err = controller.query(9, "sign in", None).await.unwrap_err();
    assert!(err.to_string().contains("Tab not found"));
}

#[tokio::test]
async fn http_surface_reports_status_and_runs_commands() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let http_base = base.replace("ws://", "http://");
    let mut agent = ScriptedAgent::connect(&base).await;
    hello_and_snapshot(&mut agent, 1, "https://a/").await;

    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(format!("{}/status", http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["agents"], 1);
    assert_eq!(status["tabs"][0]["candidateCount"], 1);
    assert_eq!(status["policy"]["domainMode"], "all");

    let tabs: serde_json::Value = client
        .get(format!("{}/tabs", http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tabs[0]["tabId"], 1);

    let candidates: serde_json::Value = client
        .get(format!("{}/tabs/1/candidates", http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(candidates[0]["id"], "a_0");

    let found: serde_json::Value = client
        .get(format!("{}/tabs/1/search?q=sign%20in&role=button", http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);

    // POST /command runs the same pipeline; the scripted agent answers.
    let post = tokio::spawn({
        let client = client.clone();
        let http_base = http_base.clone();
        async move {
            client
                .post(format!("{}/command", http_base))
                .json(&serde_json::json!({"type": "click", "tabId": 1, "id": "a_0"}))
                .send()
                .await
                .unwrap()
                .json::<CommandAck>()
                .await
                .unwrap()
        }
    });
    let command = agent.recv_command(Duration::from_secs(5)).await.unwrap();
    agent
        .send(&AgentMessage::Ack(CommandAck::ok(command.command_id(), None)))
        .await;
    let ack = post.await.unwrap();
    assert!(matches!(ack.status, AckStatus::Ok { .. }));

    // Policy read/write round trip.
    let policy: PolicyConfig = client
        .get(format!("{}/policy", http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(policy.domain_mode, DomainMode::All);
    let updated: PolicyConfig = client
        .post(format!("{}/policy", http_base))
        .json(&PolicyConfig {
            domain_mode: DomainMode::Blocklist,
            ..Default::default()
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated.domain_mode, DomainMode::Blocklist);
}

#[tokio::test]
async fn malformed_agent_frames_are_dropped_without_killing_the_link() {
    let (base, state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    agent
        .ws
        .send(WsMessage::Text("{not json".to_string()))
        .await
        .unwrap();
    hello_and_snapshot(&mut agent, 1, "https://a/").await;
    assert_eq!(state.world.lock().tab_count(), 1);
    assert_eq!(state.agent_count(), 1);
}

#[tokio::test]
async fn subscriber_filtering_scopes_telemetry_by_tab() {
    let (base, _state) = spawn_gateway(PolicyConfig::default(), Duration::from_secs(30)).await;
    let mut agent = ScriptedAgent::connect(&base).await;
    hello_and_snapshot(&mut agent, 1, "https://a/").await;
    hello_and_snapshot(&mut agent, 2, "https://b/").await;

    let controller = ControllerClient::connect(&format!("{}/controller", base))
        .await
        .unwrap();
    controller.subscribe(Some(2)).await.unwrap();
    let mut events = controller.events().await.unwrap();

    agent
        .send(&AgentMessage::Delta {
            tab_id: 1,
            removed: vec!["a_0".to_string()],
            added: vec![],
            updated: vec![],
        })
        .await;
    agent
        .send(&AgentMessage::Delta {
            tab_id: 2,
            removed: vec!["a_0".to_string()],
            added: vec![],
            updated: vec![],
        })
        .await;

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        AgentMessage::Delta { tab_id, .. } => assert_eq!(tab_id, 2),
        other => panic!("expected tab-2 delta, got {:?}", other),
    }
}
