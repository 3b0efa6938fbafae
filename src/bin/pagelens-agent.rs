//! Perception agent: mirrors one browser tab over the remote-debugging
//! protocol, runs the perception engine against the mirror, and speaks the
//! agent telemetry protocol to the gateway.

use clap::Parser;
use pagelens_lib::cdp::CdpClient;
use pagelens_lib::config;
use pagelens_lib::dom::capture::Mirror;
use pagelens_lib::dom::SyntheticEvent;
use pagelens_lib::executor::Executor;
use pagelens_lib::perception::{PerceptionEngine, DEBOUNCE};
use pagelens_lib::protocol::{AgentMessage, Viewport};
use pagelens_lib::transport::{AgentInbound, AgentTransport};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pagelens-agent", version)]
struct Args {
    /// Gateway agent-endpoint URL (overrides config)
    #[arg(long)]
    gateway_url: Option<String>,

    /// Tab id this agent reports as
    #[arg(long, default_value_t = 1)]
    tab_id: u64,

    /// Remote-debugging port of the browser
    #[arg(long = "cdp-port", default_value_t = 9222)]
    cdp_port: u16,

    /// Re-capture interval for the DOM mirror
    #[arg(long, default_value_t = 500)]
    capture_interval_ms: u64,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut transport_config = match args.config.as_ref() {
        Some(path) => config::load_config_from(path)?.transport,
        None => config::load_config().unwrap_or_default().transport,
    };
    if let Some(url) = args.gateway_url {
        transport_config.gateway_url = url;
    }

    let cdp = CdpClient::attach(args.cdp_port).await?;
    let (width, height) = cdp.viewport().await?;
    let viewport = Viewport { width, height };
    let url = cdp.current_url();
    tracing::info!("Attached to {} ({}x{})", url, width, height);

    let mut mirror = Mirror::new(url.clone(), viewport);
    let snapshot = cdp.capture_dom().await?;
    mirror.sync(&snapshot)?;
    mirror.document_mut().take_mutations();

    let mut engine = PerceptionEngine::new();
    let initial = engine.start(mirror.document());

    let (transport, mut inbound) = AgentTransport::new(transport_config, args.tab_id);
    tokio::spawn(transport.clone().run());

    transport.send(AgentMessage::Hello {
        tab_id: args.tab_id,
        url: url.clone(),
        viewport,
        user_agent: format!("pagelens-agent/{}", env!("CARGO_PKG_VERSION")),
    });
    transport.send(AgentMessage::Snapshot {
        tab_id: args.tab_id,
        url,
        viewport,
        candidates: initial,
    });

    let mut capture_tick = tokio::time::interval(Duration::from_millis(args.capture_interval_ms));
    capture_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut debounce_deadline: Option<tokio::time::Instant> = None;

    loop {
        let armed = debounce_deadline;
        let debounce = async move {
            match armed {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = capture_tick.tick() => {
                let snapshot = match cdp.capture_dom().await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("DOM capture failed: {}", e);
                        continue;
                    }
                };
                let out_of_band = match mirror.sync(&snapshot) {
                    Ok(flag) => flag,
                    Err(e) => {
                        tracing::warn!("Mirror sync failed: {}", e);
                        continue;
                    }
                };
                let mutations = mirror.document_mut().take_mutations();
                for event in engine.overlay_events(&mutations, mirror.document()) {
                    transport.send(AgentMessage::Event { tab_id: args.tab_id, name: event });
                }
                let mut arm = engine.observe_mutations(&mutations, mirror.document());
                if out_of_band {
                    arm |= engine.note_viewport_change();
                }
                if arm && debounce_deadline.is_none() {
                    debounce_deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                }
            }
            _ = debounce => {
                debounce_deadline = None;
                if let Some(delta) = engine.flush(mirror.document()) {
                    transport.send(AgentMessage::Delta {
                        tab_id: args.tab_id,
                        removed: delta.removed,
                        added: delta.added,
                        updated: delta.updated,
                    });
                }
            }
            _ = tokio::signal::ctrl_c() => {
                transport.send(AgentMessage::Unload { tab_id: args.tab_id });
                // give the link a moment to flush the unload
                tokio::time::sleep(Duration::from_millis(100)).await;
                break;
            }
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    AgentInbound::RequestSnapshot => {
                        let candidates = engine.snapshot(mirror.document());
                        let viewport = mirror.document().viewport();
                        let url = mirror.document().url().to_string();
                        transport.send(AgentMessage::Snapshot {
                            tab_id: args.tab_id,
                            url,
                            viewport,
                            candidates,
                        });
                    }
                    AgentInbound::Command(command) => {
                        let ack = Executor::new(mirror.document_mut(), &mut engine)
                            .execute(&command)
                            .await;
                        let events = mirror.document_mut().take_events();
                        forward_input(&cdp, &events).await;
                        transport.send(AgentMessage::Ack(ack));
                        // Surface the command's effects without waiting for
                        // the next capture tick.
                        mirror.document_mut().take_mutations();
                        if let Some(delta) = engine.force_update(mirror.document()) {
                            transport.send(AgentMessage::Delta {
                                tab_id: args.tab_id,
                                removed: delta.removed,
                                added: delta.added,
                                updated: delta.updated,
                            });
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Replay the executor's synthesized event journal through the browser's
/// Input domain. Derived events (click, change, focus) are synthesized by
/// the browser itself from the press/release pairs.
async fn forward_input(cdp: &CdpClient, events: &[SyntheticEvent]) {
    for event in events {
        let result = match event.kind.as_str() {
            "mousedown" | "mouseup" => {
                cdp.dispatch_mouse(&event.kind, event.x, event.y, event.button, event.detail.max(1))
                    .await
            }
            "mousemove" => {
                cdp.dispatch_mouse(&event.kind, event.x, event.y, event.button, 0)
                    .await
            }
            "keydown" | "keyup" => match &event.key {
                Some(key) => cdp.dispatch_key(&event.kind, key).await,
                None => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("Input forwarding failed for {}: {}", event.kind, e);
        }
    }
}
