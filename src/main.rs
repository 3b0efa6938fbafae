use clap::Parser;
use pagelens_lib::config;
use pagelens_lib::gateway;
use pagelens_lib::state::GatewayState;
use std::path::PathBuf;
use std::sync::Arc;

/// Browser perception and control plane gateway.
#[derive(Parser, Debug)]
#[command(name = "pagelens", version)]
struct Args {
    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Remote-debugging port of the browser (overrides config)
    #[arg(long = "cdp-port")]
    cdp_port: Option<u16>,

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

    // Never overwrite an existing (broken) config file; run on defaults.
    let mut app_config = match args.config.as_ref() {
        Some(path) => config::load_config_from(path)?,
        None => match config::load_config() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to load config: {}. Using in-memory defaults.", e);
                config::AppConfig::default()
            }
        },
    };
    if let Some(host) = args.host {
        app_config.gateway.listen_host = host;
    }
    if let Some(port) = args.port {
        app_config.gateway.listen_port = port;
    }
    if let Some(cdp_port) = args.cdp_port {
        app_config.gateway.remote_debug_port = cdp_port;
    }

    let host = app_config.gateway.listen_host.clone();
    let port = app_config.gateway.listen_port;
    let state = Arc::new(GatewayState::new(
        app_config.gateway.clone(),
        app_config.policy.clone(),
    ));

    gateway::run_server(state, &host, port).await?;
    Ok(())
}
