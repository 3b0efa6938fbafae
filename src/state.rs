use crate::cdp::CdpClient;
use crate::config::{GatewayConfig, PolicyConfig};
use crate::policy::PolicyEngine;
use crate::protocol::CommandAck;
use crate::world::WorldState;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Outstanding commands resolve (ack, policy reject, transport failure, or
/// timeout) within this window, exactly once.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// One connected agent socket. Commands go to the first open one.
pub struct AgentHandle {
    pub id: u64,
    pub tx: UnboundedSender<String>,
}

/// One connected controller socket with its subscription filter.
pub struct ControllerHandle {
    pub id: u64,
    pub tx: UnboundedSender<String>,
    /// `None` receives everything; `Some(tab)` only that tab's telemetry.
    pub subscribed_tab_id: Option<u64>,
}

/// Where a command came from, for targeted ack delivery.
pub enum CommandOrigin {
    /// A controller websocket connection.
    Controller(u64),
    /// An HTTP `POST /command` waiter.
    Http(tokio::sync::oneshot::Sender<CommandAck>),
}

pub struct PendingCommand {
    pub tab_id: u64,
    pub kind: &'static str,
    pub origin: CommandOrigin,
    pub timeout: tokio::task::JoinHandle<()>,
}

/// Gateway-wide shared state. Handlers run on a threaded runtime, so every
/// shared structure sits behind its own lock.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub world: Mutex<WorldState>,
    pub policy: RwLock<PolicyConfig>,
    pub policy_engine: Mutex<PolicyEngine>,
    pub pending: Mutex<HashMap<String, PendingCommand>>,
    pub agents: Mutex<Vec<AgentHandle>>,
    pub controllers: Mutex<HashMap<u64, ControllerHandle>>,
    /// Lazily-attached remote-debugging client.
    pub cdp: tokio::sync::Mutex<Option<CdpClient>>,
    /// Which agent connection last claimed each tab id (last writer wins).
    pub tab_owners: Mutex<HashMap<u64, u64>>,
    pub command_timeout: Duration,
    next_conn_id: AtomicU64,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, policy: PolicyConfig) -> Self {
        Self {
            config,
            world: Mutex::new(WorldState::new()),
            policy: RwLock::new(policy),
            policy_engine: Mutex::new(PolicyEngine::new()),
            pending: Mutex::new(HashMap::new()),
            agents: Mutex::new(Vec::new()),
            controllers: Mutex::new(HashMap::new()),
            cdp: tokio::sync::Mutex::new(None),
            tab_owners: Mutex::new(HashMap::new()),
            command_timeout: COMMAND_TIMEOUT,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Shortened command timeout for tests.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sender for the first open agent socket, if any.
    pub fn first_agent(&self) -> Option<UnboundedSender<String>> {
        self.agents.lock().first().map(|a| a.tx.clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Fan out one frame to every controller whose subscription is unset or
    /// matches `tab_id`.
    pub fn broadcast_to_subscribers(&self, tab_id: Option<u64>, text: &str) {
        let controllers = self.controllers.lock();
        for c in controllers.values() {
            let wanted = match (c.subscribed_tab_id, tab_id) {
                (None, _) => true,
                (Some(sub), Some(tab)) => sub == tab,
                (Some(_), None) => true,
            };
            if wanted {
                let _ = c.tx.send(text.to_string());
            }
        }
    }

    /// Send one frame to one controller connection, if still present.
    pub fn send_to_controller(&self, conn_id: u64, text: &str) -> bool {
        let controllers = self.controllers.lock();
        match controllers.get(&conn_id) {
            Some(c) => c.tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Subscription filter of one controller, if connected.
    pub fn subscription_of(&self, conn_id: u64) -> Option<Option<u64>> {
        self.controllers.lock().get(&conn_id).map(|c| c.subscribed_tab_id)
    }
}
