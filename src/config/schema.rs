use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Gateway listen settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Command admission policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Agent transport settings
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen host for the websocket/HTTP surface
    #[serde(default = "default_host")]
    pub listen_host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub listen_port: u16,

    /// Remote-debugging port of the browser process
    #[serde(default = "default_remote_debug_port")]
    pub remote_debug_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: default_host(),
            listen_port: default_port(),
            remote_debug_port: default_remote_debug_port(),
        }
    }
}

/// Domain admission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainMode {
    Allowlist,
    Blocklist,
    #[default]
    All,
}

/// Pre-execution admission policy. Mutable at runtime via `GET/POST /policy`;
/// field names are camelCase because this struct crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default)]
    pub domain_mode: DomainMode,

    #[serde(default)]
    pub domain_list: Vec<String>,

    #[serde(default = "default_true")]
    pub block_payment_actions: bool,

    #[serde(default = "default_true")]
    pub block_delete_actions: bool,

    /// Reserved; not yet enforced.
    #[serde(default)]
    pub require_user_present: bool,

    #[serde(default = "default_max_per_second")]
    pub max_commands_per_second: u32,

    #[serde(default = "default_max_per_minute")]
    pub max_commands_per_minute: u32,

    #[serde(default = "default_true")]
    pub log_all_commands: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            domain_mode: DomainMode::All,
            domain_list: Vec::new(),
            block_payment_actions: true,
            block_delete_actions: true,
            require_user_present: false,
            max_commands_per_second: default_max_per_second(),
            max_commands_per_minute: default_max_per_minute(),
            log_all_commands: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Gateway agent-endpoint URL
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Wait between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Offline-queue length that triggers the backpressure trim
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            backpressure_threshold: default_backpressure_threshold(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9333
}

fn default_remote_debug_port() -> u16 {
    9222
}

fn default_true() -> bool {
    true
}

fn default_max_per_second() -> u32 {
    10
}

fn default_max_per_minute() -> u32 {
    300
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:9333/agent".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_backpressure_threshold() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.listen_port, 9333);
        assert_eq!(config.gateway.listen_host, "0.0.0.0");
        assert_eq!(config.gateway.remote_debug_port, 9222);
        assert_eq!(config.policy.domain_mode, DomainMode::All);
        assert!(config.policy.domain_list.is_empty());
        assert!(config.policy.block_payment_actions);
        assert!(config.policy.block_delete_actions);
        assert!(!config.policy.require_user_present);
        assert_eq!(config.policy.max_commands_per_second, 10);
        assert_eq!(config.policy.max_commands_per_minute, 300);
        assert_eq!(config.transport.reconnect_interval_ms, 2000);
        assert_eq!(config.transport.max_reconnect_attempts, 10);
        assert_eq!(config.transport.heartbeat_interval_ms, 5000);
        assert_eq!(config.transport.backpressure_threshold, 100);
    }

    #[test]
    fn policy_uses_camel_case_on_the_wire() {
        let json = serde_json::to_value(PolicyConfig::default()).unwrap();
        assert_eq!(json["domainMode"], "all");
        assert_eq!(json["maxCommandsPerMinute"], 300);
        let parsed: PolicyConfig =
            serde_json::from_str(r#"{"domainMode":"allowlist","domainList":["example.com"]}"#)
                .unwrap();
        assert_eq!(parsed.domain_mode, DomainMode::Allowlist);
        assert!(parsed.block_payment_actions);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            listen_port = 9400
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.listen_port, 9400);
        assert_eq!(config.gateway.remote_debug_port, 9222);
        assert_eq!(config.policy.max_commands_per_second, 10);
    }
}
