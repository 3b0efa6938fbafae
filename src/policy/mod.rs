//! Pre-execution command admission: domain allow/block, dual-window rate
//! limiting, and action-name pattern blocks, with structured audit records.
//!
//! The decision itself is a pure function of (config, history, now); the
//! engine wrapper owns the shared timestamp history and appends on allow.

use crate::config::{DomainMode, PolicyConfig};
use crate::protocol::Command;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Case-insensitive substrings that flag a payment action.
pub const PAYMENT_PATTERNS: &[&str] = &[
    "checkout",
    "payment",
    "purchase",
    "buy now",
    "place order",
    "confirm order",
    "submit order",
    "pay $",
];

/// Case-insensitive substrings that flag a destructive action.
pub const DELETE_PATTERNS: &[&str] = &["delete", "remove", "clear all", "destroy", "erase"];

/// Pure admission decision. `url` is the target tab's url (if the tab is
/// known), `target_name` the looked-up candidate's accessible name.
pub fn evaluate(
    config: &PolicyConfig,
    history: &VecDeque<Instant>,
    now: Instant,
    command: &Command,
    url: Option<&str>,
    target_name: Option<&str>,
) -> Result<(), String> {
    check_domain(config, url)?;
    check_rate(config, history, now)?;
    check_action_name(config, command, target_name)?;
    Ok(())
}

fn check_domain(config: &PolicyConfig, url: Option<&str>) -> Result<(), String> {
    match config.domain_mode {
        DomainMode::All => Ok(()),
        DomainMode::Allowlist => {
            let url = url.unwrap_or("");
            if host_matches_any(url, &config.domain_list) {
                Ok(())
            } else {
                Err(format!("Domain not allowed: {}", url))
            }
        }
        DomainMode::Blocklist => {
            let url = url.unwrap_or("");
            if host_matches_any(url, &config.domain_list) {
                Err(format!("Domain blocked: {}", url))
            } else {
                Ok(())
            }
        }
    }
}

/// Host equality or subdomain match against any list entry. Malformed urls
/// never match (fail closed under allowlist).
fn host_matches_any(url_str: &str, list: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url_str) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    list.iter().any(|entry| {
        let entry = entry.trim();
        !entry.is_empty() && (host == entry || host.ends_with(&format!(".{}", entry)))
    })
}

fn check_rate(
    config: &PolicyConfig,
    history: &VecDeque<Instant>,
    now: Instant,
) -> Result<(), String> {
    let last_minute = history
        .iter()
        .filter(|t| now.duration_since(**t) < MINUTE)
        .count();
    if last_minute >= config.max_commands_per_minute as usize {
        return Err(format!(
            "Rate limit exceeded: {} commands per minute",
            config.max_commands_per_minute
        ));
    }
    let last_second = history
        .iter()
        .filter(|t| now.duration_since(**t) < SECOND)
        .count();
    if last_second >= config.max_commands_per_second as usize {
        return Err(format!(
            "Rate limit exceeded: {} commands per second",
            config.max_commands_per_second
        ));
    }
    Ok(())
}

/// Payment/delete name patterns apply only to click and type, and only when
/// the target candidate's name is known.
fn check_action_name(
    config: &PolicyConfig,
    command: &Command,
    target_name: Option<&str>,
) -> Result<(), String> {
    if !matches!(command, Command::Click { .. } | Command::Type { .. }) {
        return Ok(());
    }
    let Some(name) = target_name else {
        return Ok(());
    };
    let lower = name.to_lowercase();
    if config.block_payment_actions && PAYMENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Err(format!("Blocked payment action: {}", name));
    }
    if config.block_delete_actions && DELETE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Err(format!("Blocked delete action: {}", name));
    }
    Ok(())
}

/// Rate-limit window counts, for the status surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateCounters {
    pub last_second: usize,
    pub last_minute: usize,
}

/// Stateful wrapper owning the shared, append-only timestamp history.
#[derive(Default)]
pub struct PolicyEngine {
    history: VecDeque<Instant>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the ordered checks; on allow, record the command in the history.
    pub fn check(
        &mut self,
        config: &PolicyConfig,
        command: &Command,
        url: Option<&str>,
        target_name: Option<&str>,
    ) -> Result<(), String> {
        let now = Instant::now();
        self.prune(now);
        evaluate(config, &self.history, now, command, url, target_name)?;
        self.history.push_back(now);
        Ok(())
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.history.front() {
            if now.duration_since(*front) >= MINUTE {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn counters(&self) -> RateCounters {
        let now = Instant::now();
        RateCounters {
            last_second: self
                .history
                .iter()
                .filter(|t| now.duration_since(**t) < SECOND)
                .count(),
            last_minute: self
                .history
                .iter()
                .filter(|t| now.duration_since(**t) < MINUTE)
                .count(),
        }
    }
}

/// One structured audit line per permitted command and per failure.
pub fn audit(
    config: &PolicyConfig,
    command_id: &str,
    kind: &str,
    tab_id: u64,
    outcome: &str,
    reason: Option<&str>,
) {
    if !config.log_all_commands {
        return;
    }
    tracing::info!(
        target: "audit",
        timestamp = %chrono::Utc::now().to_rfc3339(),
        command_id,
        kind,
        tab_id,
        outcome,
        reason = reason.unwrap_or(""),
    );
}
