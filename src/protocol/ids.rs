//! Identifier generators.
//!
//! Command ids are `cmd_<ms-since-epoch>_<4-char-base36>` and are unique
//! within an agent session. Element ids (`a_<base36>` / `e_<dom-id>`) are
//! assigned by the perception engine's identity registry.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lowercase base36 rendering of `n`.
pub fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ASCII")
}

/// Generate a fresh command id: `cmd_<ms>_<4-char-base36>`.
pub fn new_command_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..36)] as char)
        .collect();
    format!("cmd_{}_{}", now_ms(), suffix)
}
