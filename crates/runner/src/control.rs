//! Parent/child control channel and instance environment.
//!
//! The parent writes one command per line to the child's stdin. The child
//! answers liveness checks on stdout with a `PONG` line; any other stdout
//! line is treated as output to forward.

use std::env;

/// Zero-based index of the instance, set on every child.
pub const INSTANCE_INDEX_ENV: &str = "FLOWLINE_INSTANCE_INDEX";
/// Number of instances the parent runs.
pub const INSTANCE_COUNT_ENV: &str = "FLOWLINE_INSTANCE_COUNT";

pub const STOP_COMMAND: &str = "STOP";
pub const PING_COMMAND: &str = "PING";
pub const PONG_PREFIX: &str = "PONG";

/// Whether this process was launched by a [`crate::ProcessRunner`].
pub fn is_child_process() -> bool {
    instance_index().is_some()
}

pub fn instance_index() -> Option<usize> {
    env_usize(INSTANCE_INDEX_ENV)
}

pub fn instance_count() -> Option<usize> {
    env_usize(INSTANCE_COUNT_ENV)
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok()?.trim().parse().ok()
}

/// Format a liveness answer.
pub fn pong_line(alive: bool) -> String {
    format!("{PONG_PREFIX} {alive}")
}

/// Parse a liveness answer, `None` if `line` is not one.
pub fn parse_pong(line: &str) -> Option<bool> {
    let rest = line.trim().strip_prefix(PONG_PREFIX)?;
    match rest.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
