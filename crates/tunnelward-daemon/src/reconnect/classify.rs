//! Failure classification for client exits.

use super::types::FailureClass;

/// Output fragments that mean retrying cannot help.
const FATAL_PATTERNS: &[&str] = &[
    "authentication failed",
    "authorization failed",
    "unauthorized",
    "invalid token",
    "token mismatch",
    "invalid config",
    "invalid configuration",
    "unknown flag",
    "proxy name already in use",
];

/// Output fragments that point at the relay being unreachable.
const UNREACHABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "i/o timeout",
    "no such host",
    "network is unreachable",
    "network unreachable",
    "connection reset",
    "dial tcp",
    "login to server failed",
    "login to the server failed",
];

/// Classify a process exit from its exit code and last output lines.
///
/// Exit codes 126/127 (not executable / not found) are fatal. Otherwise the
/// output decides; anything unrecognized, including signal termination, is
/// transient.
pub fn classify_exit(exit_code: Option<i32>, output_tail: &[String]) -> FailureClass {
    if matches!(exit_code, Some(126 | 127)) {
        return FailureClass::Fatal;
    }
    let output = output_tail.join("\n").to_ascii_lowercase();
    if FATAL_PATTERNS.iter().any(|p| output.contains(p)) {
        FailureClass::Fatal
    } else if UNREACHABLE_PATTERNS.iter().any(|p| output.contains(p)) {
        FailureClass::ServerUnreachable
    } else {
        FailureClass::Transient
    }
}
