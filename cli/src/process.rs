//! Process management utilities.

use std::process::Command;

/// Process name pattern matched when cleaning up stale instances
const PROCESS_PATTERN: &str = "hypo";

/// Kill any previously running hypo instances so the LAN port and mDNS
/// instance name are free for this one.
pub fn kill_previous_instances() {
    let my_pid = std::process::id();

    let Ok(output) = Command::new("pgrep").args(["-f", PROCESS_PATTERN]).output() else {
        return;
    };

    let stale: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != my_pid)
        .collect();

    if stale.is_empty() {
        return;
    }

    for pid in &stale {
        let _ = Command::new("kill").args(["-9", &pid.to_string()]).output();
    }
    tracing::debug!(count = stale.len(), "killed stale instances");

    // Brief pause to let the OS release the port
    std::thread::sleep(std::time::Duration::from_millis(100));
}
