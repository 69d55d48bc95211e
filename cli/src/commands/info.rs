//! Info command implementation.

use std::sync::Arc;

use hypo_core::clipboard::ArboardPasteboard;
use hypo_core::{Config, HypoService, MemoryHistory};

/// Display device information.
pub async fn show_info(config: Config) -> anyhow::Result<()> {
    let service = HypoService::new(
        config,
        Arc::new(ArboardPasteboard),
        Arc::new(MemoryHistory::new()),
    )?;

    println!("\n\x1b[1mHypo Device Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mName:\x1b[0m        {}", service.device_name());
    println!("\x1b[1mID:\x1b[0m          {}", service.device_id());
    println!("\x1b[1mFingerprint:\x1b[0m {}", service.fingerprint().await);

    let paired = service.paired_devices().await;
    if !paired.is_empty() {
        println!("\n\x1b[1mPaired devices:\x1b[0m");
        for id in paired {
            println!("  • {}", id);
        }
    }

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in hypo_core::discovery::get_local_ips() {
        println!("  • {}", ip);
    }
    println!();
    Ok(())
}
