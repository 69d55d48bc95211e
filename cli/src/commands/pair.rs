//! Pair and unpair command implementations.

use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use hypo_core::clipboard::ArboardPasteboard;
use hypo_core::pairing::PairingManager;
use hypo_core::{Config, DeviceId, HypoService, MemoryHistory, ServiceEvent};

use crate::ui::print_qr_code;

#[derive(Subcommand)]
pub enum PairMode {
    /// Display this device's pairing QR code and wait for a scan
    Qr,
    /// Pair from a scanned QR string
    Scan {
        /// The hypo://pair#... string
        qr: String,
    },
    /// Create a remote 6-digit pairing code via the relay
    Code,
    /// Claim a remote 6-digit pairing code
    Claim {
        /// The 6-digit code shown on the other device
        code: String,
    },
    /// Pair with a LAN-discovered device by id
    Lan {
        /// The peer's device id
        device_id: String,
    },
}

/// Deadline for a pairing attempt driven from the CLI
const PAIR_WAIT: Duration = Duration::from_secs(120);

/// Run one pairing flow to completion.
pub async fn pair(config: Config, mode: PairMode) -> anyhow::Result<()> {
    let mut service = HypoService::new(
        config,
        Arc::new(ArboardPasteboard),
        Arc::new(MemoryHistory::new()),
    )?;
    let mut events = service.start().await?;

    match mode {
        PairMode::Qr => {
            let payload = service.qr_payload().await?;
            let qr = PairingManager::qr_string(&payload)?;
            println!("\n\x1b[1;33mScan this QR code on the other device:\x1b[0m\n");
            print_qr_code(&qr);
            println!("\n\x1b[2mOr enter manually: {}\x1b[0m\n", qr);
            wait_for_completion(&mut events).await
        }
        PairMode::Scan { qr } => {
            service.pair_via_qr(&qr).await?;
            println!("\x1b[1;32m✓\x1b[0m Paired.");
            Ok(())
        }
        PairMode::Code => {
            let grant = service.create_remote_code().await?;
            println!(
                "\n\x1b[1mPairing code:\x1b[0m \x1b[1;33m{}\x1b[0m (expires {})",
                grant.code, grant.expires_at
            );
            println!("\x1b[2mEnter this code on the other device.\x1b[0m\n");
            wait_for_completion(&mut events).await
        }
        PairMode::Claim { code } => {
            service.pair_via_code(&code).await?;
            println!("\x1b[1;32m✓\x1b[0m Paired.");
            Ok(())
        }
        PairMode::Lan { device_id } => {
            let peer = DeviceId::normalize(&device_id)?;
            // Give the browser a moment to resolve the peer
            tokio::time::sleep(Duration::from_secs(2)).await;
            service.pair_lan_auto(&peer).await?;
            println!("\x1b[1;32m✓\x1b[0m Paired.");
            Ok(())
        }
    }
}

async fn wait_for_completion(
    events: &mut tokio::sync::mpsc::Receiver<ServiceEvent>,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + PAIR_WAIT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("no device paired within {:?}", PAIR_WAIT);
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(ServiceEvent::PairingCompleted {
                device_id,
                device_name,
            })) => {
                println!(
                    "\x1b[1;32m✓\x1b[0m Paired with \x1b[1m{}\x1b[0m ({})",
                    device_name, device_id
                );
                return Ok(());
            }
            Ok(Some(ServiceEvent::PairingFailed { reason })) => {
                anyhow::bail!("pairing failed: {}", reason);
            }
            Ok(Some(_)) => continue,
            Ok(None) => anyhow::bail!("service stopped"),
            Err(_) => anyhow::bail!("no device paired within {:?}", PAIR_WAIT),
        }
    }
}

/// Remove a paired device.
pub async fn unpair(config: Config, device_id: &str) -> anyhow::Result<()> {
    let peer = DeviceId::normalize(device_id)?;
    let mut service = HypoService::new(
        config,
        Arc::new(ArboardPasteboard),
        Arc::new(MemoryHistory::new()),
    )?;
    let _events = service.start().await?;

    service.unpair(&peer).await?;
    println!("\x1b[1;32m✓\x1b[0m Unpaired {}", peer);
    Ok(())
}
