//! Run command implementation.

use std::sync::Arc;

use hypo_core::clipboard::ArboardPasteboard;
use hypo_core::pairing::PairingManager;
use hypo_core::{Config, HypoService, MemoryHistory, ServiceEvent};

use crate::process::kill_previous_instances;
use crate::ui::{print_banner, print_qr_code};

/// Run the hypo service.
pub async fn run_service(config: Config) -> anyhow::Result<()> {
    kill_previous_instances();
    print_banner();

    let mut service = HypoService::new(
        config,
        Arc::new(ArboardPasteboard),
        Arc::new(MemoryHistory::new()),
    )?;

    println!("\x1b[1mDevice:\x1b[0m {}", service.device_name());
    println!("\x1b[1mID:\x1b[0m     {}", service.device_id());
    println!("\x1b[1mKey:\x1b[0m    {}", service.fingerprint().await);

    let mut events = service.start().await?;

    // Show the pairing QR so another device can scan straight away
    let payload = service.qr_payload().await?;
    let qr = PairingManager::qr_string(&payload)?;
    println!("\n\x1b[1;33mScan this QR code with another Hypo device to pair:\x1b[0m\n");
    print_qr_code(&qr);
    println!("\n\x1b[2mOr enter manually: {}\x1b[0m\n", qr);

    println!("\x1b[1;32m✓\x1b[0m Listening for devices and clipboard changes...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(event);
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                service.stop();
                break;
            }
        }
    }

    Ok(())
}

/// Handle a service event and print appropriate output.
fn handle_event(event: ServiceEvent) {
    match event {
        ServiceEvent::DeviceDiscovered(peer) => {
            println!("\x1b[1;32m⬤\x1b[0m Found: \x1b[1m{}\x1b[0m", peer.device_name);
            for addr in &peer.addresses {
                println!("    {}:{}", addr, peer.port);
            }
        }
        ServiceEvent::DeviceLost(name) => {
            println!("\x1b[1;31m⬤\x1b[0m Lost: {}", name);
        }
        ServiceEvent::PairingCompleted {
            device_id,
            device_name,
        } => {
            println!(
                "\x1b[1;35m⚡\x1b[0m Paired with: \x1b[1m{}\x1b[0m ({})",
                device_name, device_id
            );
        }
        ServiceEvent::PairingFailed { reason } => {
            eprintln!("\x1b[1;31m✗\x1b[0m Pairing failed: {}", reason);
        }
        ServiceEvent::ClipboardStored { item } => {
            println!("\x1b[1;34m📋\x1b[0m Copied: \"{}\"", item.preview);
        }
        ServiceEvent::ClipboardReceived {
            from_name,
            transport,
            preview,
            ..
        } => {
            println!(
                "\x1b[1;34m📋\x1b[0m Received from {} ({:?}): \"{}\"",
                from_name, transport, preview
            );
        }
        ServiceEvent::ClipboardSent {
            delivered, failed, ..
        } => {
            if delivered + failed > 0 {
                println!(
                    "\x1b[1;34m📤\x1b[0m Sent to {} device(s){}",
                    delivered,
                    if failed > 0 {
                        format!(", {} failed", failed)
                    } else {
                        String::new()
                    }
                );
            }
        }
        ServiceEvent::InboundRejected { sender, reason } => {
            eprintln!(
                "\x1b[1;31m✗\x1b[0m Could not read message from {}: {}",
                sender, reason
            );
        }
        ServiceEvent::ClipboardAccessDenied => {
            eprintln!("\x1b[1;33m!\x1b[0m Clipboard access denied by the platform");
        }
        ServiceEvent::ClipboardTooLarge { size, max } => {
            eprintln!(
                "\x1b[1;33m!\x1b[0m Clipboard content too large ({} bytes, max {})",
                size, max
            );
        }
        ServiceEvent::Error(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Error: {}", e);
        }
    }
}
