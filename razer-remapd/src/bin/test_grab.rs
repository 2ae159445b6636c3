//! Simple CLI tool to test device grabbing and event reading
//! Usage: cargo run --bin test_grab -- <stable-id|/dev/input/eventX>

use evdev::EventType;
use razer_remap_common::{keymap, tracing};
use razer_remapd::config::DeviceSettings;
use razer_remapd::device::{DeviceMux, DeviceRegistry, SystemDeviceRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <stable-id|device_path>", args[0]);
        eprintln!("Example: {} usb-Razer_Razer_Naga_Trinity-event-mouse", args[0]);
        eprintln!("\nThis tool will:");
        eprintln!("  1. Grab the specified device exclusively (EVIOCGRAB)");
        eprintln!("  2. Print all key events from that device by name");
        eprintln!("  3. Press Ctrl+C to exit and ungrab");
        std::process::exit(1);
    }

    let target = &args[1];
    let registry = SystemDeviceRegistry::new(&DeviceSettings::default());

    let device = match registry.open(target) {
        Ok(device) => device,
        Err(e) => {
            error!("{}", e);
            error!("Available devices:");
            for device in registry.scan() {
                error!("  {} ({})", device.stable_id, device.name);
            }
            std::process::exit(1);
        }
    };

    let mut mux = DeviceMux::new()?;
    mux.add(device)?;
    info!("Device grabbed successfully! Events from this device are now intercepted.");
    info!("Press keys on the device - they will appear here but NOT in other applications.");
    info!("Press Ctrl+C to exit and release the device.");

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cleaning up...");
            stop_flag.store(true, Ordering::SeqCst);
        }
    });

    let reader = tokio::task::spawn_blocking(move || -> Result<(), nix::Error> {
        while !stop.load(Ordering::SeqCst) && !mux.is_empty() {
            for token in mux.wait(100)? {
                let Some(device) = mux.device_mut(token) else {
                    continue;
                };
                match device.read_batch() {
                    Ok(events) => {
                        for event in events.iter().filter(|e| e.event_type() == EventType::KEY) {
                            let action = match event.value() {
                                0 => "RELEASED",
                                1 => "PRESSED",
                                _ => "REPEAT",
                            };
                            let name = keymap::schema_name(event.code()).unwrap_or("UNKNOWN");
                            info!("[{}] Key {} ({}) {}", device.stable_id(), event.code(), name, action);
                        }
                    }
                    Err(e) => {
                        error!("{}", e);
                        if let Some(mut device) = mux.remove(token) {
                            device.release();
                        }
                    }
                }
            }
        }

        info!("Ungrabbing device...");
        for mut device in mux.drain() {
            device.release();
        }
        Ok(())
    });

    reader.await??;
    info!("Device released. Test complete!");
    Ok(())
}
