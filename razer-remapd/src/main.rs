//! Razer Remap Daemon - Main Entry Point
//!
//! Grabs the configured devices, remaps their events onto a virtual device
//! and shuts down cleanly on SIGINT/SIGTERM. SIGHUP reloads the active profile.

use clap::{Parser, Subcommand};
use razer_remap_common::{tracing, MacroAction};
use razer_remapd::config::{ConfigManager, ProfileStore};
use razer_remapd::daemon::{self, DaemonServices};
use razer_remapd::device::{DeviceMux, DeviceRegistry, SystemDeviceRegistry};
use razer_remapd::recorder::{self, MacroRecorder};
use razer_remapd::{ControlFlags, RemapDaemon};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "razer-remapd", version, about = "Input remapping daemon for Razer devices")]
struct Cli {
    /// Configuration directory (default: ~/.config/razer-remap)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Switch profiles based on the focused application
    #[arg(long)]
    app_watcher: bool,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Record a macro from one device until Ctrl+C
    Record {
        /// Stable device id or /dev/input/event* path
        #[arg(long)]
        device: String,

        #[arg(long)]
        macro_id: String,

        #[arg(long)]
        name: Option<String>,

        /// Profile to store the macro in (default: the active profile)
        #[arg(long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config_manager = ConfigManager::new(cli.config_dir.clone().unwrap_or_else(ConfigManager::default_dir)).await?;
    config_manager.load_config().await?;

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        config_manager.config().log_level()
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if cli.list_devices {
        let registry = SystemDeviceRegistry::new(&config_manager.config().devices);
        print!("{}", daemon::device_listing(&registry.scan()));
        return Ok(());
    }

    match cli.command {
        Some(Command::Record { device, macro_id, name, profile }) => {
            record(&config_manager, &device, &macro_id, name, profile.as_deref()).await
        }
        None => run_daemon(&config_manager, cli.app_watcher).await,
    }
}

async fn run_daemon(config_manager: &ConfigManager, app_watcher: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting Razer Remap Daemon v{}", env!("CARGO_PKG_VERSION"));

    let services = DaemonServices::system(config_manager);
    let mut daemon = RemapDaemon::new(config_manager.config().clone(), services, tokio::runtime::Handle::current())
        .with_app_watcher(app_watcher);

    if let Err(e) = daemon.setup().await {
        error!("Setup failed: {}", e);
        if let Some(hint) = e.remediation() {
            eprintln!("{}", hint);
        }
        daemon.cleanup();
        std::process::exit(1);
    }

    forward_signals(daemon.flags())?;

    // The read loop blocks; keep it off the async workers
    let result = tokio::task::spawn_blocking(move || {
        let result = daemon.run();
        daemon.cleanup();
        result
    })
    .await?;

    if let Err(e) = result {
        error!("Daemon loop failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn record(
    config_manager: &ConfigManager,
    device: &str,
    macro_id: &str,
    name: Option<String>,
    profile: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config_manager.config().clone();
    let registry = SystemDeviceRegistry::new(&config.devices);

    let mut mux = DeviceMux::new()?;
    mux.add(registry.open(device)?)?;
    info!("Recording from {}. Press Ctrl+C to stop.", device);

    let flags = ControlFlags::default();
    forward_signals(flags.clone())?;

    let mut recorder = MacroRecorder::new(config.macro_engine.record_min_delay_ms);
    let timeout = config.daemon.poll_timeout_ms;
    let recorder = tokio::task::spawn_blocking(move || {
        recorder::record_session(&mut mux, &mut recorder, timeout, || flags.should_stop()).map(|()| recorder)
    })
    .await??;

    let mut recorder = recorder;
    let steps = recorder.finish();
    if steps.is_empty() {
        warn!("Nothing recorded, profile left unchanged");
        return Ok(());
    }

    let name = name.unwrap_or_else(|| macro_id.to_string());
    let store = config_manager.profile_store();
    let saved = daemon::store_recorded_macro(&store, profile, MacroAction::new(macro_id, &name, steps))?;
    println!("Saved macro '{}' to profile '{}'", macro_id, saved.id);

    if store.get_active_profile_id()?.as_deref() == Some(saved.id.as_str()) {
        info!("Send SIGHUP to a running razer-remapd to pick up the new macro");
    }
    Ok(())
}

/// SIGINT/SIGTERM request a stop, SIGHUP a reload of the active profile
fn forward_signals(flags: ControlFlags) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    flags.request_stop();
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    flags.request_stop();
                }
                _ = hangup.recv() => {
                    info!("Received SIGHUP, reloading active profile");
                    flags.request_reload();
                }
            }
        }
    });
    Ok(())
}
