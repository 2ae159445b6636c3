//! Razer Remap Daemon Library
//!
//! Core of the remap daemon:
//! - Device discovery, exclusive grabs and the epoll read loop
//! - Layer-aware binding resolution
//! - Macro playback and recording
//! - Virtual output injection via uinput
//! - Per-application profile switching

pub mod app_watcher;
pub mod config;
pub mod daemon;
pub mod device;
pub mod engine;
pub mod error;
pub mod injector;
pub mod macro_engine;
pub mod recorder;

// Re-export common types
pub use daemon::{ControlFlags, DaemonServices, RemapDaemon};
pub use error::{DaemonError, DeviceError, OutputError, StoreError};
pub use razer_remap_common::{DeviceInfo, MacroAction, Profile};
