use std::path::PathBuf;
use thiserror::Error;

/// Errors acquiring or reading a physical input device
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{0}' not found")]
    NotFound(String),
    #[error("permission denied opening {path}: add your user to the 'input' group or run as root")]
    PermissionDenied { path: PathBuf },
    #[error("device {path} unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read error on device '{stable_id}': {source}")]
    Read {
        stable_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors writing to the virtual output device
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to create virtual device: {0}")]
    Create(#[source] std::io::Error),
    #[error("failed to write to virtual device: {0}")]
    Write(#[source] std::io::Error),
    #[error("virtual device is closed")]
    Closed,
}

/// Errors from the profile store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile '{0}' not found")]
    NotFound(String),
    #[error("profile store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize profile: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Fatal errors surfaced to the process wrapper
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("virtual output device could not be created: {0}")]
    VirtualDevice(#[source] OutputError),
    #[error("none of the configured input devices could be grabbed")]
    NoDevicesGrabbed,
    #[error("active profile '{0}' has no input devices configured")]
    NoInputDevicesConfigured(String),
    #[error("device multiplexer error: {0}")]
    Multiplexer(#[from] nix::Error),
}

impl DaemonError {
    /// Actionable hint printed alongside a startup failure
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            DaemonError::VirtualDevice(_) => Some(
                "Make sure the uinput module is loaded (sudo modprobe uinput) and /dev/uinput is writable.",
            ),
            DaemonError::NoDevicesGrabbed => Some(
                "Check that the devices are connected and that you are in the 'input' group (sudo usermod -aG input $USER).",
            ),
            DaemonError::NoInputDevicesConfigured(_) => Some(
                "Add stable device ids to the profile's input_devices (see razer-remapd --list-devices).",
            ),
            DaemonError::Multiplexer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_failures_carry_remediation() {
        let uinput = DaemonError::VirtualDevice(OutputError::Create(std::io::Error::from_raw_os_error(2)));
        assert!(uinput.remediation().unwrap().contains("modprobe uinput"));
        assert!(DaemonError::NoDevicesGrabbed.remediation().unwrap().contains("'input' group"));
        assert!(DaemonError::NoInputDevicesConfigured("chord".to_string())
            .remediation()
            .unwrap()
            .contains("--list-devices"));

        let mux: DaemonError = nix::Error::EBADF.into();
        assert!(mux.remediation().is_none());
        assert!(mux.to_string().starts_with("device multiplexer error"));
    }
}
