use evdev::{Device as EvdevDevice, InputEvent, Key, RelativeAxisType};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use razer_remap_common::{tracing, DeviceInfo};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::DeviceSettings;
use crate::error::DeviceError;

/// A grabbed physical device the read loop can drain
pub trait InputDevice: Send {
    fn stable_id(&self) -> &str;
    fn raw_fd(&self) -> RawFd;
    /// Every event queued on the device; empty when nothing is pending
    fn read_batch(&mut self) -> Result<Vec<InputEvent>, DeviceError>;
    /// Ungrab and close; further reads are invalid
    fn release(&mut self);
}

/// Maps stable device identifiers to event devices
pub trait DeviceRegistry: Send + Sync {
    fn scan(&self) -> Vec<DeviceInfo>;
    fn resolve(&self, stable_id: &str) -> Result<PathBuf, DeviceError>;
    /// Resolve, open and exclusively grab a device
    fn open(&self, stable_id: &str) -> Result<Box<dyn InputDevice>, DeviceError>;
}

/// evdev device grabbed with EVIOCGRAB and switched to non-blocking reads
pub struct EvdevInput {
    stable_id: String,
    path: PathBuf,
    device: Option<EvdevDevice>,
    fd: RawFd,
}

impl EvdevInput {
    pub fn open(stable_id: &str, path: &Path) -> Result<Self, DeviceError> {
        let mut device = EvdevDevice::open(path).map_err(|e| open_error(stable_id, path, e))?;

        info!("Grabbing device: {} ({})", device.name().unwrap_or("Unknown Device"), path.display());
        device.grab().map_err(|e| open_error(stable_id, path, e))?;

        let fd = device.as_raw_fd();
        if let Err(e) = set_nonblocking(fd) {
            warn!("Failed to set O_NONBLOCK for {}: {}", path.display(), e);
        }

        info!("Successfully grabbed device {} (fd={})", path.display(), fd);
        Ok(Self {
            stable_id: stable_id.to_string(),
            path: path.to_path_buf(),
            device: Some(device),
            fd,
        })
    }
}

impl InputDevice for EvdevInput {
    fn stable_id(&self) -> &str {
        &self.stable_id
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn read_batch(&mut self) -> Result<Vec<InputEvent>, DeviceError> {
        let device = self.device.as_mut().ok_or_else(|| DeviceError::Read {
            stable_id: self.stable_id.clone(),
            source: std::io::Error::new(ErrorKind::NotConnected, "device released"),
        })?;

        let mut batch = Vec::new();
        loop {
            match device.fetch_events() {
                Ok(events) => {
                    let before = batch.len();
                    batch.extend(events);
                    if batch.len() == before {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DeviceError::Read {
                        stable_id: self.stable_id.clone(),
                        source,
                    })
                }
            }
        }
        Ok(batch)
    }

    fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            match device.ungrab() {
                Ok(()) => info!("Successfully ungrabbed device {}", self.path.display()),
                Err(e) => warn!("Failed to ungrab device {}: {}", self.path.display(), e),
            }
        }
    }
}

impl Drop for EvdevInput {
    fn drop(&mut self) {
        self.release();
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), nix::Error> {
    let current = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(current | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn open_error(stable_id: &str, path: &Path, e: std::io::Error) -> DeviceError {
    match e.kind() {
        ErrorKind::NotFound => DeviceError::NotFound(stable_id.to_string()),
        ErrorKind::PermissionDenied => DeviceError::PermissionDenied { path: path.to_path_buf() },
        _ => DeviceError::Unavailable { path: path.to_path_buf(), source: e },
    }
}

/// Registry over the udev symlink directories; the link name is the stable id
pub struct SystemDeviceRegistry {
    link_dirs: Vec<PathBuf>,
}

impl SystemDeviceRegistry {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            link_dirs: vec![settings.by_id_dir.clone(), settings.by_path_dir.clone()],
        }
    }

    /// `(stable_id, event path)` for every link that targets an event device
    fn links(&self) -> Vec<(String, PathBuf)> {
        let mut links = Vec::new();

        for dir in &self.link_dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let Ok(target) = fs::canonicalize(entry.path()) else {
                    continue;
                };
                let is_event = target
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.starts_with("event"));
                if is_event {
                    links.push((name, target));
                }
            }
        }

        links.sort();
        links
    }

    fn probe(stable_id: String, event_path: PathBuf) -> DeviceInfo {
        match EvdevDevice::open(&event_path) {
            Ok(device) => DeviceInfo {
                stable_id,
                name: device.name().unwrap_or("Unknown Device").to_string(),
                is_mouse: device
                    .supported_relative_axes()
                    .is_some_and(|axes| axes.contains(RelativeAxisType::REL_X)),
                is_keyboard: device
                    .supported_keys()
                    .is_some_and(|keys| keys.contains(Key::KEY_A)),
                event_path,
            },
            Err(e) => {
                debug!("Could not open {} for probing: {}", event_path.display(), e);
                DeviceInfo {
                    stable_id,
                    name: "Unknown Device".to_string(),
                    event_path,
                    is_mouse: false,
                    is_keyboard: false,
                }
            }
        }
    }
}

impl DeviceRegistry for SystemDeviceRegistry {
    fn scan(&self) -> Vec<DeviceInfo> {
        self.links()
            .into_iter()
            .map(|(stable_id, path)| Self::probe(stable_id, path))
            .collect()
    }

    fn resolve(&self, stable_id: &str) -> Result<PathBuf, DeviceError> {
        let direct = Path::new(stable_id);
        if direct.is_absolute() {
            return if direct.exists() {
                Ok(direct.to_path_buf())
            } else {
                Err(DeviceError::NotFound(stable_id.to_string()))
            };
        }

        self.link_dirs
            .iter()
            .map(|dir| dir.join(stable_id))
            .find_map(|link| fs::canonicalize(link).ok())
            .ok_or_else(|| DeviceError::NotFound(stable_id.to_string()))
    }

    fn open(&self, stable_id: &str) -> Result<Box<dyn InputDevice>, DeviceError> {
        let path = self.resolve(stable_id)?;
        Ok(Box::new(EvdevInput::open(stable_id, &path)?))
    }
}

/// epoll set over the grabbed devices; each device is keyed by a token
pub struct DeviceMux {
    epoll: Epoll,
    devices: HashMap<u64, Box<dyn InputDevice>>,
    next_token: u64,
}

impl DeviceMux {
    pub fn new() -> Result<Self, nix::Error> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            devices: HashMap::new(),
            next_token: 0,
        })
    }

    pub fn add(&mut self, device: Box<dyn InputDevice>) -> Result<u64, nix::Error> {
        let token = self.next_token;
        // The device owns the fd and outlives its registration
        let fd = unsafe { BorrowedFd::borrow_raw(device.raw_fd()) };
        self.epoll.add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))?;

        self.next_token += 1;
        self.devices.insert(token, device);
        Ok(token)
    }

    /// Tokens of readable devices; empty on timeout or signal interruption
    pub fn wait(&self, timeout_ms: u16) -> Result<Vec<u64>, nix::Error> {
        let mut events = [EpollEvent::empty(); 16];
        let ready = match self.epoll.wait(&mut events, timeout_ms) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => 0,
            Err(e) => return Err(e),
        };

        Ok(events[..ready].iter().map(|ev| ev.data()).collect())
    }

    pub fn device_mut(&mut self, token: u64) -> Option<&mut Box<dyn InputDevice>> {
        self.devices.get_mut(&token)
    }

    /// Unregister a device and hand it back to the caller
    pub fn remove(&mut self, token: u64) -> Option<Box<dyn InputDevice>> {
        let device = self.devices.remove(&token)?;
        let fd = unsafe { BorrowedFd::borrow_raw(device.raw_fd()) };
        if let Err(e) = self.epoll.delete(fd) {
            debug!("epoll delete for {} failed: {}", device.stable_id(), e);
        }
        Some(device)
    }

    /// Remove every device, in registration order
    pub fn drain(&mut self) -> Vec<Box<dyn InputDevice>> {
        let mut tokens: Vec<u64> = self.devices.keys().copied().collect();
        tokens.sort_unstable();
        tokens.into_iter().filter_map(|t| self.remove(t)).collect()
    }

    pub fn stable_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.values().map(|d| d.stable_id().to_string()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
