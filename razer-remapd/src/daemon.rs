//! The remap daemon: owns grabbed devices, the virtual output and the engine,
//! runs the read loop and tears everything down in a fixed order.

use razer_remap_common::{tracing, DeviceInfo, Profile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::app_watcher::{self, AppWatcher, ProfileMatcher, SessionEnv, WindowBackend};
use crate::config::{ConfigManager, DaemonConfig, FileProfileStore, ProfileStore};
use crate::device::{DeviceMux, DeviceRegistry, SystemDeviceRegistry};
use crate::engine::RemapEngine;
use crate::error::{DaemonError, OutputError, StoreError};
use crate::injector::{EventSink, UinputSink, VirtualOutput};
use crate::macro_engine::MacroPlayer;

/// Builds the sink behind the virtual output device
pub type OutputFactory = Box<dyn Fn(&DaemonConfig) -> Result<Box<dyn EventSink>, OutputError> + Send + Sync>;

/// Collaborators the daemon is constructed with
pub struct DaemonServices {
    pub store: Arc<dyn ProfileStore>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub output_factory: OutputFactory,
    pub window_backends: Vec<Arc<dyn WindowBackend>>,
}

impl DaemonServices {
    /// Real store, udev registry, uinput output and desktop backends
    pub fn system(config: &ConfigManager) -> Self {
        let store: FileProfileStore = config.profile_store();
        Self {
            store: Arc::new(store),
            registry: Arc::new(SystemDeviceRegistry::new(&config.config().devices)),
            output_factory: Box::new(|config: &DaemonConfig| {
                let sink = UinputSink::create(&config.daemon.virtual_device_name)?;
                Ok(Box::new(sink) as Box<dyn EventSink>)
            }),
            window_backends: app_watcher::default_backends(&SessionEnv::from_env()),
        }
    }
}

/// Requests raised by signal handlers and consumed by the read loop
#[derive(Clone, Default)]
pub struct ControlFlags {
    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

pub struct RemapDaemon {
    config: DaemonConfig,
    services: DaemonServices,
    runtime: Handle,
    flags: ControlFlags,
    enable_app_watcher: bool,
    output: Option<VirtualOutput>,
    engine: Option<RemapEngine>,
    mux: Option<DeviceMux>,
    watcher: Option<AppWatcher>,
    switch_tx: UnboundedSender<Profile>,
    switch_rx: UnboundedReceiver<Profile>,
    accepting_switches: Arc<AtomicBool>,
    cleaned_up: bool,
}

impl RemapDaemon {
    pub fn new(config: DaemonConfig, services: DaemonServices, runtime: Handle) -> Self {
        let (switch_tx, switch_rx) = mpsc::unbounded_channel();
        Self {
            enable_app_watcher: config.app_watcher.enabled,
            config,
            services,
            runtime,
            flags: ControlFlags::default(),
            output: None,
            engine: None,
            mux: None,
            watcher: None,
            switch_tx,
            switch_rx,
            accepting_switches: Arc::new(AtomicBool::new(true)),
            cleaned_up: false,
        }
    }

    /// Turn the app watcher on regardless of the config file
    pub fn with_app_watcher(mut self, enabled: bool) -> Self {
        self.enable_app_watcher |= enabled;
        self
    }

    pub fn flags(&self) -> ControlFlags {
        self.flags.clone()
    }

    /// Sender for externally requested profile switches, applied by the read loop
    pub fn switch_requests(&self) -> UnboundedSender<Profile> {
        self.switch_tx.clone()
    }

    /// Load the profile, create the virtual device, grab devices and start the watcher
    pub async fn setup(&mut self) -> Result<(), DaemonError> {
        let profile = self.resolve_active_profile();
        info!("Active profile: {} ({})", profile.name, profile.id);

        if profile.input_devices.is_empty() {
            error!("No input devices configured in profile '{}'", profile.id);
            log_available_devices(&self.services.registry.scan());
            return Err(DaemonError::NoInputDevicesConfigured(profile.id));
        }

        let sink = (self.services.output_factory)(&self.config).map_err(DaemonError::VirtualDevice)?;
        let output = VirtualOutput::new(sink);
        info!("Created virtual device: {}", self.config.daemon.virtual_device_name);

        let mut mux = DeviceMux::new()?;
        for stable_id in &profile.input_devices {
            match self.services.registry.open(stable_id) {
                Ok(device) => {
                    mux.add(device)?;
                    info!("Grabbed device: {}", stable_id);
                }
                Err(e) => warn!("Skipping device {}: {}", stable_id, e),
            }
        }

        if mux.is_empty() {
            output.close();
            return Err(DaemonError::NoDevicesGrabbed);
        }

        let player = MacroPlayer::new(output.clone(), &self.config.macro_engine, self.runtime.clone());
        let active_id = profile.id.clone();
        self.engine = Some(RemapEngine::new(profile, output.clone(), player));
        self.output = Some(output);
        self.mux = Some(mux);

        if self.enable_app_watcher {
            self.start_app_watcher(active_id).await;
        }

        Ok(())
    }

    fn resolve_active_profile(&self) -> Profile {
        let store = &self.services.store;
        let profile = match store.load_active_profile() {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                info!("No active profile found. Creating default profile...");
                let profile = self.default_profile();
                if let Err(e) = store
                    .save_profile(&profile)
                    .and_then(|()| store.set_active_profile(&profile.id))
                {
                    warn!("Failed to persist default profile: {}", e);
                }
                profile
            }
            Err(e) => {
                warn!("Failed to load active profile, using defaults: {}", e);
                self.default_profile()
            }
        };
        log_profile_problems(&profile);
        profile
    }

    /// Bindings-free profile on the first Razer mouse the registry can see
    fn default_profile(&self) -> Profile {
        let mouse = self
            .services
            .registry
            .scan()
            .into_iter()
            .find(|d| d.is_mouse && d.stable_id.to_lowercase().contains("razer"));
        Profile::default_profile(mouse.map(|d| vec![d.stable_id]).unwrap_or_default())
    }

    async fn start_app_watcher(&mut self, active_id: String) {
        let mut watcher = AppWatcher::new(self.services.window_backends.clone(), &self.config.app_watcher).await;
        let matcher = ProfileMatcher::from_store(self.services.store.as_ref());

        let tx = self.switch_tx.clone();
        let accepting = Arc::clone(&self.accepting_switches);
        let started = watcher.start(matcher, Some(active_id), move |profile| {
            if accepting.load(Ordering::SeqCst) && tx.send(profile).is_err() {
                debug!("Daemon loop gone, dropping profile switch");
            }
        });

        if started {
            info!(
                "App watcher enabled (backend: {})",
                watcher.backend_name().unwrap_or("none")
            );
            self.watcher = Some(watcher);
        } else {
            warn!("App watcher could not start");
        }
    }

    /// Blocking read loop; returns when stopped or when no devices remain
    pub fn run(&mut self) -> Result<(), DaemonError> {
        if self.engine.is_none() || self.mux.as_ref().map_or(true, DeviceMux::is_empty) {
            error!("Daemon not set up");
            return Err(DaemonError::NoDevicesGrabbed);
        }

        info!("Remap daemon running. Press Ctrl+C to stop.");
        let timeout = self.config.daemon.poll_timeout_ms;

        loop {
            if self.flags.should_stop() {
                info!("Stop requested");
                break;
            }

            self.apply_pending_requests();

            let ready = match self.mux.as_ref() {
                Some(mux) => mux.wait(timeout)?,
                None => break,
            };
            self.process_ready(&ready);

            if self.mux.as_ref().map_or(true, DeviceMux::is_empty) {
                error!("All input devices were lost, stopping");
                break;
            }
        }

        Ok(())
    }

    /// Profile changes are applied here, between device batches
    fn apply_pending_requests(&mut self) {
        if self.flags.take_reload() {
            match self.services.store.load_active_profile() {
                Ok(Some(profile)) => self.reload_profile(profile),
                Ok(None) => warn!("Reload requested but no active profile is set"),
                Err(e) => warn!("Reload requested but the active profile failed to load: {}", e),
            }
        }

        while let Ok(profile) = self.switch_rx.try_recv() {
            if self.accepting_switches.load(Ordering::SeqCst) {
                self.switch_profile(profile);
            }
        }
    }

    fn process_ready(&mut self, tokens: &[u64]) {
        let (Some(mux), Some(engine)) = (self.mux.as_mut(), self.engine.as_mut()) else {
            return;
        };

        for &token in tokens {
            let Some(device) = mux.device_mut(token) else {
                continue;
            };

            match device.read_batch() {
                Ok(events) => {
                    for event in events {
                        engine.dispatch(device.stable_id(), event);
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    if let Some(mut device) = mux.remove(token) {
                        device.release();
                        engine.release_device(device.stable_id());
                        warn!("Removed device {}, {} remaining", device.stable_id(), mux.len());
                    }
                }
            }
        }
    }

    /// Persist `profile` as active, then rebind the engine
    pub fn switch_profile(&mut self, profile: Profile) {
        if let Err(e) = self.services.store.set_active_profile(&profile.id) {
            warn!("Failed to persist active profile {}: {}", profile.id, e);
        }
        info!("Switched to profile: {}", profile.name);
        self.reload_profile(profile);
    }

    pub fn reload_profile(&mut self, profile: Profile) {
        let Some(engine) = self.engine.as_mut() else {
            warn!("Engine not running, ignoring profile {}", profile.id);
            return;
        };

        log_profile_problems(&profile);
        if let Some(watcher) = self.watcher.as_ref() {
            watcher.set_current_profile(&profile.id);
        }
        engine.reload_profile(profile);
        info!("Reloaded profile: {}", engine.profile().name);
    }

    /// Stop watcher, cancel macros, release keys, ungrab devices, close the virtual device
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        info!("Starting cleanup...");

        self.accepting_switches.store(false, Ordering::SeqCst);
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        while self.switch_rx.try_recv().is_ok() {}

        if let Some(engine) = self.engine.as_mut() {
            engine.cancel_macros();
            engine.release_all_keys();
        }

        if let Some(mux) = self.mux.as_mut() {
            for mut device in mux.drain() {
                device.release();
                debug!("Released device {}", device.stable_id());
            }
        }

        if let Some(output) = self.output.as_ref() {
            output.close();
        }

        info!("Remap daemon shutdown complete");
    }

    pub fn engine(&self) -> Option<&RemapEngine> {
        self.engine.as_ref()
    }

    pub fn grabbed_devices(&self) -> Vec<String> {
        self.mux.as_ref().map(DeviceMux::stable_ids).unwrap_or_default()
    }

    pub fn app_watcher_running(&self) -> bool {
        self.watcher.as_ref().is_some_and(AppWatcher::is_running)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }
}

impl Drop for RemapDaemon {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn log_available_devices(devices: &[DeviceInfo]) {
    let razer: Vec<&DeviceInfo> = devices
        .iter()
        .filter(|d| d.stable_id.to_lowercase().contains("razer"))
        .collect();
    let shown: Vec<&DeviceInfo> = if razer.is_empty() { devices.iter().collect() } else { razer };

    if shown.is_empty() {
        warn!("No input devices found");
        return;
    }

    info!("Available devices (add one to the profile's input_devices):");
    for device in shown {
        info!("  {}", device.stable_id);
        info!("    Name: {}", device.name);
        info!("    Path: {}", device.event_path.display());
    }
}

/// Warn about bindings and macros the engine will drop; returns how many were found
fn log_profile_problems(profile: &Profile) -> usize {
    let problems = profile.validate();
    for problem in &problems {
        warn!("Profile '{}': {}", profile.id, problem);
    }
    problems.len()
}

/// Human-readable listing for `--list-devices`
pub fn device_listing(devices: &[DeviceInfo]) -> String {
    if devices.is_empty() {
        return "No input devices found.\n".to_string();
    }

    let mut out = String::new();
    for device in devices {
        out.push_str(&format!(
            "{}\n    Name: {}\n    Type: {}\n    Path: {}\n",
            device.stable_id,
            device.name,
            device.type_label(),
            device.event_path.display()
        ));
    }
    out
}

/// Store a recorded macro in `profile_id` (or the active profile), replacing one with the same id
pub fn store_recorded_macro(
    store: &dyn ProfileStore,
    profile_id: Option<&str>,
    action: razer_remap_common::MacroAction,
) -> Result<Profile, StoreError> {
    let mut profile = match profile_id {
        Some(id) => store.load_profile(id)?,
        None => store
            .load_active_profile()?
            .ok_or_else(|| StoreError::NotFound("active profile".to_string()))?,
    };

    info!("Saving macro '{}' ({} steps) to profile {}", action.id, action.steps.len(), profile.id);
    profile.upsert_macro(action);
    store.save_profile(&profile)?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InputDevice;
    use crate::error::DeviceError;
    use crate::app_watcher::ActiveWindowInfo;
    use crate::injector::MemorySink;
    use async_trait::async_trait;
    use evdev::{EventType, InputEvent};
    use razer_remap_common::{Binding, MacroAction, MacroStep};
    use std::collections::{HashMap, VecDeque};
    use std::io::Write;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Sink that also writes to a shared journal
    struct JournalSink {
        inner: MemorySink,
        journal: Journal,
    }

    impl EventSink for JournalSink {
        fn emit(&mut self, events: &[InputEvent]) -> Result<(), OutputError> {
            for e in events.iter().filter(|e| e.event_type() == EventType::KEY) {
                self.journal.lock().unwrap().push(format!("key {} {}", e.code(), e.value()));
            }
            self.inner.emit(events)
        }

        fn close(&mut self) {
            self.journal.lock().unwrap().push("close output".to_string());
            self.inner.close();
        }
    }

    struct ScriptedDevice {
        id: String,
        read_end: OwnedFd,
        batches: VecDeque<Result<Vec<InputEvent>, ()>>,
        journal: Journal,
    }

    impl InputDevice for ScriptedDevice {
        fn stable_id(&self) -> &str {
            &self.id
        }

        fn raw_fd(&self) -> RawFd {
            self.read_end.as_raw_fd()
        }

        fn read_batch(&mut self) -> Result<Vec<InputEvent>, DeviceError> {
            match self.batches.pop_front() {
                Some(Ok(events)) => Ok(events),
                Some(Err(())) => Err(DeviceError::Read {
                    stable_id: self.id.clone(),
                    source: std::io::Error::from_raw_os_error(19),
                }),
                None => Ok(Vec::new()),
            }
        }

        fn release(&mut self) {
            self.journal.lock().unwrap().push(format!("release {}", self.id));
        }
    }

    struct FakeRegistry {
        devices: Mutex<HashMap<String, ScriptedDevice>>,
        writers: Mutex<Vec<std::fs::File>>,
    }

    impl FakeRegistry {
        fn new() -> Self {
            Self {
                devices: Mutex::new(HashMap::new()),
                writers: Mutex::new(Vec::new()),
            }
        }

        /// Device whose fd is always readable and which yields `batches` in order
        fn add(&self, id: &str, batches: Vec<Result<Vec<InputEvent>, ()>>, journal: &Journal) {
            let (read_end, write_end) = nix::unistd::pipe().unwrap();
            let mut writer = std::fs::File::from(write_end);
            writer.write_all(b"ready").unwrap();
            self.writers.lock().unwrap().push(writer);
            self.devices.lock().unwrap().insert(
                id.to_string(),
                ScriptedDevice {
                    id: id.to_string(),
                    read_end,
                    batches: batches.into(),
                    journal: Arc::clone(journal),
                },
            );
        }
    }

    impl DeviceRegistry for FakeRegistry {
        fn scan(&self) -> Vec<DeviceInfo> {
            let mut ids: Vec<String> = self.devices.lock().unwrap().keys().cloned().collect();
            ids.sort();
            ids.into_iter()
                .map(|id| DeviceInfo {
                    name: id.clone(),
                    event_path: PathBuf::from("/dev/input/event0"),
                    stable_id: id,
                    is_mouse: true,
                    is_keyboard: false,
                })
                .collect()
        }

        fn resolve(&self, stable_id: &str) -> Result<PathBuf, DeviceError> {
            if self.devices.lock().unwrap().contains_key(stable_id) {
                Ok(PathBuf::from("/dev/input/event0"))
            } else {
                Err(DeviceError::NotFound(stable_id.to_string()))
            }
        }

        fn open(&self, stable_id: &str) -> Result<Box<dyn InputDevice>, DeviceError> {
            match self.devices.lock().unwrap().remove(stable_id) {
                Some(device) => Ok(Box::new(device)),
                None => Err(DeviceError::NotFound(stable_id.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        profiles: Mutex<HashMap<String, Profile>>,
        active: Mutex<Option<String>>,
    }

    impl ProfileStore for MemoryStore {
        fn list_profiles(&self) -> Result<Vec<String>, StoreError> {
            let mut ids: Vec<String> = self.profiles.lock().unwrap().keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        fn load_profile(&self, id: &str) -> Result<Profile, StoreError> {
            self.profiles
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
            self.profiles.lock().unwrap().insert(profile.id.clone(), profile.clone());
            Ok(())
        }

        fn delete_profile(&self, id: &str) -> Result<(), StoreError> {
            self.profiles.lock().unwrap().remove(id);
            Ok(())
        }

        fn get_active_profile_id(&self) -> Result<Option<String>, StoreError> {
            Ok(self.active.lock().unwrap().clone())
        }

        fn set_active_profile(&self, id: &str) -> Result<(), StoreError> {
            *self.active.lock().unwrap() = Some(id.to_string());
            Ok(())
        }
    }

    /// Window backend reporting a fixed process and counting polls
    struct FocusBackend {
        process: Mutex<String>,
        polls: AtomicUsize,
    }

    impl FocusBackend {
        fn new(process: &str) -> Arc<Self> {
            Arc::new(Self {
                process: Mutex::new(process.to_string()),
                polls: AtomicUsize::new(0),
            })
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WindowBackend for FocusBackend {
        fn name(&self) -> &'static str {
            "focus"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn active_window(&self) -> Option<ActiveWindowInfo> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Some(ActiveWindowInfo::new(1, &self.process.lock().unwrap()))
        }
    }

    fn watching_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.app_watcher.enabled = true;
        config.app_watcher.poll_interval_ms = 5;
        config.app_watcher.debounce_polls = 1;
        config
    }

    fn browser_profile(devices: &[&str]) -> Profile {
        let mut profile = chord_profile(devices);
        profile.id = "browser".to_string();
        profile.app_patterns = vec!["firefox".to_string()];
        profile
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, done: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn pump(daemon: &mut RemapDaemon) {
        let ready = daemon.mux.as_ref().unwrap().wait(100).unwrap();
        daemon.process_ready(&ready);
    }

    const KEY_A: u16 = 30;
    const KEY_C: u16 = 46;
    const KEY_LEFTCTRL: u16 = 29;
    const BTN_SIDE: u16 = 0x113;
    const BTN_EXTRA: u16 = 0x114;

    fn key(code: u16, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY, code, value)
    }

    fn syn() -> InputEvent {
        InputEvent::new(EventType::SYNCHRONIZATION, 0, 0)
    }

    fn chord_profile(devices: &[&str]) -> Profile {
        let mut profile = Profile::default_profile(devices.iter().map(|d| d.to_string()).collect());
        profile.id = "chord".to_string();
        profile.is_default = false;
        profile.layers[0].bindings.push(Binding::key("BTN_EXTRA", &["CTRL", "C"]));
        profile
    }

    fn daemon(store: Arc<MemoryStore>, registry: Arc<FakeRegistry>, journal: &Journal) -> (RemapDaemon, MemorySink) {
        daemon_with(DaemonConfig::default(), Vec::new(), store, registry, journal)
    }

    fn daemon_with(
        config: DaemonConfig,
        window_backends: Vec<Arc<dyn WindowBackend>>,
        store: Arc<MemoryStore>,
        registry: Arc<FakeRegistry>,
        journal: &Journal,
    ) -> (RemapDaemon, MemorySink) {
        let sink = MemorySink::new();
        let factory_sink = sink.clone();
        let factory_journal = Arc::clone(journal);
        let services = DaemonServices {
            store,
            registry,
            output_factory: Box::new(move |_: &DaemonConfig| {
                Ok(Box::new(JournalSink {
                    inner: factory_sink.clone(),
                    journal: Arc::clone(&factory_journal),
                }) as Box<dyn EventSink>)
            }),
            window_backends,
        };
        (RemapDaemon::new(config, services, Handle::current()), sink)
    }

    fn store_with(profile: Profile) -> Arc<MemoryStore> {
        let store = MemoryStore::default();
        store.set_active_profile(&profile.id).unwrap();
        store.save_profile(&profile).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_setup_skips_missing_devices() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("usb-Razer_Naga-event-mouse", vec![], &journal);

        let store = store_with(chord_profile(&["usb-Razer_Naga-event-mouse", "usb-Gone-event-kbd"]));
        let (mut daemon, _sink) = daemon(store, registry, &journal);

        daemon.setup().await.unwrap();
        assert_eq!(daemon.grabbed_devices(), vec!["usb-Razer_Naga-event-mouse".to_string()]);
        assert_eq!(daemon.engine().unwrap().profile().id, "chord");
    }

    #[tokio::test]
    async fn test_setup_fails_without_grabbed_devices() {
        let journal = Journal::default();
        let store = store_with(chord_profile(&["usb-Gone-event-kbd"]));
        let (mut daemon, sink) = daemon(store, Arc::new(FakeRegistry::new()), &journal);

        assert!(matches!(daemon.setup().await, Err(DaemonError::NoDevicesGrabbed)));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_setup_creates_default_profile() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("usb-Razer_Basilisk-event-mouse", vec![], &journal);
        let store = Arc::new(MemoryStore::default());
        let (mut daemon, _sink) = daemon(Arc::clone(&store), registry, &journal);

        daemon.setup().await.unwrap();
        let profile = store.load_active_profile().unwrap().unwrap();
        assert_eq!(profile.id, "default");
        assert!(profile.is_default);
        assert_eq!(profile.input_devices, vec!["usb-Razer_Basilisk-event-mouse".to_string()]);
    }

    #[tokio::test]
    async fn test_setup_fails_when_profile_has_no_devices() {
        let journal = Journal::default();
        let store = store_with(chord_profile(&[]));
        let (mut daemon, _sink) = daemon(store, Arc::new(FakeRegistry::new()), &journal);

        assert!(matches!(daemon.setup().await, Err(DaemonError::NoInputDevicesConfigured(id)) if id == "chord"));
    }

    #[tokio::test]
    async fn test_virtual_device_failure_is_fatal() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![], &journal);
        let services = DaemonServices {
            store: store_with(chord_profile(&["mouse"])),
            registry,
            output_factory: Box::new(|_: &DaemonConfig| Err(OutputError::Create(std::io::Error::from_raw_os_error(2)))),
            window_backends: Vec::new(),
        };
        let mut daemon = RemapDaemon::new(DaemonConfig::default(), services, Handle::current());

        assert!(matches!(daemon.setup().await, Err(DaemonError::VirtualDevice(_))));
    }

    #[tokio::test]
    async fn test_read_error_removes_device_and_loop_exits() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add(
            "a",
            vec![Ok(vec![key(BTN_EXTRA, 1), syn()]), Ok(vec![key(BTN_EXTRA, 0), syn()]), Err(())],
            &journal,
        );
        registry.add("b", vec![Err(())], &journal);

        let store = store_with(chord_profile(&["a", "b"]));
        let (mut daemon, sink) = daemon(store, registry, &journal);
        daemon.setup().await.unwrap();

        daemon.run().unwrap();
        assert!(daemon.grabbed_devices().is_empty());
        assert_eq!(
            sink.key_events(),
            vec![(KEY_LEFTCTRL, 1), (KEY_C, 1), (KEY_C, 0), (KEY_LEFTCTRL, 0)]
        );

        let journal = journal.lock().unwrap();
        assert!(journal.contains(&"release a".to_string()));
        assert!(journal.contains(&"release b".to_string()));
    }

    #[tokio::test]
    async fn test_cleanup_order_and_idempotence() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![Ok(vec![key(BTN_EXTRA, 1), syn()])], &journal);

        let store = store_with(chord_profile(&["mouse"]));
        let (mut daemon, sink) = daemon(store, registry, &journal);
        daemon.setup().await.unwrap();

        let flags = daemon.flags();
        let ready = daemon.mux.as_ref().unwrap().wait(100).unwrap();
        daemon.process_ready(&ready);
        assert_eq!(daemon.engine().unwrap().asserted_keys(), vec![KEY_LEFTCTRL, KEY_C]);

        flags.request_stop();
        daemon.run().unwrap();
        daemon.cleanup();
        daemon.cleanup();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "key 29 1".to_string(),
                "key 46 1".to_string(),
                "key 46 0".to_string(),
                "key 29 0".to_string(),
                "release mouse".to_string(),
                "close output".to_string(),
            ]
        );
        assert!(sink.is_closed());
        assert!(daemon.is_cleaned_up());
    }

    #[tokio::test]
    async fn test_lost_device_keys_are_released() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![Ok(vec![key(BTN_EXTRA, 1), syn()]), Err(())], &journal);
        registry.add("kbd", vec![], &journal);

        let store = store_with(chord_profile(&["mouse", "kbd"]));
        let (mut daemon, sink) = daemon(store, registry, &journal);
        daemon.setup().await.unwrap();

        for _ in 0..3 {
            pump(&mut daemon);
        }

        assert_eq!(daemon.grabbed_devices(), vec!["kbd".to_string()]);
        assert!(daemon.engine().unwrap().asserted_keys().is_empty());
        assert_eq!(
            sink.key_events(),
            vec![(KEY_LEFTCTRL, 1), (KEY_C, 1), (KEY_C, 0), (KEY_LEFTCTRL, 0)]
        );
        assert!(journal.lock().unwrap().contains(&"release mouse".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_stops_watcher_and_macro_before_ungrab() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![Ok(vec![key(BTN_SIDE, 1), syn()])], &journal);

        let mut profile = chord_profile(&["mouse"]);
        profile.layers[0].bindings.push(Binding::macro_trigger("MOUSE_SIDE", "hold"));
        profile.upsert_macro(MacroAction::new(
            "hold",
            "Hold A",
            vec![
                MacroStep::KeyDown { key: "A".to_string() },
                MacroStep::Delay { ms: 10_000 },
                MacroStep::KeyUp { key: "A".to_string() },
            ],
        ));
        let store = store_with(profile);
        store.save_profile(&browser_profile(&["mouse"])).unwrap();

        let backend = FocusBackend::new("gedit");
        let (mut daemon, sink) = daemon_with(watching_config(), vec![backend.clone()], store, registry, &journal);
        daemon.setup().await.unwrap();
        assert!(daemon.app_watcher_running());
        wait_for("watcher polls", || backend.polls() > 0).await;

        pump(&mut daemon);
        wait_for("macro key-down", || sink.key_events() == vec![(KEY_A, 1)]).await;
        assert!(daemon.engine().unwrap().player().is_playing("hold"));

        daemon.cleanup();
        let expected = vec![
            "key 30 1".to_string(),
            "key 30 0".to_string(),
            "release mouse".to_string(),
            "close output".to_string(),
        ];
        assert_eq!(*journal.lock().unwrap(), expected);
        assert!(daemon.engine().unwrap().player().is_idle());
        assert!(!daemon.app_watcher_running());

        // Nothing polls or writes once cleanup has returned
        tokio::time::sleep(Duration::from_millis(20)).await;
        let polls = backend.polls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*journal.lock().unwrap(), expected);
        assert_eq!(backend.polls(), polls);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_switches_again_after_reload() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![], &journal);

        let store = store_with(chord_profile(&["mouse"]));
        store.save_profile(&browser_profile(&["mouse"])).unwrap();
        let backend = FocusBackend::new("firefox");
        let (mut daemon, _sink) =
            daemon_with(watching_config(), vec![backend.clone()], Arc::clone(&store), registry, &journal);
        daemon.setup().await.unwrap();
        assert_eq!(daemon.engine().unwrap().profile().id, "chord");

        let switched_to_browser = |daemon: &mut RemapDaemon| {
            daemon.apply_pending_requests();
            daemon.engine().unwrap().profile().id == "browser"
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !switched_to_browser(&mut daemon) {
            assert!(Instant::now() < deadline, "watcher never switched");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A reload puts "chord" back while firefox keeps focus
        store.set_active_profile("chord").unwrap();
        daemon.flags().request_reload();
        daemon.apply_pending_requests();
        assert_eq!(daemon.engine().unwrap().profile().id, "chord");

        let deadline = Instant::now() + Duration::from_secs(2);
        while !switched_to_browser(&mut daemon) {
            assert!(Instant::now() < deadline, "watcher did not switch back after reload");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        daemon.cleanup();
    }

    #[tokio::test]
    async fn test_profile_problems_are_reported_not_fatal() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![], &journal);

        let mut profile = chord_profile(&["mouse"]);
        profile.layers[0].bindings.push(Binding::key("MOUSE_SIDE", &["CTRLL"]));
        profile.layers[0].bindings.push(Binding::macro_trigger("F13", "missing"));
        assert_eq!(log_profile_problems(&profile), 2);
        assert_eq!(log_profile_problems(&chord_profile(&["mouse"])), 0);

        let (mut daemon, _sink) = daemon(store_with(profile), registry, &journal);
        daemon.setup().await.unwrap();
        assert_eq!(daemon.grabbed_devices(), vec!["mouse".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_request_applied_between_batches() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![Ok(vec![key(BTN_EXTRA, 1), syn()])], &journal);

        let store = store_with(chord_profile(&["mouse"]));
        let (mut daemon, sink) = daemon(Arc::clone(&store), registry, &journal);
        daemon.setup().await.unwrap();

        let ready = daemon.mux.as_ref().unwrap().wait(100).unwrap();
        daemon.process_ready(&ready);

        let mut next = Profile::default_profile(vec!["mouse".to_string()]);
        next.id = "next".to_string();
        next.upsert_macro(MacroAction::new("m", "M", vec![MacroStep::Delay { ms: 1 }]));
        daemon.switch_requests().send(next).unwrap();
        daemon.apply_pending_requests();

        assert_eq!(daemon.engine().unwrap().profile().id, "next");
        assert!(daemon.engine().unwrap().asserted_keys().is_empty());
        assert_eq!(store.get_active_profile_id().unwrap().as_deref(), Some("next"));
        assert_eq!(sink.key_events()[2..], [(KEY_C, 0), (KEY_LEFTCTRL, 0)]);
    }

    #[tokio::test]
    async fn test_reload_flag_rereads_active_profile() {
        let journal = Journal::default();
        let registry = Arc::new(FakeRegistry::new());
        registry.add("mouse", vec![], &journal);

        let store = store_with(chord_profile(&["mouse"]));
        let (mut daemon, _sink) = daemon(Arc::clone(&store), registry, &journal);
        daemon.setup().await.unwrap();

        let mut edited = chord_profile(&["mouse"]);
        edited.name = "Edited".to_string();
        store.save_profile(&edited).unwrap();

        daemon.flags().request_reload();
        daemon.apply_pending_requests();
        assert_eq!(daemon.engine().unwrap().profile().name, "Edited");
    }

    #[test]
    fn test_device_listing() {
        let devices = vec![DeviceInfo {
            stable_id: "usb-Razer_Naga-event-mouse".to_string(),
            name: "Razer Naga".to_string(),
            event_path: PathBuf::from("/dev/input/event4"),
            is_mouse: true,
            is_keyboard: true,
        }];
        assert_eq!(
            device_listing(&devices),
            "usb-Razer_Naga-event-mouse\n    Name: Razer Naga\n    Type: mouse, keyboard\n    Path: /dev/input/event4\n"
        );
        assert_eq!(device_listing(&[]), "No input devices found.\n");
    }

    #[test]
    fn test_store_recorded_macro_replaces_by_id() {
        let store = MemoryStore::default();
        let mut profile = chord_profile(&["mouse"]);
        profile.upsert_macro(MacroAction::new("m1", "Old", vec![]));
        store.save_profile(&profile).unwrap();
        store.set_active_profile("chord").unwrap();

        let recorded = MacroAction::new("m1", "New", vec![MacroStep::KeyDown { key: "A".to_string() }]);
        let saved = store_recorded_macro(&store, None, recorded).unwrap();

        assert_eq!(saved.macros.len(), 1);
        assert_eq!(store.load_profile("chord").unwrap().find_macro("m1").unwrap().name, "New");
        assert!(matches!(
            store_recorded_macro(&store, Some("missing"), MacroAction::new("x", "X", vec![])),
            Err(StoreError::NotFound(_))
        ));
    }
}
