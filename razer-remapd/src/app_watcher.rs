//! Foreground-application watcher that requests profile switches.

use async_trait::async_trait;
use razer_remap_common::{tracing, Profile};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppWatcherSettings, ProfileStore};

/// The focused window as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindowInfo {
    pub pid: u32,
    pub process_name: String,
    pub window_class: Option<String>,
    pub window_title: Option<String>,
}

impl ActiveWindowInfo {
    pub fn new(pid: u32, process_name: &str) -> Self {
        Self {
            pid,
            process_name: process_name.to_string(),
            window_class: None,
            window_title: None,
        }
    }
}

/// A way of asking the desktop which window has focus
#[async_trait]
pub trait WindowBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn is_available(&self) -> bool;
    async fn active_window(&self) -> Option<ActiveWindowInfo>;
}

/// Session variables that decide which backends apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    pub display: Option<String>,
    pub session_type: Option<String>,
    pub current_desktop: Option<String>,
}

impl SessionEnv {
    pub fn from_env() -> Self {
        let var = |name| std::env::var(name).ok().filter(|v: &String| !v.is_empty());
        Self {
            display: var("DISPLAY"),
            session_type: var("XDG_SESSION_TYPE"),
            current_desktop: var("XDG_CURRENT_DESKTOP"),
        }
    }

    fn is_gnome_wayland(&self) -> bool {
        let wayland = self
            .session_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("wayland"));
        let gnome = self
            .current_desktop
            .as_deref()
            .is_some_and(|d| d.split(':').any(|part| part.eq_ignore_ascii_case("gnome")));
        wayland && gnome
    }
}

/// Default backend list in priority order
pub fn default_backends(env: &SessionEnv) -> Vec<Arc<dyn WindowBackend>> {
    vec![
        Arc::new(GnomeWaylandBackend::new(env.clone())),
        Arc::new(X11Backend::new(env.clone())),
    ]
}

async fn run_command(program: &str, args: &[&str]) -> Option<String> {
    let output = match Command::new(program).args(args).output().await {
        Ok(output) => output,
        Err(e) => {
            debug!("Failed to run {}: {}", program, e);
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Some(stdout)
}

async fn process_name(pid: u32) -> Option<String> {
    let comm = tokio::fs::read_to_string(format!("/proc/{}/comm", pid)).await.ok()?;
    let name = comm.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// X11 backend built on `xdotool`
pub struct X11Backend {
    env: SessionEnv,
}

impl X11Backend {
    pub fn new(env: SessionEnv) -> Self {
        Self { env }
    }
}

#[async_trait]
impl WindowBackend for X11Backend {
    fn name(&self) -> &'static str {
        "X11Backend"
    }

    async fn is_available(&self) -> bool {
        if self.env.display.is_none() {
            return false;
        }
        run_command("xdotool", &["version"]).await.is_some()
    }

    async fn active_window(&self) -> Option<ActiveWindowInfo> {
        let window = run_command("xdotool", &["getactivewindow"]).await?;
        let pid: u32 = run_command("xdotool", &["getwindowpid", window.as_str()])
            .await?
            .parse()
            .ok()?;
        let window_class = run_command("xdotool", &["getwindowclassname", window.as_str()]).await;
        let window_title = run_command("xdotool", &["getwindowname", window.as_str()]).await;

        let process_name = match process_name(pid).await {
            Some(name) => name,
            None => window_class.as_deref()?.to_lowercase(),
        };

        Some(ActiveWindowInfo {
            pid,
            process_name,
            window_class,
            window_title,
        })
    }
}

const GNOME_FOCUS_SCRIPT: &str =
    "let w = global.display.focus_window; w ? w.get_pid() + '|' + w.get_wm_class() : ''";

/// GNOME on Wayland, through the shell's `Eval` D-Bus method
pub struct GnomeWaylandBackend {
    env: SessionEnv,
}

impl GnomeWaylandBackend {
    pub fn new(env: SessionEnv) -> Self {
        Self { env }
    }
}

/// Parse `(true, '"1234|firefox"')` into pid and window class
fn parse_gnome_eval(output: &str) -> Option<(u32, Option<String>)> {
    if !output.starts_with("(true") {
        return None;
    }
    let start = output.find('\'')?;
    let end = output.rfind('\'')?;
    if end <= start {
        return None;
    }

    let payload = output[start + 1..end].trim_matches('"');
    let (pid, class) = payload.split_once('|')?;
    let pid = pid.trim().parse().ok()?;
    let class = Some(class.trim().to_string()).filter(|c| !c.is_empty() && c != "null");
    Some((pid, class))
}

#[async_trait]
impl WindowBackend for GnomeWaylandBackend {
    fn name(&self) -> &'static str {
        "GnomeWaylandBackend"
    }

    async fn is_available(&self) -> bool {
        self.env.is_gnome_wayland()
    }

    async fn active_window(&self) -> Option<ActiveWindowInfo> {
        let output = run_command(
            "gdbus",
            &[
                "call",
                "--session",
                "--dest",
                "org.gnome.Shell",
                "--object-path",
                "/org/gnome/Shell",
                "--method",
                "org.gnome.Shell.Eval",
                GNOME_FOCUS_SCRIPT,
            ],
        )
        .await?;

        let (pid, window_class) = parse_gnome_eval(&output)?;
        let process_name = match process_name(pid).await {
            Some(name) => name,
            None => window_class.as_deref()?.to_lowercase(),
        };

        Some(ActiveWindowInfo {
            pid,
            process_name,
            window_class,
            window_title: None,
        })
    }
}

/// Case-insensitive match: `*`/`?` glob, exact name, or substring
pub fn matches_pattern(process_name: &str, pattern: &str) -> bool {
    let name = process_name.to_lowercase();
    let pattern = pattern.to_lowercase();

    if pattern.contains('*') || pattern.contains('?') {
        let name: Vec<char> = name.chars().collect();
        let pattern: Vec<char> = pattern.chars().collect();
        return glob_match(&name, &pattern);
    }

    name == pattern || name.contains(&pattern)
}

fn glob_match(text: &[char], pattern: &[char]) -> bool {
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Profiles that can be auto-activated, in stable id order
#[derive(Debug, Clone, Default)]
pub struct ProfileMatcher {
    profiles: Vec<Profile>,
    fallback: Option<Profile>,
}

impl ProfileMatcher {
    pub fn new(mut profiles: Vec<Profile>) -> Self {
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        let fallback = profiles.iter().find(|p| p.is_default).cloned();
        profiles.retain(|p| !p.app_patterns.is_empty());
        Self { profiles, fallback }
    }

    /// Load every profile the store knows, skipping ones that fail to parse
    pub fn from_store(store: &dyn ProfileStore) -> Self {
        let ids = match store.list_profiles() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list profiles for app watcher: {}", e);
                Vec::new()
            }
        };

        let profiles = ids
            .iter()
            .filter_map(|id| match store.load_profile(id) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!("App watcher skipping profile {}: {}", id, e);
                    None
                }
            })
            .collect();
        Self::new(profiles)
    }

    /// First profile with a matching pattern, else the default profile
    pub fn match_process(&self, process_name: &str) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.app_patterns.iter().any(|pat| matches_pattern(process_name, pat)))
            .or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Requires a candidate on N consecutive polls before it is reported
#[derive(Debug)]
pub struct Debouncer {
    required: u32,
    current: Option<String>,
    candidate: Option<String>,
    streak: u32,
}

impl Debouncer {
    pub fn new(required: u32, current: Option<String>) -> Self {
        Self {
            required: required.max(1),
            current,
            candidate: None,
            streak: 0,
        }
    }

    /// Feed one poll result; returns the id to switch to once stable
    pub fn observe(&mut self, candidate: Option<&str>) -> Option<String> {
        let Some(candidate) = candidate else {
            self.candidate = None;
            self.streak = 0;
            return None;
        };

        if self.current.as_deref() == Some(candidate) {
            self.candidate = None;
            self.streak = 0;
            return None;
        }

        if self.candidate.as_deref() == Some(candidate) {
            self.streak += 1;
        } else {
            self.candidate = Some(candidate.to_string());
            self.streak = 1;
        }

        if self.streak >= self.required {
            self.current = self.candidate.take();
            self.streak = 0;
            return self.current.clone();
        }
        None
    }

    /// Adopt a profile that became active without this debouncer reporting it
    pub fn set_current(&mut self, current: Option<String>) {
        if self.current != current {
            self.current = current;
            self.candidate = None;
            self.streak = 0;
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

/// Polls the focused application and reports stable profile matches
pub struct AppWatcher {
    backend: Option<Arc<dyn WindowBackend>>,
    poll_interval: Duration,
    debounce_polls: u32,
    /// Profile the daemon is running; updated by both the daemon and the poll loop
    current: Arc<Mutex<Option<String>>>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AppWatcher {
    /// Probe `backends` in order and adopt the first available one
    pub async fn new(backends: Vec<Arc<dyn WindowBackend>>, settings: &AppWatcherSettings) -> Self {
        let mut chosen = None;
        for backend in backends {
            if backend.is_available().await {
                info!("App watcher using {}", backend.name());
                chosen = Some(backend);
                break;
            }
            debug!("{} not available", backend.name());
        }

        if chosen.is_none() {
            warn!("No window backend available, automatic profile switching disabled");
        }

        Self {
            backend: chosen,
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            debounce_polls: settings.debounce_polls,
            current: Arc::new(Mutex::new(None)),
            token: CancellationToken::new(),
            task: None,
        }
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Record a profile change made outside the watcher (reload, manual switch)
    pub fn set_current_profile(&self, id: &str) {
        *lock(&self.current) = Some(id.to_string());
    }

    pub fn current_profile(&self) -> Option<String> {
        lock(&self.current).clone()
    }

    /// Start polling; returns false when there is no backend or nothing to match
    pub fn start<F>(&mut self, matcher: ProfileMatcher, current_profile: Option<String>, on_profile_change: F) -> bool
    where
        F: Fn(Profile) + Send + Sync + 'static,
    {
        let Some(backend) = self.backend.clone() else {
            return false;
        };
        if self.task.is_some() {
            warn!("App watcher already running");
            return false;
        }
        if matcher.is_empty() {
            info!("No profile has app patterns, app watcher idle");
            return false;
        }

        info!("App watcher started with {} profiles", matcher.len());
        let token = self.token.clone();
        let poll_interval = self.poll_interval;
        *lock(&self.current) = current_profile.clone();
        let current = Arc::clone(&self.current);
        let mut debouncer = Debouncer::new(self.debounce_polls, current_profile);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let window = backend.active_window().await;
                let matched = window
                    .as_ref()
                    .and_then(|w| matcher.match_process(&w.process_name));

                debouncer.set_current(lock(&current).clone());
                let Some(id) = debouncer.observe(matched.map(|p| p.id.as_str())) else {
                    continue;
                };
                if token.is_cancelled() {
                    break;
                }
                *lock(&current) = Some(id.clone());
                if let Some(profile) = matched {
                    info!(
                        "Active application {} matches profile '{}'",
                        window.as_ref().map(|w| w.process_name.as_str()).unwrap_or("?"),
                        id
                    );
                    on_profile_change(profile.clone());
                }
            }

            debug!("App watcher loop stopped");
        }));
        true
    }

    /// Stop polling; no callback runs after this returns
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            info!("App watcher stopped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Drop for AppWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
