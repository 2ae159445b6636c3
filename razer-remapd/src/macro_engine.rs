use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use razer_remap_common::{keymap, tracing, MacroAction, MacroStep};

use crate::config::MacroEngineSettings;
use crate::injector::{KeyOrigin, OutputGuard, VirtualOutput};

/// A macro step with its key names resolved
#[derive(Debug, Clone, PartialEq)]
enum Op {
    Press(u16),
    Down(u16),
    Up(u16),
    Delay(u64),
    /// `(code, needs_shift)` per character
    Text(Vec<(u16, bool)>),
}

/// Playback was cancelled; not an error, the canceller releases held keys
#[derive(Debug)]
struct Cancelled;

/// Plays macros as tokio tasks, writing through the shared virtual output
pub struct MacroPlayer {
    output: VirtualOutput,
    runtime: Handle,
    key_press_gap: Duration,
    max_concurrent_macros: usize,
    token: Mutex<CancellationToken>,
    /// Macro id -> run number of the playback currently holding that id
    executing: Arc<Mutex<HashMap<String, u64>>>,
    next_run: AtomicU64,
}

impl MacroPlayer {
    pub fn new(output: VirtualOutput, settings: &MacroEngineSettings, runtime: Handle) -> Self {
        Self {
            output,
            runtime,
            key_press_gap: Duration::from_millis(settings.key_press_gap_ms),
            max_concurrent_macros: settings.max_concurrent_macros,
            token: Mutex::new(CancellationToken::new()),
            executing: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(0),
        }
    }

    /// Start playing `action`; returns false when it was not started
    pub fn play(&self, action: &MacroAction) -> bool {
        if action.repeat_count == 0 {
            debug!("Macro {} has repeat_count 0, nothing to play", action.id);
            return false;
        }

        let ops = compile_steps(action);
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        {
            let mut executing = lock(&self.executing);
            if executing.contains_key(&action.id) {
                warn!("Macro {} is already executing", action.id);
                return false;
            }
            if executing.len() >= self.max_concurrent_macros {
                warn!(
                    "Not starting macro {}: {} macros already executing",
                    action.id,
                    executing.len()
                );
                return false;
            }
            executing.insert(action.id.clone(), run);
        }

        let token = lock(&self.token).clone();
        let output = self.output.clone();
        let executing = Arc::clone(&self.executing);
        let id = action.id.clone();
        let repeat_count = action.repeat_count;
        let repeat_delay = Duration::from_millis(action.repeat_delay_ms);
        let gap = self.key_press_gap;

        self.runtime.spawn(async move {
            let playback = Playback { output, token, gap };
            match playback.run(&ops, repeat_count, repeat_delay).await {
                Ok(()) => debug!("Macro {} execution completed", id),
                Err(Cancelled) => debug!("Macro {} cancelled", id),
            }

            let mut executing = lock(&executing);
            if executing.get(&id) == Some(&run) {
                executing.remove(&id);
            }
        });

        info!("Started executing macro: {}", action.id);
        true
    }

    /// Stop every playback and release the keys macros left asserted
    pub fn cancel_all(&self) -> usize {
        {
            let mut token = lock(&self.token);
            token.cancel();
            *token = CancellationToken::new();
        }
        lock(&self.executing).clear();

        let released = self.output.release_origin(KeyOrigin::Macro);
        if released > 0 {
            info!("Cancelled macro playback, released {} keys", released);
        }
        released
    }

    pub fn is_playing(&self, id: &str) -> bool {
        lock(&self.executing).contains_key(id)
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.executing).is_empty()
    }

    /// Ids of currently executing macros
    pub fn executing(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.executing).keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn compile_steps(action: &MacroAction) -> Vec<Op> {
    let resolve = |key: &str| match keymap::validate_key(key) {
        Ok(code) => Some(code),
        Err(e) => {
            warn!("Macro {}: skipping step, {}", action.id, e);
            None
        }
    };

    action
        .steps
        .iter()
        .filter_map(|step| match step {
            MacroStep::KeyPress { key } => resolve(key).map(Op::Press),
            MacroStep::KeyDown { key } => resolve(key).map(Op::Down),
            MacroStep::KeyUp { key } => resolve(key).map(Op::Up),
            MacroStep::Delay { ms } => Some(Op::Delay(*ms)),
            MacroStep::Text { text } => Some(Op::Text(
                text.chars()
                    .filter_map(|c| {
                        let key = keymap::char_to_key(c);
                        if key.is_none() {
                            warn!("No key mapping for character: '{}' (U+{:04X})", c, c as u32);
                        }
                        key
                    })
                    .collect(),
            )),
        })
        .collect()
}

/// One running playback
struct Playback {
    output: VirtualOutput,
    token: CancellationToken,
    gap: Duration,
}

impl Playback {
    async fn run(&self, ops: &[Op], repeat_count: u32, repeat_delay: Duration) -> Result<(), Cancelled> {
        for repetition in 0..repeat_count {
            if repetition > 0 {
                self.sleep(repeat_delay).await?;
            }

            for op in ops {
                match op {
                    Op::Press(code) => self.press(*code).await?,
                    Op::Down(code) => self.write(|out| out.press(*code, KeyOrigin::Macro))?,
                    Op::Up(code) => self.write(|out| out.release(*code))?,
                    Op::Delay(ms) => self.sleep(Duration::from_millis(*ms)).await?,
                    Op::Text(keys) => {
                        for &(code, shift) in keys {
                            if shift {
                                self.write(|out| out.press(keymap::KEY_LEFTSHIFT, KeyOrigin::Macro))?;
                            }
                            self.press(code).await?;
                            if shift {
                                self.write(|out| out.release(keymap::KEY_LEFTSHIFT))?;
                            }
                            self.sleep(self.gap).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn press(&self, code: u16) -> Result<(), Cancelled> {
        self.write(|out| out.press(code, KeyOrigin::Macro))?;
        self.sleep(self.gap).await?;
        self.write(|out| out.release(code))
    }

    /// Write under the output lock, refusing once cancelled
    fn write<F>(&self, f: F) -> Result<(), Cancelled>
    where
        F: FnOnce(&mut OutputGuard<'_>) -> Result<(), crate::error::OutputError>,
    {
        let mut out = self.output.lock();
        if self.token.is_cancelled() {
            return Err(Cancelled);
        }
        if let Err(e) = f(&mut out) {
            warn!("Macro write failed: {}", e);
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if duration.is_zero() {
            // Always yields, so delayless repeat loops never hold a worker
            tokio::task::yield_now().await;
            return if self.token.is_cancelled() { Err(Cancelled) } else { Ok(()) };
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
