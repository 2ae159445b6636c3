//! Layered binding resolution between grabbed devices and the virtual output.
//!
//! The engine owns no I/O of its own: key output goes through the shared
//! [`VirtualOutput`] (so the ledger there is the record of what we asserted)
//! and macro triggers are handed to the [`MacroPlayer`].

use evdev::{EventType, InputEvent};
use razer_remap_common::{keymap, tracing, BindingAction, Profile};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::injector::{KeyOrigin, VirtualOutput};
use crate::macro_engine::MacroPlayer;

/// Binding with its names resolved to codes
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Key(Vec<u16>),
    Macro(String),
}

#[derive(Debug)]
struct CompiledLayer {
    id: String,
    hold: Option<u16>,
    bindings: HashMap<u16, Action>,
}

#[derive(Debug)]
struct CompiledProfile {
    layers: Vec<CompiledLayer>,
    base: usize,
    /// Hold codes of every non-base layer; never forwarded
    hold_codes: HashSet<u16>,
}

impl CompiledProfile {
    fn compile(profile: &Profile) -> Self {
        let mut layers = Vec::new();

        for layer in &profile.layers {
            let hold = match &layer.hold_modifier_input_code {
                Some(name) => match keymap::validate_key(name) {
                    Ok(code) => Some(code),
                    Err(e) => {
                        warn!("Dropping layer '{}': hold modifier {}", layer.id, e);
                        continue;
                    }
                },
                None => None,
            };

            let mut bindings = HashMap::new();
            for binding in &layer.bindings {
                let input = match keymap::validate_key(&binding.input_code) {
                    Ok(code) => code,
                    Err(e) => {
                        warn!("Layer '{}': dropping binding, input {}", layer.id, e);
                        continue;
                    }
                };

                let action = match &binding.action {
                    BindingAction::None => continue,
                    BindingAction::Key { output_keys } => {
                        let codes: Result<Vec<u16>, _> =
                            output_keys.iter().map(|k| keymap::validate_key(k)).collect();
                        match codes {
                            Ok(codes) if !codes.is_empty() => Action::Key(codes),
                            Ok(_) => {
                                warn!("Layer '{}': binding {} has no output keys", layer.id, binding.input_code);
                                continue;
                            }
                            Err(e) => {
                                warn!("Layer '{}': dropping binding {}, output {}", layer.id, binding.input_code, e);
                                continue;
                            }
                        }
                    }
                    BindingAction::Macro { macro_id } => {
                        if profile.find_macro(macro_id).is_none() {
                            warn!("Layer '{}': macro '{}' not found", layer.id, macro_id);
                            continue;
                        }
                        Action::Macro(macro_id.clone())
                    }
                };

                if bindings.insert(input, action).is_some() {
                    warn!("Layer '{}': duplicate binding for {}, last one wins", layer.id, binding.input_code);
                }
            }

            layers.push(CompiledLayer {
                id: layer.id.clone(),
                hold,
                bindings,
            });
        }

        if layers.is_empty() {
            layers.push(CompiledLayer {
                id: "base".to_string(),
                hold: None,
                bindings: HashMap::new(),
            });
        }

        let base = layers.iter().position(|l| l.hold.is_none()).unwrap_or(0);
        let hold_codes = layers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != base)
            .filter_map(|(_, l)| l.hold)
            .collect();

        Self { layers, base, hold_codes }
    }
}

/// A key on one grabbed device, by stable id
type SourceKey = (String, u16);

/// Binding-resolution state machine
pub struct RemapEngine {
    profile: Profile,
    compiled: CompiledProfile,
    output: VirtualOutput,
    player: MacroPlayer,
    active_layer: usize,
    /// Hold codes currently down, in press order
    held_modifiers: Vec<SourceKey>,
    /// Source key -> outputs asserted on its key-down
    active_bindings: HashMap<SourceKey, Vec<u16>>,
    /// Source keys whose key-down was forwarded unchanged
    passthrough_keys: Vec<SourceKey>,
}

impl RemapEngine {
    pub fn new(profile: Profile, output: VirtualOutput, player: MacroPlayer) -> Self {
        let compiled = CompiledProfile::compile(&profile);
        let active_layer = compiled.base;
        info!("Engine bound to profile '{}' ({} layers)", profile.id, compiled.layers.len());

        Self {
            profile,
            compiled,
            output,
            player,
            active_layer,
            held_modifiers: Vec::new(),
            active_bindings: HashMap::new(),
            passthrough_keys: Vec::new(),
        }
    }

    /// Process one event from device `source`, forwarding it when the engine does not handle it
    pub fn dispatch(&mut self, source: &str, event: InputEvent) {
        if !self.process_event(source, &event) {
            if let Err(e) = self.output.passthrough(event) {
                warn!("Failed to forward event: {}", e);
            }
        }
    }

    /// Returns true when the event was consumed or remapped
    pub fn process_event(&mut self, source: &str, event: &InputEvent) -> bool {
        if event.event_type() != EventType::KEY {
            return false;
        }

        let key = (source.to_string(), event.code());
        let value = event.value();

        if self.compiled.hold_codes.contains(&key.1) {
            self.update_modifier(key, value);
            return true;
        }

        match value {
            1 => self.key_down(key),
            0 => self.key_up(&key),
            _ => self.key_repeat(&key),
        }
    }

    fn update_modifier(&mut self, key: SourceKey, value: i32) {
        match value {
            1 => {
                if !self.held_modifiers.contains(&key) {
                    self.held_modifiers.push(key);
                }
            }
            0 => self.held_modifiers.retain(|held| *held != key),
            _ => return,
        }
        self.refresh_layer();
    }

    fn refresh_layer(&mut self) {
        let layer = self.resolve_layer();
        if layer != self.active_layer {
            self.active_layer = layer;
            debug!("Active layer: {}", self.compiled.layers[layer].id);
        }
    }

    /// First configured layer whose hold modifier is held, else the base layer
    fn resolve_layer(&self) -> usize {
        self.compiled
            .layers
            .iter()
            .enumerate()
            .find(|(i, layer)| {
                *i != self.compiled.base
                    && layer
                        .hold
                        .is_some_and(|hold| self.held_modifiers.iter().any(|(_, code)| *code == hold))
            })
            .map(|(i, _)| i)
            .unwrap_or(self.compiled.base)
    }

    fn key_down(&mut self, key: SourceKey) -> bool {
        let code = key.1;
        let action = self.compiled.layers[self.active_layer].bindings.get(&code).cloned();

        match action {
            None => {
                if !self.passthrough_keys.contains(&key) {
                    self.passthrough_keys.push(key);
                }
                false
            }
            Some(Action::Key(outputs)) => {
                if let Some(previous) = self.active_bindings.remove(&key) {
                    self.release_outputs(&previous);
                }

                debug!("Key {} on {} -> {:?}", code, key.0, outputs);
                for &out in &outputs {
                    if let Err(e) = self.output.press(out, KeyOrigin::Binding) {
                        warn!("Failed to press {}: {}", out, e);
                    }
                }
                self.active_bindings.insert(key, outputs);
                true
            }
            Some(Action::Macro(id)) => {
                match self.profile.find_macro(&id) {
                    Some(macro_action) => {
                        debug!("Key {} on {} triggers macro {}", code, key.0, id);
                        self.player.play(macro_action);
                    }
                    None => warn!("Macro '{}' disappeared from profile", id),
                }
                true
            }
        }
    }

    fn key_up(&mut self, key: &SourceKey) -> bool {
        if let Some(outputs) = self.active_bindings.remove(key) {
            self.release_outputs(&outputs);
            return true;
        }

        if let Some(pos) = self.passthrough_keys.iter().position(|k| k == key) {
            self.passthrough_keys.remove(pos);
            return false;
        }

        debug!("Swallowing key-up {} from {} with no recorded key-down", key.1, key.0);
        true
    }

    fn key_repeat(&mut self, key: &SourceKey) -> bool {
        if let Some(last) = self.active_bindings.get(key).and_then(|outputs| outputs.last()) {
            if let Err(e) = self.output.repeat(*last) {
                warn!("Failed to repeat {}: {}", last, e);
            }
            return true;
        }

        !self.passthrough_keys.contains(key)
    }

    fn release_outputs(&self, outputs: &[u16]) {
        for &out in outputs.iter().rev() {
            if let Err(e) = self.output.release(out) {
                warn!("Failed to release {}: {}", out, e);
            }
        }
    }

    /// Release every key asserted through the engine or its macros, then reset state
    pub fn release_all_keys(&mut self) -> usize {
        let mut released = self.output.release_all();

        for (_, code) in std::mem::take(&mut self.passthrough_keys).into_iter().rev() {
            if let Err(e) = self.output.release(code) {
                warn!("Failed to release forwarded key {}: {}", code, e);
            }
            released += 1;
        }

        self.active_bindings.clear();
        self.held_modifiers.clear();
        self.active_layer = self.compiled.base;

        if released > 0 {
            info!("Released {} asserted keys", released);
        }
        released
    }

    /// Forget a device that went away, releasing whatever it was holding.
    ///
    /// A forwarded key stays down while another device still holds the same code.
    pub fn release_device(&mut self, stable_id: &str) -> usize {
        let mut released = 0;

        let owned: Vec<SourceKey> = self
            .active_bindings
            .keys()
            .filter(|(source, _)| source == stable_id)
            .cloned()
            .collect();
        for key in owned {
            if let Some(outputs) = self.active_bindings.remove(&key) {
                self.release_outputs(&outputs);
                released += outputs.len();
            }
        }

        let (lost, kept): (Vec<SourceKey>, Vec<SourceKey>) = std::mem::take(&mut self.passthrough_keys)
            .into_iter()
            .partition(|(source, _)| source == stable_id);
        self.passthrough_keys = kept;
        for (_, code) in lost.into_iter().rev() {
            if self.passthrough_keys.iter().any(|(_, c)| *c == code) {
                continue;
            }
            if let Err(e) = self.output.release(code) {
                warn!("Failed to release forwarded key {}: {}", code, e);
            }
            released += 1;
        }

        self.held_modifiers.retain(|(source, _)| source != stable_id);
        self.refresh_layer();

        if released > 0 {
            info!("Released {} keys held by lost device {}", released, stable_id);
        }
        released
    }

    /// Stop in-flight macro playback, releasing the keys it held
    pub fn cancel_macros(&self) -> usize {
        self.player.cancel_all()
    }

    /// Drain everything the old profile asserted, then bind `profile`
    pub fn reload_profile(&mut self, profile: Profile) {
        info!("Reloading profile '{}' -> '{}'", self.profile.id, profile.id);

        self.cancel_macros();
        self.release_all_keys();

        self.compiled = CompiledProfile::compile(&profile);
        self.profile = profile;
        self.active_layer = self.compiled.base;
    }

    pub fn active_layer_id(&self) -> &str {
        &self.compiled.layers[self.active_layer].id
    }

    pub fn held_modifiers(&self) -> Vec<u16> {
        self.held_modifiers.iter().map(|(_, code)| *code).collect()
    }

    pub fn asserted_keys(&self) -> Vec<u16> {
        self.output.asserted()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn player(&self) -> &MacroPlayer {
        &self.player
    }
}
