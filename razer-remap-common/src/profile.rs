//! Profile schema: layers of bindings, macros and application match patterns.

use serde::{Deserialize, Serialize};

use crate::keymap;

/// A complete remapping profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Stable device identifiers to grab while this profile is active
    #[serde(default)]
    pub input_devices: Vec<String>,
    /// Ordered layers; the first layer without a hold modifier is the base layer
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub macros: Vec<MacroAction>,
    /// Process-name patterns that auto-activate this profile
    #[serde(default, alias = "match_process_names")]
    pub app_patterns: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// A set of bindings, optionally active only while a modifier input is held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_modifier_input_code: Option<String>,
}

/// Maps one physical input code to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub input_code: String,
    pub action: BindingAction,
}

/// What a binding does when its input fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BindingAction {
    /// Explicitly unbound; the input passes through
    None,
    /// Emit a chord, asserted in order and released in reverse
    Key { output_keys: Vec<String> },
    /// Play a macro from the profile
    Macro { macro_id: String },
}

/// A named, repeatable sequence of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroAction {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    #[serde(default)]
    pub repeat_delay_ms: u64,
}

fn default_repeat_count() -> u32 {
    1
}

/// A single macro step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MacroStep {
    /// Down then up with the configured minimal gap
    KeyPress { key: String },
    KeyDown { key: String },
    KeyUp { key: String },
    Delay { ms: u64 },
    /// Type text character by character
    Text { text: String },
}

impl Binding {
    pub fn key(input_code: &str, output_keys: &[&str]) -> Self {
        Self {
            input_code: input_code.to_string(),
            action: BindingAction::Key {
                output_keys: output_keys.iter().map(|k| k.to_string()).collect(),
            },
        }
    }

    pub fn macro_trigger(input_code: &str, macro_id: &str) -> Self {
        Self {
            input_code: input_code.to_string(),
            action: BindingAction::Macro { macro_id: macro_id.to_string() },
        }
    }
}

impl Layer {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            bindings: Vec::new(),
            hold_modifier_input_code: None,
        }
    }
}

impl MacroAction {
    pub fn new(id: &str, name: &str, steps: Vec<MacroStep>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            steps,
            repeat_count: 1,
            repeat_delay_ms: 0,
        }
    }
}

impl Profile {
    /// Bindings-free profile used when no active profile can be loaded
    pub fn default_profile(input_devices: Vec<String>) -> Self {
        Self {
            id: "default".to_string(),
            name: "Default Profile".to_string(),
            description: "Default profile - no remapping".to_string(),
            input_devices,
            layers: vec![Layer::new("base", "Base Layer")],
            macros: Vec::new(),
            app_patterns: Vec::new(),
            is_default: true,
        }
    }

    pub fn find_macro(&self, id: &str) -> Option<&MacroAction> {
        self.macros.iter().find(|m| m.id == id)
    }

    /// Insert a macro, replacing any existing macro with the same id
    pub fn upsert_macro(&mut self, macro_action: MacroAction) {
        match self.macros.iter_mut().find(|m| m.id == macro_action.id) {
            Some(existing) => *existing = macro_action,
            None => self.macros.push(macro_action),
        }
    }

    /// Problems that would make bindings of this profile inert
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.input_devices.is_empty() {
            problems.push("No input devices configured".to_string());
        }

        for layer in &self.layers {
            if let Some(hold) = &layer.hold_modifier_input_code {
                if let Err(e) = keymap::validate_key(hold) {
                    problems.push(format!("Layer '{}' hold modifier: {}", layer.name, e));
                }
            }

            for binding in &layer.bindings {
                if let Err(e) = keymap::validate_key(&binding.input_code) {
                    problems.push(format!("Layer '{}': {}", layer.name, e));
                }

                match &binding.action {
                    BindingAction::None => {}
                    BindingAction::Key { output_keys } => {
                        if output_keys.is_empty() {
                            problems.push(format!(
                                "Layer '{}' binding {}: no output keys",
                                layer.name, binding.input_code
                            ));
                        }
                        for key in output_keys {
                            if let Err(e) = keymap::validate_key(key) {
                                problems.push(format!(
                                    "Layer '{}' binding {}: output key {}",
                                    layer.name, binding.input_code, e
                                ));
                            }
                        }
                    }
                    BindingAction::Macro { macro_id } => {
                        if self.find_macro(macro_id).is_none() {
                            problems.push(format!(
                                "Layer '{}': macro '{}' not found",
                                layer.name, macro_id
                            ));
                        }
                    }
                }
            }
        }

        for macro_action in &self.macros {
            for step in &macro_action.steps {
                let key = match step {
                    MacroStep::KeyPress { key } | MacroStep::KeyDown { key } | MacroStep::KeyUp { key } => key,
                    MacroStep::Delay { .. } | MacroStep::Text { .. } => continue,
                };
                if let Err(e) = keymap::validate_key(key) {
                    problems.push(format!("Macro '{}': {}", macro_action.id, e));
                }
            }
        }

        problems
    }
}
