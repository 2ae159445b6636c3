use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// Re-export common dependencies
pub use serde;
pub use tracing;

pub mod keymap;
pub mod profile;

pub use profile::{Binding, BindingAction, Layer, MacroAction, MacroStep, Profile};

/// Information about an input device known to the device registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identifier that survives reconnects (udev by-id / by-path link name)
    pub stable_id: String,
    pub name: String,
    pub event_path: PathBuf,
    pub is_mouse: bool,
    pub is_keyboard: bool,
}

impl DeviceInfo {
    /// Short type label used in device listings
    pub fn type_label(&self) -> String {
        let mut kinds = Vec::new();
        if self.is_mouse {
            kinds.push("mouse");
        }
        if self.is_keyboard {
            kinds.push("keyboard");
        }
        if kinds.is_empty() {
            "other".to_string()
        } else {
            kinds.join(", ")
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}) at {}",
               self.name, self.stable_id, self.event_path.display())
    }
}
