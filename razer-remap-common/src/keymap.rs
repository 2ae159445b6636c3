//! Key-name table shared by the daemon and profile tooling.
//!
//! Profiles name keys with short *schema names* (`CTRL`, `MOUSE_SIDE`,
//! `NUM_0`) or with raw evdev names (`KEY_LEFTCTRL`, `BTN_SIDE`). Both resolve
//! to the numeric codes of `linux/input-event-codes.h`.

use std::fmt;
use std::ops::{Range, RangeInclusive};
use thiserror::Error;

/// Keyboard key codes declared on the virtual device
pub const VIRTUAL_KEY_CODES: RangeInclusive<u16> = 1..=255;
/// Mouse button codes declared on the virtual device (BTN_LEFT..BTN_TASK and spares)
pub const VIRTUAL_BUTTON_CODES: Range<u16> = 0x110..0x120;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;
pub const REL_HWHEEL: u16 = 0x06;
pub const REL_WHEEL: u16 = 0x08;
/// Relative axes declared on the virtual device
pub const VIRTUAL_REL_AXES: [u16; 4] = [REL_X, REL_Y, REL_WHEEL, REL_HWHEEL];

pub const KEY_LEFTSHIFT: u16 = 42;

/// Grouping used by editors and validation output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCategory {
    Mouse,
    Modifiers,
    Letters,
    Numbers,
    Function,
    Navigation,
    Editing,
    Punctuation,
    Media,
    System,
    Numpad,
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            KeyCategory::Mouse => "Mouse",
            KeyCategory::Modifiers => "Modifiers",
            KeyCategory::Letters => "Letters",
            KeyCategory::Numbers => "Numbers",
            KeyCategory::Function => "Function",
            KeyCategory::Navigation => "Navigation",
            KeyCategory::Editing => "Editing",
            KeyCategory::Punctuation => "Punctuation",
            KeyCategory::Media => "Media",
            KeyCategory::System => "System",
            KeyCategory::Numpad => "Numpad",
        };
        f.write_str(name)
    }
}

/// One row of the key-name table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    pub schema: &'static str,
    pub evdev: &'static str,
    pub code: u16,
    pub category: KeyCategory,
}

const fn key(schema: &'static str, evdev: &'static str, code: u16, category: KeyCategory) -> KeyEntry {
    KeyEntry { schema, evdev, code, category }
}

use KeyCategory::*;

static KEY_TABLE: &[KeyEntry] = &[
    // Mouse buttons
    key("MOUSE_LEFT", "BTN_LEFT", 0x110, Mouse),
    key("MOUSE_RIGHT", "BTN_RIGHT", 0x111, Mouse),
    key("MOUSE_MIDDLE", "BTN_MIDDLE", 0x112, Mouse),
    key("MOUSE_SIDE", "BTN_SIDE", 0x113, Mouse),
    key("MOUSE_EXTRA", "BTN_EXTRA", 0x114, Mouse),
    key("MOUSE_FORWARD", "BTN_FORWARD", 0x115, Mouse),
    key("MOUSE_BACK", "BTN_BACK", 0x116, Mouse),
    key("MOUSE_TASK", "BTN_TASK", 0x117, Mouse),
    // Modifiers
    key("CTRL", "KEY_LEFTCTRL", 29, Modifiers),
    key("CTRL_R", "KEY_RIGHTCTRL", 97, Modifiers),
    key("SHIFT", "KEY_LEFTSHIFT", 42, Modifiers),
    key("SHIFT_R", "KEY_RIGHTSHIFT", 54, Modifiers),
    key("ALT", "KEY_LEFTALT", 56, Modifiers),
    key("ALT_R", "KEY_RIGHTALT", 100, Modifiers),
    key("META", "KEY_LEFTMETA", 125, Modifiers),
    key("META_R", "KEY_RIGHTMETA", 126, Modifiers),
    // Letters
    key("A", "KEY_A", 30, Letters),
    key("B", "KEY_B", 48, Letters),
    key("C", "KEY_C", 46, Letters),
    key("D", "KEY_D", 32, Letters),
    key("E", "KEY_E", 18, Letters),
    key("F", "KEY_F", 33, Letters),
    key("G", "KEY_G", 34, Letters),
    key("H", "KEY_H", 35, Letters),
    key("I", "KEY_I", 23, Letters),
    key("J", "KEY_J", 36, Letters),
    key("K", "KEY_K", 37, Letters),
    key("L", "KEY_L", 38, Letters),
    key("M", "KEY_M", 50, Letters),
    key("N", "KEY_N", 49, Letters),
    key("O", "KEY_O", 24, Letters),
    key("P", "KEY_P", 25, Letters),
    key("Q", "KEY_Q", 16, Letters),
    key("R", "KEY_R", 19, Letters),
    key("S", "KEY_S", 31, Letters),
    key("T", "KEY_T", 20, Letters),
    key("U", "KEY_U", 22, Letters),
    key("V", "KEY_V", 47, Letters),
    key("W", "KEY_W", 17, Letters),
    key("X", "KEY_X", 45, Letters),
    key("Y", "KEY_Y", 21, Letters),
    key("Z", "KEY_Z", 44, Letters),
    // Number row
    key("1", "KEY_1", 2, Numbers),
    key("2", "KEY_2", 3, Numbers),
    key("3", "KEY_3", 4, Numbers),
    key("4", "KEY_4", 5, Numbers),
    key("5", "KEY_5", 6, Numbers),
    key("6", "KEY_6", 7, Numbers),
    key("7", "KEY_7", 8, Numbers),
    key("8", "KEY_8", 9, Numbers),
    key("9", "KEY_9", 10, Numbers),
    key("0", "KEY_0", 11, Numbers),
    // Function keys
    key("F1", "KEY_F1", 59, Function),
    key("F2", "KEY_F2", 60, Function),
    key("F3", "KEY_F3", 61, Function),
    key("F4", "KEY_F4", 62, Function),
    key("F5", "KEY_F5", 63, Function),
    key("F6", "KEY_F6", 64, Function),
    key("F7", "KEY_F7", 65, Function),
    key("F8", "KEY_F8", 66, Function),
    key("F9", "KEY_F9", 67, Function),
    key("F10", "KEY_F10", 68, Function),
    key("F11", "KEY_F11", 87, Function),
    key("F12", "KEY_F12", 88, Function),
    key("F13", "KEY_F13", 183, Function),
    key("F14", "KEY_F14", 184, Function),
    key("F15", "KEY_F15", 185, Function),
    key("F16", "KEY_F16", 186, Function),
    key("F17", "KEY_F17", 187, Function),
    key("F18", "KEY_F18", 188, Function),
    key("F19", "KEY_F19", 189, Function),
    key("F20", "KEY_F20", 190, Function),
    key("F21", "KEY_F21", 191, Function),
    key("F22", "KEY_F22", 192, Function),
    key("F23", "KEY_F23", 193, Function),
    key("F24", "KEY_F24", 194, Function),
    // Navigation
    key("UP", "KEY_UP", 103, Navigation),
    key("DOWN", "KEY_DOWN", 108, Navigation),
    key("LEFT", "KEY_LEFT", 105, Navigation),
    key("RIGHT", "KEY_RIGHT", 106, Navigation),
    key("HOME", "KEY_HOME", 102, Navigation),
    key("END", "KEY_END", 107, Navigation),
    key("PAGEUP", "KEY_PAGEUP", 104, Navigation),
    key("PAGEDOWN", "KEY_PAGEDOWN", 109, Navigation),
    // Editing
    key("ESC", "KEY_ESC", 1, Editing),
    key("TAB", "KEY_TAB", 15, Editing),
    key("ENTER", "KEY_ENTER", 28, Editing),
    key("SPACE", "KEY_SPACE", 57, Editing),
    key("BACKSPACE", "KEY_BACKSPACE", 14, Editing),
    key("DELETE", "KEY_DELETE", 111, Editing),
    key("INSERT", "KEY_INSERT", 110, Editing),
    key("CAPSLOCK", "KEY_CAPSLOCK", 58, Editing),
    key("UNDO", "KEY_UNDO", 131, Editing),
    key("COPY", "KEY_COPY", 133, Editing),
    key("PASTE", "KEY_PASTE", 135, Editing),
    key("CUT", "KEY_CUT", 137, Editing),
    key("FIND", "KEY_FIND", 136, Editing),
    // Punctuation
    key("MINUS", "KEY_MINUS", 12, Punctuation),
    key("EQUAL", "KEY_EQUAL", 13, Punctuation),
    key("LEFTBRACE", "KEY_LEFTBRACE", 26, Punctuation),
    key("RIGHTBRACE", "KEY_RIGHTBRACE", 27, Punctuation),
    key("SEMICOLON", "KEY_SEMICOLON", 39, Punctuation),
    key("APOSTROPHE", "KEY_APOSTROPHE", 40, Punctuation),
    key("GRAVE", "KEY_GRAVE", 41, Punctuation),
    key("BACKSLASH", "KEY_BACKSLASH", 43, Punctuation),
    key("COMMA", "KEY_COMMA", 51, Punctuation),
    key("DOT", "KEY_DOT", 52, Punctuation),
    key("SLASH", "KEY_SLASH", 53, Punctuation),
    // Media
    key("PLAY_PAUSE", "KEY_PLAYPAUSE", 164, Media),
    key("NEXT_TRACK", "KEY_NEXTSONG", 163, Media),
    key("PREV_TRACK", "KEY_PREVIOUSSONG", 165, Media),
    key("STOP_MEDIA", "KEY_STOPCD", 166, Media),
    key("VOL_UP", "KEY_VOLUMEUP", 115, Media),
    key("VOL_DOWN", "KEY_VOLUMEDOWN", 114, Media),
    key("MUTE", "KEY_MUTE", 113, Media),
    // System
    key("PRINT", "KEY_SYSRQ", 99, System),
    key("SCROLLLOCK", "KEY_SCROLLLOCK", 70, System),
    key("PAUSE", "KEY_PAUSE", 119, System),
    key("MENU", "KEY_COMPOSE", 127, System),
    key("POWER", "KEY_POWER", 116, System),
    key("SLEEP", "KEY_SLEEP", 142, System),
    key("WAKEUP", "KEY_WAKEUP", 143, System),
    key("CALC", "KEY_CALC", 140, System),
    key("MAIL", "KEY_MAIL", 155, System),
    key("WWW", "KEY_WWW", 150, System),
    key("HOMEPAGE", "KEY_HOMEPAGE", 172, System),
    key("BROWSER_BACK", "KEY_BACK", 158, System),
    key("BROWSER_FORWARD", "KEY_FORWARD", 159, System),
    key("REFRESH", "KEY_REFRESH", 173, System),
    // Numpad
    key("NUM_0", "KEY_KP0", 82, Numpad),
    key("NUM_1", "KEY_KP1", 79, Numpad),
    key("NUM_2", "KEY_KP2", 80, Numpad),
    key("NUM_3", "KEY_KP3", 81, Numpad),
    key("NUM_4", "KEY_KP4", 75, Numpad),
    key("NUM_5", "KEY_KP5", 76, Numpad),
    key("NUM_6", "KEY_KP6", 77, Numpad),
    key("NUM_7", "KEY_KP7", 71, Numpad),
    key("NUM_8", "KEY_KP8", 72, Numpad),
    key("NUM_9", "KEY_KP9", 73, Numpad),
    key("NUM_ENTER", "KEY_KPENTER", 96, Numpad),
    key("NUM_PLUS", "KEY_KPPLUS", 78, Numpad),
    key("NUM_MINUS", "KEY_KPMINUS", 74, Numpad),
    key("NUM_ASTERISK", "KEY_KPASTERISK", 55, Numpad),
    key("NUM_SLASH", "KEY_KPSLASH", 98, Numpad),
    key("NUM_DOT", "KEY_KPDOT", 83, Numpad),
    key("NUM_EQUAL", "KEY_KPEQUAL", 117, Numpad),
    key("NUMLOCK", "KEY_NUMLOCK", 69, Numpad),
];

/// Error returned by [`validate_key`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key name cannot be empty")]
    Empty,
    #[error("Unknown key '{name}'{}", did_you_mean(.suggestions))]
    Unknown { name: String, suggestions: Vec<String> },
}

fn did_you_mean(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (Did you mean: {}?)", suggestions.join(", "))
    }
}

/// Every entry of the table, in table order
pub fn entries() -> &'static [KeyEntry] {
    KEY_TABLE
}

/// Look up a table entry by schema or evdev name
pub fn lookup(name: &str) -> Option<&'static KeyEntry> {
    KEY_TABLE.iter().find(|e| e.schema == name || e.evdev == name)
}

/// Look up a table entry by numeric code
pub fn lookup_code(code: u16) -> Option<&'static KeyEntry> {
    KEY_TABLE.iter().find(|e| e.code == code)
}

/// Resolve a schema or evdev key name to its code
pub fn code_for(name: &str) -> Option<u16> {
    lookup(name).map(|e| e.code)
}

pub fn schema_name(code: u16) -> Option<&'static str> {
    lookup_code(code).map(|e| e.schema)
}

pub fn evdev_name(code: u16) -> Option<&'static str> {
    lookup_code(code).map(|e| e.evdev)
}

pub fn is_valid_key(name: &str) -> bool {
    lookup(name).is_some()
}

/// Validate a key name, suggesting close schema names when it is unknown
pub fn validate_key(name: &str) -> Result<u16, KeyError> {
    if name.trim().is_empty() {
        return Err(KeyError::Empty);
    }
    if let Some(code) = code_for(name) {
        return Ok(code);
    }

    let upper = name.to_ascii_uppercase();
    let mut suggestions: Vec<(usize, &'static str)> = KEY_TABLE
        .iter()
        .filter_map(|e| {
            let distance = edit_distance(&upper, e.schema);
            let prefix = e.schema.starts_with(upper.as_str()) || upper.starts_with(e.schema);
            if distance <= 2 || (prefix && upper.len() >= 2 && e.schema.len() >= 2) {
                Some((distance, e.schema))
            } else {
                None
            }
        })
        .collect();
    suggestions.sort();
    suggestions.truncate(3);

    Err(KeyError::Unknown {
        name: name.to_string(),
        suggestions: suggestions.into_iter().map(|(_, s)| s.to_string()).collect(),
    })
}

/// All schema names, sorted
pub fn all_schema_names() -> Vec<&'static str> {
    let mut names: Vec<_> = KEY_TABLE.iter().map(|e| e.schema).collect();
    names.sort_unstable();
    names
}

/// All evdev names, sorted
pub fn all_evdev_names() -> Vec<&'static str> {
    let mut names: Vec<_> = KEY_TABLE.iter().map(|e| e.evdev).collect();
    names.sort_unstable();
    names
}

pub fn keys_in_category(category: KeyCategory) -> Vec<&'static str> {
    KEY_TABLE
        .iter()
        .filter(|e| e.category == category)
        .map(|e| e.schema)
        .collect()
}

/// Map a character to the US-QWERTY key that types it and whether Shift is needed
pub fn char_to_key(c: char) -> Option<(u16, bool)> {
    if c.is_ascii_alphabetic() {
        let name = c.to_ascii_uppercase().to_string();
        return code_for(&name).map(|code| (code, c.is_ascii_uppercase()));
    }
    if c.is_ascii_digit() {
        return code_for(&c.to_string()).map(|code| (code, false));
    }

    let (name, shift) = match c {
        ' ' => ("SPACE", false),
        '\t' => ("TAB", false),
        '\n' => ("ENTER", false),
        '-' => ("MINUS", false),
        '_' => ("MINUS", true),
        '=' => ("EQUAL", false),
        '+' => ("EQUAL", true),
        '[' => ("LEFTBRACE", false),
        '{' => ("LEFTBRACE", true),
        ']' => ("RIGHTBRACE", false),
        '}' => ("RIGHTBRACE", true),
        '\\' => ("BACKSLASH", false),
        '|' => ("BACKSLASH", true),
        ';' => ("SEMICOLON", false),
        ':' => ("SEMICOLON", true),
        '\'' => ("APOSTROPHE", false),
        '"' => ("APOSTROPHE", true),
        '`' => ("GRAVE", false),
        '~' => ("GRAVE", true),
        ',' => ("COMMA", false),
        '<' => ("COMMA", true),
        '.' => ("DOT", false),
        '>' => ("DOT", true),
        '/' => ("SLASH", false),
        '?' => ("SLASH", true),
        '!' => ("1", true),
        '@' => ("2", true),
        '#' => ("3", true),
        '$' => ("4", true),
        '%' => ("5", true),
        '^' => ("6", true),
        '&' => ("7", true),
        '*' => ("8", true),
        '(' => ("9", true),
        ')' => ("0", true),
        _ => return None,
    };
    code_for(name).map(|code| (code, shift))
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}
