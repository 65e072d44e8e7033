use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hotkey::error::HotkeyError;

bitflags::bitflags! {
    /// Modifier keys held with a chord.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Modifiers: u8 {
        const CMD = 1 << 0;
        const ALT = 1 << 1;
        const CTRL = 1 << 2;
        const SHIFT = 1 << 3;
    }
}

/// Display order and accepted spellings of each modifier.
const MODIFIER_NAMES: [(Modifiers, &str, &[&str]); 4] = [
    (Modifiers::CMD, "Cmd", &["cmd", "command", "super", "meta"]),
    (Modifiers::CTRL, "Ctrl", &["ctrl", "control"]),
    (Modifiers::ALT, "Alt", &["alt", "option", "opt"]),
    (Modifiers::SHIFT, "Shift", &["shift"]),
];

const FUNCTION_KEY_BASE: u32 = 0x1000;

/// Platform-neutral key code.
///
/// Letters and digits use their uppercase ASCII value, function keys
/// `0x1000 + n`, and the few named keys their ASCII control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(pub u32);

impl KeyCode {
    pub const SPACE: KeyCode = KeyCode(0x20);
    pub const ESCAPE: KeyCode = KeyCode(0x1B);
    pub const TAB: KeyCode = KeyCode(0x09);
    pub const ENTER: KeyCode = KeyCode(0x0D);

    /// Key for an ASCII letter or digit.
    pub const fn char(c: char) -> KeyCode {
        KeyCode(c.to_ascii_uppercase() as u32)
    }

    pub const fn function(n: u32) -> KeyCode {
        KeyCode(FUNCTION_KEY_BASE + n)
    }

    fn parse(token: &str) -> Option<KeyCode> {
        let lower = token.to_ascii_lowercase();
        match lower.as_str() {
            "space" => return Some(Self::SPACE),
            "esc" | "escape" => return Some(Self::ESCAPE),
            "tab" => return Some(Self::TAB),
            "enter" | "return" => return Some(Self::ENTER),
            _ => {}
        }
        let mut chars = token.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return c.is_ascii_alphanumeric().then_some(Self::char(c));
        }
        let n: u32 = lower.strip_prefix('f')?.parse().ok()?;
        (1..=24).contains(&n).then_some(Self::function(n))
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SPACE => write!(f, "Space"),
            Self::ESCAPE => write!(f, "Esc"),
            Self::TAB => write!(f, "Tab"),
            Self::ENTER => write!(f, "Enter"),
            KeyCode(code) if code > FUNCTION_KEY_BASE => write!(f, "F{}", code - FUNCTION_KEY_BASE),
            KeyCode(code) => match char::from_u32(code) {
                Some(c) => write!(f, "{c}"),
                None => write!(f, "0x{code:X}"),
            },
        }
    }
}

/// A key plus the modifiers held with it, e.g. `Cmd+Alt+H`.
///
/// Global chords need at least one modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyChord {
    pub modifiers: Modifiers,
    pub code: KeyCode,
}

impl KeyChord {
    pub const fn new(modifiers: Modifiers, code: KeyCode) -> Self {
        Self { modifiers, code }
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, name, _) in MODIFIER_NAMES {
            if self.modifiers.contains(flag) {
                write!(f, "{name}+")?;
            }
        }
        write!(f, "{}", self.code)
    }
}

impl FromStr for KeyChord {
    type Err = HotkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| HotkeyError::InvalidChord(format!("'{s}': {why}"));

        let mut tokens: Vec<&str> = s.split('+').map(str::trim).collect();
        let key = tokens.pop().filter(|k| !k.is_empty()).ok_or_else(|| invalid("missing key"))?;

        let mut modifiers = Modifiers::empty();
        for token in tokens {
            let lower = token.to_ascii_lowercase();
            let flag = MODIFIER_NAMES
                .iter()
                .find(|(_, _, aliases)| aliases.contains(&lower.as_str()))
                .map(|(flag, _, _)| *flag)
                .ok_or_else(|| invalid(&format!("unknown modifier '{token}'")))?;
            modifiers |= flag;
        }
        if modifiers.is_empty() {
            return Err(invalid("at least one modifier is required"));
        }

        let code = KeyCode::parse(key).ok_or_else(|| invalid(&format!("unknown key '{key}'")))?;
        Ok(KeyChord::new(modifiers, code))
    }
}

impl TryFrom<String> for KeyChord {
    type Error = HotkeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyChord> for String {
    fn from(chord: KeyChord) -> Self {
        chord.to_string()
    }
}

/// Actions reachable from a global hotkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogicalAction {
    TogglePrivacy,
    ToggleCapture,
    TogglePip,
    ToggleFullscreen,
}

impl LogicalAction {
    pub const ALL: [LogicalAction; 4] = [
        Self::TogglePrivacy,
        Self::ToggleCapture,
        Self::TogglePip,
        Self::ToggleFullscreen,
    ];

    /// Stable identifier used in preference keys.
    pub fn id(self) -> &'static str {
        match self {
            Self::TogglePrivacy => "toggle-privacy",
            Self::ToggleCapture => "toggle-capture",
            Self::TogglePip => "toggle-pip",
            Self::ToggleFullscreen => "toggle-fullscreen",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TogglePrivacy => "Toggle Privacy",
            Self::ToggleCapture => "Start/Stop Sharing",
            Self::TogglePip => "Toggle Picture in Picture",
            Self::ToggleFullscreen => "Toggle Fullscreen",
        }
    }

    pub fn default_chord(self) -> KeyChord {
        let cmd_alt = Modifiers::CMD.union(Modifiers::ALT);
        match self {
            Self::TogglePrivacy => KeyChord::new(cmd_alt, KeyCode::char('H')),
            Self::ToggleCapture => KeyChord::new(cmd_alt, KeyCode::char('S')),
            Self::TogglePip => KeyChord::new(cmd_alt, KeyCode::char('P')),
            Self::ToggleFullscreen => {
                KeyChord::new(Modifiers::CMD.union(Modifiers::CTRL), KeyCode::char('F'))
            }
        }
    }
}
