//! Colour parsing and the deterministic collaborator palette.

use sha2::{Digest, Sha256};

/// Palette for collaborator cursors.
pub const CURSOR_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#469990",
    "#9a6324", "#800000", "#808000", "#000075",
];

const NAMED_COLORS: &[(&str, &str)] = &[
    ("black", "#000000"),
    ("white", "#ffffff"),
    ("red", "#ff0000"),
    ("green", "#008000"),
    ("lime", "#00ff00"),
    ("blue", "#0000ff"),
    ("navy", "#000080"),
    ("yellow", "#ffff00"),
    ("orange", "#ffa500"),
    ("purple", "#800080"),
    ("violet", "#ee82ee"),
    ("pink", "#ffc0cb"),
    ("brown", "#a52a2a"),
    ("gray", "#808080"),
    ("grey", "#808080"),
    ("cyan", "#00ffff"),
    ("magenta", "#ff00ff"),
    ("teal", "#008080"),
    ("gold", "#ffd700"),
    ("silver", "#c0c0c0"),
    ("transparent", "#00000000"),
];

/// Resolve a colour name or hex literal to a lowercase hex string.
///
/// Accepts `#rgb`, `#rrggbb`, `#rrggbbaa` and the named colours above.
pub fn resolve_color(input: &str) -> Option<String> {
    let value = input.trim().to_ascii_lowercase();
    if let Some(hex) = value.strip_prefix('#') {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        return match hex.len() {
            3 => {
                let expanded: String = hex.chars().flat_map(|c| [c, c]).collect();
                Some(format!("#{expanded}"))
            }
            6 | 8 => Some(value),
            _ => None,
        };
    }
    NAMED_COLORS
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, hex)| (*hex).to_string())
}

/// Deterministic cursor colour for a user id.
pub fn cursor_color(user_id: &str) -> &'static str {
    let digest = Sha256::digest(user_id.as_bytes());
    CURSOR_PALETTE[digest[0] as usize % CURSOR_PALETTE.len()]
}
