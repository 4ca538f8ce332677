use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A resolved 24-bit color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Default foreground (white).
pub const DEFAULT_FG: Rgb = Rgb::new(255, 255, 255);
/// Default background (black).
pub const DEFAULT_BG: Rgb = Rgb::new(0, 0, 0);

bitflags! {
    /// SGR attributes of a cell, one bit each.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CellFlags: u8 {
        const BOLD          = 0b0000_0001;
        const ITALIC        = 0b0000_0010;
        const UNDERLINE     = 0b0000_0100;
        const STRIKETHROUGH = 0b0000_1000;
        const INVERSE       = 0b0001_0000;
        const DIM           = 0b0010_0000;
        const HIDDEN        = 0b0100_0000;
        const BLINK         = 0b1000_0000;
    }
}

/// One grid cell, colors already resolved against the palette.
#[derive(Clone, Debug)]
pub struct VtCell {
    pub codepoint: char,
    pub fg: Rgb,
    pub bg: Rgb,
    pub flags: CellFlags,
    /// Character width: 1 for normal, 2 for wide (CJK) chars, 0 for the
    /// spacer that follows a wide char.
    pub width: u8,
}

impl VtCell {
    /// Whether two cells render with the same colors and attributes.
    pub fn same_style(&self, other: &VtCell) -> bool {
        self.fg == other.fg && self.bg == other.bg && self.flags == other.flags
    }

    /// A blank cell in the default style.
    pub fn is_blank(&self) -> bool {
        self.codepoint == ' '
            && self.fg == DEFAULT_FG
            && self.bg == DEFAULT_BG
            && self.flags.is_empty()
    }
}

impl Default for VtCell {
    fn default() -> Self {
        Self {
            codepoint: ' ',
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
            flags: CellFlags::empty(),
            width: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cell_is_blank() {
        assert!(VtCell::default().is_blank());
    }

    #[test]
    fn test_styled_cell_is_not_blank() {
        let cell = VtCell {
            flags: CellFlags::BOLD,
            ..VtCell::default()
        };
        assert!(!cell.is_blank());
        assert!(!cell.same_style(&VtCell::default()));
    }
}
