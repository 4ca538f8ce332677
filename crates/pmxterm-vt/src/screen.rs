use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line as GridLine};
use alacritty_terminal::term::cell::Flags as AlacFlags;
use alacritty_terminal::term::Term;
use alacritty_terminal::vte::ansi::{Color, CursorShape as AlacCursorShape, NamedColor, Rgb as AlacRgb};
use serde::{Deserialize, Serialize};

use crate::cell::{CellFlags, Rgb, VtCell, DEFAULT_BG, DEFAULT_FG};
use crate::terminal::EventProxy;

/// Current state of the cursor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub shape: CursorShape,
    pub visible: bool,
}

/// Shape of the terminal cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorShape {
    Block,
    Underline,
    Bar,
    Hidden,
}

/// A run of adjacent cells sharing one style.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    pub fg: Rgb,
    pub bg: Rgb,
    /// Raw [`CellFlags`] bits.
    pub flags: u8,
}

impl Span {
    pub fn flags(&self) -> CellFlags {
        CellFlags::from_bits_truncate(self.flags)
    }
}

/// One visible row of the screen. Trailing blank cells are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub spans: Vec<Span>,
}

impl Line {
    /// Plain text of the row without styling.
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

/// Serializable snapshot of a terminal screen, as returned by `dump`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub cols: u16,
    pub rows: u16,
    pub lines: Vec<Line>,
    pub cursor: CursorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Screen {
    /// The screen as plain text, one row per line.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether any row contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.text().contains(needle))
    }
}

/// A read-only view into the terminal screen.
pub struct ScreenView<'a> {
    term: &'a Term<EventProxy>,
}

impl<'a> ScreenView<'a> {
    pub(crate) fn new(term: &'a Term<EventProxy>) -> Self {
        Self { term }
    }

    /// Number of visible rows.
    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    /// Number of columns.
    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    /// Get a single cell at the given row and column.
    ///
    /// Row 0 is the top of the visible screen.
    pub fn cell(&self, row: u16, col: u16) -> VtCell {
        if (row as usize) >= self.term.screen_lines() || (col as usize) >= self.term.columns() {
            return VtCell::default();
        }

        let cell = &self.term.grid()[GridLine(row as i32)][Column(col as usize)];
        convert_cell(cell, self.term.colors())
    }

    /// Get all cells in a row.
    pub fn row_cells(&self, row: u16) -> Vec<VtCell> {
        (0..self.cols()).map(|col| self.cell(row, col)).collect()
    }

    /// Collapse a row into styled spans.
    pub fn line(&self, row: u16) -> Line {
        let mut cells = self.row_cells(row);
        while cells.last().is_some_and(VtCell::is_blank) {
            cells.pop();
        }

        let mut spans: Vec<Span> = Vec::new();
        let mut style: Option<VtCell> = None;
        for cell in cells.into_iter().filter(|c| c.width > 0) {
            let extend = style.as_ref().is_some_and(|prev| prev.same_style(&cell));
            if extend {
                if let Some(span) = spans.last_mut() {
                    span.text.push(cell.codepoint);
                }
            } else {
                spans.push(Span {
                    text: cell.codepoint.to_string(),
                    fg: cell.fg,
                    bg: cell.bg,
                    flags: cell.flags.bits(),
                });
                style = Some(cell);
            }
        }
        Line { spans }
    }

    /// Every visible row as styled spans.
    pub fn lines(&self) -> Vec<Line> {
        (0..self.rows()).map(|row| self.line(row)).collect()
    }
}

/// Standard xterm-256color ANSI palette.
const ANSI_COLORS: [AlacRgb; 16] = [
    AlacRgb { r: 0, g: 0, b: 0 },       // Black
    AlacRgb { r: 205, g: 0, b: 0 },     // Red
    AlacRgb { r: 0, g: 205, b: 0 },     // Green
    AlacRgb { r: 205, g: 205, b: 0 },   // Yellow
    AlacRgb { r: 0, g: 0, b: 238 },     // Blue
    AlacRgb { r: 205, g: 0, b: 205 },   // Magenta
    AlacRgb { r: 0, g: 205, b: 205 },   // Cyan
    AlacRgb { r: 229, g: 229, b: 229 }, // White
    AlacRgb { r: 127, g: 127, b: 127 }, // Bright Black
    AlacRgb { r: 255, g: 0, b: 0 },     // Bright Red
    AlacRgb { r: 0, g: 255, b: 0 },     // Bright Green
    AlacRgb { r: 255, g: 255, b: 0 },   // Bright Yellow
    AlacRgb { r: 92, g: 92, b: 255 },   // Bright Blue
    AlacRgb { r: 255, g: 0, b: 255 },   // Bright Magenta
    AlacRgb { r: 0, g: 255, b: 255 },   // Bright Cyan
    AlacRgb { r: 255, g: 255, b: 255 }, // Bright White
];

/// Resolve a `vte::ansi::Color` to an `Rgb` using the terminal's color palette.
pub(crate) fn resolve_color(
    color: &Color,
    colors: &alacritty_terminal::term::color::Colors,
    is_fg: bool,
) -> Rgb {
    let default = if is_fg { DEFAULT_FG } else { DEFAULT_BG };
    match color {
        Color::Spec(rgb) => Rgb::new(rgb.r, rgb.g, rgb.b),
        Color::Named(named) => {
            if let Some(rgb) = colors[*named] {
                return Rgb::new(rgb.r, rgb.g, rgb.b);
            }
            let idx = *named as usize;
            match named {
                NamedColor::Foreground | NamedColor::BrightForeground => DEFAULT_FG,
                NamedColor::Background => DEFAULT_BG,
                NamedColor::Cursor => DEFAULT_FG,
                _ if idx < 16 => {
                    let c = ANSI_COLORS[idx];
                    Rgb::new(c.r, c.g, c.b)
                }
                NamedColor::DimBlack => Rgb::new(0, 0, 0),
                NamedColor::DimRed => Rgb::new(154, 0, 0),
                NamedColor::DimGreen => Rgb::new(0, 154, 0),
                NamedColor::DimYellow => Rgb::new(154, 154, 0),
                NamedColor::DimBlue => Rgb::new(0, 0, 178),
                NamedColor::DimMagenta => Rgb::new(154, 0, 154),
                NamedColor::DimCyan => Rgb::new(0, 154, 154),
                NamedColor::DimWhite | NamedColor::DimForeground => Rgb::new(178, 178, 178),
                _ => default,
            }
        }
        Color::Indexed(idx) => {
            let idx = *idx as usize;
            if let Some(rgb) = colors[idx] {
                Rgb::new(rgb.r, rgb.g, rgb.b)
            } else if idx < 16 {
                let c = ANSI_COLORS[idx];
                Rgb::new(c.r, c.g, c.b)
            } else if idx < 232 {
                // 216-color cube (indices 16..232).
                let n = idx - 16;
                let to_byte = |v: usize| if v == 0 { 0u8 } else { (55 + 40 * v) as u8 };
                Rgb::new(to_byte((n / 36) % 6), to_byte((n / 6) % 6), to_byte(n % 6))
            } else {
                // Grayscale ramp (indices 232..256).
                let v = (8 + 10 * (idx - 232)) as u8;
                Rgb::new(v, v, v)
            }
        }
    }
}

/// Convert an alacritty Cell to our VtCell.
pub(crate) fn convert_cell(
    cell: &alacritty_terminal::term::cell::Cell,
    colors: &alacritty_terminal::term::color::Colors,
) -> VtCell {
    const FLAG_MAP: [(AlacFlags, CellFlags); 7] = [
        (AlacFlags::BOLD, CellFlags::BOLD),
        (AlacFlags::ITALIC, CellFlags::ITALIC),
        (AlacFlags::UNDERLINE, CellFlags::UNDERLINE),
        (AlacFlags::STRIKEOUT, CellFlags::STRIKETHROUGH),
        (AlacFlags::INVERSE, CellFlags::INVERSE),
        (AlacFlags::DIM, CellFlags::DIM),
        (AlacFlags::HIDDEN, CellFlags::HIDDEN),
    ];

    let flags = FLAG_MAP
        .iter()
        .filter(|(alac, _)| cell.flags.contains(*alac))
        .fold(CellFlags::empty(), |acc, (_, ours)| acc | *ours);

    let width = if cell.flags.contains(AlacFlags::WIDE_CHAR) {
        2
    } else if cell.flags.contains(AlacFlags::WIDE_CHAR_SPACER) {
        0
    } else {
        1
    };

    VtCell {
        codepoint: cell.c,
        fg: resolve_color(&cell.fg, colors, true),
        bg: resolve_color(&cell.bg, colors, false),
        flags,
        width,
    }
}

/// Convert alacritty's CursorShape to our CursorShape.
pub(crate) fn convert_cursor_shape(shape: AlacCursorShape) -> CursorShape {
    match shape {
        AlacCursorShape::Block | AlacCursorShape::HollowBlock => CursorShape::Block,
        AlacCursorShape::Underline => CursorShape::Underline,
        AlacCursorShape::Beam => CursorShape::Bar,
        AlacCursorShape::Hidden => CursorShape::Hidden,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Terminal;
    use crate::terminal::VtTerminal;

    #[test]
    fn test_line_collapses_styles_into_spans() {
        let mut term = VtTerminal::new(20, 4);
        term.feed(b"ab\x1b[1mCD\x1b[0mef");

        let line = term.screen().line(0);
        assert_eq!(line.text(), "abCDef");
        assert_eq!(line.spans.len(), 3);
        assert!(line.spans[1].flags().contains(CellFlags::BOLD));
        assert_eq!(line.spans[1].text, "CD");
    }

    #[test]
    fn test_blank_rows_have_no_spans() {
        let term = VtTerminal::new(20, 4);
        let lines = term.screen().lines();
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.spans.is_empty()));
    }

    #[test]
    fn test_wide_char_spacer_skipped() {
        let mut term = VtTerminal::new(20, 4);
        term.feed("\u{4e16}x".as_bytes());
        assert_eq!(term.screen().line(0).text(), "\u{4e16}x");
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut term = VtTerminal::new(10, 2);
        term.feed(b"hi");
        let screen = term.snapshot();

        let json = serde_json::to_string(&screen).unwrap();
        let back: Screen = serde_json::from_str(&json).unwrap();
        assert_eq!(back, screen);
        assert!(back.contains("hi"));
        assert_eq!(back.text(), "hi\n");
    }

    #[test]
    fn test_indexed_color_cube() {
        let mut term = VtTerminal::new(10, 2);
        // 196 is pure red in the 6x6x6 cube.
        term.feed(b"\x1b[38;5;196mR");
        assert_eq!(term.screen().cell(0, 0).fg, Rgb::new(255, 0, 0));
    }
}
