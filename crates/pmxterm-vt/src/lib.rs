//! pmxterm-vt: Terminal screen state for pmxterm sessions.
//!
//! Defines the [`Terminal`] capability the session multiplexer talks to and
//! ships one implementation, [`VtTerminal`], backed by `alacritty_terminal`.
//! The multiplexer only ever feeds bytes, resizes, translates keystrokes and
//! asks for a serializable [`Screen`] snapshot.

pub mod capability;
pub mod cell;
pub mod screen;
pub mod terminal;

pub use capability::{vt_factory, Terminal, TerminalFactory};
pub use cell::{CellFlags, Rgb, VtCell};
pub use screen::{CursorShape, CursorState, Line, Screen, ScreenView, Span};
pub use terminal::VtTerminal;
