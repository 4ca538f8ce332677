//! The screen-buffer capability a session owns.

use std::sync::Arc;

use crate::screen::Screen;
use crate::terminal::VtTerminal;

/// Screen state for one session.
///
/// The multiplexer feeds child output in, pushes keystrokes through
/// [`translate_input`](Terminal::translate_input) on the way out, and reads
/// snapshots back. It never looks further inside.
pub trait Terminal: Send {
    /// Apply raw output bytes from the child process.
    fn feed(&mut self, bytes: &[u8]);

    /// Serializable snapshot of the visible screen.
    fn snapshot(&self) -> Screen;

    /// Resize the screen to `cols` x `rows` cells.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Transform keystroke input before it is written to the child.
    fn translate_input(&self, bytes: &[u8]) -> Vec<u8>;

    /// Mirror input that was just sent to the child.
    ///
    /// PTY children echo through the line discipline, so the default does
    /// nothing.
    fn echo(&mut self, bytes: &[u8]) {
        let _ = bytes;
    }

    /// Bytes the terminal wants written back to the child, such as cursor
    /// position reports. Draining clears them.
    fn take_replies(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Builds a terminal of the given `(cols, rows)` for a new session.
pub type TerminalFactory = Arc<dyn Fn(u16, u16) -> Box<dyn Terminal> + Send + Sync>;

/// Factory producing [`VtTerminal`]s.
pub fn vt_factory() -> TerminalFactory {
    Arc::new(|cols, rows| Box::new(VtTerminal::new(cols, rows)) as Box<dyn Terminal>)
}
