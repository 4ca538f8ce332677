use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi;

use crate::capability::Terminal;
use crate::screen::{convert_cursor_shape, CursorState, Screen, ScreenView};

/// Shared event state captured from the terminal.
#[derive(Default)]
struct EventState {
    title: Option<String>,
    pty_writes: Vec<String>,
}

/// Event proxy that captures terminal events.
///
/// Must be `Clone` because `Term` requires `T: EventListener`. We use
/// interior mutability via `Arc<Mutex<_>>`.
#[derive(Clone)]
pub struct EventProxy {
    state: Arc<Mutex<EventState>>,
}

impl EventProxy {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EventState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        let mut state = self.lock();
        match event {
            Event::Title(title) => state.title = Some(title),
            Event::ResetTitle => state.title = None,
            Event::PtyWrite(data) => state.pty_writes.push(data),
            _ => {}
        }
    }
}

/// Dimensions helper for creating / resizing the terminal.
struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl TermSize {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        }
    }
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

/// The default [`Terminal`] implementation.
///
/// Wraps `alacritty_terminal::Term` and a VTE parser.
pub struct VtTerminal {
    term: Term<EventProxy>,
    parser: ansi::Processor,
    event_proxy: EventProxy,
    local_echo: bool,
}

impl VtTerminal {
    /// Create a new terminal with the given dimensions and 10,000 lines of
    /// scrollback.
    pub fn new(cols: u16, rows: u16) -> Self {
        let config = Config {
            scrolling_history: 10_000,
            ..Config::default()
        };

        let event_proxy = EventProxy::new();
        let term = Term::new(config, &TermSize::new(cols, rows), event_proxy.clone());

        Self {
            term,
            parser: ansi::Processor::new(),
            event_proxy,
            local_echo: false,
        }
    }

    /// Enable local echo, for children that are not attached to a PTY.
    pub fn with_local_echo(mut self, enabled: bool) -> Self {
        self.local_echo = enabled;
        self
    }

    /// Get a read-only view of the terminal screen.
    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView::new(&self.term)
    }

    /// Get the current cursor state (position, shape, visibility).
    pub fn cursor(&self) -> CursorState {
        let content = self.term.renderable_content();
        let cursor = &content.cursor;

        CursorState {
            row: cursor.point.line.0.max(0) as u16,
            col: cursor.point.column.0 as u16,
            shape: convert_cursor_shape(cursor.shape),
            visible: cursor.shape != ansi::CursorShape::Hidden,
        }
    }

    /// The window title, if set by OSC escape sequences.
    pub fn title(&self) -> Option<String> {
        self.event_proxy.lock().title.clone()
    }
}

impl Terminal for VtTerminal {
    fn feed(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.term, bytes);
    }

    fn snapshot(&self) -> Screen {
        let view = self.screen();
        Screen {
            cols: view.cols(),
            rows: view.rows(),
            lines: view.lines(),
            cursor: self.cursor(),
            title: self.title(),
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.term.resize(TermSize::new(cols, rows));
    }

    fn translate_input(&self, bytes: &[u8]) -> Vec<u8> {
        let mode = *self.term.mode();
        let newline: &[u8] = if mode.contains(TermMode::LINE_FEED_NEW_LINE) {
            b"\r\n"
        } else {
            b"\r"
        };
        let app_cursor = mode.contains(TermMode::APP_CURSOR);

        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match &bytes[i..] {
                [b'\r', b'\n', ..] => {
                    out.extend_from_slice(newline);
                    i += 2;
                }
                [b'\n', ..] => {
                    out.extend_from_slice(newline);
                    i += 1;
                }
                [0x1b, b'[', key @ (b'A' | b'B' | b'C' | b'D' | b'H' | b'F'), ..] if app_cursor => {
                    out.extend_from_slice(&[0x1b, b'O', *key]);
                    i += 3;
                }
                [byte, ..] => {
                    out.push(*byte);
                    i += 1;
                }
                [] => break,
            }
        }
        out
    }

    fn echo(&mut self, bytes: &[u8]) {
        if self.local_echo {
            self.feed(bytes);
        }
    }

    fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.event_proxy.lock().pty_writes)
            .into_iter()
            .flat_map(String::into_bytes)
            .collect()
    }
}
