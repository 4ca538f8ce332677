//! pmxterm-pty: session multiplexing and process supervision for pmxterm.
//!
//! This crate sits between the PTY children (real shell processes) and the
//! terminals that hold their screen state. It spawns children, pumps their
//! output into terminals, forwards keystrokes, and reaps children when
//! sessions are buried or go idle.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: low-level PTY process management (spawn, write, resize, terminate).
//! - [`Session`]: one client session pairing a `PtyHandle` with a terminal.
//! - [`Multiplexer`]: the session table every command and the sweep share.
//! - [`supervisor`]: per-session reader and writer threads and the periodic sweep task.
//! - [`Notifier`]: broadcast of change hints to any number of listeners.

pub mod config;
pub mod multiplexer;
pub mod notify;
pub mod pty;
pub mod session;
pub mod supervisor;

pub use config::MultiplexerConfig;
pub use multiplexer::Multiplexer;
pub use notify::Notifier;
pub use pty::{default_shell, PtyError, PtyHandle};
pub use session::{Session, SessionId, SessionState};
pub use supervisor::spawn_sweep_loop;
