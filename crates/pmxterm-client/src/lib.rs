//! pmxterm-client: the client side of a pmxterm backend.
//!
//! - [`Backend`]: connection to a running backend's command and notification channels.
//! - [`Session`]: stub for one remote session.
//! - [`LocalBackend`]: launches the backend binary and reports its lifecycle as [`BackendEvent`]s.
//! - [`BackendManager`]: keeps every backend so a front-end can close them together.

pub mod backend;
pub mod connection;
pub mod error;
pub mod local;
pub mod manager;
pub mod session;

pub use backend::Backend;
pub use error::{ClientError, Result};
pub use local::{BackendEvent, BackendState, FailureKind, LocalBackend, LocalOptions};
pub use manager::BackendManager;
pub use session::{generate_id, Session, SessionUpdates};
