//! pmxterm-proto: Wire types shared by the pmxterm backend and its clients.
//!
//! Both channels carry newline-delimited JSON documents:
//!
//! - the command channel exchanges one [`Request`] for one [`Response`];
//! - the notification channel streams [`Notification`]s, optionally after
//!   the subscriber sends a [`Subscribe`] line.
//!
//! On startup the backend prints an [`Announcement`] naming both
//! [`Endpoint`]s on a single stdout line. [`connect`] dials either kind.

pub mod endpoint;
pub mod stream;
pub mod verb;
pub mod wire;

pub use endpoint::{Endpoint, EndpointError};
pub use stream::{connect, read_line, Frame, ReadHalf, WriteHalf, MAX_LINE};
pub use verb::{ArgError, Command, Payload, UnknownVerb, Verb};
pub use wire::{to_line, Announcement, Notification, NotificationKind, Request, Response, Subscribe};
