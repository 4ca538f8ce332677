use std::sync::Arc;

use pmxterm_pty::{Multiplexer, Notifier};
use tokio::sync::watch;

/// Everything a connection handler needs, shared behind an `Arc`.
pub struct BackendContext {
    mux: Arc<Multiplexer>,
    shutdown: watch::Sender<bool>,
}

impl BackendContext {
    pub fn new(mux: Arc<Multiplexer>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { mux, shutdown }
    }

    pub fn mux(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn notifier(&self) -> &Notifier {
        self.mux.notifier()
    }

    /// A receiver that flips to `true` once [`shutdown`](Self::shutdown) is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
