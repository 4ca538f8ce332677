use pmxterm_proto::Announcement;

use crate::backend::Backend;
use crate::error::Result;
use crate::local::{BackendState, LocalBackend, LocalOptions};

/// Every backend a front-end talks to, so they can be closed together.
#[derive(Default)]
pub struct BackendManager {
    remotes: Vec<Backend>,
    locals: Vec<LocalBackend>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to an already running backend given its announcement line.
    pub async fn backend(&mut self, name: &str, connection_string: &str) -> Result<Backend> {
        let announcement: Announcement = serde_json::from_str(connection_string.trim())?;
        let backend = Backend::connect(name, announcement).await?;
        self.remotes.push(backend.clone());
        Ok(backend)
    }

    /// Register a backend this client will launch. Call
    /// [`LocalBackend::start`] on the result.
    pub fn local_backend(&mut self, options: LocalOptions) -> &mut LocalBackend {
        let index = self.locals.len();
        self.locals.push(LocalBackend::new(options));
        &mut self.locals[index]
    }

    pub fn remotes(&self) -> &[Backend] {
        &self.remotes
    }

    pub fn locals(&self) -> &[LocalBackend] {
        &self.locals
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bury all sessions on every remote backend and stop every running
    /// local one. Keeps going past failures and returns the first.
    pub async fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;

        for backend in self.remotes.drain(..) {
            if let Err(e) = backend.close().await {
                log::warn!("closing backend {}: {e}", backend.name());
                first_error.get_or_insert(e);
            }
        }
        for local in &mut self.locals {
            if local.state() == BackendState::NotRunning {
                continue;
            }
            if let Err(e) = local.stop().await {
                log::warn!("stopping local backend: {e}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
