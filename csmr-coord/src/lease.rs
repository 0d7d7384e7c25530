//! Leases on named resources.

use std::fmt;
use std::sync::Weak;
use tokio::sync::watch;

/// Backend hooks a lease calls back into.
pub trait LeaseBackend: Send + Sync {
    /// Frees the resource if it is still held under `token`.
    fn release(&self, resource: &str, token: u64);

    /// Applies pending session expiry so validity checks are current.
    fn refresh(&self);
}

/// Exclusive, session-bound ownership of a named resource.
///
/// The lease ends when it is released or when the holder's session
/// expires. Tokens grow strictly per resource, so a stale holder can be
/// fenced off by comparing tokens.
pub struct Lease {
    resource: String,
    token: u64,
    holder: String,
    revoked: watch::Receiver<bool>,
    backend: Weak<dyn LeaseBackend>,
}

impl Lease {
    pub fn new(
        resource: impl Into<String>,
        token: u64,
        holder: impl Into<String>,
        revoked: watch::Receiver<bool>,
        backend: Weak<dyn LeaseBackend>,
    ) -> Self {
        Self {
            resource: resource.into(),
            token,
            holder: holder.into(),
            revoked,
            backend,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Fencing token.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns true while the lease is held.
    pub fn is_valid(&self) -> bool {
        if let Some(backend) = self.backend.upgrade() {
            backend.refresh();
        }
        !*self.revoked.borrow() && self.revoked.has_changed().is_ok()
    }

    /// Resolves once the lease has been revoked or released.
    pub async fn revoked(&mut self) {
        loop {
            if *self.revoked.borrow_and_update() {
                return;
            }
            if self.revoked.changed().await.is_err() {
                return;
            }
        }
    }

    /// Gives the resource up.
    pub fn release(self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.release(&self.resource, self.token);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.resource)
            .field("token", &self.token)
            .field("holder", &self.holder)
            .finish()
    }
}
