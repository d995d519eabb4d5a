//! Write-through synchronization with the remote store.
//!
//! Every write first makes sure some identity is signed in (anonymous if
//! nobody logged in) and retries once with a refreshed token when the store
//! rejects the credentials. Failures never cross this boundary: they are
//! logged and reported as `false` / `None`, so a dropped location write
//! cannot take a tracking loop down with it.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::store::{paths, IdentityProvider, RemoteStore};
use crate::{IncidentReport, LocationRecord, StoreError};

// ---

/// Boolean-result writer used by the tracking loop and the incident reporter.
pub struct SyncGateway {
    // ---
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn RemoteStore>,
}

impl SyncGateway {
    pub fn new(identity: Arc<dyn IdentityProvider>, store: Arc<dyn RemoteStore>) -> Self {
        Self { identity, store }
    }

    /// Make sure an identity is active, signing in anonymously if needed.
    ///
    /// Safe to call before every operation; a no-op while an identity exists.
    pub async fn ensure_authenticated(&self) -> bool {
        // ---
        if self.identity.current().is_some() {
            return true;
        }

        match self.identity.sign_in_anonymously().await {
            Ok(identity) => {
                info!("Authorized writes with anonymous identity {}", identity.uid);
                true
            }
            Err(e) => {
                error!("Anonymous sign-in failed: {}", e);
                false
            }
        }
    }

    /// Replace the current-position slot of `record.assignment_id`.
    pub async fn put_current_location(&self, record: &LocationRecord) -> bool {
        // ---
        let path = paths::current_location(&record.assignment_id);
        let Some(value) = self.encode(record) else {
            return false;
        };

        let result = self
            .write("put current location", || self.store.set(&path, value.clone()))
            .await;
        self.report(&path, result).is_some()
    }

    /// Append `record` to the history of its assignment.
    pub async fn append_history(&self, record: &LocationRecord) -> bool {
        // ---
        let path = paths::location_history(&record.assignment_id);
        let Some(value) = self.encode(record) else {
            return false;
        };

        let result = self
            .write("append history", || self.store.push(&path, value.clone()))
            .await;
        self.report(&path, result).is_some()
    }

    /// Remove the current-position slot. A missing slot counts as removed.
    pub async fn clear_current_location(&self, assignment_id: &str) -> bool {
        // ---
        let path = paths::current_location(assignment_id);
        let result = self
            .write("clear current location", || self.store.remove(&path))
            .await;
        self.report(&path, result).is_some()
    }

    /// Append an incident report, returning its generated key.
    pub async fn append_incident(&self, report: &IncidentReport) -> Option<String> {
        // ---
        let value = self.encode(report)?;
        let result = self
            .write("append incident", || self.store.push(paths::INCIDENTS, value.clone()))
            .await;
        self.report(paths::INCIDENTS, result)
    }

    fn encode<T: Serialize>(&self, payload: &T) -> Option<Value> {
        // ---
        match serde_json::to_value(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Failed to encode payload: {}", e);
                None
            }
        }
    }

    /// Run `op` behind `ensure_authenticated`, retrying once after a token
    /// refresh if the store answers `Unauthorized`.
    async fn write<T, F, Fut>(&self, what: &str, op: F) -> Option<Result<T, StoreError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        // ---
        if !self.ensure_authenticated().await {
            warn!("Skipping {}: not authenticated", what);
            return None;
        }

        match op().await {
            Err(StoreError::Unauthorized { status }) => {
                warn!("{} rejected ({}), refreshing token", what, status);
                if let Err(e) = self.identity.refresh().await {
                    error!("Token refresh failed, giving up on {}: {}", what, e);
                    return Some(Err(StoreError::Unauthorized { status }));
                }
                Some(op().await)
            }
            other => Some(other),
        }
    }

    fn report<T>(&self, path: &str, result: Option<Result<T, StoreError>>) -> Option<T> {
        // ---
        match result? {
            Ok(value) => {
                debug!("Wrote {}", path);
                Some(value)
            }
            Err(e) => {
                error!("Write to {} failed: {}", path, e);
                None
            }
        }
    }
}
