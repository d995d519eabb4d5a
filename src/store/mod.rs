//! Remote store gateway.
//!
//! The engine persists everything in a hierarchical, path-addressed key-value
//! store. This module defines the [`RemoteStore`] capability and the
//! [`IdentityProvider`] that authorizes it, and exposes two implementations of
//! each: Firebase REST (`firebase`, `identity`) and in-memory (`memory`).
//! Sibling modules only depend on the traits exported from here.

use async_trait::async_trait;
use serde_json::Value;

use crate::StoreError;

mod firebase;
mod identity;
pub mod memory;

pub use firebase::RestStore;
pub use identity::{FirebaseIdentity, Identity, IdentityProvider};

// ---

/// Wire paths of the collections the engine reads and writes.
pub mod paths {
    // ---
    pub const PROFILES: &str = "conductores";
    pub const ASSIGNMENTS: &str = "asignaciones";
    pub const ROUTES: &str = "rutas";
    pub const CURRENT_LOCATIONS: &str = "localizaciones_actuales";
    pub const LOCATION_HISTORY: &str = "historial_localizaciones";
    pub const INCIDENTS: &str = "incidencias";

    /// Profile field holding the device push token.
    pub const PUSH_TOKEN_FIELD: &str = "fcm_token";

    pub fn profile(uid: &str) -> String {
        format!("{PROFILES}/{uid}")
    }

    pub fn push_token(uid: &str) -> String {
        format!("{PROFILES}/{uid}/{PUSH_TOKEN_FIELD}")
    }

    pub fn route(route_id: &str) -> String {
        format!("{ROUTES}/{route_id}")
    }

    pub fn current_location(assignment_id: &str) -> String {
        format!("{CURRENT_LOCATIONS}/{assignment_id}")
    }

    pub fn location_history(assignment_id: &str) -> String {
        format!("{LOCATION_HISTORY}/{assignment_id}")
    }
}

/// Hierarchical key-value store addressed by `/`-separated paths.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path`; `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Append `value` under `path` with a store-generated key, returning it.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Remove the value at `path`. Removing a missing path succeeds.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

/// Iterate a collection that may be stored as an object or, when its keys are
/// small integers, as an array with `null` holes.
pub fn collection_entries(collection: &Value) -> Vec<(String, &Value)> {
    // ---
    match collection {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}
