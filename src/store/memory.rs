//! In-memory store and identity provider.
//!
//! Behave like their REST counterparts (generated push keys, idempotent
//! remove, `Unauthorized` on stale tokens) and add a few switches to inject
//! failures. Used by the integration tests and for running the engine without
//! a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Identity, IdentityProvider, RemoteStore};
use crate::{AuthError, PushTokenSource, StoreError};

// ---

/// Tree-shaped [`RemoteStore`] held in a single JSON value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    // ---
    root: Mutex<Value>,
    write_attempts: AtomicUsize,
    unavailable: AtomicBool,
    reject_writes: AtomicUsize,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Borrow `node` as a map, replacing any scalar found on the way.
fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
    // ---
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    /// Store pre-populated with `root`.
    pub fn with_data(root: Value) -> Self {
        // ---
        Self {
            root: Mutex::new(root),
            ..Self::default()
        }
    }

    /// Synchronous read, for assertions.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        // ---
        let root = self.lock();
        let mut node = &*root;
        for seg in segments(path) {
            node = node.as_object()?.get(seg)?;
        }
        (!node.is_null()).then(|| node.clone())
    }

    /// Number of set/push/remove calls that reached the store.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject the next `count` writes with `StoreError::Unauthorized`.
    pub fn reject_next_writes(&self, count: usize) {
        self.reject_writes.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        // ---
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        // ---
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;

        let rejected = self
            .reject_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::Unauthorized { status: 401 });
        }
        Ok(())
    }

    fn write(&self, path: &str, value: Value) {
        // ---
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            *self.lock() = value;
            return;
        };

        let mut root = self.lock();
        let mut node = &mut *root;
        for seg in parents {
            node = object_mut(node)
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let map = object_mut(node);

        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check_read()?;
        Ok(self.snapshot(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        // ---
        self.check_write()?;
        self.write(path, value);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        // ---
        self.check_write()?;
        let key = format!("-{}", Uuid::new_v4().simple());
        self.write(&format!("{path}/{key}"), value);
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        // ---
        self.check_write()?;
        self.write(path, Value::Null);
        Ok(())
    }
}

// ---

/// [`IdentityProvider`] backed by a fixed account table.
#[derive(Debug)]
pub struct MemoryIdentity {
    // ---
    accounts: HashMap<String, (String, String)>,
    current: Mutex<Option<Identity>>,
    anonymous_enabled: AtomicBool,
    anonymous_sign_ins: AtomicUsize,
    issued: AtomicUsize,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        // ---
        Self {
            accounts: HashMap::new(),
            current: Mutex::new(None),
            anonymous_enabled: AtomicBool::new(true),
            anonymous_sign_ins: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
        }
    }

    /// Register an email/password account for `uid`.
    pub fn with_account(mut self, email: &str, password: &str, uid: &str) -> Self {
        self.accounts
            .insert(email.to_string(), (password.to_string(), uid.to_string()));
        self
    }

    /// Allow or refuse anonymous sign-in.
    pub fn set_anonymous_enabled(&self, enabled: bool) {
        self.anonymous_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Number of successful anonymous sign-ins.
    pub fn anonymous_sign_ins(&self) -> usize {
        self.anonymous_sign_ins.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Identity>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, uid: &str, email: Option<String>, anonymous: bool) -> Identity {
        // ---
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let identity = Identity {
            uid: uid.to_string(),
            id_token: format!("token-{uid}-{n}"),
            refresh_token: format!("refresh-{uid}"),
            email,
            anonymous,
        };
        *self.lock() = Some(identity.clone());
        identity
    }
}

fn rejected(code: &str) -> AuthError {
    AuthError::Rejected {
        status: 400,
        code: code.to_string(),
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    fn current(&self) -> Option<Identity> {
        self.lock().clone()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        // ---
        match self.accounts.get(email) {
            Some((expected, uid)) if expected == password => {
                Ok(self.issue(uid, Some(email.to_string()), false))
            }
            _ => Err(rejected("INVALID_LOGIN_CREDENTIALS")),
        }
    }

    async fn sign_in_anonymously(&self) -> Result<Identity, AuthError> {
        // ---
        if !self.anonymous_enabled.load(Ordering::SeqCst) {
            return Err(rejected("ADMIN_ONLY_OPERATION"));
        }
        self.anonymous_sign_ins.fetch_add(1, Ordering::SeqCst);
        let uid = format!("anon-{}", Uuid::new_v4().simple());
        Ok(self.issue(&uid, None, true))
    }

    async fn refresh(&self) -> Result<Identity, AuthError> {
        // ---
        let active = self.current().ok_or(AuthError::NotSignedIn)?;
        Ok(self.issue(&active.uid, active.email, active.anonymous))
    }

    fn sign_out(&self) {
        *self.lock() = None;
    }
}

// ---

/// Push-token source returning a fixed token, or failing when `None`.
#[derive(Debug, Clone)]
pub struct StaticPushToken(pub Option<String>);

#[async_trait]
impl PushTokenSource for StaticPushToken {
    async fn token(&self) -> anyhow::Result<String> {
        self.0
            .clone()
            .ok_or_else(|| anyhow::anyhow!("push token unavailable"))
    }
}
