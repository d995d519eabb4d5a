//! Driver session state machine.
//!
//! ```text
//! LoggedOut -> Authenticating -> ProfileLoading -> AssignmentLoading -> Ready
//!     ^                                                                  |
//!     +------------------------------ logout ----------------------------+
//! ```
//!
//! The machine is the only writer of the phase, session and assignment cells.
//! Each cell is a `watch` channel: a value is published only once it is fully
//! built, and a late subscriber sees the current value immediately.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::store::{collection_entries, paths, IdentityProvider, RemoteStore};
use crate::{ActiveAssignment, ConductorSession, SessionError};

// ---

/// Supplies the device push-notification token.
#[async_trait]
pub trait PushTokenSource: Send + Sync {
    async fn token(&self) -> anyhow::Result<String>;
}

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    LoggedOut,
    Authenticating,
    ProfileLoading,
    AssignmentLoading,
    Ready { has_assignment: bool },
}

/// Owns the observable session and assignment state.
pub struct SessionStateMachine {
    // ---
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn RemoteStore>,
    push_tokens: Option<Arc<dyn PushTokenSource>>,

    phase: watch::Sender<SessionPhase>,
    conductor: watch::Sender<Option<ConductorSession>>,
    assignment: watch::Sender<Option<ActiveAssignment>>,

    // Serializes login/refresh/logout so the cells keep a single writer
    transitions: Mutex<()>,
}

impl SessionStateMachine {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn RemoteStore>,
        push_tokens: Option<Arc<dyn PushTokenSource>>,
    ) -> Self {
        // ---
        Self {
            identity,
            store,
            push_tokens,
            phase: watch::Sender::new(SessionPhase::LoggedOut),
            conductor: watch::Sender::new(None),
            assignment: watch::Sender::new(None),
            transitions: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn conductor(&self) -> Option<ConductorSession> {
        self.conductor.borrow().clone()
    }

    pub fn assignment(&self) -> Option<ActiveAssignment> {
        self.assignment.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe_conductor(&self) -> watch::Receiver<Option<ConductorSession>> {
        self.conductor.subscribe()
    }

    pub fn subscribe_assignment(&self) -> watch::Receiver<Option<ActiveAssignment>> {
        self.assignment.subscribe()
    }

    /// Authenticate, load the driver profile, then look up the assignment.
    ///
    /// Not finding an assignment is not an error: the session ends up in
    /// `Ready { has_assignment: false }`. Any failure before the profile is
    /// published signs the identity back out and leaves the cells untouched.
    #[tracing::instrument(skip(self, password))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ConductorSession, SessionError> {
        // ---
        let _transition = self.transitions.lock().await;
        if self.conductor.borrow().is_some() {
            warn!("Login attempted while a session is active");
            return Err(SessionError::AlreadyLoggedIn);
        }

        self.phase.send_replace(SessionPhase::Authenticating);
        let identity = match self.identity.sign_in_with_password(email, password).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Sign-in failed: {}", e);
                self.phase.send_replace(SessionPhase::LoggedOut);
                return Err(e.into());
            }
        };

        self.phase.send_replace(SessionPhase::ProfileLoading);
        let conductor = match self.load_profile(&identity.uid, email).await {
            Ok(conductor) => conductor,
            Err(e) => {
                warn!("Profile load for {} failed: {}", identity.uid, e);
                self.identity.sign_out();
                self.phase.send_replace(SessionPhase::LoggedOut);
                return Err(e);
            }
        };

        info!("Driver {} ({}) signed in", conductor.name, conductor.uid);
        self.conductor.send_replace(Some(conductor.clone()));
        self.register_push_token(&conductor.uid).await;

        self.phase.send_replace(SessionPhase::AssignmentLoading);
        let assignment = self.find_assignment(&conductor.uid).await;
        self.publish_assignment(assignment);

        Ok(conductor)
    }

    /// Re-scan assignments for the active driver. No-op without a session.
    pub async fn refresh_assignment(&self) -> Option<ActiveAssignment> {
        // ---
        let _transition = self.transitions.lock().await;
        let Some(uid) = self.conductor.borrow().as_ref().map(|c| c.uid.clone()) else {
            debug!("No session, nothing to refresh");
            return None;
        };

        self.assignment.send_replace(None);
        self.phase.send_replace(SessionPhase::AssignmentLoading);

        let assignment = self.find_assignment(&uid).await;
        self.publish_assignment(assignment.clone());
        assignment
    }

    /// Sign out and clear both cells.
    pub async fn logout(&self) {
        // ---
        let _transition = self.transitions.lock().await;
        self.identity.sign_out();
        self.assignment.send_replace(None);

        if let Some(previous) = self.conductor.send_replace(None) {
            info!("Driver {} signed out", previous.uid);
        }
        self.phase.send_replace(SessionPhase::LoggedOut);
    }

    /// Store a freshly issued push token on the driver profile.
    ///
    /// Tokens received with no session are dropped. Returns whether the token
    /// was written.
    pub async fn on_new_push_token(&self, token: &str) -> bool {
        // ---
        let Some(uid) = self.conductor.borrow().as_ref().map(|c| c.uid.clone()) else {
            debug!("Push token received with no session, dropping it");
            return false;
        };
        self.write_push_token(&uid, token).await
    }

    async fn load_profile(&self, uid: &str, email: &str) -> Result<ConductorSession, SessionError> {
        // ---
        match self.store.get(&paths::profile(uid)).await? {
            Some(Value::Object(profile)) => {
                Ok(ConductorSession::from_profile(uid, email, &profile))
            }
            Some(_) => Err(SessionError::InvalidProfile { uid: uid.to_string() }),
            None => Err(SessionError::ProfileNotFound { uid: uid.to_string() }),
        }
    }

    /// First assignment whose driver is `uid`, in collection order.
    ///
    /// Read failures are logged and treated as no match.
    async fn find_assignment(&self, uid: &str) -> Option<ActiveAssignment> {
        // ---
        let collection = match self.store.get(paths::ASSIGNMENTS).await {
            Ok(Some(collection)) => collection,
            Ok(None) => {
                debug!("Assignments collection is empty");
                return None;
            }
            Err(e) => {
                warn!("Failed to read assignments: {}", e);
                return None;
            }
        };

        let found = collection_entries(&collection)
            .into_iter()
            .find_map(|(key, value)| {
                let record = value.as_object()?;
                (ActiveAssignment::driver_of(record)? == uid)
                    .then(|| ActiveAssignment::from_record(&key, record))
            });

        match &found {
            Some(a) => info!("Assignment {} on route {} for {}", a.assignment_id, a.route_id, uid),
            None => info!("No assignment for {}", uid),
        }
        found
    }

    fn publish_assignment(&self, assignment: Option<ActiveAssignment>) {
        // ---
        let has_assignment = assignment.is_some();
        self.assignment.send_replace(assignment);
        self.phase.send_replace(SessionPhase::Ready { has_assignment });
    }

    async fn register_push_token(&self, uid: &str) {
        // ---
        let Some(source) = &self.push_tokens else {
            return;
        };

        match source.token().await {
            Ok(token) => {
                self.write_push_token(uid, &token).await;
            }
            Err(e) => warn!("Push token unavailable: {:#}", e),
        }
    }

    async fn write_push_token(&self, uid: &str, token: &str) -> bool {
        // ---
        match self.store.set(&paths::push_token(uid), Value::from(token)).await {
            Ok(()) => {
                debug!("Push token stored for {}", uid);
                true
            }
            Err(e) => {
                warn!("Failed to store push token for {}: {}", uid, e);
                false
            }
        }
    }
}
