//! Error types for each engine boundary.
//!
//! Every boundary owns its own enum so callers can match on exactly the
//! failures that boundary can produce. Remote I/O failures stop at the
//! `SyncGateway`/`SessionStateMachine` boundary; the orchestrator only ever
//! sees `TrackingError`.

use thiserror::Error;

// ---

/// Failures produced by the location stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The platform reports that location permission is not granted.
    #[error("location permission denied")]
    PermissionDenied,

    /// The platform source refused the update request.
    #[error("location registration failed: {0}")]
    Registration(String),

    /// The platform source failed after registration.
    #[error("location provider error: {0}")]
    Provider(String),
}

/// Failures produced by an identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider rejected the request with an error code
    /// (e.g. `INVALID_LOGIN_CREDENTIALS`).
    #[error("identity provider rejected request ({status}): {code}")]
    Rejected {
        /// HTTP status code (0 if no response).
        status: u16,
        /// Provider error code.
        code: String,
    },

    /// Operation requires an identity but none is active.
    #[error("no identity is signed in")]
    NotSignedIn,
}

impl AuthError {
    /// Provider error code, if the provider answered with one.
    pub fn code(&self) -> Option<&str> {
        // ---
        match self {
            AuthError::Rejected { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// Failures produced by a remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store refused the credentials attached to the request.
    #[error("remote store rejected credentials ({status})")]
    Unauthorized {
        /// HTTP status code.
        status: u16,
    },

    /// The store answered with a non-success status.
    #[error("remote store error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// The store is unreachable.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by `SessionStateMachine::login`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A session is already live; log out first.
    #[error("a session is already active")]
    AlreadyLoggedIn,

    /// Bad credentials or identity provider failure.
    #[error("authentication failed: {0}")]
    AuthFailure(#[from] AuthError),

    /// The identity has no driver profile record.
    #[error("no driver profile found for {uid}")]
    ProfileNotFound {
        /// Identity that was signed in and then signed back out.
        uid: String,
    },

    /// The profile record exists but is not a map.
    #[error("driver profile for {uid} is malformed")]
    InvalidProfile {
        /// Identity that was signed in and then signed back out.
        uid: String,
    },

    /// Reading the profile failed.
    #[error("remote store error: {0}")]
    Remote(#[from] StoreError),
}

impl SessionError {
    /// Human-readable message for the presentation layer.
    pub fn user_message(&self) -> String {
        // ---
        match self {
            SessionError::AlreadyLoggedIn => "You are already signed in".to_string(),
            SessionError::AuthFailure(AuthError::Rejected { code, .. }) => {
                match code.split(':').next().unwrap_or_default().trim() {
                    "INVALID_LOGIN_CREDENTIALS" | "INVALID_EMAIL" | "INVALID_PASSWORD" => {
                        "Incorrect email or password".to_string()
                    }
                    "EMAIL_NOT_FOUND" => "No account exists for this email".to_string(),
                    "USER_DISABLED" => "This account has been disabled".to_string(),
                    c if c.starts_with("TOO_MANY_ATTEMPTS") => {
                        "Too many attempts. Wait a few minutes".to_string()
                    }
                    other => format!("Sign-in failed: {other}"),
                }
            }
            SessionError::AuthFailure(AuthError::Http(_)) | SessionError::Remote(_) => {
                "Connection error. Check your network".to_string()
            }
            SessionError::AuthFailure(e) => format!("Sign-in failed: {e}"),
            SessionError::ProfileNotFound { .. } | SessionError::InvalidProfile { .. } => {
                "This account has no driver profile".to_string()
            }
        }
    }
}

/// Failures surfaced by `RouteTrackingOrchestrator::start`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// No session or no active assignment to attach samples to.
    #[error("no active assignment")]
    NoActiveAssignment,
}

/// Failures surfaced by `IncidentReporter::submit_incident`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncidentError {
    /// Description was empty after trimming.
    #[error("incident description is required")]
    EmptyDescription,

    /// No driver session is active.
    #[error("no active session")]
    NoSession,

    /// The remote write did not succeed.
    #[error("failed to write incident report")]
    RemoteWriteFailure,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn rejected(code: &str) -> SessionError {
        SessionError::AuthFailure(AuthError::Rejected {
            status: 400,
            code: code.to_string(),
        })
    }

    #[test]
    fn bad_credentials_map_to_friendly_message() {
        // ---
        assert_eq!(
            rejected("INVALID_LOGIN_CREDENTIALS").user_message(),
            "Incorrect email or password"
        );
        assert_eq!(rejected("INVALID_PASSWORD").user_message(), "Incorrect email or password");
    }

    #[test]
    fn throttling_code_with_detail_is_recognized() {
        // ---
        let err = rejected("TOO_MANY_ATTEMPTS_TRY_LATER : Access disabled");
        assert_eq!(err.user_message(), "Too many attempts. Wait a few minutes");
    }

    #[test]
    fn missing_profile_message() {
        // ---
        let err = SessionError::ProfileNotFound { uid: "u1".into() };
        assert_eq!(err.user_message(), "This account has no driver profile");
        assert_eq!(err.to_string(), "no driver profile found for u1");
    }

    #[test]
    fn unknown_code_is_passed_through() {
        // ---
        assert_eq!(
            rejected("OPERATION_NOT_ALLOWED").user_message(),
            "Sign-in failed: OPERATION_NOT_ALLOWED"
        );
    }

    #[test]
    fn auth_error_code_accessor() {
        // ---
        let err = AuthError::Rejected {
            status: 400,
            code: "USER_DISABLED".into(),
        };
        assert_eq!(err.code(), Some("USER_DISABLED"));
        assert_eq!(AuthError::NotSignedIn.code(), None);
    }
}
