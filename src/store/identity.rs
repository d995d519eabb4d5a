//! Identity provider: email/password sign-in, anonymous fallback, token refresh.
//!
//! [`FirebaseIdentity`] talks to the Identity Toolkit and Secure Token REST
//! endpoints. The active identity is cached in-process so the store can attach
//! its ID token to every request.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::AuthError;

// ---

/// Signed-in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    // ---
    pub uid: String,
    pub id_token: String,
    pub refresh_token: String,
    pub email: Option<String>,
    pub anonymous: bool,
}

/// Authenticates the device against the remote store.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Currently active identity, if any.
    fn current(&self) -> Option<Identity>;

    /// Sign in with email and password, replacing any active identity.
    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Identity, AuthError>;

    /// Create and activate an anonymous identity.
    async fn sign_in_anonymously(&self) -> Result<Identity, AuthError>;

    /// Exchange the refresh token of the active identity for a fresh ID token.
    async fn refresh(&self) -> Result<Identity, AuthError>;

    /// Drop the active identity.
    fn sign_out(&self);
}

// ---

/// Identity Toolkit / Secure Token REST client.
pub struct FirebaseIdentity {
    // ---
    client: reqwest::Client,
    identity_url: String,
    token_url: String,
    api_key: String,
    current: RwLock<Option<Identity>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    id_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl FirebaseIdentity {
    /// Create a client for the given endpoints and web API key.
    pub fn new(
        client: reqwest::Client,
        identity_url: impl Into<String>,
        token_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            client,
            identity_url: identity_url.into().trim_end_matches('/').to_string(),
            token_url: token_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            current: RwLock::new(None),
        }
    }

    fn replace_current(&self, identity: Option<Identity>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    async fn sign_in(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        anonymous: bool,
    ) -> Result<Identity, AuthError> {
        // ---
        let url = format!("{}/accounts:{}", self.identity_url, endpoint);
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let data: SignInResponse = resp.json().await?;

        let identity = Identity {
            uid: data.local_id,
            id_token: data.id_token,
            refresh_token: data.refresh_token,
            email: data.email.filter(|e| !e.is_empty()),
            anonymous,
        };
        self.replace_current(Some(identity.clone()));
        Ok(identity)
    }
}

/// Turn a non-success response into `AuthError::Rejected` with the provider code.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AuthError> {
    // ---
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let code = serde_json::from_str::<ErrorEnvelope>(&text)
        .map(|e| e.error.message)
        .unwrap_or(text);

    Err(AuthError::Rejected {
        status: status.as_u16(),
        code,
    })
}

#[async_trait]
impl IdentityProvider for FirebaseIdentity {
    fn current(&self) -> Option<Identity> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[tracing::instrument(skip_all)]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        // ---
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });
        let identity = self.sign_in("signInWithPassword", body, false).await?;
        info!("Signed in as {}", identity.uid);
        Ok(identity)
    }

    #[tracing::instrument(skip_all)]
    async fn sign_in_anonymously(&self) -> Result<Identity, AuthError> {
        // ---
        let body = serde_json::json!({ "returnSecureToken": true });
        let identity = self.sign_in("signUp", body, true).await?;
        info!("Signed in anonymously as {}", identity.uid);
        Ok(identity)
    }

    #[tracing::instrument(skip_all)]
    async fn refresh(&self) -> Result<Identity, AuthError> {
        // ---
        let Some(active) = self.current() else {
            return Err(AuthError::NotSignedIn);
        };

        let url = format!("{}/token", self.token_url);
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", active.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let resp = match check_status(resp).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Token refresh for {} failed: {}", active.uid, e);
                return Err(e);
            }
        };
        let data: RefreshResponse = resp.json().await?;

        let identity = Identity {
            uid: data.user_id,
            id_token: data.id_token,
            refresh_token: data.refresh_token,
            ..active
        };
        debug!("Refreshed ID token for {}", identity.uid);
        self.replace_current(Some(identity.clone()));
        Ok(identity)
    }

    fn sign_out(&self) {
        // ---
        if let Some(previous) = self.current() {
            debug!("Signing out {}", previous.uid);
        }
        self.replace_current(None);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity_for(server: &MockServer) -> FirebaseIdentity {
        FirebaseIdentity::new(reqwest::Client::new(), server.uri(), server.uri(), "test-key")
    }

    #[tokio::test]
    async fn password_sign_in_caches_identity() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:signInWithPassword"))
            .and(query_param("key", "test-key"))
            .and(body_partial_json(serde_json::json!({ "email": "ana@x.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "localId": "u1",
                "idToken": "tok-1",
                "refreshToken": "rt-1",
                "email": "ana@x.com",
                "expiresIn": "3600"
            })))
            .mount(&server)
            .await;

        let identity = identity_for(&server);
        let signed_in = identity.sign_in_with_password("ana@x.com", "pw").await.unwrap();

        assert_eq!(signed_in.uid, "u1");
        assert!(!signed_in.anonymous);
        assert_eq!(identity.current().unwrap().id_token, "tok-1");
    }

    #[tokio::test]
    async fn rejected_credentials_carry_provider_code() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:signInWithPassword"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "INVALID_LOGIN_CREDENTIALS" }
            })))
            .mount(&server)
            .await;

        let identity = identity_for(&server);
        let err = identity.sign_in_with_password("bad@x.com", "wrong").await.unwrap_err();

        assert_eq!(err.code(), Some("INVALID_LOGIN_CREDENTIALS"));
        assert!(identity.current().is_none());
    }

    #[tokio::test]
    async fn anonymous_sign_in_and_refresh() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:signUp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "localId": "anon-1",
                "idToken": "tok-a",
                "refreshToken": "rt-a"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id_token": "tok-b",
                "refresh_token": "rt-b",
                "user_id": "anon-1",
                "expires_in": "3600"
            })))
            .mount(&server)
            .await;

        let identity = identity_for(&server);
        let anon = identity.sign_in_anonymously().await.unwrap();
        assert!(anon.anonymous);
        assert_eq!(anon.email, None);

        let refreshed = identity.refresh().await.unwrap();
        assert_eq!(refreshed.id_token, "tok-b");
        assert!(refreshed.anonymous);

        identity.sign_out();
        assert!(matches!(identity.refresh().await, Err(AuthError::NotSignedIn)));
    }
}
