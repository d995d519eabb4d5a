//! Firebase Realtime Database over its REST interface.
//!
//! Every path maps to `{database_url}/{path}.json`. The ID token of the active
//! identity, when there is one, is attached as the `auth` query parameter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{IdentityProvider, RemoteStore};
use crate::StoreError;

// ---

/// REST-backed [`RemoteStore`].
pub struct RestStore {
    // ---
    client: reqwest::Client,
    database_url: String,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

impl RestStore {
    pub fn new(
        client: reqwest::Client,
        database_url: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        // ---
        Self {
            client,
            database_url: database_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        // ---
        let url = format!("{}/{}.json", self.database_url, path.trim_matches('/'));
        let builder = self.client.request(method, &url);

        match self.identity.current() {
            Some(identity) => builder.query(&[("auth", identity.id_token)]),
            None => builder,
        }
    }
}

/// Map a response status to `StoreError`, passing successful responses through.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    // ---
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let code = status.as_u16();
    if code == 401 || code == 403 {
        return Err(StoreError::Unauthorized { status: code });
    }

    let message = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: code,
        message,
    })
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        // ---
        debug!("GET {}", path);
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        let value: Value = check_status(resp).await?.json().await?;

        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        // ---
        debug!("PUT {}", path);
        let resp = self
            .request(reqwest::Method::PUT, path)
            .json(&value)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        // ---
        debug!("POST {}", path);
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(&value)
            .send()
            .await?;
        let pushed: PushResponse = check_status(resp).await?.json().await?;
        Ok(pushed.name)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        // ---
        debug!("DELETE {}", path);
        let resp = self.request(reqwest::Method::DELETE, path).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::memory::MemoryIdentity;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn anonymous_store(server: &MockServer) -> RestStore {
        RestStore::new(reqwest::Client::new(), server.uri(), Arc::new(MemoryIdentity::new()))
    }

    async fn signed_in_store(server: &MockServer) -> (RestStore, String) {
        // ---
        let identity = Arc::new(MemoryIdentity::new());
        let token = identity.sign_in_anonymously().await.unwrap().id_token;
        (RestStore::new(reqwest::Client::new(), server.uri(), identity), token)
    }

    #[tokio::test]
    async fn get_missing_path_is_none() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rutas/r9.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Null))
            .mount(&server)
            .await;

        let store = anonymous_store(&server);
        assert_eq!(store.get("rutas/r9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_sends_body() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/localizaciones_actuales/a1.json"))
            .and(body_json(json!({ "latitud": 1.5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "latitud": 1.5 })))
            .expect(1)
            .mount(&server)
            .await;

        let store = anonymous_store(&server);
        store
            .set("localizaciones_actuales/a1", json!({ "latitud": 1.5 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn push_returns_generated_name() {
        // ---
        let server = MockServer::start().await;
        let (store, token) = signed_in_store(&server).await;

        Mock::given(method("POST"))
            .and(path("/incidencias.json"))
            .and(query_param("auth", token.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "-Nabc" })))
            .mount(&server)
            .await;

        assert_eq!(store.push("incidencias", json!({ "tipo": "Otro" })).await.unwrap(), "-Nabc");
    }

    #[tokio::test]
    async fn rejected_token_maps_to_unauthorized() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "error": "Permission denied" })),
            )
            .mount(&server)
            .await;

        let store = anonymous_store(&server);
        let err = store.remove("localizaciones_actuales/a1").await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { status: 401 }));
    }

    #[tokio::test]
    async fn server_error_keeps_body() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = anonymous_store(&server);
        match store.get("asignaciones").await {
            Err(StoreError::Status { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
