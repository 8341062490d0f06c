//! JSON-over-HTTP remote client.
//!
//! Wire contract:
//! - `POST   {base}/{collection}`       create, body is the payload
//! - `PUT    {base}/{collection}/{id}`  update, `If-Match: "<version>"`
//! - `DELETE {base}/{collection}/{id}`  delete
//! - `GET    {base}/{collection}`       list
//!
//! Mutating requests carry an `Idempotency-Key` header. Forced overwrites
//! drop `If-Match` and send `X-Force-Overwrite: true` instead.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use outbox_common::{EntityType, Error, Payload, Result, ServerId};

use crate::api::{
    CreateAck, DeleteAck, IdempotencyKey, RemoteApi, RemoteEntity, RemoteError, RemoteResult,
    UpdateAck,
};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const FORCE_OVERWRITE: &str = "X-Force-Overwrite";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`RemoteApi`].
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// Create a client for a server base URL.
    ///
    /// # Errors
    /// - Base URL is malformed or cannot carry a path
    /// - HTTP client construction fails
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid server URL {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "Server URL {} cannot carry a path",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent("Outbox/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn collection_url(&self, entity_type: EntityType) -> Url {
        self.url_for(&[entity_type.collection()])
    }

    fn entity_url(&self, entity_type: EntityType, server_id: &ServerId) -> Url {
        self.url_for(&[entity_type.collection(), server_id.as_str()])
    }

    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RemoteError::Transient(format!("Failed to parse response: {}", e)));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map a reqwest failure to a remote outcome.
fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transient(err.to_string())
    }
}

/// Map a non-success HTTP status to a remote outcome.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            match serde_json::from_str::<RemoteEntity>(body) {
                Ok(entity) => RemoteError::Conflict(Box::new(entity)),
                Err(_) => RemoteError::Validation {
                    status: status.as_u16(),
                    detail: format!("conflict without server state: {}", body),
                },
            }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => RemoteError::Transient(format!("{}: {}", status, body)),
        s => RemoteError::Validation {
            status: s.as_u16(),
            detail: body.to_string(),
        },
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_entity(
        &self,
        entity_type: EntityType,
        payload: &Payload,
        key: &IdempotencyKey,
    ) -> RemoteResult<CreateAck> {
        let url = self.collection_url(entity_type);
        debug!("POST {} ({})", url, key);
        let request = self
            .http
            .post(url)
            .header(IDEMPOTENCY_KEY, key.as_str())
            .json(payload);
        self.send(request).await
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        payload: &Payload,
        if_version: Option<u64>,
        force: bool,
        key: &IdempotencyKey,
    ) -> RemoteResult<UpdateAck> {
        let url = self.entity_url(entity_type, server_id);
        debug!("PUT {} ({}, force={})", url, key, force);
        let mut request = self
            .http
            .put(url)
            .header(IDEMPOTENCY_KEY, key.as_str())
            .json(payload);
        if force {
            request = request.header(FORCE_OVERWRITE, "true");
        } else if let Some(version) = if_version {
            request = request.header(header::IF_MATCH, format!("\"{}\"", version));
        }
        self.send(request).await
    }

    async fn delete_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        key: &IdempotencyKey,
    ) -> RemoteResult<DeleteAck> {
        let url = self.entity_url(entity_type, server_id);
        debug!("DELETE {} ({})", url, key);
        let response = self
            .http
            .delete(url)
            .header(IDEMPOTENCY_KEY, key.as_str())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(DeleteAck::Deleted);
        }
        let body = response.text().await.unwrap_or_default();
        match classify_status(status, &body) {
            RemoteError::NotFound => Ok(DeleteAck::AlreadyGone),
            err => Err(err),
        }
    }

    async fn list_entities(&self, entity_type: EntityType) -> RemoteResult<Vec<RemoteEntity>> {
        let url = self.collection_url(entity_type);
        debug!("GET {}", url);
        self.send(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base: &str) -> HttpRemote {
        HttpRemote::new(base, DEFAULT_REQUEST_TIMEOUT).unwrap()
    }

    #[test]
    fn test_urls() {
        let r = remote("https://api.example.com/v1/");
        assert_eq!(
            r.collection_url(EntityType::TimeEntry).as_str(),
            "https://api.example.com/v1/time-entries"
        );
        assert_eq!(
            r.entity_url(EntityType::Task, &ServerId::new("srv-9")).as_str(),
            "https://api.example.com/v1/tasks/srv-9"
        );

        let r = remote("http://localhost:8080");
        assert_eq!(
            r.collection_url(EntityType::Client).as_str(),
            "http://localhost:8080/clients"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpRemote::new("not a url", DEFAULT_REQUEST_TIMEOUT).is_err());
        assert!(HttpRemote::new("mailto:ops@example.com", DEFAULT_REQUEST_TIMEOUT).is_err());
    }

    #[test]
    fn test_classify_transient() {
        for code in [408u16, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_transient(), "{}", code);
        }
    }

    #[test]
    fn test_classify_validation() {
        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "name is required");
        match err {
            RemoteError::Validation { status, detail } => {
                assert_eq!(status, 422);
                assert_eq!(detail, "name is required");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_classify_conflict_with_server_state() {
        let body = r#"{"id":"srv-1","payload":{"name":"Remote"},"version":5,"updatedAt":"2024-05-01T10:00:00Z"}"#;
        match classify_status(StatusCode::CONFLICT, body) {
            RemoteError::Conflict(entity) => {
                assert_eq!(entity.version, 5);
                assert_eq!(entity.payload["name"], "Remote");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            classify_status(StatusCode::PRECONDITION_FAILED, body),
            RemoteError::Conflict(_)
        ));
    }

    #[test]
    fn test_classify_conflict_without_body() {
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "busy"),
            RemoteError::Validation { status: 409, .. }
        ));
    }

    #[test]
    fn test_classify_not_found() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            RemoteError::NotFound
        ));
    }
}
