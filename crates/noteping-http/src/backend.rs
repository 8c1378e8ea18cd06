//! Backend client
//!
//! `POST /api/notifications/subscribe` registers a push channel for the
//! signed-in user (the backend upserts by endpoint). `GET /api/notes/{id}`
//! serves the note whose `ai_summary` the poller waits for.

use crate::error::HttpError;
use async_trait::async_trait;
use noteping_core::auth::AuthContext;
use noteping_core::config::BackendConfig;
use noteping_core::error::{FetchError, RegistrationError};
use noteping_core::registration::Registrar;
use noteping_core::summary::{Note, NoteSource};
use noteping_core::types::{ChannelHandle, Credential};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use url::Url;

/// Registration route, relative to the base URL
pub const SUBSCRIBE_PATH: &str = "api/notifications/subscribe";

/// Note route prefix, relative to the base URL
pub const NOTES_PATH: &str = "api/notes/";

/// Response bodies are cut to this many bytes in errors and logs
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    subscription: &'a ChannelHandle,
}

/// HTTP client for the delivery-relay and note APIs
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    auth: Arc<dyn AuthContext>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Create a client from config
    ///
    /// `auth` supplies the bearer credential for note fetches; registration
    /// receives its credential per call.
    ///
    /// # Errors
    /// `HttpError` if the base URL is invalid or the client cannot be built.
    pub fn new(config: &BackendConfig, auth: Arc<dyn AuthContext>) -> Result<Self, HttpError> {
        let mut base_url = Url::parse(&config.base_url).map_err(|source| HttpError::InvalidBaseUrl {
            url: config.base_url.clone(),
            source,
        })?;
        if base_url.cannot_be_a_base() {
            return Err(HttpError::NotABase(config.base_url.clone()));
        }
        // Relative joins replace the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("noteping/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// Base URL every route is joined onto
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn route(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }
}

#[async_trait]
impl Registrar for HttpBackend {
    async fn register(
        &self,
        handle: &ChannelHandle,
        credential: &Credential,
    ) -> Result<(), RegistrationError> {
        let url = self
            .route(SUBSCRIBE_PATH)
            .map_err(|e| RegistrationError::NetworkError(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(credential.token())
            .json(&SubscribeRequest {
                subscription: handle,
            })
            .send()
            .await
            .map_err(|e| RegistrationError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = status.as_u16(), "subscription accepted by backend");
            return Ok(());
        }

        let body = read_body(response).await;
        tracing::debug!(status = status.as_u16(), body = %body, "subscription rejected by backend");
        Err(RegistrationError::ServerRejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NoteSource for HttpBackend {
    async fn fetch_note(&self, note_id: i64) -> Result<Note, FetchError> {
        let url = self
            .route(&format!("{NOTES_PATH}{note_id}"))
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let mut request = self.client.get(url);
        if let Some(credential) = self.auth.credential() {
            request = request.bearer_auth(credential.token());
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| FetchError::Network(e.to_string()))?;
                serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))
            }
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(format!("note {note_id}"))),
            status => Err(FetchError::Status {
                status: status.as_u16(),
                body: read_body(response).await,
            }),
        }
    }
}

async fn read_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
