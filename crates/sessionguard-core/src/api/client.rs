//! Session-aware HTTP client.
//!
//! This module provides the `SessionClient` struct, which attaches the
//! current access credential to every request and transparently renews it
//! when the server answers 401.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::refresh::{RefreshCoordinator, RefreshOutcome};
use super::ApiError;
use crate::auth::{AccessCredential, CredentialStore, SessionExpiredNotifier};

// ============================================================================
// Constants
// ============================================================================

/// Path of the refresh exchange, relative to the base URL
const REFRESH_PATH: &str = "/refresh";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a single refresh exchange.
const REFRESH_TIMEOUT_SECS: u64 = 10;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Connection settings for a [`SessionClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub request_timeout: Duration,
    /// `None` leaves the refresh exchange bounded only by `request_timeout`.
    pub refresh_timeout: Option<Duration>,
    pub max_rate_limit_retries: u32,
    pub initial_backoff: Duration,
}

impl ClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            refresh_timeout: Some(Duration::from_secs(REFRESH_TIMEOUT_SECS)),
            max_rate_limit_retries: MAX_RATE_LIMIT_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

/// A request that can be sent, and replayed, as-is.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    /// Set once the request has been through a refresh attempt
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// HTTP client bound to one session's credentials.
/// Clone is cheap - clones share the connection pool and the refresh state.
#[derive(Clone)]
pub struct SessionClient {
    client: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
    max_rate_limit_retries: u32,
    initial_backoff: Duration,
}

impl SessionClient {
    pub fn new(options: ClientOptions, credentials: Arc<CredentialStore>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()?;

        let base_url = options.base_url.trim_end_matches('/').to_string();
        let refresh = RefreshCoordinator::new(
            client.clone(),
            format!("{}{}", base_url, REFRESH_PATH),
            Arc::clone(&credentials),
            options.refresh_timeout,
        );

        Ok(Self {
            client,
            base_url,
            credentials,
            refresh: Arc::new(refresh),
            max_rate_limit_retries: options.max_rate_limit_retries,
            initial_backoff: options.initial_backoff,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register the callback fired once per unrecoverable refresh failure.
    pub fn set_expiry_notifier(&self, notifier: Arc<dyn SessionExpiredNotifier>) {
        self.refresh.set_notifier(notifier);
    }

    /// Whether a refresh exchange is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    /// Number of requests parked on the in-flight refresh.
    pub fn pending_waiters(&self) -> usize {
        self.refresh.pending_waiters()
    }

    /// Send a request, renewing the access credential once on 401.
    ///
    /// Any response other than 401 is returned untouched. A 401 on a request
    /// that was already replayed is returned untouched as well.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        let sent_with = self.credentials.access();
        let response = self.send(&request, sent_with.as_ref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if request.retried {
            debug!(path = %request.path, "Replayed request rejected again");
            return Ok(response);
        }
        request.retried = true;

        match self.refresh.refresh(sent_with.as_ref()).await {
            RefreshOutcome::Renewed => {
                debug!(path = %request.path, "Replaying after refresh");
                let renewed = self.credentials.access();
                self.send(&request, renewed.as_ref()).await
            }
            RefreshOutcome::Expired => Err(ApiError::SessionExpired),
        }
    }

    /// Send a request once with the current credential, without refresh handling.
    pub async fn execute_once(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let credential = self.credentials.access();
        self.send(&request, credential.as_ref()).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.execute(ApiRequest::get(path)).await?;
        Self::decode(response).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(ApiError::Encode)?;
        let response = self.execute(ApiRequest::post(path, body)).await?;
        Self::decode(response).await
    }

    /// Check if response is successful, returning an error with body if not.
    pub async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Check the status and parse the JSON body.
    pub async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let url = response.url().to_string();
        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(credential: Option<&AccessCredential>) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(credential) = credential {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
                .map_err(|_| ApiError::InvalidResponse("Access credential is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// One transport round trip, retrying 429 with exponential backoff.
    async fn send(
        &self,
        request: &ApiRequest,
        credential: Option<&AccessCredential>,
    ) -> Result<Response, ApiError> {
        let url = self.url(&request.path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(Self::auth_headers(credential)?);
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS
                || retries >= self.max_rate_limit_retries
            {
                return Ok(response);
            }

            retries += 1;
            warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }
}
