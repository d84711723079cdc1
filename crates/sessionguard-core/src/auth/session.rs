use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credentials::{AccessCredential, RefreshCredential};
use crate::api::{ApiError, ApiRequest, SessionClient};

const LOGIN_PATH: &str = "/login";
const LOGOUT_PATH: &str = "/logout";
const IDENTITY_PATH: &str = "/me";

/// The authenticated user as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    /// Display name
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub identity: Identity,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            established_at: Utc::now(),
        }
    }
}

/// Called when the session can no longer be renewed and the user has to log
/// in again. Credentials are already cleared by the time it fires.
pub trait SessionExpiredNotifier: Send + Sync {
    fn session_expired(&self);
}

impl<F> SessionExpiredNotifier for F
where
    F: Fn() + Send + Sync,
{
    fn session_expired(&self) {
        self()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: AccessCredential,
    #[serde(rename = "refreshToken")]
    refresh_token: RefreshCredential,
    user: Identity,
}

#[derive(Serialize)]
struct LogoutRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// Drops the held session before handing the expiry to the caller's notifier.
struct ExpiryHook {
    session: Arc<RwLock<Option<Session>>>,
    notifier: Arc<dyn SessionExpiredNotifier>,
}

impl SessionExpiredNotifier for ExpiryHook {
    fn session_expired(&self) {
        *self.session.write().unwrap_or_else(|p| p.into_inner()) = None;
        info!("Session expired, login required");
        self.notifier.session_expired();
    }
}

/// Caller-facing login, logout and identity operations.
pub struct SessionController {
    client: SessionClient,
    session: Arc<RwLock<Option<Session>>>,
}

impl SessionController {
    pub fn new(client: SessionClient, notifier: Arc<dyn SessionExpiredNotifier>) -> Self {
        let session = Arc::new(RwLock::new(None));
        client.set_expiry_notifier(Arc::new(ExpiryHook {
            session: Arc::clone(&session),
            notifier,
        }));
        Self { client, session }
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Snapshot of the current session, if logged in.
    pub fn session(&self) -> Option<Session> {
        self.session.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(|p| p.into_inner()) = session;
    }

    /// Authenticate and store both credentials.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, ApiError> {
        let body = serde_json::to_value(LoginRequest {
            email: identifier,
            password: secret,
        })
        .map_err(ApiError::Encode)?;

        let response = self
            .client
            .execute_once(ApiRequest::post(LOGIN_PATH, body))
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            info!(identifier, "Login rejected");
            return Err(ApiError::InvalidCredentials);
        }

        let login: LoginResponse = SessionClient::decode(response).await?;

        let credentials = self.client.credentials();
        credentials.set_access(login.access_token);
        if let Err(e) = credentials.set_refresh(&login.refresh_token) {
            // Still usable until the access credential expires
            warn!(error = %e, "Failed to persist refresh credential");
        }

        let session = Session::new(login.user);
        self.set_session(Some(session.clone()));
        info!(user_id = %session.identity.id, role = %session.identity.role, "Login successful");
        Ok(session)
    }

    /// End the session. Local credentials are always cleared, whatever the
    /// server says.
    pub async fn logout(&self) {
        let credentials = self.client.credentials();

        if let Some(refresh) = credentials.refresh_or_none() {
            match self.terminate_remote(&refresh).await {
                Ok(()) => debug!("Remote session terminated"),
                Err(e) => warn!(error = %e, "Logout request failed, clearing local session anyway"),
            }
        } else {
            debug!("No refresh credential, skipping remote logout");
        }

        credentials.clear_all();
        self.set_session(None);
        info!("Logged out");
    }

    async fn terminate_remote(&self, refresh: &RefreshCredential) -> Result<(), ApiError> {
        let body = serde_json::to_value(LogoutRequest {
            refresh_token: refresh.expose(),
        })
        .map_err(ApiError::Encode)?;

        let response = self
            .client
            .execute_once(ApiRequest::post(LOGOUT_PATH, body))
            .await?;
        SessionClient::check_response(response).await?;
        Ok(())
    }

    /// Fetch the authenticated identity, renewing the access credential if needed.
    pub async fn current_identity(&self) -> Result<Identity, ApiError> {
        let credentials = self.client.credentials();
        if !credentials.has_any() {
            return Err(ApiError::Unauthenticated);
        }

        let identity: Identity = self.client.get_json(IDENTITY_PATH).await?;

        let mut slot = self.session.write().unwrap_or_else(|p| p.into_inner());
        match slot.as_mut() {
            Some(session) => session.identity = identity.clone(),
            None => {
                debug!(user_id = %identity.id, "Session restored from refresh credential");
                *slot = Some(Session::new(identity.clone()));
            }
        }

        Ok(identity)
    }
}
