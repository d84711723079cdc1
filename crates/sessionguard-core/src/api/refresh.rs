//! Single-flight refresh coordination.
//!
//! The first request to see a 401 while no refresh is running starts one
//! exchange on a background task. Every request that fails while it is in
//! flight, the initiator included, parks a oneshot receiver in the pending
//! queue and is woken in FIFO order with the shared outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::{AccessCredential, CredentialStore, RefreshCredential, SessionExpiredNotifier};

/// Result of one refresh cycle, shared by every waiter of that cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    /// A new access credential is stored; replay the original request.
    Renewed,
    /// Credentials were cleared; the session is over.
    Expired,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: AccessCredential,
}

/// Idle when `refreshing` is false, in which case `waiters` is empty.
#[derive(Default)]
struct PendingRefresh {
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

/// Owns one cycle. Dropping it resolves every waiter and returns the
/// coordinator to idle, as `Expired` if the cycle never recorded an outcome.
struct CycleGuard {
    coordinator: Arc<RefreshCoordinator>,
    outcome: Option<RefreshOutcome>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => {
                warn!("Refresh cycle aborted, expiring session");
                self.coordinator.credentials.clear_all();
                RefreshOutcome::Expired
            }
        };
        self.coordinator.resolve(outcome);
    }
}

pub(crate) struct RefreshCoordinator {
    state: Mutex<PendingRefresh>,
    client: Client,
    refresh_url: String,
    credentials: Arc<CredentialStore>,
    timeout: Option<Duration>,
    notifier: RwLock<Option<Arc<dyn SessionExpiredNotifier>>>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        client: Client,
        refresh_url: String,
        credentials: Arc<CredentialStore>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: Mutex::new(PendingRefresh::default()),
            client,
            refresh_url,
            credentials,
            timeout,
            notifier: RwLock::new(None),
        }
    }

    pub(crate) fn set_notifier(&self, notifier: Arc<dyn SessionExpiredNotifier>) {
        let mut slot = self.notifier.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(notifier);
    }

    fn lock_state(&self) -> MutexGuard<'_, PendingRefresh> {
        // Every critical section leaves the state consistent before it can panic
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        self.lock_state().refreshing
    }

    pub(crate) fn pending_waiters(&self) -> usize {
        self.lock_state().waiters.len()
    }

    /// Wait for the outcome of the current refresh cycle, starting one if idle.
    ///
    /// `sent_with` is the access credential the rejected request carried. If
    /// an earlier cycle already replaced or cleared it, that cycle's outcome
    /// applies and no new exchange starts.
    pub(crate) async fn refresh(
        self: &Arc<Self>,
        sent_with: Option<&AccessCredential>,
    ) -> RefreshOutcome {
        let (tx, rx) = oneshot::channel();

        let start = {
            let mut state = self.lock_state();
            if !state.refreshing {
                // Cycles store the renewed credential before returning to idle
                match (sent_with, self.credentials.access()) {
                    (_, Some(current)) if Some(&current) != sent_with => {
                        debug!("Credential already renewed, replaying");
                        return RefreshOutcome::Renewed;
                    }
                    (Some(_), None) => {
                        debug!("Session ended while request was in flight");
                        return RefreshOutcome::Expired;
                    }
                    _ => {}
                }
            }

            state.waiters.push_back(tx);
            if state.refreshing {
                false
            } else {
                state.refreshing = true;
                true
            }
        };

        if start {
            debug!("Starting refresh exchange");
            self.start_cycle();
        } else {
            debug!("Refresh already in flight, waiting for outcome");
        }

        // The cycle guard resolves every queued sender, even on panic
        rx.await.unwrap_or(RefreshOutcome::Expired)
    }

    fn start_cycle(self: &Arc<Self>) {
        let mut cycle = CycleGuard {
            coordinator: Arc::clone(self),
            outcome: None,
        };
        tokio::spawn(async move {
            let outcome = cycle.coordinator.run_cycle().await;
            cycle.outcome = Some(outcome);
        });
    }

    async fn run_cycle(&self) -> RefreshOutcome {
        let outcome = match self.credentials.refresh_or_none() {
            None => {
                info!("No refresh credential available, session cannot be renewed");
                RefreshOutcome::Expired
            }
            Some(refresh) => match self.exchange(&refresh).await {
                Ok(access) => {
                    self.credentials.set_access(access);
                    RefreshOutcome::Renewed
                }
                Err(e) => {
                    warn!(error = %e, "Refresh exchange failed");
                    RefreshOutcome::Expired
                }
            },
        };

        if outcome == RefreshOutcome::Expired {
            self.credentials.clear_all();
            self.notify_expired();
        }
        outcome
    }

    /// Resolve every waiter in enqueue order and return to idle, in one
    /// critical section.
    fn resolve(&self, outcome: RefreshOutcome) {
        let mut state = self.lock_state();
        info!(?outcome, waiters = state.waiters.len(), "Refresh cycle complete");
        for waiter in state.waiters.drain(..) {
            // Receiver gone means that caller was cancelled; nothing to resume
            let _ = waiter.send(outcome);
        }
        state.refreshing = false;
    }

    fn notify_expired(&self) {
        let notifier = self
            .notifier
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(notifier) = notifier {
            notifier.session_expired();
        }
    }

    async fn exchange(&self, refresh: &RefreshCredential) -> Result<AccessCredential, ApiError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_exchange(refresh))
                .await
                .map_err(|_| ApiError::Timeout(limit))?,
            None => self.send_exchange(refresh).await,
        }
    }

    async fn send_exchange(&self, refresh: &RefreshCredential) -> Result<AccessCredential, ApiError> {
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh_token: refresh.expose(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let text = response.text().await?;
        let parsed: RefreshResponse = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;
        Ok(parsed.access_token)
    }
}
