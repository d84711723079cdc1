use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::RefreshStore;
use crate::api::ApiError;

/// Short-lived bearer token. Only ever held in process memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessCredential(String);

/// Long-lived bearer token exchanged for new access credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshCredential(String);

impl AccessCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl RefreshCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCredential(***)")
    }
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshCredential(***)")
    }
}

/// Holds the credential pair for the current session.
///
/// The access credential lives in memory and is lost on restart. The refresh
/// credential is delegated to a durable [`RefreshStore`].
pub struct CredentialStore {
    access: RwLock<Option<AccessCredential>>,
    refresh: Arc<dyn RefreshStore>,
}

impl CredentialStore {
    pub fn new(refresh: Arc<dyn RefreshStore>) -> Self {
        Self {
            access: RwLock::new(None),
            refresh,
        }
    }

    // ===== Access credential (in-memory) =====

    pub fn access(&self) -> Option<AccessCredential> {
        self.access.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_access(&self, credential: AccessCredential) {
        *self.access_slot() = Some(credential);
    }

    pub fn clear_access(&self) {
        *self.access_slot() = None;
    }

    fn access_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<AccessCredential>> {
        // The slot is a plain Option, a panicked writer cannot leave it half-written
        self.access.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== Refresh credential (durable) =====

    pub fn refresh(&self) -> Result<Option<RefreshCredential>, ApiError> {
        self.refresh
            .load()
            .map_err(|e| ApiError::StorageUnavailable(format!("{:#}", e)))
    }

    /// Read the refresh credential, treating an unreachable store as empty.
    pub fn refresh_or_none(&self) -> Option<RefreshCredential> {
        match self.refresh() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Refresh credential unreadable, treating as absent");
                None
            }
        }
    }

    pub fn set_refresh(&self, credential: &RefreshCredential) -> Result<(), ApiError> {
        self.refresh
            .save(credential)
            .map_err(|e| ApiError::StorageUnavailable(format!("{:#}", e)))
    }

    pub fn clear_refresh(&self) -> Result<(), ApiError> {
        self.refresh
            .delete()
            .map_err(|e| ApiError::StorageUnavailable(format!("{:#}", e)))
    }

    /// Clear both credentials. Safe to call repeatedly.
    pub fn clear_all(&self) {
        self.clear_access();
        if let Err(e) = self.clear_refresh() {
            warn!(error = %e, "Failed to delete refresh credential");
        }
        debug!("Credentials cleared");
    }

    pub fn has_any(&self) -> bool {
        self.access().is_some() || self.refresh_or_none().is_some()
    }
}
