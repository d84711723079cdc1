//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: the access credential in memory plus the refresh
//!   credential in durable storage
//! - `RefreshStore` backends: OS keychain, encrypted file, or memory
//! - `SessionController`: login, logout and identity lookup

pub mod credentials;
pub mod session;
pub mod storage;

pub use credentials::{AccessCredential, CredentialStore, RefreshCredential};
pub use session::{Identity, Session, SessionController, SessionExpiredNotifier};
pub use storage::{FileRefreshStore, KeyringRefreshStore, MemoryRefreshStore, RefreshStore};
