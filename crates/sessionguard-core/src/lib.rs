//! sessionguard - an HTTP client that keeps a session alive across
//! short-lived access credentials.
//!
//! Build a [`SessionController`](auth::SessionController) from a
//! [`SessionClient`](api::SessionClient) and a [`CredentialStore`](auth::CredentialStore):
//!
//! ```no_run
//! use std::sync::Arc;
//! use sessionguard_core::api::{ClientOptions, SessionClient};
//! use sessionguard_core::auth::{CredentialStore, MemoryRefreshStore, SessionController};
//!
//! # async fn run() -> Result<(), sessionguard_core::api::ApiError> {
//! let credentials = Arc::new(CredentialStore::new(Arc::new(MemoryRefreshStore::new())));
//! let client = SessionClient::new(ClientOptions::new("http://localhost:3000/api"), credentials)?;
//! let controller = SessionController::new(client, Arc::new(|| eprintln!("please log in again")));
//!
//! controller.login("user@example.com", "password123").await?;
//! let me = controller.current_identity().await?;
//! println!("{} ({})", me.name, me.role);
//! controller.logout().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
