//! Authenticated REST client.
//!
//! This module provides the `SessionClient` for talking to the remote
//! authentication service and any API protected by its bearer tokens.
//!
//! Requests carry the current access credential. A 401 triggers one shared
//! refresh exchange no matter how many requests fail at the same time, after
//! which every waiting request is replayed once.

pub mod client;
pub mod error;
mod refresh;

pub use client::{ApiRequest, ClientOptions, SessionClient};
pub use error::ApiError;
