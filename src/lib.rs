//! Implements the Tonga feature flag client
//!
//! Flags are resolved against a remote Tonga server, either one at a time or
//! through a single bulk pre-fetch, and cached for the lifetime of the
//! client. Usage analytics are aggregated locally and reported to the server
//! by a background task, off the critical path of `get`.
//!
//! To change the default request timeout set the TONGA_TIMEOUT_MS
//! environment variable to the desired timeout value.
mod analytics;
mod cache;
mod client;
mod http;

pub mod models;
pub use crate::client::{ScopedState, TongaClient, TongaClientBuilder};
pub use crate::models::{ContextAttributes, FlagValue, RequestAttributes, TongaOptions};
