//! Sign-in audit log access.
//!
//! This crate provides:
//! - `CredentialProvider` trait and the OAuth2 client-credentials implementation
//! - `EventSource` trait and the Graph `auditLogs/signIns` implementation
//! - `AuthError` / `FetchError`, the two failures that abort a run

pub mod auth;
pub mod error;
pub mod signins;
pub mod traits;

pub use auth::ClientCredentialProvider;
pub use error::{AuthError, FetchError};
pub use signins::{sign_in_filter, GraphSignInSource};
pub use traits::{AccessToken, CredentialProvider, EventSource};
