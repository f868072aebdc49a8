//! Errors raised while talking to the identity provider.

/// Credential acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token response did not contain an access token")]
    MissingToken,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("token request timed out after {0}ms")]
    Timeout(u64),
}

/// Event query failures.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sign-in query returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid sign-in response: {0}")]
    Decode(String),

    #[error("sign-in query exceeded {0} pages")]
    TooManyPages(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("sign-in query timed out after {0}ms")]
    Timeout(u64),
}
