//! Error types for the auth gate.

use crate::gate::GateState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Email link error: {0}")]
    Link(#[from] LinkError),

    #[error("Profile update error: {0}")]
    ProfileUpdate(#[from] ProfileUpdateError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity provider failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email already in use: {0}")]
    EmailInUse(String),

    #[error("Password must be at least {min} characters")]
    WeakPassword { min: usize },

    #[error("Too many requests, try again later")]
    RateLimited,

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Invalid continue URL: {0}")]
    InvalidContinueUrl(String),

    #[error("Sign-in link is expired, invalid, or already used")]
    LinkExpiredOrInvalid,

    #[error("Failed to deliver email to {to}: {reason}")]
    Delivery { to: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),
}

impl AuthError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Network(_) | Self::Delivery { .. }
        )
    }
}

/// Email-link sign-in failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Sign-in link is expired, invalid, or already used")]
    LinkExpiredOrInvalid,

    #[error("Incoming link carries no continuation token")]
    MissingToken,

    #[error("Failed to send email link. Please try again.")]
    SendFailed(#[source] AuthError),

    #[error("Email link sign-in failed. Please try again.")]
    Auth(#[source] AuthError),
}

impl LinkError {
    /// Terminal errors send the user back to the request form.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LinkExpiredOrInvalid | Self::MissingToken)
    }
}

impl From<AuthError> for LinkError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::LinkExpiredOrInvalid => Self::LinkExpiredOrInvalid,
            other => Self::Auth(other),
        }
    }
}

/// Profile store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Profile not found for identity {0}")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Profile store unavailable: {0}")]
    Unavailable(String),
}

/// Profile completion failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileUpdateError {
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("{0}")]
    Rejected(String),

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Profile completion is not available in state {state}")]
    NotEligible { state: GateState },
}

impl From<StoreError> for ProfileUpdateError {
    fn from(err: StoreError) -> Self {
        match err {
            // Surface the store's own message untouched.
            StoreError::Rejected(message) => Self::Rejected(message),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Demo identity provisioning failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Demo identity creation failed: {0}")]
    Failed(#[source] AuthError),

    #[error("Demo provisioning already in flight")]
    InFlight,

    #[error("Demo provisioning is disabled")]
    Disabled,
}

/// Result type alias for the gate.
pub type Result<T> = std::result::Result<T, Error>;
