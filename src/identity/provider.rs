//! Identity provider contract and the types it hands out.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AuthError;

/// The authenticated principal returned by the identity provider.
///
/// Read-only outside the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub email_verified: bool,
}

/// A session-change notification.
///
/// `seq` increases monotonically per provider; a receiver that has applied
/// `seq = n` must discard any later-arriving event with `seq <= n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub identity: Option<Identity>,
}

/// Phase 1 of a passwordless sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLinkRequest {
    pub email: String,
    /// Page the user lands on when opening the link.
    pub continue_url: String,
}

/// Backend-agnostic identity provider.
///
/// Models a single client session: sign-in operations replace the current
/// identity and every change is published on the [`subscribe`] stream.
///
/// [`subscribe`]: IdentityProvider::subscribe
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Subscribe to session changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// The current session, stamped with the latest sequence number.
    async fn current_session(&self) -> SessionEvent;

    /// Email a single-use sign-in link bound to `request.email`.
    async fn send_sign_in_link(&self, request: &EmailLinkRequest) -> Result<(), AuthError>;

    /// Exchange a continuation token for a live session.
    ///
    /// `email`, when given, must match the address the token was issued for.
    async fn complete_email_link_sign_in(
        &self,
        token: &str,
        email: Option<&str>,
    ) -> Result<Identity, AuthError>;

    /// Create (or reuse) the fallback demo identity and sign it in.
    async fn create_demo_identity(&self) -> Result<Identity, AuthError>;

    async fn create_user_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Identity, AuthError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Identity, AuthError>;

    /// Email a verification code to the signed-in identity.
    async fn send_verification_email(&self) -> Result<(), AuthError>;

    /// Mark the code's owner as verified. Publishes a session change if the
    /// owner is the current identity.
    async fn apply_verification_code(&self, code: &str) -> Result<Identity, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}
