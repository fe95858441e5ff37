//! Password accounts and email verification.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::error::{AuthError, Result};
use crate::identity::{Identity, IdentityProvider};
use crate::session::AuthSessionManager;
use crate::store::{ProfileStore, UserProfile};

pub struct AccountFlow {
    sessions: Arc<AuthSessionManager>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
}

impl AccountFlow {
    pub fn new(
        sessions: Arc<AuthSessionManager>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            sessions,
            provider,
            store,
        }
    }

    /// Create an unverified account, email it a verification link, and write
    /// its initial profile.
    ///
    /// A failed verification email does not undo the sign-up; the user can
    /// ask for another one from the verify-email screen.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        name: &str,
    ) -> Result<(Identity, UserProfile)> {
        let identity = self
            .provider
            .create_user_with_password(email, password)
            .await?;

        if let Err(e) = self.provider.send_verification_email().await {
            warn!(identity_id = %identity.id, error = %e, "Verification email not sent");
        }

        let profile = self
            .store
            .create_if_absent(UserProfile::new(&identity, name.trim()))
            .await?;
        if let Err(e) = self.sessions.refresh_profile().await {
            warn!(identity_id = %identity.id, error = %e, "Profile refresh failed");
        }
        info!(identity_id = %identity.id, "Signed up");
        Ok((identity, profile))
    }

    pub async fn sign_in(&self, email: &str, password: &SecretString) -> Result<Identity> {
        let identity = self.provider.sign_in_with_password(email, password).await?;
        Ok(identity)
    }

    /// Clears the session. The profile record is kept.
    pub async fn sign_out(&self) -> Result<()> {
        self.provider.sign_out().await?;
        Ok(())
    }

    pub async fn verify_email(&self, code: &str) -> Result<Identity> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::LinkExpiredOrInvalid.into());
        }
        let identity = self.provider.apply_verification_code(code).await?;
        Ok(identity)
    }

    pub async fn resend_verification(&self) -> Result<()> {
        self.provider.send_verification_email().await?;
        Ok(())
    }
}
