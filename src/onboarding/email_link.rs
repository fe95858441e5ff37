//! Passwordless sign-in by emailed link.
//!
//! Phase 1 asks the provider to email a link carrying a single-use token.
//! Phase 2 runs when the user comes back through that link: the token is
//! exchanged for a session, which the session manager then picks up like any
//! other sign-in. Nothing but the token carries over between the phases.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::LinkError;
use crate::identity::{ContinuationLink, EmailLinkRequest, Identity, IdentityProvider};
use crate::session::AuthSessionManager;
use crate::store::{ProfileStore, UserProfile};

/// Route the user goes back to after a terminal link failure.
pub const REQUEST_ROUTE: &str = "/email-link-signup";

/// What the email-link screen shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkFlowState {
    /// Request form.
    Idle,
    /// "Check your email" for `email`.
    LinkSent { email: String },
    /// Request form with a retryable error.
    Failed { message: String },
}

pub struct EmailLinkSignInFlow {
    sessions: Arc<AuthSessionManager>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    continue_url: String,
    state: Mutex<LinkFlowState>,
}

impl EmailLinkSignInFlow {
    pub fn new(
        sessions: Arc<AuthSessionManager>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
        continue_url: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            provider,
            store,
            continue_url: continue_url.into(),
            state: Mutex::new(LinkFlowState::Idle),
        }
    }

    pub fn state(&self) -> LinkFlowState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, next: LinkFlowState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Phase 1: email a sign-in link to `email`.
    ///
    /// Asking again for the same address just sends another link.
    pub async fn request_link(&self, email: &str) -> Result<(), LinkError> {
        let email = email.trim();
        let request = EmailLinkRequest {
            email: email.to_string(),
            continue_url: self.continue_url.clone(),
        };

        match self.provider.send_sign_in_link(&request).await {
            Ok(()) => {
                self.set_state(LinkFlowState::LinkSent {
                    email: email.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(email = %email, error = %e, "Sign-in link request failed");
                let err = LinkError::SendFailed(e);
                self.set_state(LinkFlowState::Failed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Phase 2: complete sign-in from the link the user opened.
    ///
    /// An expired, consumed, or unknown token fails with
    /// [`LinkError::LinkExpiredOrInvalid`] and resets to the request form.
    pub async fn complete(&self, incoming: &str) -> Result<Identity, LinkError> {
        let Some(link) = ContinuationLink::parse(incoming) else {
            self.set_state(LinkFlowState::Idle);
            return Err(LinkError::MissingToken);
        };

        let identity = match self
            .provider
            .complete_email_link_sign_in(&link.token, link.email.as_deref())
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                let err = LinkError::from(e);
                if err.is_terminal() {
                    info!("Sign-in link rejected, returning to request form");
                    self.set_state(LinkFlowState::Idle);
                } else {
                    warn!(error = %err, "Sign-in link completion failed");
                    self.set_state(LinkFlowState::Failed {
                        message: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        // First sign-in creates the profile record the gate reads. The
        // sign-in was announced before the write, so re-read it.
        match self
            .store
            .create_if_absent(UserProfile::new(&identity, ""))
            .await
        {
            Ok(_) => {
                if let Err(e) = self.sessions.refresh_profile().await {
                    warn!(identity_id = %identity.id, error = %e, "Profile refresh failed");
                }
            }
            Err(e) => {
                warn!(identity_id = %identity.id, error = %e, "Could not create profile record");
            }
        }

        self.set_state(LinkFlowState::Idle);
        info!(identity_id = %identity.id, "Email link sign-in complete");
        Ok(identity)
    }
}
