//! In-process identity provider.
//!
//! Holds accounts, outstanding link tokens and the current session in memory.
//! Used by the binary when no hosted provider is wired in, and by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::link::{ContinuationLink, LinkMode};
use super::mailer::{LinkMailer, OutboundMail};
use super::provider::{EmailLinkRequest, Identity, IdentityProvider, SessionEvent};
use crate::config::GateConfig;
use crate::error::AuthError;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
});

const MIN_PASSWORD_LEN: usize = 6;
const TOKEN_LEN: usize = 32;

/// Provider settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Lifetime of sign-in tokens and verification codes.
    pub link_ttl: Duration,
    /// Landing page for verification links.
    pub verify_url: String,
    pub demo_email: String,
    /// Sign-in links allowed per address inside `rate_window`.
    pub max_links_per_window: usize,
    pub rate_window: Duration,
    pub event_capacity: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

impl ProviderSettings {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            link_ttl: config.link_ttl,
            verify_url: config.link_base_url.clone(),
            demo_email: config.demo.email.clone(),
            max_links_per_window: 5,
            rate_window: Duration::from_secs(10 * 60),
            event_capacity: config.session_event_capacity,
        }
    }
}

/// Provider operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    SendSignInLink,
    CompleteEmailLink,
    CreateDemoIdentity,
    SignUp,
    SignIn,
}

struct Account {
    identity: Identity,
    password: Option<SecretString>,
}

struct PendingCode {
    email: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by lowercased email.
    accounts: HashMap<String, Account>,
    link_tokens: HashMap<String, PendingCode>,
    verification_codes: HashMap<String, PendingCode>,
    sends: HashMap<String, VecDeque<DateTime<Utc>>>,
    current: Option<Identity>,
    seq: u64,
    faults: HashMap<ProviderOp, AuthError>,
    calls: HashMap<ProviderOp, usize>,
}

impl Inner {
    /// Record a call and return any scripted failure for it.
    fn enter(&mut self, op: ProviderOp) -> Result<(), AuthError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop expired codes and send histories with nothing left in `window`.
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.link_tokens.retain(|_, pending| pending.expires_at > now);
        self.verification_codes
            .retain(|_, pending| pending.expires_at > now);
        self.sends
            .retain(|_, sent| sent.back().is_some_and(|t| now - *t <= window));
    }

    fn account_or_create(&mut self, email: &str, verified: bool) -> &mut Account {
        self.accounts
            .entry(email.to_ascii_lowercase())
            .or_insert_with(|| Account {
                identity: Identity {
                    id: Uuid::new_v4().to_string(),
                    email: email.to_string(),
                    email_verified: verified,
                },
                password: None,
            })
    }
}

/// In-memory [`IdentityProvider`].
pub struct InMemoryIdentityProvider {
    inner: RwLock<Inner>,
    tx: broadcast::Sender<SessionEvent>,
    mailer: Arc<dyn LinkMailer>,
    settings: ProviderSettings,
}

impl InMemoryIdentityProvider {
    pub fn new(mailer: Arc<dyn LinkMailer>, settings: ProviderSettings) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(settings.event_capacity.max(1));
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            tx,
            mailer,
            settings,
        })
    }

    /// Make the next call of `op` fail with `err`.
    pub async fn fail_next(&self, op: ProviderOp, err: AuthError) {
        self.inner.write().await.faults.insert(op, err);
    }

    /// How many times `op` has been invoked.
    pub async fn call_count(&self, op: ProviderOp) -> usize {
        self.inner.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Replace the current identity and publish the change.
    ///
    /// Called with the write guard held so sequence order matches send order.
    fn publish(&self, inner: &mut Inner, identity: Option<Identity>) {
        inner.current = identity;
        inner.seq += 1;
        let event = SessionEvent {
            seq: inner.seq,
            identity: inner.current.clone(),
        };
        debug!(seq = event.seq, signed_in = event.identity.is_some(), "Publishing session change");
        // ok if nobody is subscribed yet
        let _ = self.tx.send(event);
    }

    fn new_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect()
    }

    fn check_email(email: &str) -> Result<(), AuthError> {
        if EMAIL_RE.is_match(email) {
            Ok(())
        } else {
            Err(AuthError::InvalidEmail(email.to_string()))
        }
    }

    fn rate_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.rate_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(10))
    }

    fn check_rate(&self, inner: &mut Inner, email: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
        let window = self.rate_window();
        let sends = inner.sends.entry(email.to_ascii_lowercase()).or_default();
        while sends.front().is_some_and(|t| now - *t > window) {
            sends.pop_front();
        }
        if sends.len() >= self.settings.max_links_per_window {
            warn!(email = %email, "Sign-in link rate limit hit");
            return Err(AuthError::RateLimited);
        }
        sends.push_back(now);
        Ok(())
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.settings.link_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    async fn current_session(&self) -> SessionEvent {
        let inner = self.inner.read().await;
        SessionEvent {
            seq: inner.seq,
            identity: inner.current.clone(),
        }
    }

    async fn send_sign_in_link(&self, request: &EmailLinkRequest) -> Result<(), AuthError> {
        let email = request.email.trim();
        let (token, link) = {
            let mut inner = self.inner.write().await;
            inner.enter(ProviderOp::SendSignInLink)?;
            Self::check_email(email)?;
            let now = Utc::now();
            inner.prune(now, self.rate_window());
            self.check_rate(&mut inner, email, now)?;

            let token = Self::new_token();
            let link = ContinuationLink::build(&request.continue_url, LinkMode::SignIn, &token, email)?;
            inner.link_tokens.insert(
                token.clone(),
                PendingCode {
                    email: email.to_string(),
                    expires_at: self.expiry(now),
                },
            );
            (token, link)
        };

        if let Err(e) = self.mailer.deliver(OutboundMail::sign_in_link(email, link)).await {
            // an undeliverable link must not stay redeemable
            self.inner.write().await.link_tokens.remove(&token);
            return Err(e);
        }
        info!(email = %email, "Sign-in link sent");
        Ok(())
    }

    async fn complete_email_link_sign_in(
        &self,
        token: &str,
        email: Option<&str>,
    ) -> Result<Identity, AuthError> {
        let mut inner = self.inner.write().await;
        inner.enter(ProviderOp::CompleteEmailLink)?;

        let pending = inner
            .link_tokens
            .get(token)
            .ok_or(AuthError::LinkExpiredOrInvalid)?;
        if pending.expires_at <= Utc::now() {
            inner.link_tokens.remove(token);
            return Err(AuthError::LinkExpiredOrInvalid);
        }
        if let Some(email) = email {
            if !pending.email.eq_ignore_ascii_case(email.trim()) {
                // wrong address does not consume the token
                return Err(AuthError::LinkExpiredOrInvalid);
            }
        }

        let bound_email = pending.email.clone();
        inner.link_tokens.remove(token);

        // Opening the link proves ownership of the address.
        let account = inner.account_or_create(&bound_email, true);
        account.identity.email_verified = true;
        let identity = account.identity.clone();

        self.publish(&mut inner, Some(identity.clone()));
        info!(identity_id = %identity.id, "Signed in with email link");
        Ok(identity)
    }

    async fn create_demo_identity(&self) -> Result<Identity, AuthError> {
        let mut inner = self.inner.write().await;
        inner.enter(ProviderOp::CreateDemoIdentity)?;

        let demo_email = self.settings.demo_email.clone();
        let identity = inner.account_or_create(&demo_email, true).identity.clone();

        self.publish(&mut inner, Some(identity.clone()));
        info!(identity_id = %identity.id, "Demo identity signed in");
        Ok(identity)
    }

    async fn create_user_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Identity, AuthError> {
        let email = email.trim();
        let mut inner = self.inner.write().await;
        inner.enter(ProviderOp::SignUp)?;
        Self::check_email(email)?;
        if password.expose_secret().len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        if inner.accounts.contains_key(&email.to_ascii_lowercase()) {
            return Err(AuthError::EmailInUse(email.to_string()));
        }

        let account = inner.account_or_create(email, false);
        account.password = Some(password.clone());
        let identity = account.identity.clone();

        self.publish(&mut inner, Some(identity.clone()));
        info!(identity_id = %identity.id, "Account created");
        Ok(identity)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Identity, AuthError> {
        let mut inner = self.inner.write().await;
        inner.enter(ProviderOp::SignIn)?;

        let account = inner
            .accounts
            .get(&email.trim().to_ascii_lowercase())
            .ok_or(AuthError::InvalidCredentials)?;
        let matches = account
            .password
            .as_ref()
            .is_some_and(|p| p.expose_secret() == password.expose_secret());
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }
        let identity = account.identity.clone();

        self.publish(&mut inner, Some(identity.clone()));
        info!(identity_id = %identity.id, "Signed in with password");
        Ok(identity)
    }

    async fn send_verification_email(&self) -> Result<(), AuthError> {
        let (email, link) = {
            let mut inner = self.inner.write().await;
            let email = inner
                .current
                .as_ref()
                .map(|i| i.email.clone())
                .ok_or(AuthError::NotSignedIn)?;
            let code = Self::new_token();
            let link =
                ContinuationLink::build(&self.settings.verify_url, LinkMode::VerifyEmail, &code, &email)?;
            let now = Utc::now();
            inner.prune(now, self.rate_window());
            let expires_at = self.expiry(now);
            inner.verification_codes.insert(
                code,
                PendingCode {
                    email: email.clone(),
                    expires_at,
                },
            );
            (email, link)
        };

        self.mailer
            .deliver(OutboundMail::verification(&email, link))
            .await
    }

    async fn apply_verification_code(&self, code: &str) -> Result<Identity, AuthError> {
        let mut inner = self.inner.write().await;
        let pending = inner
            .verification_codes
            .remove(code)
            .ok_or(AuthError::LinkExpiredOrInvalid)?;
        if pending.expires_at <= Utc::now() {
            return Err(AuthError::LinkExpiredOrInvalid);
        }

        let account = inner
            .accounts
            .get_mut(&pending.email.to_ascii_lowercase())
            .ok_or(AuthError::LinkExpiredOrInvalid)?;
        account.identity.email_verified = true;
        let identity = account.identity.clone();

        if inner.current.as_ref().is_some_and(|c| c.id == identity.id) {
            self.publish(&mut inner, Some(identity.clone()));
        }
        info!(identity_id = %identity.id, "Email verified");
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        if inner.current.is_none() {
            return Ok(());
        }
        self.publish(&mut inner, None);
        info!("Signed out");
        Ok(())
    }
}
