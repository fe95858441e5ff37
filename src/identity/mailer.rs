//! Outbound delivery of sign-in and verification links.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::AuthError;

/// What an outbound email is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MailKind {
    SignInLink,
    Verification,
}

/// A link-carrying email ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMail {
    pub kind: MailKind,
    pub to: String,
    pub subject: String,
    pub link: String,
    pub queued_at: DateTime<Utc>,
}

impl OutboundMail {
    pub fn sign_in_link(to: &str, link: String) -> Self {
        Self {
            kind: MailKind::SignInLink,
            to: to.to_string(),
            subject: "Sign in to TwiTrip".to_string(),
            link,
            queued_at: Utc::now(),
        }
    }

    pub fn verification(to: &str, link: String) -> Self {
        Self {
            kind: MailKind::Verification,
            to: to.to_string(),
            subject: "Verify your email for TwiTrip".to_string(),
            link,
            queued_at: Utc::now(),
        }
    }

    fn body(&self) -> String {
        match self.kind {
            MailKind::SignInLink => format!(
                "Follow this link to sign in:\n\n{}\n\nIf you didn't ask to sign in, you can ignore this email.",
                self.link
            ),
            MailKind::Verification => format!(
                "Follow this link to verify your email address:\n\n{}",
                self.link
            ),
        }
    }
}

/// Delivers link emails.
#[async_trait]
pub trait LinkMailer: Send + Sync {
    async fn deliver(&self, mail: OutboundMail) -> Result<(), AuthError>;
}

/// Keeps delivered mail in memory. Used when no SMTP server is configured.
#[derive(Default)]
pub struct OutboxMailer {
    sent: Mutex<Vec<OutboundMail>>,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// All mail delivered so far, oldest first.
    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// The most recent link of `kind` delivered to `to`.
    pub fn last_link(&self, kind: MailKind, to: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.kind == kind && m.to.eq_ignore_ascii_case(to))
            .map(|m| m.link)
    }
}

#[async_trait]
impl LinkMailer for OutboxMailer {
    async fn deliver(&self, mail: OutboundMail) -> Result<(), AuthError> {
        info!(to = %mail.to, kind = ?mail.kind, "Link email queued in outbox");
        let mut sent = self.sent.lock().map_err(|_| AuthError::Delivery {
            to: mail.to.clone(),
            reason: "outbox poisoned".to_string(),
        })?;
        sent.push(mail);
        Ok(())
    }
}

/// Sends link emails over SMTP.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &SmtpConfig, mail: &OutboundMail) -> Result<(), AuthError> {
        let delivery_error = |reason: String| AuthError::Delivery {
            to: mail.to.clone(),
            reason,
        };

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| delivery_error(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| delivery_error(format!("Invalid from address: {e}")))?,
            )
            .to(mail
                .to
                .parse()
                .map_err(|e| delivery_error(format!("Invalid recipient: {e}")))?)
            .subject(mail.subject.clone())
            .body(mail.body())
            .map_err(|e| delivery_error(format!("Failed to build message: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| delivery_error(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl LinkMailer for SmtpMailer {
    async fn deliver(&self, mail: OutboundMail) -> Result<(), AuthError> {
        let config = self.config.clone();
        let to = mail.to.clone();
        let kind = mail.kind;

        // lettre's SMTP transport is blocking
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &mail))
            .await
            .map_err(|e| AuthError::Delivery {
                to: to.clone(),
                reason: format!("send task failed: {e}"),
            })??;

        info!(to = %to, kind = ?kind, "Link email sent via SMTP");
        Ok(())
    }
}
