//! Identity provider seam: who is signed in, and how they got there.

pub mod link;
pub mod mailer;
pub mod memory;
pub mod provider;

pub use link::{ContinuationLink, LinkMode};
pub use mailer::{LinkMailer, MailKind, OutboundMail, OutboxMailer, SmtpMailer};
pub use memory::{InMemoryIdentityProvider, ProviderOp, ProviderSettings};
pub use provider::{EmailLinkRequest, Identity, IdentityProvider, SessionEvent};
