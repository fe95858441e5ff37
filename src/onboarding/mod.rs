//! Onboarding flows: the ways a visitor gets an identity, and the profile
//! step that takes them to full access.
//!
//! Each flow talks to the identity provider or profile store directly and
//! never touches the session snapshot; the session manager picks up every
//! change from the provider's notifications.

pub mod account;
pub mod demo;
pub mod email_link;
pub mod profile;
pub mod routes;

pub use account::AccountFlow;
pub use demo::{DemoProvisioningFlow, LatchState, MAX_ATTEMPTS_PER_CYCLE, ProvisioningAttempt, SkipReason};
pub use email_link::{EmailLinkSignInFlow, LinkFlowState, REQUEST_ROUTE};
pub use profile::{Notice, ProfileCompleted, ProfileCompletionFlow, ProfileForm};
pub use routes::{GateRouteState, gate_routes};
