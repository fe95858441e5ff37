//! Onboarding gate: maps session state to what a route may do.
//!
//! The gate is a pure function of `(loading, identity, profile)`; route
//! guards translate its state into render, spinner, or redirect.

pub mod guard;
pub mod state;

pub use guard::{HOME_ROUTE, OnboardingPage, RouteDecision, decide};
pub use state::{GateAction, GateState, evaluate};
