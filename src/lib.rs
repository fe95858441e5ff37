//! TripGate: session tracking and onboarding gate for TwiTrip.

pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod onboarding;
pub mod session;
pub mod store;
