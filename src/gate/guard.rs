//! Route guards built on the gate state.

use serde::Serialize;

use super::state::{GateAction, GateState};

/// Landing page for fully onboarded users.
pub const HOME_ROUTE: &str = "/explore";

/// The onboarding pages, each reachable in exactly one gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingPage {
    Login,
    VerifyEmail,
    CreateProfile,
}

impl OnboardingPage {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/login" => Some(Self::Login),
            "/verify-email" => Some(Self::VerifyEmail),
            "/create-profile" => Some(Self::CreateProfile),
            _ => None,
        }
    }

    /// The gate state in which this page renders.
    pub fn owning_state(&self) -> GateState {
        match self {
            Self::Login => GateState::Unauthenticated,
            Self::VerifyEmail => GateState::EmailUnverified,
            Self::CreateProfile => GateState::ProfileIncomplete,
        }
    }
}

/// A guard's verdict for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub path: String,
    pub state: GateState,
    pub action: GateAction,
}

/// Decide what `path` does in `state`.
///
/// Protected paths render only when `Active`. Onboarding pages render only in
/// their own state; an active user is sent home, anyone else to the page for
/// their state.
pub fn decide(path: &str, state: GateState) -> RouteDecision {
    let action = match OnboardingPage::from_path(path) {
        None => state.action(),
        Some(_) if state == GateState::Loading => GateAction::ShowSpinner,
        Some(page) if page.owning_state() == state => GateAction::Render,
        Some(_) if state == GateState::Active => GateAction::Redirect { to: HOME_ROUTE },
        Some(_) => state.action(),
    };

    RouteDecision {
        path: path.to_string(),
        state,
        action,
    }
}
