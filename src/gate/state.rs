//! Onboarding gate states and the rules that pick one.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::store::UserProfile;

/// Onboarding progress, derived from session and profile.
///
/// Never stored: recompute with [`evaluate`] whenever it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Loading,
    Unauthenticated,
    EmailUnverified,
    ProfileIncomplete,
    Active,
}

impl GateState {
    /// Route a protected page redirects to in this state.
    ///
    /// `None` for `Loading` (show a spinner) and `Active` (render).
    pub fn redirect(&self) -> Option<&'static str> {
        match self {
            Self::Loading | Self::Active => None,
            Self::Unauthenticated => Some("/login"),
            Self::EmailUnverified => Some("/verify-email"),
            Self::ProfileIncomplete => Some("/create-profile"),
        }
    }

    /// What a protected route does in this state.
    pub fn action(&self) -> GateAction {
        match self.redirect() {
            Some(to) => GateAction::Redirect { to },
            None if *self == Self::Loading => GateAction::ShowSpinner,
            None => GateAction::Render,
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Unauthenticated => "unauthenticated",
            Self::EmailUnverified => "email_unverified",
            Self::ProfileIncomplete => "profile_incomplete",
            Self::Active => "active",
        };
        write!(f, "{s}")
    }
}

/// What a route does with a resolved gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateAction {
    ShowSpinner,
    Redirect { to: &'static str },
    Render,
}

/// Map `(loading, identity, profile)` to a gate state.
///
/// Rules are checked top to bottom; the first match wins. A missing profile
/// counts as incomplete.
pub fn evaluate(
    loading: bool,
    identity: Option<&Identity>,
    profile: Option<&UserProfile>,
) -> GateState {
    if loading {
        return GateState::Loading;
    }
    let Some(identity) = identity else {
        return GateState::Unauthenticated;
    };
    if !identity.email_verified {
        return GateState::EmailUnverified;
    }
    match profile {
        Some(p) if p.profile_complete => GateState::Active,
        _ => GateState::ProfileIncomplete,
    }
}
