//! Session data as seen by consumers.

use serde::Serialize;

use crate::error::StoreError;
use crate::gate::{self, GateState};
use crate::identity::Identity;
use crate::store::UserProfile;

/// The current identity plus whether the provider has answered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub identity: Option<Identity>,
    pub loading: bool,
}

/// Where the profile for the current identity stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileStatus {
    /// No identity, so no profile to fetch.
    Absent,
    /// Fetch in flight.
    Pending,
    Loaded(UserProfile),
    /// The store has no record for this identity.
    Missing,
    Failed(StoreError),
}

/// Session plus profile, published by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: Session,
    pub profile: ProfileStatus,
}

impl SessionSnapshot {
    /// State before the provider's first notification.
    pub fn initial() -> Self {
        Self {
            session: Session {
                identity: None,
                loading: true,
            },
            profile: ProfileStatus::Absent,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.session.identity.as_ref()
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        match &self.profile {
            ProfileStatus::Loaded(profile) => Some(profile),
            _ => None,
        }
    }

    pub fn profile_error(&self) -> Option<&StoreError> {
        match &self.profile {
            ProfileStatus::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Loading until the provider answers, and again while the profile for a
    /// new identity is being fetched.
    pub fn is_loading(&self) -> bool {
        self.session.loading || self.profile == ProfileStatus::Pending
    }

    pub fn gate(&self) -> GateState {
        gate::evaluate(self.is_loading(), self.identity(), self.profile())
    }
}
