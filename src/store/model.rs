//! Application-level user records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// User profile, one-to-one with an [`Identity`] by id.
///
/// Never deleted by the gate; signing out and back in with the same identity
/// finds the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    pub profile_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// A fresh, incomplete profile for `identity`.
    pub fn new(identity: &Identity, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            name: name.to_string(),
            bio: String::new(),
            city: String::new(),
            state: String::new(),
            profile_complete: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an already-validated update.
    pub(crate) fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(ref fields) = update.fields {
            self.name = fields.name.clone();
            self.bio = fields.bio.clone();
            self.city = fields.city.clone();
            self.state = fields.state.clone();
        }
        if let Some(complete) = update.profile_complete {
            self.profile_complete = complete;
        }
        self.updated_at = Utc::now();
    }
}

/// The mandatory profile fields, all non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub name: String,
    pub bio: String,
    pub city: String,
    pub state: String,
}

impl ProfileFields {
    /// Names of fields that are empty after trimming.
    pub fn blank_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("bio", &self.bio),
            ("city", &self.city),
            ("state", &self.state),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect()
    }
}

/// A write to a profile record.
///
/// Either carries all mandatory fields or none of them; a field-less update
/// only flips `profile_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(flatten)]
    pub fields: Option<ProfileFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_complete: Option<bool>,
}

impl ProfileUpdate {
    /// Write all fields and mark the profile complete in one step.
    pub fn completing(fields: ProfileFields) -> Self {
        Self {
            fields: Some(fields),
            profile_complete: Some(true),
        }
    }

    /// Only flip the completion flag.
    pub fn flag(complete: bool) -> Self {
        Self {
            fields: None,
            profile_complete: Some(complete),
        }
    }
}
