//! In-memory profile store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::model::{ProfileUpdate, UserProfile};
use super::traits::ProfileStore;
use crate::error::StoreError;

/// Upper bound on free-text profile fields.
const MAX_FIELD_LEN: usize = 500;

/// Profile records held in a map.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }
}

/// Reject updates the store would not accept.
fn validate(update: &ProfileUpdate) -> Result<(), StoreError> {
    if update.fields.is_none() && update.profile_complete.is_none() {
        return Err(StoreError::Rejected("Update contains no fields".to_string()));
    }
    if let Some(ref fields) = update.fields {
        let blank = fields.blank_fields();
        if !blank.is_empty() {
            return Err(StoreError::Rejected(format!(
                "Required fields are empty: {}",
                blank.join(", ")
            )));
        }
        for (field, value) in [("name", &fields.name), ("bio", &fields.bio)] {
            if value.chars().count() > MAX_FIELD_LEN {
                return Err(StoreError::Rejected(format!(
                    "{field} must be at most {MAX_FIELD_LEN} characters"
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.profiles.read().await.get(identity_id).cloned())
    }

    async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
        let mut profiles = self.profiles.write().await;
        if let Some(existing) = profiles.get(&profile.id) {
            debug!(identity_id = %profile.id, "Profile already exists");
            return Ok(existing.clone());
        }
        info!(identity_id = %profile.id, "Profile created");
        profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn update(
        &self,
        identity_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError> {
        validate(update)?;

        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(identity_id)
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        profile.apply(update);

        debug!(identity_id = %identity_id, complete = profile.profile_complete, "Profile updated");
        Ok(profile.clone())
    }
}
