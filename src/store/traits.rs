//! `ProfileStore` trait: the single async interface to profile persistence.

use async_trait::async_trait;

use super::model::{ProfileUpdate, UserProfile};
use crate::error::StoreError;

/// Backend-agnostic profile storage, keyed by identity id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch the profile for an identity, if one exists.
    async fn get(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Insert `profile` unless a record for its id already exists.
    /// Returns the stored record either way.
    async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError>;

    /// Apply `update` atomically: either every field is written or none is.
    async fn update(
        &self,
        identity_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, StoreError>;
}
