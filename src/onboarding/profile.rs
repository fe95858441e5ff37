//! Profile completion: the step between verification and full access.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ProfileUpdateError;
use crate::gate::GateState;
use crate::session::AuthSessionManager;
use crate::store::{ProfileFields, ProfileStore, ProfileUpdate, UserProfile};

/// Raw form input. Every field is mandatory and must be non-blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileForm {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl ProfileForm {
    /// Check every mandatory field, reporting the first one missing.
    pub fn validate(&self) -> Result<ProfileFields, ProfileUpdateError> {
        fn required(
            field: &'static str,
            value: &Option<String>,
        ) -> Result<String, ProfileUpdateError> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(ProfileUpdateError::MissingField { field }),
            }
        }

        Ok(ProfileFields {
            name: required("name", &self.name)?,
            bio: required("bio", &self.bio)?,
            city: required("city", &self.city)?,
            state: required("state", &self.state)?,
        })
    }
}

/// Shown to the user after a successful submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub title: &'static str,
    pub description: &'static str,
}

/// Successful completion.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileCompleted {
    pub profile: UserProfile,
    pub notice: Notice,
}

/// Collects the mandatory profile fields and marks the profile complete.
pub struct ProfileCompletionFlow {
    sessions: Arc<AuthSessionManager>,
    store: Arc<dyn ProfileStore>,
}

impl ProfileCompletionFlow {
    pub fn new(sessions: Arc<AuthSessionManager>, store: Arc<dyn ProfileStore>) -> Self {
        Self { sessions, store }
    }

    /// Validate and write all fields plus `profile_complete = true` in one
    /// store update.
    ///
    /// Invalid input is rejected before the store is touched. On a store
    /// failure nothing is written and the store's message is returned as-is;
    /// the form stays editable.
    ///
    /// The record is created first if sign-in never got to write it.
    pub async fn submit(&self, form: &ProfileForm) -> Result<ProfileCompleted, ProfileUpdateError> {
        let fields = form.validate()?;

        let snapshot = self.sessions.snapshot();
        let identity = snapshot
            .identity()
            .cloned()
            .ok_or(ProfileUpdateError::NotSignedIn)?;
        let state = snapshot.gate();
        if state != GateState::ProfileIncomplete {
            return Err(ProfileUpdateError::NotEligible { state });
        }

        self.store
            .create_if_absent(UserProfile::new(&identity, &fields.name))
            .await
            .inspect_err(|e| {
                warn!(identity_id = %identity.id, error = %e, "Profile record could not be created");
            })?;

        let profile = self
            .store
            .update(&identity.id, &ProfileUpdate::completing(fields))
            .await
            .inspect_err(|e| {
                warn!(identity_id = %identity.id, error = %e, "Profile update rejected");
            })?;
        info!(identity_id = %identity.id, "Profile completed");

        // The gate reads the profile from the session snapshot.
        if let Err(e) = self.sessions.refresh_profile().await {
            warn!(identity_id = %identity.id, error = %e, "Profile refresh after update failed");
        }

        Ok(ProfileCompleted {
            profile,
            notice: Notice {
                title: "Profile Created",
                description: "Welcome to TwiTrip!",
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::error::StoreError;
    use crate::identity::{
        ContinuationLink, EmailLinkRequest, IdentityProvider, InMemoryIdentityProvider, MailKind,
        OutboxMailer, ProviderSettings,
    };
    use crate::onboarding::EmailLinkSignInFlow;
    use crate::store::InMemoryProfileStore;

    const WAIT: Duration = Duration::from_secs(2);

    fn form(bio: Option<&str>) -> ProfileForm {
        ProfileForm {
            name: Some("Ana".into()),
            bio: bio.map(String::from),
            city: Some("Rio".into()),
            state: Some("RJ".into()),
        }
    }

    /// Counts writes and rejects them all.
    #[derive(Default)]
    struct RejectingStore {
        inner: InMemoryProfileStore,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl ProfileStore for RejectingStore {
        async fn get(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
            self.inner.get(identity_id).await
        }
        async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
            self.inner.create_if_absent(profile).await
        }
        async fn update(
            &self,
            _identity_id: &str,
            _update: &ProfileUpdate,
        ) -> Result<UserProfile, StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Rejected("City is not supported yet".into()))
        }
    }

    /// Fails the first record creation, then behaves.
    #[derive(Default)]
    struct FlakyCreateStore {
        inner: InMemoryProfileStore,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl ProfileStore for FlakyCreateStore {
        async fn get(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
            self.inner.get(identity_id).await
        }
        async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("store offline".into()));
            }
            self.inner.create_if_absent(profile).await
        }
        async fn update(
            &self,
            identity_id: &str,
            update: &ProfileUpdate,
        ) -> Result<UserProfile, StoreError> {
            self.inner.update(identity_id, update).await
        }
    }

    /// Sign Ana in through an email link and seed an incomplete profile.
    async fn signed_in(store: Arc<dyn ProfileStore>) -> (Arc<AuthSessionManager>, String) {
        let outbox = Arc::new(OutboxMailer::new());
        let provider = InMemoryIdentityProvider::new(outbox.clone(), ProviderSettings::default());
        let sessions = AuthSessionManager::start(provider.clone(), store.clone());

        provider
            .send_sign_in_link(&EmailLinkRequest {
                email: "ana@example.com".into(),
                continue_url: "http://localhost/verify-email-link".into(),
            })
            .await
            .unwrap();
        let link = outbox.last_link(MailKind::SignInLink, "ana@example.com").unwrap();
        let token = ContinuationLink::parse(&link).unwrap().token;
        let identity = provider.complete_email_link_sign_in(&token, None).await.unwrap();
        store
            .create_if_absent(UserProfile::new(&identity, ""))
            .await
            .unwrap();
        sessions.refresh_profile().await.unwrap();

        let snapshot = timeout(
            WAIT,
            sessions.wait_for(|s| s.gate() == GateState::ProfileIncomplete),
        )
        .await
        .unwrap();
        assert!(snapshot.profile().is_some());
        (sessions, identity.id)
    }

    #[test]
    fn validate_reports_first_missing_field() {
        assert!(form(Some("x")).validate().is_ok());
        assert_eq!(
            form(None).validate().unwrap_err(),
            ProfileUpdateError::MissingField { field: "bio" }
        );
        assert_eq!(
            form(Some("   ")).validate().unwrap_err(),
            ProfileUpdateError::MissingField { field: "bio" }
        );
        assert_eq!(
            ProfileForm::default().validate().unwrap_err(),
            ProfileUpdateError::MissingField { field: "name" }
        );
    }

    #[tokio::test]
    async fn submit_completes_profile_and_activates_gate() {
        let store = Arc::new(InMemoryProfileStore::new());
        let (sessions, id) = signed_in(store.clone()).await;
        let flow = ProfileCompletionFlow::new(sessions.clone(), store.clone());

        let done = flow.submit(&form(Some("x"))).await.unwrap();
        assert!(done.profile.profile_complete);
        assert_eq!(done.notice.title, "Profile Created");

        assert_eq!(sessions.gate(), GateState::Active);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            (stored.name.as_str(), stored.bio.as_str(), stored.city.as_str(), stored.state.as_str()),
            ("Ana", "x", "Rio", "RJ")
        );
    }

    #[tokio::test]
    async fn missing_bio_rejected_before_store_call() {
        let store = Arc::new(RejectingStore::default());
        let (sessions, _id) = signed_in(store.clone()).await;
        let flow = ProfileCompletionFlow::new(sessions, store.clone());

        let err = flow.submit(&form(None)).await.unwrap_err();
        assert_eq!(err, ProfileUpdateError::MissingField { field: "bio" });
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_rejection_is_verbatim_and_leaves_profile_incomplete() {
        let store = Arc::new(RejectingStore::default());
        let (sessions, id) = signed_in(store.clone()).await;
        let flow = ProfileCompletionFlow::new(sessions.clone(), store.clone());

        let err = flow.submit(&form(Some("x"))).await.unwrap_err();
        assert_eq!(err.to_string(), "City is not supported yet");
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);

        let stored = store.get(&id).await.unwrap().unwrap();
        assert!(!stored.profile_complete);
        assert!(stored.city.is_empty());
        assert_eq!(sessions.gate(), GateState::ProfileIncomplete);

        // the form can be submitted again
        let err = flow.submit(&form(Some("x"))).await.unwrap_err();
        assert!(matches!(err, ProfileUpdateError::Rejected(_)));
    }

    #[tokio::test]
    async fn not_reachable_outside_profile_incomplete() {
        let provider =
            InMemoryIdentityProvider::new(Arc::new(OutboxMailer::new()), ProviderSettings::default());
        let store = Arc::new(InMemoryProfileStore::new());
        let sessions = AuthSessionManager::start(provider, store.clone());
        timeout(WAIT, sessions.settled()).await.unwrap();

        let flow = ProfileCompletionFlow::new(sessions, store);
        let err = flow.submit(&form(Some("x"))).await.unwrap_err();
        assert_eq!(err, ProfileUpdateError::NotSignedIn);
    }

    #[tokio::test]
    async fn submit_recovers_when_sign_in_never_wrote_the_record() {
        let outbox = Arc::new(OutboxMailer::new());
        let provider = InMemoryIdentityProvider::new(outbox.clone(), ProviderSettings::default());
        let store = Arc::new(FlakyCreateStore::default());
        let sessions = AuthSessionManager::start(provider.clone(), store.clone());
        let links = EmailLinkSignInFlow::new(
            sessions.clone(),
            provider,
            store.clone(),
            "http://localhost/verify-email-link",
        );

        links.request_link("ana@example.com").await.unwrap();
        let link = outbox.last_link(MailKind::SignInLink, "ana@example.com").unwrap();
        let identity = links.complete(&link).await.unwrap();
        assert!(store.get(&identity.id).await.unwrap().is_none());

        let snapshot = timeout(
            WAIT,
            sessions.wait_for(|s| s.gate() == GateState::ProfileIncomplete),
        )
        .await
        .unwrap();
        assert!(snapshot.profile().is_none());

        let flow = ProfileCompletionFlow::new(sessions.clone(), store.clone());
        let done = flow.submit(&form(Some("x"))).await.unwrap();
        assert!(done.profile.profile_complete);
        assert_eq!(done.profile.id, identity.id);
        assert_eq!(sessions.gate(), GateState::Active);
    }
}
