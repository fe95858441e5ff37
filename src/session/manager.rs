//! AuthSessionManager: the single subscriber to provider session changes.
//!
//! Owns the [`Session`] and the profile fetched for it, and publishes both as
//! a [`SessionSnapshot`] on a watch channel so consumers can read the latest
//! state synchronously.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::snapshot::{ProfileStatus, SessionSnapshot};
use crate::error::StoreError;
use crate::gate::GateState;
use crate::identity::{IdentityProvider, SessionEvent};
use crate::store::{ProfileStore, UserProfile};

/// Ordering and teardown bookkeeping. Never held across an await.
#[derive(Debug, Default)]
struct Tracking {
    last_seq: Option<u64>,
    /// Bumped whenever a profile fetch is started; older results are stale.
    profile_generation: u64,
    closed: bool,
}

struct Shared {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    state: watch::Sender<SessionSnapshot>,
    tracking: Mutex<Tracking>,
}

impl Shared {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn listen(self: Arc<Self>, events: broadcast::Receiver<SessionEvent>) {
        let initial = self.provider.current_session().await;
        self.apply(initial);

        let mut events = BroadcastStream::new(events);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => self.apply(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session events lagged, resyncing from provider");
                    let current = self.provider.current_session().await;
                    self.apply(current);
                }
            }
        }
        debug!("Session event stream closed");
    }

    /// Apply one session change. Stale or post-teardown events are dropped.
    fn apply(self: &Arc<Self>, event: SessionEvent) {
        let fetch = {
            let mut tracking = self.tracking();
            if tracking.closed {
                return;
            }
            if let Some(last) = tracking.last_seq.filter(|last| event.seq <= *last) {
                warn!(seq = event.seq, last_seq = last, "Discarding stale session event");
                return;
            }
            tracking.last_seq = Some(event.seq);

            let previous_id = self
                .state
                .borrow()
                .session
                .identity
                .as_ref()
                .map(|i| i.id.clone());
            let next_id = event.identity.as_ref().map(|i| i.id.clone());
            let identity_changed = previous_id != next_id;
            if identity_changed {
                tracking.profile_generation += 1;
            }
            let generation = tracking.profile_generation;

            info!(
                seq = event.seq,
                identity_id = next_id.as_deref().unwrap_or("-"),
                verified = event.identity.as_ref().is_some_and(|i| i.email_verified),
                "Session changed"
            );

            self.state.send_modify(|snapshot| {
                snapshot.session.identity = event.identity;
                snapshot.session.loading = false;
                if identity_changed {
                    snapshot.profile = if next_id.is_some() {
                        ProfileStatus::Pending
                    } else {
                        ProfileStatus::Absent
                    };
                }
            });

            next_id.filter(|_| identity_changed).map(|id| (generation, id))
        };

        if let Some((generation, identity_id)) = fetch {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                // failures are recorded in the snapshot
                let _ = shared.fetch_profile(generation, &identity_id).await;
            });
        }
    }

    /// Fetch the profile and publish it if `generation` is still current.
    async fn fetch_profile(
        &self,
        generation: u64,
        identity_id: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        let result = self.store.get(identity_id).await;

        let tracking = self.tracking();
        if tracking.closed || tracking.profile_generation != generation {
            debug!(identity_id = %identity_id, generation, "Discarding stale profile fetch");
            return result;
        }

        let status = match &result {
            Ok(Some(profile)) => ProfileStatus::Loaded(profile.clone()),
            Ok(None) => ProfileStatus::Missing,
            Err(e) => {
                warn!(identity_id = %identity_id, error = %e, "Profile fetch failed");
                ProfileStatus::Failed(e.clone())
            }
        };
        self.state.send_modify(|snapshot| snapshot.profile = status);
        result
    }
}

/// Bridges the provider's asynchronous session lifecycle into a readable
/// snapshot.
///
/// Construct once with [`AuthSessionManager::start`] and pass the `Arc` to
/// every consumer.
pub struct AuthSessionManager {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AuthSessionManager {
    /// Subscribe to `provider` and begin tracking the session.
    ///
    /// The snapshot reports loading until the provider's first answer.
    pub fn start(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
    ) -> Arc<Self> {
        let (state, _rx) = watch::channel(SessionSnapshot::initial());
        // Subscribe before reading the current session so nothing slips between.
        let events = provider.subscribe();
        let shared = Arc::new(Shared {
            provider,
            store,
            state,
            tracking: Mutex::new(Tracking::default()),
        });
        let listener = tokio::spawn(Arc::clone(&shared).listen(events));
        info!("Session manager started");

        Arc::new(Self {
            shared,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.borrow().clone()
    }

    /// The gate state for the latest snapshot.
    pub fn gate(&self) -> GateState {
        self.shared.state.borrow().gate()
    }

    /// Receive every future snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state.subscribe()
    }

    /// Wait until a snapshot satisfies `predicate` and return it.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = self.watch();
        match rx.wait_for(|snapshot| predicate(snapshot)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Wait for the first definitive gate answer.
    pub async fn settled(&self) -> SessionSnapshot {
        self.wait_for(|snapshot| !snapshot.is_loading()).await
    }

    /// Re-read the current identity's profile, e.g. after a profile write.
    ///
    /// Errors are returned to the caller and also recorded in the snapshot.
    pub async fn refresh_profile(&self) -> Result<Option<UserProfile>, StoreError> {
        let (generation, identity_id) = {
            let mut tracking = self.shared.tracking();
            let Some(identity_id) = self
                .shared
                .state
                .borrow()
                .session
                .identity
                .as_ref()
                .map(|i| i.id.clone())
            else {
                return Ok(None);
            };
            tracking.profile_generation += 1;
            (tracking.profile_generation, identity_id)
        };
        self.shared.fetch_profile(generation, &identity_id).await
    }

    /// Unsubscribe and drop any in-flight completions.
    pub fn shutdown(&self) {
        self.shared.tracking().closed = true;
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
            info!("Session manager stopped");
        }
    }
}

impl Drop for AuthSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::identity::{Identity, InMemoryIdentityProvider, OutboxMailer, ProviderSettings};
    use crate::store::{InMemoryProfileStore, ProfileUpdate};

    const WAIT: Duration = Duration::from_secs(2);

    fn provider() -> Arc<InMemoryIdentityProvider> {
        InMemoryIdentityProvider::new(Arc::new(OutboxMailer::new()), ProviderSettings::default())
    }

    fn identity(id: &str, verified: bool) -> Identity {
        Identity {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            email_verified: verified,
        }
    }

    /// Store whose reads fail.
    struct FailingStore;

    #[async_trait]
    impl ProfileStore for FailingStore {
        async fn get(&self, _identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
            Ok(profile)
        }
        async fn update(
            &self,
            identity_id: &str,
            _update: &ProfileUpdate,
        ) -> Result<UserProfile, StoreError> {
            Err(StoreError::NotFound(identity_id.to_string()))
        }
    }

    /// Store that delays reads for selected identities.
    struct SlowStore {
        inner: InMemoryProfileStore,
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl ProfileStore for SlowStore {
        async fn get(&self, identity_id: &str) -> Result<Option<UserProfile>, StoreError> {
            if let Some(delay) = self.delays.get(identity_id) {
                tokio::time::sleep(*delay).await;
            }
            self.inner.get(identity_id).await
        }
        async fn create_if_absent(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
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

    #[tokio::test]
    async fn starts_loading_then_settles_unauthenticated() {
        assert_eq!(SessionSnapshot::initial().gate(), GateState::Loading);

        let manager = AuthSessionManager::start(provider(), Arc::new(InMemoryProfileStore::new()));
        let settled = timeout(WAIT, manager.settled()).await.unwrap();
        assert!(settled.session.identity.is_none());
        assert!(!settled.session.loading);
        assert_eq!(settled.gate(), GateState::Unauthenticated);
    }

    #[tokio::test]
    async fn picks_up_sign_in_and_profile() {
        let provider = provider();
        let store = Arc::new(InMemoryProfileStore::new());
        let manager = AuthSessionManager::start(provider.clone(), store.clone());
        timeout(WAIT, manager.settled()).await.unwrap();

        let demo = provider.create_demo_identity().await.unwrap();
        store.create_if_absent(UserProfile::new(&demo, "Demo")).await.unwrap();

        let snapshot = timeout(
            WAIT,
            manager.wait_for(|s| s.identity().is_some() && !s.is_loading()),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.identity().map(|i| i.id.as_str()), Some(demo.id.as_str()));
        assert_eq!(snapshot.gate(), GateState::ProfileIncomplete);

        provider.sign_out().await.unwrap();
        let snapshot = timeout(WAIT, manager.wait_for(|s| s.identity().is_none()))
            .await
            .unwrap();
        assert!(matches!(snapshot.profile, ProfileStatus::Absent));
        assert_eq!(snapshot.gate(), GateState::Unauthenticated);
    }

    #[tokio::test]
    async fn stale_events_are_discarded() {
        let manager = AuthSessionManager::start(provider(), Arc::new(InMemoryProfileStore::new()));

        manager.shared.apply(SessionEvent {
            seq: 5,
            identity: Some(identity("newer", true)),
        });
        manager.shared.apply(SessionEvent {
            seq: 3,
            identity: None,
        });
        manager.shared.apply(SessionEvent {
            seq: 5,
            identity: Some(identity("duplicate", true)),
        });

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.identity().map(|i| i.id.as_str()), Some("newer"));
    }

    #[tokio::test]
    async fn verification_change_keeps_profile() {
        let store = Arc::new(InMemoryProfileStore::new());
        let unverified = identity("u1", false);
        store.create_if_absent(UserProfile::new(&unverified, "U")).await.unwrap();
        let manager = AuthSessionManager::start(provider(), store.clone());

        manager.shared.apply(SessionEvent {
            seq: 10,
            identity: Some(unverified),
        });
        let snapshot = timeout(WAIT, manager.wait_for(|s| s.profile().is_some()))
            .await
            .unwrap();
        assert_eq!(snapshot.gate(), GateState::EmailUnverified);

        manager.shared.apply(SessionEvent {
            seq: 11,
            identity: Some(identity("u1", true)),
        });
        let snapshot = manager.snapshot();
        assert!(snapshot.profile().is_some(), "same identity, no refetch");
        assert_eq!(snapshot.gate(), GateState::ProfileIncomplete);
    }

    #[tokio::test]
    async fn profile_fetch_failure_is_surfaced() {
        let manager = AuthSessionManager::start(provider(), Arc::new(FailingStore));
        manager.shared.apply(SessionEvent {
            seq: 1,
            identity: Some(identity("u1", true)),
        });

        let snapshot = timeout(WAIT, manager.wait_for(|s| s.profile_error().is_some()))
            .await
            .unwrap();
        assert!(snapshot.profile().is_none());
        assert_eq!(
            snapshot.profile_error(),
            Some(&StoreError::Unavailable("connection refused".into()))
        );

        let err = manager.refresh_profile().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn slow_fetch_for_previous_identity_is_discarded() {
        let inner = InMemoryProfileStore::new();
        let slow = identity("slow", true);
        let fast = identity("fast", true);
        inner.create_if_absent(UserProfile::new(&slow, "Slow")).await.unwrap();
        inner.create_if_absent(UserProfile::new(&fast, "Fast")).await.unwrap();
        let store = SlowStore {
            inner,
            delays: HashMap::from([("slow".to_string(), Duration::from_millis(200))]),
        };
        let manager = AuthSessionManager::start(provider(), Arc::new(store));

        manager.shared.apply(SessionEvent {
            seq: 1,
            identity: Some(slow),
        });
        manager.shared.apply(SessionEvent {
            seq: 2,
            identity: Some(fast),
        });

        let snapshot = timeout(WAIT, manager.wait_for(|s| s.profile().is_some()))
            .await
            .unwrap();
        assert_eq!(snapshot.profile().map(|p| p.name.as_str()), Some("Fast"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            manager.snapshot().profile().map(|p| p.name.as_str()),
            Some("Fast")
        );
    }

    #[tokio::test]
    async fn shutdown_ignores_later_changes() {
        let provider = provider();
        let manager = AuthSessionManager::start(provider.clone(), Arc::new(InMemoryProfileStore::new()));
        timeout(WAIT, manager.settled()).await.unwrap();

        manager.shutdown();
        provider.create_demo_identity().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.snapshot().identity().is_none());
    }

    #[tokio::test]
    async fn lagged_listener_resyncs_and_keeps_listening() {
        let provider = InMemoryIdentityProvider::new(
            Arc::new(OutboxMailer::new()),
            ProviderSettings {
                event_capacity: 1,
                ..ProviderSettings::default()
            },
        );
        let manager = AuthSessionManager::start(provider.clone(), Arc::new(InMemoryProfileStore::new()));
        timeout(WAIT, manager.settled()).await.unwrap();

        // Three changes before the listener runs again overflow its buffer.
        let demo = provider.create_demo_identity().await.unwrap();
        provider.sign_out().await.unwrap();
        provider.create_demo_identity().await.unwrap();

        let snapshot = timeout(
            WAIT,
            manager.wait_for(|s| s.identity().is_some() && !s.is_loading()),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.identity(), Some(&demo));
        assert_eq!(manager.shared.tracking().last_seq, Some(3));

        provider.sign_out().await.unwrap();
        let snapshot = timeout(WAIT, manager.wait_for(|s| s.identity().is_none()))
            .await
            .unwrap();
        assert_eq!(snapshot.gate(), GateState::Unauthenticated);
        assert_eq!(manager.shared.tracking().last_seq, Some(4));
    }
}
