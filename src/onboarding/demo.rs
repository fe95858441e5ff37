//! Demo provisioning: a fallback identity when nobody is signed in.
//!
//! A latch makes sure at most one provisioning attempt is in flight. The
//! latch moves to `InFlight` synchronously, before the first await, so two
//! evaluations racing on the same snapshot cannot both start an attempt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DemoConfig;
use crate::error::ProvisioningError;
use crate::identity::{Identity, IdentityProvider};
use crate::session::{AuthSessionManager, SessionSnapshot};
use crate::store::{ProfileStore, UserProfile};

/// Attempts allowed per cycle: the first one plus a single retry.
pub const MAX_ATTEMPTS_PER_CYCLE: u32 = 2;

/// Latch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchState {
    NotAttempted,
    InFlight,
    Done,
    /// Last attempt failed; the next evaluation may retry.
    Failed,
}

#[derive(Debug)]
struct Latch {
    state: LatchState,
    attempts: u32,
}

/// Why an evaluation did not start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Loading,
    SignedIn,
    InFlight,
    Done,
    RetriesExhausted,
    Disabled,
}

/// One claimed provisioning attempt.
///
/// Dropping it unfinished (the caller went away mid-flight) releases the
/// latch without counting the attempt as failed.
pub struct ProvisioningAttempt<'a> {
    flow: &'a DemoProvisioningFlow,
    settled: bool,
}

impl ProvisioningAttempt<'_> {
    /// Create the demo identity and its profile record.
    pub async fn run(mut self) -> Result<Identity, ProvisioningError> {
        let result = self.flow.provider.create_demo_identity().await;

        let identity = match result {
            Ok(identity) => identity,
            Err(e) => {
                let mut latch = self.flow.latch();
                latch.state = LatchState::Failed;
                self.settled = true;
                warn!(
                    error = %e,
                    attempts = latch.attempts,
                    "Demo provisioning failed"
                );
                return Err(ProvisioningError::Failed(e));
            }
        };

        {
            let mut latch = self.flow.latch();
            latch.state = LatchState::Done;
            self.settled = true;
        }
        info!(identity_id = %identity.id, "Demo identity provisioned");

        let profile = UserProfile::new(&identity, &self.flow.config.display_name);
        match self.flow.store.create_if_absent(profile).await {
            Ok(_) => {
                if let Err(e) = self.flow.sessions.refresh_profile().await {
                    warn!(identity_id = %identity.id, error = %e, "Profile refresh failed");
                }
            }
            Err(e) => {
                warn!(identity_id = %identity.id, error = %e, "Could not create demo profile");
            }
        }
        Ok(identity)
    }
}

impl Drop for ProvisioningAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut latch = self.flow.latch();
        if latch.state == LatchState::InFlight {
            latch.attempts = latch.attempts.saturating_sub(1);
            latch.state = if latch.attempts == 0 {
                LatchState::NotAttempted
            } else {
                LatchState::Failed
            };
            debug!("Demo provisioning abandoned mid-flight");
        }
    }
}

/// Auto-provisions a fallback identity, at most once per cycle.
pub struct DemoProvisioningFlow {
    sessions: Arc<AuthSessionManager>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    config: DemoConfig,
    latch: Mutex<Latch>,
}

impl DemoProvisioningFlow {
    pub fn new(
        sessions: Arc<AuthSessionManager>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
        config: DemoConfig,
    ) -> Self {
        Self {
            sessions,
            provider,
            store,
            config,
            latch: Mutex::new(Latch {
                state: LatchState::NotAttempted,
                attempts: 0,
            }),
        }
    }

    fn latch(&self) -> MutexGuard<'_, Latch> {
        self.latch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latch_state(&self) -> LatchState {
        self.latch().state
    }

    /// Claim the latch if `snapshot` calls for provisioning.
    ///
    /// Synchronous: once this returns an attempt, every other evaluation is
    /// skipped until the attempt settles.
    pub fn try_begin(
        &self,
        snapshot: &SessionSnapshot,
    ) -> Result<ProvisioningAttempt<'_>, SkipReason> {
        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }
        if snapshot.session.loading {
            return Err(SkipReason::Loading);
        }
        if snapshot.identity().is_some() {
            return Err(SkipReason::SignedIn);
        }

        let mut latch = self.latch();
        match latch.state {
            LatchState::InFlight => return Err(SkipReason::InFlight),
            LatchState::Done => return Err(SkipReason::Done),
            LatchState::Failed if latch.attempts >= MAX_ATTEMPTS_PER_CYCLE => {
                return Err(SkipReason::RetriesExhausted);
            }
            LatchState::NotAttempted | LatchState::Failed => {}
        }
        latch.state = LatchState::InFlight;
        latch.attempts += 1;
        debug!(attempt = latch.attempts, "Demo provisioning latch claimed");

        Ok(ProvisioningAttempt {
            flow: self,
            settled: false,
        })
    }

    /// Evaluate `snapshot` and provision if needed.
    ///
    /// Returns `Ok(None)` when no attempt was due.
    pub async fn ensure_identity(
        &self,
        snapshot: &SessionSnapshot,
    ) -> Result<Option<Identity>, ProvisioningError> {
        match self.try_begin(snapshot) {
            Ok(attempt) => attempt.run().await.map(Some),
            Err(reason) => {
                debug!(?reason, "Demo provisioning skipped");
                Ok(None)
            }
        }
    }

    /// Start a new cycle, e.g. after the session manager restarts.
    pub fn reset(&self) {
        let mut latch = self.latch();
        if latch.state != LatchState::InFlight {
            latch.state = LatchState::NotAttempted;
            latch.attempts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::time::timeout;

    use super::*;
    use crate::error::AuthError;
    use crate::gate::GateState;
    use crate::identity::{InMemoryIdentityProvider, OutboxMailer, ProviderOp, ProviderSettings};
    use crate::session::Session;
    use crate::store::InMemoryProfileStore;

    const WAIT: Duration = Duration::from_secs(2);

    fn anonymous() -> SessionSnapshot {
        SessionSnapshot {
            session: Session {
                identity: None,
                loading: false,
            },
            ..SessionSnapshot::initial()
        }
    }

    struct Setup {
        provider: Arc<InMemoryIdentityProvider>,
        store: Arc<InMemoryProfileStore>,
        sessions: Arc<AuthSessionManager>,
        flow: DemoProvisioningFlow,
    }

    fn setup_with(config: DemoConfig) -> Setup {
        let provider =
            InMemoryIdentityProvider::new(Arc::new(OutboxMailer::new()), ProviderSettings::default());
        let store = Arc::new(InMemoryProfileStore::new());
        let sessions = AuthSessionManager::start(provider.clone(), store.clone());
        let flow =
            DemoProvisioningFlow::new(sessions.clone(), provider.clone(), store.clone(), config);
        Setup {
            provider,
            store,
            sessions,
            flow,
        }
    }

    fn setup() -> Setup {
        setup_with(DemoConfig::default())
    }

    #[tokio::test]
    async fn second_synchronous_evaluation_is_skipped() {
        let Setup { flow, .. } = setup();
        let snapshot = anonymous();

        let first = flow.try_begin(&snapshot);
        assert!(first.is_ok());
        assert_eq!(flow.latch_state(), LatchState::InFlight);
        for _ in 0..3 {
            assert_eq!(flow.try_begin(&snapshot).err(), Some(SkipReason::InFlight));
        }
    }

    #[tokio::test]
    async fn only_triggers_when_anonymous_and_settled() {
        let Setup { flow, .. } = setup();
        assert_eq!(
            flow.try_begin(&SessionSnapshot::initial()).err(),
            Some(SkipReason::Loading)
        );

        let mut signed_in = anonymous();
        signed_in.session.identity = Some(Identity {
            id: "u1".into(),
            email: "u1@example.com".into(),
            email_verified: true,
        });
        assert_eq!(flow.try_begin(&signed_in).err(), Some(SkipReason::SignedIn));
        assert_eq!(flow.latch_state(), LatchState::NotAttempted);
    }

    #[tokio::test]
    async fn concurrent_evaluations_attempt_once() {
        let Setup {
            provider,
            store,
            flow,
            ..
        } = setup();
        let snapshot = anonymous();

        let results = join_all((0..5).map(|_| flow.ensure_identity(&snapshot))).await;
        let provisioned: Vec<_> = results
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();

        assert_eq!(provisioned.len(), 1);
        assert_eq!(provider.call_count(ProviderOp::CreateDemoIdentity).await, 1);
        assert_eq!(flow.latch_state(), LatchState::Done);

        let profile = store.get(&provisioned[0].id).await.unwrap().unwrap();
        assert_eq!(profile.name, "Demo Explorer");
        assert!(!profile.profile_complete);

        // later evaluations stay quiet
        assert!(flow.ensure_identity(&snapshot).await.unwrap().is_none());
        assert_eq!(provider.call_count(ProviderOp::CreateDemoIdentity).await, 1);
    }

    #[tokio::test]
    async fn failure_clears_latch_for_one_retry() {
        let Setup { provider, flow, .. } = setup();
        let snapshot = anonymous();

        provider
            .fail_next(ProviderOp::CreateDemoIdentity, AuthError::Network("offline".into()))
            .await;
        let err = flow.ensure_identity(&snapshot).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Failed(AuthError::Network(_))));
        assert_eq!(flow.latch_state(), LatchState::Failed);

        // no retry happens on its own
        assert_eq!(provider.call_count(ProviderOp::CreateDemoIdentity).await, 1);

        let identity = flow.ensure_identity(&snapshot).await.unwrap();
        assert!(identity.is_some());
        assert_eq!(provider.call_count(ProviderOp::CreateDemoIdentity).await, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded_per_cycle() {
        let Setup { provider, flow, .. } = setup();
        let snapshot = anonymous();

        for _ in 0..MAX_ATTEMPTS_PER_CYCLE {
            provider
                .fail_next(ProviderOp::CreateDemoIdentity, AuthError::Network("offline".into()))
                .await;
            assert!(flow.ensure_identity(&snapshot).await.is_err());
        }
        assert_eq!(
            flow.try_begin(&snapshot).err(),
            Some(SkipReason::RetriesExhausted)
        );

        flow.reset();
        assert!(flow.ensure_identity(&snapshot).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn abandoned_attempt_releases_latch() {
        let Setup { flow, .. } = setup();
        let snapshot = anonymous();

        let attempt = flow.try_begin(&snapshot).unwrap();
        drop(attempt);
        assert_eq!(flow.latch_state(), LatchState::NotAttempted);
        assert!(flow.try_begin(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn provisioned_identity_reaches_the_gate() {
        let Setup { sessions, flow, .. } = setup();
        let snapshot = timeout(WAIT, sessions.settled()).await.unwrap();
        assert_eq!(snapshot.gate(), GateState::Unauthenticated);

        let identity = flow.ensure_identity(&snapshot).await.unwrap().unwrap();
        let snapshot = timeout(
            WAIT,
            sessions.wait_for(|s| s.identity().is_some() && !s.is_loading()),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.identity().map(|i| i.id.clone()), Some(identity.id.clone()));
        assert_ne!(snapshot.gate(), GateState::Unauthenticated);

        let snapshot = timeout(WAIT, sessions.wait_for(|s| s.profile().is_some()))
            .await
            .unwrap();
        assert_eq!(snapshot.profile().map(|p| p.id.clone()), Some(identity.id));
        assert_eq!(snapshot.gate(), GateState::ProfileIncomplete);
    }

    #[tokio::test]
    async fn disabled_never_triggers() {
        let Setup { flow, .. } = setup_with(DemoConfig {
            enabled: false,
            ..DemoConfig::default()
        });
        assert_eq!(flow.try_begin(&anonymous()).err(), Some(SkipReason::Disabled));
    }
}
