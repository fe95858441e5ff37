//! REST endpoints for sign-in and onboarding.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use super::account::AccountFlow;
use super::demo::{DemoProvisioningFlow, SkipReason};
use super::email_link::{EmailLinkSignInFlow, REQUEST_ROUTE};
use super::profile::{ProfileCompletionFlow, ProfileForm};
use crate::error::{AuthError, Error, LinkError, ProfileUpdateError, ProvisioningError};
use crate::gate::{GateAction, GateState, HOME_ROUTE, decide};
use crate::identity::{ContinuationLink, Identity};
use crate::session::{AuthSessionManager, SessionSnapshot};
use crate::store::UserProfile;

/// How long a handler waits for the session manager to catch up with a
/// sign-in or sign-out before answering with whatever it has.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared state for gate routes.
#[derive(Clone)]
pub struct GateRouteState {
    pub sessions: Arc<AuthSessionManager>,
    pub accounts: Arc<AccountFlow>,
    pub links: Arc<EmailLinkSignInFlow>,
    pub profiles: Arc<ProfileCompletionFlow>,
    pub demo: Arc<DemoProvisioningFlow>,
}

/// JSON view of a session snapshot.
#[derive(Debug, Serialize)]
struct SessionView {
    loading: bool,
    identity: Option<Identity>,
    profile: Option<UserProfile>,
    profile_error: Option<String>,
    gate: GateState,
    action: GateAction,
}

impl From<&SessionSnapshot> for SessionView {
    fn from(snapshot: &SessionSnapshot) -> Self {
        let gate = snapshot.gate();
        Self {
            loading: snapshot.is_loading(),
            identity: snapshot.identity().cloned(),
            profile: snapshot.profile().cloned(),
            profile_error: snapshot.profile_error().map(|e| e.to_string()),
            gate,
            action: gate.action(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Display) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message.to_string()})),
    )
        .into_response()
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidEmail(_)
        | AuthError::WeakPassword { .. }
        | AuthError::InvalidContinueUrl(_) => StatusCode::BAD_REQUEST,
        AuthError::InvalidCredentials | AuthError::NotSignedIn => StatusCode::UNAUTHORIZED,
        AuthError::EmailInUse(_) => StatusCode::CONFLICT,
        AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        AuthError::LinkExpiredOrInvalid => StatusCode::GONE,
        AuthError::Delivery { .. } | AuthError::Network(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_into_response(err: Error) -> Response {
    match err {
        Error::Auth(e) => error_response(auth_status(&e), e),
        Error::Store(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        e => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Wait until the snapshot shows `identity_id` (or nobody) with its profile
/// loaded, then render it.
async fn session_after(sessions: &AuthSessionManager, identity_id: Option<&str>) -> Response {
    let wait = sessions
        .wait_for(|s| s.identity().map(|i| i.id.as_str()) == identity_id && !s.is_loading());
    if timeout(SETTLE_TIMEOUT, wait).await.is_err() {
        warn!(
            identity_id = identity_id.unwrap_or("-"),
            "Session did not settle in time"
        );
    }
    Json(SessionView::from(&sessions.snapshot())).into_response()
}

// ── Session & gate ─────────────────────────────────────────────────────

/// GET /api/auth/session
async fn get_session(State(state): State<GateRouteState>) -> impl IntoResponse {
    Json(SessionView::from(&state.sessions.snapshot()))
}

#[derive(Deserialize)]
struct GateQuery {
    path: String,
}

/// GET /api/auth/gate?path=/explore
///
/// What the route guard for `path` does right now.
async fn get_gate(
    State(state): State<GateRouteState>,
    Query(query): Query<GateQuery>,
) -> impl IntoResponse {
    Json(decide(&query.path, state.sessions.gate()))
}

// ── Password accounts ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct SignUpBody {
    email: String,
    password: String,
    #[serde(default)]
    name: String,
}

/// POST /api/auth/signup
async fn sign_up(
    State(state): State<GateRouteState>,
    Json(body): Json<SignUpBody>,
) -> Response {
    let password = SecretString::from(body.password);
    match state.accounts.sign_up(&body.email, &password, &body.name).await {
        Ok((identity, _)) => session_after(&state.sessions, Some(&identity.id)).await,
        Err(e) => error_into_response(e),
    }
}

#[derive(Deserialize)]
struct SignInBody {
    email: String,
    password: String,
}

/// POST /api/auth/login
async fn sign_in(
    State(state): State<GateRouteState>,
    Json(body): Json<SignInBody>,
) -> Response {
    let password = SecretString::from(body.password);
    match state.accounts.sign_in(&body.email, &password).await {
        Ok(identity) => session_after(&state.sessions, Some(&identity.id)).await,
        Err(e) => error_into_response(e),
    }
}

/// POST /api/auth/logout
async fn sign_out(State(state): State<GateRouteState>) -> Response {
    match state.accounts.sign_out().await {
        Ok(()) => session_after(&state.sessions, None).await,
        Err(e) => error_into_response(e),
    }
}

#[derive(Deserialize)]
struct VerifyBody {
    /// The bare code, or the whole verification link.
    code: String,
}

/// POST /api/auth/verify-email
async fn verify_email(
    State(state): State<GateRouteState>,
    Json(body): Json<VerifyBody>,
) -> Response {
    let code = ContinuationLink::parse(&body.code)
        .map(|link| link.token)
        .unwrap_or(body.code);

    match state.accounts.verify_email(&code).await {
        Ok(identity) => {
            let current = state.sessions.snapshot();
            if current.identity().is_some_and(|i| i.id == identity.id) {
                let wait = state.sessions.wait_for(|s| {
                    s.identity().is_some_and(|i| i.email_verified) && !s.is_loading()
                });
                if timeout(SETTLE_TIMEOUT, wait).await.is_err() {
                    warn!(identity_id = %identity.id, "Verification not reflected in session yet");
                }
            }
            Json(SessionView::from(&state.sessions.snapshot())).into_response()
        }
        Err(e) => error_into_response(e),
    }
}

/// POST /api/auth/verify-email/resend
async fn resend_verification(State(state): State<GateRouteState>) -> Response {
    match state.accounts.resend_verification().await {
        Ok(()) => Json(serde_json::json!({"sent": true})).into_response(),
        Err(e) => error_into_response(e),
    }
}

// ── Email link ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LinkRequestBody {
    email: String,
}

/// GET /api/auth/email-link
async fn link_state(State(state): State<GateRouteState>) -> impl IntoResponse {
    Json(state.links.state())
}

/// POST /api/auth/email-link
async fn request_link(
    State(state): State<GateRouteState>,
    Json(body): Json<LinkRequestBody>,
) -> Response {
    match state.links.request_link(&body.email).await {
        Ok(()) => Json(state.links.state()).into_response(),
        Err(LinkError::SendFailed(e)) => {
            error_response(auth_status(&e), LinkError::SendFailed(e))
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

#[derive(Deserialize)]
struct LinkCompleteBody {
    link: String,
}

/// POST /api/auth/email-link/complete
///
/// An expired, consumed, or malformed link answers 410 with the route of the
/// request form.
async fn complete_link(
    State(state): State<GateRouteState>,
    Json(body): Json<LinkCompleteBody>,
) -> Response {
    match state.links.complete(&body.link).await {
        Ok(identity) => session_after(&state.sessions, Some(&identity.id)).await,
        Err(e) if e.is_terminal() => (
            StatusCode::GONE,
            Json(serde_json::json!({
                "error": e.to_string(),
                "redirect": REQUEST_ROUTE,
            })),
        )
            .into_response(),
        Err(LinkError::Auth(e)) => error_response(auth_status(&e), LinkError::Auth(e)),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

// ── Demo ───────────────────────────────────────────────────────────────

/// POST /api/auth/demo-login
///
/// Each press starts a new provisioning cycle; the latch still lets only one
/// attempt run at a time.
async fn demo_login(State(state): State<GateRouteState>) -> Response {
    let snapshot = match timeout(SETTLE_TIMEOUT, state.sessions.settled()).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Session is still loading");
        }
    };

    state.demo.reset();
    let attempt = match state.demo.try_begin(&snapshot) {
        Ok(attempt) => attempt,
        Err(SkipReason::SignedIn) => return Json(SessionView::from(&snapshot)).into_response(),
        Err(SkipReason::InFlight) => {
            let wait = state
                .sessions
                .wait_for(|s| s.identity().is_some() && !s.is_loading());
            return match timeout(SETTLE_TIMEOUT, wait).await {
                Ok(snapshot) => Json(SessionView::from(&snapshot)).into_response(),
                Err(_) => error_response(StatusCode::CONFLICT, ProvisioningError::InFlight),
            };
        }
        Err(SkipReason::Disabled) => {
            return error_response(StatusCode::FORBIDDEN, ProvisioningError::Disabled);
        }
        Err(reason) => {
            return error_response(
                StatusCode::CONFLICT,
                format!("Demo login unavailable ({reason:?})"),
            );
        }
    };

    match attempt.run().await {
        Ok(identity) => session_after(&state.sessions, Some(&identity.id)).await,
        Err(ProvisioningError::Failed(e)) => error_response(auth_status(&e), e),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

// ── Profile ────────────────────────────────────────────────────────────

/// POST /api/profile
async fn submit_profile(
    State(state): State<GateRouteState>,
    Json(form): Json<ProfileForm>,
) -> Response {
    match state.profiles.submit(&form).await {
        Ok(done) => Json(serde_json::json!({
            "profile": done.profile,
            "notice": done.notice,
            "redirect": HOME_ROUTE,
        }))
        .into_response(),
        Err(e) => {
            let status = match &e {
                ProfileUpdateError::MissingField { .. } => StatusCode::BAD_REQUEST,
                ProfileUpdateError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ProfileUpdateError::NotSignedIn => StatusCode::UNAUTHORIZED,
                ProfileUpdateError::NotEligible { .. } => StatusCode::CONFLICT,
            };
            error_response(status, e)
        }
    }
}

/// Build the gate REST routes.
pub fn gate_routes(state: GateRouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/api/auth/session", get(get_session))
        .route("/api/auth/gate", get(get_gate))
        .route("/api/auth/signup", post(sign_up))
        .route("/api/auth/login", post(sign_in))
        .route("/api/auth/logout", post(sign_out))
        .route("/api/auth/verify-email", post(verify_email))
        .route("/api/auth/verify-email/resend", post(resend_verification))
        .route("/api/auth/email-link", get(link_state).post(request_link))
        .route("/api/auth/email-link/complete", post(complete_link))
        .route("/api/auth/demo-login", post(demo_login))
        .route("/api/profile", post(submit_profile))
        .layer(cors)
        .with_state(state)
}
