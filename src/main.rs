use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use tripgate::config::GateConfig;
use tripgate::identity::{
    InMemoryIdentityProvider, LinkMailer, OutboxMailer, ProviderSettings, SmtpMailer,
};
use tripgate::onboarding::{
    AccountFlow, DemoProvisioningFlow, EmailLinkSignInFlow, GateRouteState, ProfileCompletionFlow,
    gate_routes,
};
use tripgate::session::AuthSessionManager;
use tripgate::store::InMemoryProfileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (SMTP)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = GateConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; the guard flushes the log file on exit
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tripgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("TripGate v{}", env!("CARGO_PKG_VERSION"));

    // ── Identity ──────────────────────────────────────────────────────────
    let mailer: Arc<dyn LinkMailer> = match config.smtp.clone() {
        Some(smtp) => {
            eprintln!("   Mail: SMTP via {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpMailer::new(smtp))
        }
        None => {
            eprintln!("   Mail: outbox only (set TRIPGATE_SMTP_HOST to send)");
            Arc::new(OutboxMailer::new())
        }
    };
    let provider = InMemoryIdentityProvider::new(mailer, ProviderSettings::from_config(&config));
    let store = Arc::new(InMemoryProfileStore::new());

    // ── Session & flows ───────────────────────────────────────────────────
    let sessions = AuthSessionManager::start(provider.clone(), store.clone());
    let state = GateRouteState {
        sessions: Arc::clone(&sessions),
        accounts: Arc::new(AccountFlow::new(
            Arc::clone(&sessions),
            provider.clone(),
            store.clone(),
        )),
        links: Arc::new(EmailLinkSignInFlow::new(
            Arc::clone(&sessions),
            provider.clone(),
            store.clone(),
            config.link_base_url.clone(),
        )),
        profiles: Arc::new(ProfileCompletionFlow::new(
            Arc::clone(&sessions),
            store.clone(),
        )),
        demo: Arc::new(DemoProvisioningFlow::new(
            Arc::clone(&sessions),
            provider.clone(),
            store.clone(),
            config.demo.clone(),
        )),
    };
    if config.demo.enabled {
        eprintln!("   Demo login: {}", config.demo.email);
    }

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = gate_routes(state);
    let address = format!("0.0.0.0:{}", config.bind_port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    tracing::info!(port = config.bind_port, "Gate server started");
    eprintln!("   Listening on {address}\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    sessions.shutdown();
    Ok(())
}
