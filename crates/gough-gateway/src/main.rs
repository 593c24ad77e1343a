//! gough control plane server.
//!
//! Startup order: configuration, store, secrets backend, CA, services,
//! background workers (inventory sync, agent health monitor, session
//! reaper), HTTP server. Exit codes: 0 normal shutdown, 1 startup failure,
//! 2 fatal runtime invariant.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gough_ca::CertificateAuthority;
use gough_clouds::DriverRegistry;
use gough_control::webhooks::WebhookProcessor;
use gough_control::{
    AgentIdentity, Auditor, ControlConfig, Heartbeats, InventorySync, MachineOrchestrator,
    PermissionEvaluator, SessionBroker, TokenService,
};
use gough_gateway::{create_router, GatewayConfig, GatewayState};
use gough_secrets::{SecretsConfig, SecretsRegistry};
use gough_store::{RocksStore, Store};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gough=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Config(message)) => {
            tracing::error!(message, "startup failed");
            ExitCode::from(1)
        }
        Err(StartupError::Fatal(message)) => {
            tracing::error!(message, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

enum StartupError {
    Config(String),
    Fatal(String),
}

async fn run() -> Result<(), StartupError> {
    tracing::info!("starting gough control plane");

    let config = GatewayConfig::from_env().map_err(StartupError::Config)?;
    let control_config = control_config_from_env();

    // Store
    let store_path = std::path::Path::new(&config.data_dir).join("db");
    let store = Arc::new(
        RocksStore::open(&store_path)
            .map_err(|e| StartupError::Config(format!("cannot open store: {e}")))?,
    );
    tracing::info!(path = %store_path.display(), "store opened");

    // Secrets backend
    let mut secrets_config = SecretsConfig::from_env();
    if secrets_config.data_dir.is_none() {
        secrets_config.data_dir = Some(std::path::Path::new(&config.data_dir).join("secrets"));
    }
    let secrets = SecretsRegistry::with_defaults()
        .create(&secrets_config)
        .map_err(|e| StartupError::Config(format!("secrets backend: {e}")))?;
    tracing::info!(backend = %secrets_config.backend, "secrets backend ready");

    // Certificate authority
    let ca = Arc::new(CertificateAuthority::new(
        Arc::clone(&store),
        Arc::clone(&secrets),
    ));
    let allowed_principals: Vec<String> = std::env::var("SSH_CA_ALLOWED_PRINCIPALS")
        .unwrap_or_else(|_| "ubuntu".into())
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    ca.ensure_initialized("default", allowed_principals)
        .await
        .map_err(|e| StartupError::Config(format!("CA initialization: {e}")))?;
    tracing::info!("certificate authority ready");

    // Services
    let tokens = Arc::new(TokenService::new(
        &config.jwt_secret_key,
        control_config.access_token_ttl_s,
        control_config.refresh_token_ttl_s,
    ));
    let identity = Arc::new(AgentIdentity::new(
        Arc::clone(&store),
        Arc::clone(&tokens),
        control_config.clone(),
    ));
    let heartbeats = Arc::new(Heartbeats::new(Arc::clone(&store), control_config.clone()));
    let permissions = PermissionEvaluator::new(Arc::clone(&store));
    let auditor = Auditor::new(Arc::clone(&store));
    let orchestrator = Arc::new(MachineOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&secrets),
        DriverRegistry::with_defaults(),
        control_config.clone(),
    ));
    let sync = Arc::new(InventorySync::new(
        Arc::clone(&orchestrator),
        control_config.clone(),
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        Arc::clone(&orchestrator),
        Arc::clone(&secrets),
    ));
    let broker = Arc::new(SessionBroker::new(
        Arc::clone(&store),
        Arc::clone(&ca),
        permissions.clone(),
        Arc::clone(&heartbeats),
        auditor.clone(),
        control_config.clone(),
    ));

    seed_admin(&store).map_err(StartupError::Config)?;

    // Rate limiter
    let ratelimit = match &config.redis_url {
        Some(url) => {
            let limiter = gough_gateway::ratelimit::RateLimiter::redis(url, config.rate_limit)
                .await
                .map_err(|e| StartupError::Config(format!("redis: {e}")))?;
            tracing::info!("rate limiter backed by redis");
            Arc::new(limiter)
        }
        None => {
            tracing::warn!("REDIS_URL not set; rate limit counters are per-process");
            Arc::new(gough_gateway::ratelimit::RateLimiter::memory(
                config.rate_limit,
            ))
        }
    };

    let metrics = Arc::new(gough_gateway::metrics::Metrics::new());

    // Background workers
    let cancel = CancellationToken::new();
    let sync_task = tokio::spawn(sync.run(cancel.child_token()));
    let reaper_task = tokio::spawn(Arc::clone(&broker).run_reaper(cancel.child_token()));
    let monitor_task = tokio::spawn(run_health_monitor(
        Arc::clone(&heartbeats),
        cancel.child_token(),
    ));

    let state = GatewayState {
        store,
        secrets,
        tokens,
        identity,
        heartbeats,
        permissions,
        orchestrator,
        webhooks,
        broker,
        ca,
        auditor,
        ratelimit,
        metrics,
        config: config.clone(),
    };

    let app = create_router(state);
    tracing::info!(listen_addr = %config.listen_addr, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Config(format!("cannot bind {}: {e}", config.listen_addr)))?;

    let shutdown_cancel = cancel.clone();
    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_cancel.cancel();
    })
    .await;

    cancel.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let _ = sync_task.await;
        let _ = reaper_task.await;
        let _ = monitor_task.await;
    })
    .await;

    serve_result.map_err(|e| StartupError::Fatal(format!("server error: {e}")))?;
    tracing::info!("shutdown complete");
    Ok(())
}

fn control_config_from_env() -> ControlConfig {
    let mut config = ControlConfig::default();
    if let Ok(value) = std::env::var("HEARTBEAT_INTERVAL") {
        if let Ok(seconds) = value.parse() {
            config.heartbeat_interval_s = seconds;
        }
    }
    if let Ok(value) = std::env::var("SYNC_INTERVAL") {
        if let Ok(seconds) = value.parse() {
            config.sync_interval_s = seconds;
        }
    }
    config
}

/// Seed the initial admin account from `ADMIN_EMAIL`/`ADMIN_PASSWORD` when
/// the user table is empty.
fn seed_admin<S: Store>(store: &Arc<S>) -> Result<(), String> {
    let users = store.list_users().map_err(|e| e.to_string())?;
    if !users.is_empty() {
        return Ok(());
    }

    let (Ok(email), Ok(password)) = (
        std::env::var("ADMIN_EMAIL"),
        std::env::var("ADMIN_PASSWORD"),
    ) else {
        tracing::warn!(
            "no users exist and ADMIN_EMAIL/ADMIN_PASSWORD are unset; the API has no usable account"
        );
        return Ok(());
    };

    let user = gough_store::User {
        id: gough_core::UserId::generate(),
        email,
        password_hash: bcrypt::hash(&password, bcrypt::DEFAULT_COST).map_err(|e| e.to_string())?,
        active: true,
        unique_token: uuid::Uuid::new_v4().to_string(),
        global_roles: std::iter::once(gough_store::Role::Admin).collect(),
        created_at: chrono::Utc::now(),
    };
    store.put_user(&user).map_err(|e| e.to_string())?;
    tracing::info!(email = %user.email, "seeded initial admin account");
    Ok(())
}

async fn run_health_monitor<S: Store + 'static>(
    heartbeats: Arc<Heartbeats<S>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
        }
        match heartbeats.monitor_pass() {
            Ok(0) => {}
            Ok(changes) => tracing::info!(changes, "agent health monitor updated statuses"),
            Err(e) => tracing::error!(error = %e, "agent health monitor pass failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
