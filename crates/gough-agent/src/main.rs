//! gough access agent.
//!
//! Runs three concurrent activities: the outbound heartbeat loop, the
//! reverse-SSH accept loop, and per-session PTY bridges. Enrollment runs
//! once at first start; afterwards the agent lives on rotating JWTs.
//! Exit codes: 0 normal shutdown, 1 startup failure, 2 fatal runtime
//! invariant.

mod certs;
mod client;
mod config;
mod pty;
mod rssh;
mod sessions;
mod tokens;

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::{ClientError, EnrollBody, HeartbeatBody, ManagementClient, ResourceUsage, ServerCommand};
use config::AgentConfig;
use tokens::{PersistedTokens, TokenStore};

const CONSECUTIVE_FAILURE_ALERT: u32 = 5;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gough_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(message) => {
            tracing::error!(message, "configuration error");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "agent failed");
            ExitCode::from(2)
        }
    }
}

async fn run(mut config: AgentConfig) -> anyhow::Result<()> {
    tracing::info!(
        management_server = %config.management_server,
        rssh_port = config.rssh_port,
        "starting gough agent"
    );

    let client = ManagementClient::new(&config)?;
    let token_store = TokenStore::new(config.token_file());

    let mut identity = if token_store.is_enrolled() {
        let identity = token_store.load()?;
        tracing::info!(agent_id = %identity.agent_id, "loaded existing identity");
        identity
    } else {
        enroll(&client, &mut config, &token_store).await?
    };

    // The CA public key is world-readable; SSH clients may want it too.
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::write(config.ca_key_file(), &identity.ca_public_key)?;

    let checker = Arc::new(certs::CertChecker::from_ca_file(&identity.ca_public_key)?);
    let host_key = rssh::load_or_generate_host_key(&config.host_key_file())?;
    let registry = Arc::new(sessions::SessionRegistry::new());

    let cancel = CancellationToken::new();
    let server = rssh::RsshServer::new(
        host_key,
        checker,
        Arc::clone(&registry),
        config.allow_root_fallback,
    );
    let rssh_task = tokio::spawn(server.run(config.rssh_port, cancel.child_token()));

    // Heartbeat loop, with shutdown on signal or server command.
    let heartbeat_cancel = cancel.child_token();
    let mut failures: u32 = 0;
    let mut system = sysinfo::System::new();
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.heartbeat_interval_s.max(1)));

    loop {
        tokio::select! {
            () = heartbeat_cancel.cancelled() => break,
            () = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {}
        }

        let body = heartbeat_body(&identity, &registry, &mut system);
        match send_heartbeat(&client, &token_store, &mut identity, &body).await {
            Ok(commands) => {
                failures = 0;
                let shutdown =
                    apply_commands(commands, &registry, &mut config, &mut interval);
                if shutdown {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                if failures >= CONSECUTIVE_FAILURE_ALERT {
                    // No backoff: the remedy is operator intervention, and a
                    // constant interval keeps recovery prompt.
                    tracing::error!(
                        failures,
                        error = %e,
                        "heartbeat failing persistently; operator attention required"
                    );
                } else {
                    tracing::warn!(failures, error = %e, "heartbeat failed");
                }
            }
        }
    }

    // Graceful shutdown: stop accepting, close sessions, stop the server.
    registry.terminate_all();
    cancel.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), rssh_task).await;
    tracing::info!("agent stopped");
    Ok(())
}

async fn enroll(
    client: &ManagementClient,
    config: &mut AgentConfig,
    token_store: &TokenStore,
) -> anyhow::Result<PersistedTokens> {
    let Some(key) = config.enrollment_key.clone() else {
        anyhow::bail!("not enrolled and GOUGH_ENROLLMENT_KEY is not set");
    };

    let body = EnrollBody {
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".into()),
        ip_address: local_ip().unwrap_or_else(|| "0.0.0.0".into()),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec!["ssh".to_string()],
        rssh_port: config.rssh_port,
    };

    tracing::info!(hostname = %body.hostname, "enrolling with management server");
    let reply = client.enroll(&key, &body).await?;

    if reply.config.heartbeat_interval_s > 0 {
        config.heartbeat_interval_s = reply.config.heartbeat_interval_s;
    }

    let identity = PersistedTokens {
        agent_id: reply.agent_id,
        access_token: reply.access_token,
        refresh_token: reply.refresh_token,
        ca_public_key: reply.ca_public_key,
        saved_at: chrono::Utc::now(),
    };
    token_store.save(&identity)?;
    tracing::info!(agent_id = %identity.agent_id, "enrolled");
    Ok(identity)
}

fn heartbeat_body(
    identity: &PersistedTokens,
    registry: &sessions::SessionRegistry,
    system: &mut sysinfo::System,
) -> HeartbeatBody {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let total = system.total_memory();
    let available = system.available_memory();
    #[allow(clippy::cast_precision_loss)]
    let mem_percent = if total == 0 {
        0.0
    } else {
        ((total - available.min(total)) as f32 / total as f32) * 100.0
    };

    HeartbeatBody {
        agent_id: identity.agent_id,
        status: "healthy".to_string(),
        active_sessions: registry.active_count(),
        closed_sessions: registry.drain_closed(),
        resource_usage: ResourceUsage {
            cpu_percent: system.global_cpu_usage(),
            mem_percent,
            mem_available_mb: available / (1024 * 1024),
            connections: 0,
        },
        timestamp: chrono::Utc::now(),
    }
}

/// Send one heartbeat; on a 401, refresh exactly once and retry.
async fn send_heartbeat(
    client: &ManagementClient,
    token_store: &TokenStore,
    identity: &mut PersistedTokens,
    body: &HeartbeatBody,
) -> Result<Vec<ServerCommand>, ClientError> {
    match client.heartbeat(&identity.access_token, body).await {
        Err(ClientError::Unauthorized(_)) => {
            tracing::info!("access token rejected, refreshing");
            let reply = client.refresh(&identity.refresh_token).await?;
            identity.access_token = reply.access_token;
            identity.refresh_token = reply.refresh_token;
            identity.saved_at = chrono::Utc::now();
            if let Err(e) = token_store.save(identity) {
                tracing::error!(error = %e, "failed to persist rotated tokens");
            }
            client.heartbeat(&identity.access_token, body).await
        }
        other => other,
    }
}

/// Apply server commands; returns true when a shutdown was ordered.
fn apply_commands(
    commands: Vec<ServerCommand>,
    registry: &sessions::SessionRegistry,
    config: &mut AgentConfig,
    interval: &mut tokio::time::Interval,
) -> bool {
    for command in commands {
        match command {
            ServerCommand::ReloadConfig => match AgentConfig::from_env() {
                Ok(fresh) => {
                    tracing::info!("configuration reloaded");
                    if fresh.heartbeat_interval_s != config.heartbeat_interval_s {
                        *interval = tokio::time::interval(std::time::Duration::from_secs(
                            fresh.heartbeat_interval_s.max(1),
                        ));
                    }
                    *config = fresh;
                }
                Err(e) => tracing::error!(error = %e, "configuration reload failed"),
            },
            ServerCommand::TerminateSession { session_id } => {
                if registry.terminate(&session_id) {
                    tracing::info!(session_id = %session_id, "terminating session on command");
                } else {
                    tracing::warn!(session_id = %session_id, "terminate for unknown session");
                }
            }
            ServerCommand::Shutdown => {
                tracing::info!("shutdown commanded by server");
                return true;
            }
        }
    }
    false
}

/// Best-effort local address discovery: the address a UDP socket would use
/// to reach a public host. No packets are sent.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
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
