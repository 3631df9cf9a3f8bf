use std::{path::Path, time::Instant};

use tokio_util::sync::CancellationToken;

use minimc_agent::{
    config::AgentConfig,
    files::FileTree,
    log_hub::LogHub,
    paper, routes,
    state::{AppState, Credentials},
    supervisor::{ProcessRegistry, Supervisor, SupervisorOptions},
    telemetry,
};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn provision(config: &AgentConfig) {
    if config.skip_provision {
        tracing::info!("server provisioning disabled (MINIMC_SKIP_PROVISION)");
        return;
    }
    let res = async {
        let client = paper::PaperClient::new(&config.paper_api_url)?;
        paper::provision(&client, &config.data_dir, config.mc_version.as_deref()).await
    }
    .await;
    if let Err(e) = res {
        tracing::error!("server provisioning failed: {e:#}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started = Instant::now();
    let config = AgentConfig::from_env()?;

    let hub = LogHub::new(config.log_max_lines, config.subscriber_buffer);
    let _log_guard = telemetry::init(hub.clone(), Path::new("."))?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    provision(&config).await;

    let supervisor = Supervisor::new(
        ProcessRegistry::new(),
        hub,
        config.launch_spec(),
        SupervisorOptions {
            command_queue: config.command_queue,
            ..SupervisorOptions::default()
        },
    );
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        supervisor.clone(),
        FileTree::new(&config.data_dir),
        Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        },
        shutdown.clone(),
    );
    let app = routes::router(state, config.web_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "http listening");
    tracing::info!(
        "Welcome to MiniMC! (Ready in ~{:.1}s)",
        started.elapsed().as_secs_f64()
    );

    let grace = config.shutdown_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            supervisor.shutdown(grace).await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
