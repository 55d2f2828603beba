//! Binaire `modline-server` : charge la configuration, initialise la
//! journalisation, câble le graphe de composants (`build_app_state`) et sert
//! l'application axum.
//!
//! Codes de sortie (§6/§7) : 0 succès, 1 erreur de configuration, 2 échec de
//! dépendance au démarrage (base de données, fichiers de templates/patterns),
//! 3 erreur fatale à l'exécution.

use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing::{error, info};

use modline::{api, build_app_state, init_tracing, ServerConfig};

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    // `workers == 0` defers to tokio's own core-count heuristic, matching
    // the teacher's "0 = auto" convention for this kind of knob.
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if config.server.workers > 0 {
        runtime_builder.worker_threads(config.server.workers);
    }
    let runtime = match runtime_builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> ExitCode {
    let _log_guard = init_tracing(&config.logging);
    info!(%config, "starting moderation pipeline");

    let bind_addr = config.server.bind_addr;
    let shutdown_timeout = config.server.shutdown_timeout;

    let state = match build_app_state(config).await {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "failed to initialize pipeline dependencies");
            return ExitCode::from(2);
        }
    };

    let app = api::build_router(state);

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %bind_addr, "failed to bind listener");
            return ExitCode::from(2);
        }
    };

    info!(%bind_addr, "listening");
    info!("   - GET  /health    - liveness check");
    info!("   - GET  /metrics   - Prometheus text exposition");
    info!("   - GET  /templates - allowlisted prompt templates");
    info!("   - POST /moderate  - run the full moderation pipeline");
    info!("   - POST /filter    - lightweight filter only (no LLM)");
    info!("   - POST /decide    - apply policy + persistence to a pre-verdicted event");
    info!("   - GET  /ws        - subscribe to the session hub");

    // A `watch` fans the same shutdown signal out to both the graceful
    // drain (no deadline of its own) and a hard deadline timer bounded by
    // `shutdown_timeout`, so a stuck in-flight request can't hang the
    // process forever.
    let (tx, mut rx) = tokio::sync::watch::channel(());
    let mut hard_deadline_rx = rx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = tx.send(());
    });

    let graceful = async move {
        let _ = rx.changed().await;
        info!("shutdown signal received, draining in-flight requests");
    };
    let hard_deadline = async move {
        let _ = hard_deadline_rx.changed().await;
        tokio::time::sleep(shutdown_timeout).await;
    };

    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(graceful) => {
            if let Err(err) = result {
                error!(error = %err, "server terminated with a fatal error");
                return ExitCode::from(3);
            }
        }
        _ = hard_deadline => {
            error!(?shutdown_timeout, "graceful shutdown exceeded the configured deadline, forcing exit");
            return ExitCode::from(3);
        }
    }

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
