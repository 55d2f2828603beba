//! # Pipeline de modération de contenu temps réel
//!
//! Bibliothèque principale du pipeline : ingestion d'un message de chat,
//! filtrage léger (C1-C3), arbitrage LLM (C4-C5) sous un disjoncteur,
//! synthèse de verdict et de décision (C6, C8-C9), persistance (C7) et
//! diffusion aux abonnés temps réel (C10).

// ═══════════════════════════════════════════════════════════════════════
// MODULES CORE (FONCTIONNELS)
// ═══════════════════════════════════════════════════════════════════════

/// Gestion d'erreurs unifiée du pipeline
pub mod error;

/// Configuration en couches (fichier, environnement, CLI)
pub mod config;

/// Modèle de données échangé entre composants
pub mod models;

/// Métriques opérationnelles et export Prometheus
pub mod metrics;

/// Cache générique à expiration (dé-duplication des messages en C6)
pub mod cache;

/// Composants du pipeline (C1-C10)
pub mod core;

/// Bus de diffusion temps réel vers les abonnés WebSocket
pub mod hub;

/// Émission best-effort de notifications externes
pub mod notification;

/// Surface d'ingress HTTP/WebSocket (axum)
pub mod api;

// ═══════════════════════════════════════════════════════════════════════
// RE-EXPORTS PUBLICS
// ═══════════════════════════════════════════════════════════════════════

pub use config::ServerConfig;
pub use error::{PipelineError, Result};

use std::sync::Arc;
use std::time::Duration;

use crate::api::AppState;
use crate::core::decision::DecisionHandler;
use crate::core::filter::LightweightFilter;
use crate::core::llm_client::LlmClient;
use crate::core::orchestrator::ModerationOrchestrator;
use crate::core::pattern_matcher::{CompiledPatterns, PatternRules};
use crate::core::rate_limiter::InProcessRateLimiter;
use crate::core::templates::TemplateRegistry;
use crate::core::violation_store::ViolationStore;
use crate::hub::session::SessionHub;
use crate::metrics::PipelineMetrics;
use crate::notification::NotificationSink;

/// Construit l'état applicatif complet à partir de la configuration, en
/// câblant chaque composant sur ses dépendances (§5 graphe de composants).
/// Se connecte à Postgres et s'assure du schéma du Violation Store.
pub async fn build_app_state(config: ServerConfig) -> Result<AppState> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.persistence.max_connections)
        .connect(config.persistence.database_url.as_str())
        .await
        .map_err(|e| PipelineError::database_error("connect", e))?;

    let violation_store = Arc::new(ViolationStore::new(pool, config.persistence.retention_days));
    violation_store.ensure_schema().await?;

    let patterns = match &config.filter.pattern_file {
        Some(path) => CompiledPatterns::from_file(path)?,
        None => CompiledPatterns::compile(&PatternRules::default())?,
    };
    let rate_limiter = Arc::new(InProcessRateLimiter::new(
        config.filter.window(),
        config.filter.max_per_window,
    ));
    let filter = Arc::new(LightweightFilter::new(rate_limiter, Arc::new(patterns)));

    let templates = Arc::new(match &config.filter.template_file {
        Some(path) => TemplateRegistry::from_file(path)?,
        None => TemplateRegistry::with_defaults()?,
    });

    let llm = Arc::new(LlmClient::new(
        config.llm.clone(),
        config.circuit_breaker.clone(),
    ));

    let metrics = Arc::new(PipelineMetrics::new());

    let orchestrator = Arc::new(
        ModerationOrchestrator::with_filter_toggle(
            Arc::clone(&filter),
            Arc::clone(&templates),
            llm,
            config.features.enable_lightweight_filter,
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    let hub = Arc::new(SessionHub::with_metrics(
        config.session.queue_size,
        config.session.ping_interval() * 2,
        Some(Arc::clone(&metrics)),
    ));

    let notifications = Arc::new(NotificationSink::new(config.persistence.notification_url.clone()));

    let decision = Arc::new(
        DecisionHandler::with_notification_toggle(
            Arc::clone(&violation_store),
            Arc::clone(&hub),
            notifications,
            config.features.enable_notifications,
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    spawn_background_tasks(&config, &violation_store, &hub);

    Ok(AppState {
        config: Arc::new(config),
        filter,
        templates,
        orchestrator,
        decision,
        hub,
        metrics,
    })
}

fn spawn_background_tasks(
    config: &ServerConfig,
    violation_store: &Arc<ViolationStore>,
    hub: &Arc<SessionHub>,
) {
    let store = Arc::clone(violation_store);
    tokio::spawn(async move {
        store.run_retention_loop(Duration::from_secs(3600)).await;
    });

    let hub = Arc::clone(hub);
    let reap_interval = config.session.ping_interval();
    tokio::spawn(async move {
        hub.run_reaper_loop(reap_interval).await;
    });
}

/// Initialise la journalisation structurée (`tracing` + `tracing-subscriber`)
/// selon la configuration (§2a). Appelé une fois, au tout début de `main`.
///
/// Quand `logging.file` est renseigné, bascule vers un `tracing_appender`
/// à rotation quotidienne plutôt que stdout ; le `WorkerGuard` retourné doit
/// rester vivant jusqu'à la fin du process (sinon le writer non-bloquant
/// s'arrête de vider son tampon), donc l'appelant le conserve lié à une
/// variable plutôt que de le laisser tomber immédiatement.
pub fn init_tracing(
    logging: &config::LoggingConfig,
) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("modline.log")
                .to_string();
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, filename))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match logging.format {
        config::LogFormat::Json => subscriber.json().init(),
        config::LogFormat::Compact => subscriber.compact().init(),
        config::LogFormat::Pretty => subscriber.pretty().init(),
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_without_panicking_on_parse() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }
}
