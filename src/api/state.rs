//! État partagé de l'application axum, construit une fois au démarrage et
//! cloné (tous champs sont des `Arc`) dans chaque handler.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::decision::DecisionHandler;
use crate::core::filter::LightweightFilter;
use crate::core::orchestrator::ModerationOrchestrator;
use crate::core::templates::TemplateRegistry;
use crate::hub::session::SessionHub;
use crate::metrics::PipelineMetrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub filter: Arc<LightweightFilter>,
    pub templates: Arc<TemplateRegistry>,
    pub orchestrator: Arc<ModerationOrchestrator>,
    pub decision: Arc<DecisionHandler>,
    pub hub: Arc<SessionHub>,
    pub metrics: Arc<PipelineMetrics>,
}
