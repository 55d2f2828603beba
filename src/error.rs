//! # Gestion d'erreurs unifiée du pipeline de modération
//!
//! Fournit un type d'erreur unique couvrant tous les `Kind` de §7 plus les
//! fautes d'ingress/config/persistance, avec `http_status()`, `severity()`
//! et `public_message()` pour un traitement uniforme aux frontières.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Type alias pour Result avec notre erreur personnalisée
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Erreurs du pipeline de modération
#[derive(Error, Debug)]
pub enum PipelineError {
    // ═══════════════════════════════════════════════════════════════════════
    // FRONTIÈRE D'INGRESS (§7: InputInvalid)
    // ═══════════════════════════════════════════════════════════════════════
    /// Requête d'ingress malformée : rejetée à la frontière, 400 au client.
    #[error("requête invalide: {reason}")]
    InputInvalid { reason: String },

    /// Corps de message trop long après toute troncature applicable.
    #[error("message trop long: {actual} octets (max: {max})")]
    MessageTooLong { actual: usize, max: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // LIGHTWEIGHT FILTER (C3, §7: FilterInternalError)
    // ═══════════════════════════════════════════════════════════════════════
    /// Faute du moteur de pattern matching ; dégrade en fail-open vers `pass`.
    #[error("erreur interne du filtre: {reason}")]
    FilterInternalError { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // TEMPLATE REGISTRY (C4, §7: fatal per-request)
    // ═══════════════════════════════════════════════════════════════════════
    /// Nom de template hors de l'allowlist serveur.
    #[error("template inconnu: {name}")]
    TemplateUnknown { name: String },

    /// Variable déclarée par le template absente de la substitution.
    #[error("variable de template manquante: {variable}")]
    TemplateVariableMissing { variable: String },

    /// Template invalide à l'enregistrement (placeholder non déclaré, format de sortie absent).
    #[error("template invalide {name}: {reason}")]
    TemplateInvalid { name: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // LLM CLIENT (C5, §4.5 / §7)
    // ═══════════════════════════════════════════════════════════════════════
    /// Délai global dépassé avant réponse de l'upstream.
    #[error("délai dépassé pour l'appel LLM")]
    LLMDeadlineExceeded,

    /// Le disjoncteur est ouvert ; la requête est court-circuitée sans trafic réseau.
    #[error("circuit LLM ouvert")]
    LLMCircuitOpen,

    /// Erreur transitoire (connexion, 5xx, 429) après épuisement des retries.
    #[error("erreur transitoire LLM après {attempts} tentatives: {reason}")]
    LLMTransient { attempts: u32, reason: String },

    /// Erreur 4xx non retryable (autre que 408/425/429).
    #[error("requête LLM rejetée ({status}): {reason}")]
    LLMBadRequest { status: u16, reason: String },

    /// Réponse upstream non parseable en JSON de modération valide.
    #[error("réponse LLM non parseable: {reason}")]
    LLMUnparseable { reason: String },

    /// Faute générique côté upstream (hors schéma 4xx/5xx classifié).
    #[error("erreur upstream LLM: {reason}")]
    LLMUpstreamError { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // VIOLATION STORE (C7, §7: ViolationStoreUnavailable)
    // ═══════════════════════════════════════════════════════════════════════
    /// Le magasin de violations est indisponible ; l'action est dégradée à `log`.
    #[error("violation store indisponible: {reason}")]
    ViolationStoreUnavailable { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // SESSION HUB (C10, §7: SessionBackpressure)
    // ═══════════════════════════════════════════════════════════════════════
    /// File sortante d'un abonné pleine ; l'événement le plus ancien est abandonné.
    #[error("backpressure de session sur le canal {channel_id}")]
    SessionBackpressure { channel_id: String },

    /// Erreur de transport WebSocket à la frontière du Session Hub.
    #[error("erreur WebSocket: {source}")]
    WebSocket {
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // NOTIFICATION SINK (externe, §7: NotificationFailure)
    // ═══════════════════════════════════════════════════════════════════════
    /// Échec du POST vers le sink de notification ; journalisé seulement.
    #[error("échec de notification: {reason}")]
    NotificationFailure { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS AMBIANTES (expansion §7: config, persistance, sérialisation)
    // ═══════════════════════════════════════════════════════════════════════
    /// Erreur de configuration au démarrage (exit code 1).
    #[error("erreur de configuration: {message}")]
    Configuration { message: String },

    /// Erreur de base de données (Violation Store).
    #[error("erreur base de données pendant {operation}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Erreur de (dé)sérialisation JSON.
    #[error("erreur de sérialisation: {message}")]
    Serialization { message: String },

    /// Ressource non trouvée.
    #[error("{resource} non trouvé(e): {id}")]
    NotFound { resource: String, id: String },

    /// Erreur interne non spécifiée (classe de bug, 500).
    #[error("erreur interne: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Retourne le code d'erreur HTTP approprié pour la frontière d'ingress.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InputInvalid { .. } | Self::MessageTooLong { .. } => 400,
            Self::TemplateUnknown { .. }
            | Self::TemplateVariableMissing { .. }
            | Self::TemplateInvalid { .. } => 500,
            Self::LLMDeadlineExceeded => 504,
            Self::LLMCircuitOpen => 503,
            Self::LLMTransient { .. } | Self::LLMUpstreamError { .. } => 502,
            Self::LLMBadRequest { .. } => 400,
            Self::LLMUnparseable { .. } => 502,
            Self::ViolationStoreUnavailable { .. } => 503,
            Self::SessionBackpressure { .. } => 200, // never surfaced as a request failure
            Self::WebSocket { .. } => 500,
            Self::NotificationFailure { .. } => 200, // logged only, never affects the decision path
            Self::Configuration { .. } => 500,
            Self::Database { .. } => 503,
            Self::Serialization { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Internal { .. } => 500,
            Self::FilterInternalError { .. } => 200, // fail-open, never surfaced
        }
    }

    /// Retourne la sévérité de l'erreur pour les logs.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Database { .. } | Self::Configuration { .. } => ErrorSeverity::Critical,
            Self::LLMCircuitOpen | Self::ViolationStoreUnavailable { .. } => ErrorSeverity::High,
            Self::LLMDeadlineExceeded
            | Self::LLMTransient { .. }
            | Self::LLMUpstreamError { .. }
            | Self::TemplateUnknown { .. }
            | Self::TemplateVariableMissing { .. }
            | Self::TemplateInvalid { .. } => ErrorSeverity::Medium,
            Self::LLMUnparseable { .. }
            | Self::LLMBadRequest { .. }
            | Self::FilterInternalError { .. }
            | Self::SessionBackpressure { .. }
            | Self::WebSocket { .. } => ErrorSeverity::Low,
            Self::InputInvalid { .. } | Self::MessageTooLong { .. } | Self::NotFound { .. } => {
                ErrorSeverity::Low
            }
            Self::NotificationFailure { .. } => ErrorSeverity::Info,
            Self::Serialization { .. } => ErrorSeverity::Info,
            Self::Internal { .. } => ErrorSeverity::High,
        }
    }

    /// Retourne un message d'erreur sécurisé pour le client (jamais de détails internes).
    pub fn public_message(&self) -> String {
        match self {
            Self::InputInvalid { reason } => format!("requête invalide: {reason}"),
            Self::MessageTooLong { max, .. } => format!("message trop long (max: {max} octets)"),
            Self::TemplateUnknown { .. } | Self::TemplateVariableMissing { .. } => {
                "erreur de configuration du template".to_string()
            }
            Self::LLMDeadlineExceeded | Self::LLMCircuitOpen => {
                "modération temporairement indisponible, message mis en file".to_string()
            }
            Self::Database { .. } | Self::ViolationStoreUnavailable { .. } => {
                "erreur temporaire, veuillez réessayer".to_string()
            }
            Self::Configuration { .. } => "service temporairement indisponible".to_string(),
            Self::Internal { .. } => "erreur interne du serveur".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn input_invalid(reason: impl Into<String>) -> Self {
        Self::InputInvalid {
            reason: reason.into(),
        }
    }

    pub fn database_error(operation: &str, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            source,
        }
    }
}

/// Niveaux de sévérité des erreurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::database_error("query", err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket { source: err }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::LLMDeadlineExceeded
        } else if err.is_connect() || err.is_request() {
            // Connection refused/reset and other send-level failures are
            // transient per §4.5 and must still consume the retry budget.
            Self::LLMTransient {
                attempts: 1,
                reason: err.to_string(),
            }
        } else {
            Self::LLMUpstreamError {
                reason: err.to_string(),
            }
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<std::env::VarError> for PipelineError {
    fn from(err: std::env::VarError) -> Self {
        Self::Configuration {
            message: format!("variable d'environnement manquante: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(PipelineError::LLMCircuitOpen.http_status(), 503);
        assert_eq!(PipelineError::LLMDeadlineExceeded.http_status(), 504);
        assert_eq!(
            PipelineError::input_invalid("missing user_id").http_status(),
            400
        );
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(PipelineError::LLMCircuitOpen.severity(), ErrorSeverity::High);
        assert_eq!(
            PipelineError::configuration_error("bad port").severity(),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn public_message_never_leaks_internal_detail() {
        let err = PipelineError::Database {
            operation: "insert".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        assert_eq!(err.public_message(), "erreur temporaire, veuillez réessayer");
    }
}
