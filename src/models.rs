//! # Modèle de données du pipeline de modération
//!
//! Types échangés entre les composants C1-C10 : message entrant, verdicts,
//! actions de policy, violations persistées et l'événement final publié
//! aux abonnés du Session Hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use ulid::Ulid;

/// Taille maximale d'un corps de message (4 KiB), avant troncature explicite.
pub const MAX_BODY_BYTES: usize = 4 * 1024;

/// Nombre maximum d'entrées dans la table de métadonnées d'un message.
pub const MAX_METADATA_ENTRIES: usize = 32;

/// Message entrant, immuable une fois créé.
///
/// Consommé exactement une fois par invocation de l'Orchestrateur (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub channel_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl IncomingMessage {
    /// Construit un message entrant en générant un `message_id` ULID si absent.
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        channel_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Ulid::new().to_string(),
            user_id: user_id.into(),
            username: username.into(),
            channel_id: channel_id.into(),
            body: body.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Vrai si le corps dépasse `MAX_BODY_BYTES` et doit être tronqué avant le prompt.
    pub fn exceeds_body_limit(&self) -> bool {
        self.body.len() > MAX_BODY_BYTES
    }

    /// Corps tronqué avec un marqueur explicite, pour l'edge case §4.6.
    pub fn truncated_body(&self) -> String {
        if !self.exceeds_body_limit() {
            return self.body.clone();
        }
        let mut truncated: String = self
            .body
            .char_indices()
            .take_while(|(idx, _)| *idx < MAX_BODY_BYTES)
            .map(|(_, c)| c)
            .collect();
        truncated.push_str(" …[truncated]");
        truncated
    }
}

/// Catégorie de motif détectée par le Pattern Matcher (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    BannedWord,
    ToxicRegex,
    Pii,
    None,
}

/// Décision du Lightweight Filter (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Pass,
    Flagged,
    RateLimited,
    Blocked,
}

/// Résultat de l'évaluation du filtre léger.
///
/// Invariant : `should_process == true` ssi `decision == Pass`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub should_process: bool,
    pub decision: FilterDecision,
    pub confidence: f32,
    pub matched_patterns: Vec<String>,
    pub pattern_type: PatternType,
    pub latency_ns: u64,
}

impl FilterOutcome {
    pub fn pass(latency_ns: u64) -> Self {
        Self {
            should_process: true,
            decision: FilterDecision::Pass,
            confidence: 0.0,
            matched_patterns: Vec::new(),
            pattern_type: PatternType::None,
            latency_ns,
        }
    }

    pub fn rate_limited(latency_ns: u64) -> Self {
        Self {
            should_process: false,
            decision: FilterDecision::RateLimited,
            confidence: 1.0,
            matched_patterns: Vec::new(),
            pattern_type: PatternType::None,
            latency_ns,
        }
    }

    pub fn flagged(
        matched_patterns: Vec<String>,
        pattern_type: PatternType,
        should_process: bool,
        confidence: f32,
        latency_ns: u64,
    ) -> Self {
        Self {
            should_process,
            decision: FilterDecision::Flagged,
            confidence,
            matched_patterns,
            pattern_type,
            latency_ns,
        }
    }

    /// Invariant-check utilisée en test/property-testing (§8, "Filter determinism").
    pub fn is_internally_consistent(&self) -> bool {
        self.should_process == (self.decision == FilterDecision::Pass)
    }
}

/// Niveau de prudence requis à la génération du prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
}

/// Format de sortie attendu de l'upstream LLM pour un template donné.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutput {
    Json,
    Text,
}

/// Template de prompt nommé et versionné (C4).
///
/// Invariant : chaque `{{var}}` de `body` apparaît dans `declared_variables`;
/// un template n'est jamais muté après enregistrement (nouvelle version = nouvelle entrée).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub version: u32,
    pub safety_level: SafetyLevel,
    pub expected_output: ExpectedOutput,
    pub body: String,
    pub declared_variables: HashSet<String>,
}

/// Décision portée par un verdict de modération.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictDecision {
    Toxic,
    #[serde(rename = "Non-Toxic", alias = "non_toxic")]
    NonToxic,
    Spam,
    Pii,
    Harassment,
    /// Synthétisé quand le filtre court-circuite sur le rate limiting.
    RateLimited,
    Unknown,
}

/// Verdict structuré produit par le LLM (ou synthétisé depuis le filtre).
///
/// Invariant : `confidence == 0 ∧ decision == Unknown` quand l'upstream a échoué
/// et que le fallback a été utilisé.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub decision: VerdictDecision,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub template_version: String,
    pub processing_ns: u64,
    #[serde(default)]
    pub categories: HashSet<String>,
}

impl ModerationVerdict {
    pub fn fallback_unknown(reasoning: impl Into<String>, processing_ns: u64) -> Self {
        Self {
            decision: VerdictDecision::Unknown,
            confidence: 0.0,
            reasoning: Some(reasoning.into()),
            template_version: "filter".to_string(),
            processing_ns,
            categories: HashSet::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        if self.decision == VerdictDecision::Unknown {
            self.confidence == 0.0
        } else {
            true
        }
    }
}

/// Sévérité d'une violation ou d'une action d'enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Violation persistée pour un utilisateur, indexée par `(user_id, created_at desc)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserViolation {
    pub violation_id: String,
    pub user_id: String,
    pub message_id: String,
    pub channel_id: String,
    pub decision: VerdictDecision,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub action_taken: ActionKind,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Nature de l'action d'enforcement choisie par le Policy Engine (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Log,
    Flag,
    Escalate,
    Timeout,
    Ban,
}

/// Action d'enforcement calculée par le Policy Engine.
///
/// Invariants : `kind == Timeout ⇒ timeout_duration > 0`;
/// `kind == Ban ⇒ expires_at` définit une durée (ou `None` pour un bannissement permanent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub severity: Severity,
    pub reason: String,
    pub notify_moderators: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Indique que l'étape de persistance (C7) a échoué et que l'action a été
    /// dégradée à `Log` pour préserver la progression (§4.9, §7).
    #[serde(default)]
    pub persistence_failure: bool,
    /// Marque une action `log` nécessitant une revue humaine (verdict Unknown).
    #[serde(default)]
    pub needs_review: bool,
}

impl Action {
    pub fn allow() -> Self {
        Self {
            kind: ActionKind::Allow,
            severity: Severity::Low,
            reason: "clean message".to_string(),
            notify_moderators: false,
            timeout_duration_secs: None,
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.kind {
            ActionKind::Timeout => matches!(self.timeout_duration_secs, Some(d) if d > 0),
            _ => true,
        }
    }
}

/// Historique agrégé d'un utilisateur, utilisé en entrée du Policy Engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserHistory {
    pub spam_24h: u32,
    pub critical_30d: u32,
    pub total_violations: u32,
}

/// Résumé des compteurs de violations par sévérité pour une fenêtre donnée.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViolationCounts {
    pub total: u64,
    pub by_severity: HashMap<Severity, u64>,
}

/// Événement final publié une fois par message (§3).
///
/// L'ordre de publication par `channel_id` est préservé par le Session Hub (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub message_id: String,
    pub channel_id: String,
    pub message: IncomingMessage,
    pub filter_outcome: FilterOutcome,
    pub verdict: ModerationVerdict,
    pub action: Action,
    pub total_latency_ns: u64,
}

impl ProcessedEvent {
    pub fn new(
        message: IncomingMessage,
        filter_outcome: FilterOutcome,
        verdict: ModerationVerdict,
        action: Action,
        total_latency_ns: u64,
    ) -> Self {
        Self {
            event_type: "chat_message".to_string(),
            message_id: message.message_id.clone(),
            channel_id: message.channel_id.clone(),
            message,
            filter_outcome,
            verdict,
            action,
            total_latency_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_marks_oversized_bodies() {
        let msg = IncomingMessage::new("u1", "alice", "c1", "x".repeat(MAX_BODY_BYTES + 10));
        assert!(msg.exceeds_body_limit());
        assert!(msg.truncated_body().ends_with("…[truncated]"));
    }

    #[test]
    fn filter_outcome_invariant_holds_for_constructors() {
        assert!(FilterOutcome::pass(10).is_internally_consistent());
        assert!(FilterOutcome::rate_limited(10).is_internally_consistent());
        assert!(FilterOutcome::flagged(vec![], PatternType::Pii, true, 0.5, 10)
            .is_internally_consistent());
    }

    #[test]
    fn fallback_verdict_has_zero_confidence() {
        let v = ModerationVerdict::fallback_unknown("upstream failure: LLMDeadlineExceeded", 10);
        assert!(v.is_consistent());
        assert_eq!(v.confidence, 0.0);
    }
}
