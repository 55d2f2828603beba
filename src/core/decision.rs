//! # Decision Handler (C9)
//!
//! Orchestre la chaîne post-verdict : historique (C7) → policy (C8) →
//! persistance conditionnelle (C7) → publication (C10) → notification
//! best-effort. Une faute de persistance dégrade l'action à `Log` plutôt que
//! de bloquer la progression du message (§4.9, §7 `ViolationStoreUnavailable`).

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::policy;
use crate::core::violation_store::ViolationStore;
use crate::hub::session::SessionHub;
use crate::metrics::PipelineMetrics;
use crate::models::{
    Action, ActionKind, ProcessedEvent, Severity, UserHistory, UserViolation, VerdictDecision,
};
use crate::notification::NotificationSink;

const HISTORY_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);
const SPAM_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Coordonne C7→C8→C7→C10→notification pour un verdict donné.
pub struct DecisionHandler {
    violations: Arc<ViolationStore>,
    hub: Arc<SessionHub>,
    notifications: Arc<NotificationSink>,
    /// `enable_notifications` (§6 feature toggle).
    notifications_enabled: bool,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl DecisionHandler {
    pub fn new(
        violations: Arc<ViolationStore>,
        hub: Arc<SessionHub>,
        notifications: Arc<NotificationSink>,
    ) -> Self {
        Self::with_notification_toggle(violations, hub, notifications, true)
    }

    pub fn with_notification_toggle(
        violations: Arc<ViolationStore>,
        hub: Arc<SessionHub>,
        notifications: Arc<NotificationSink>,
        notifications_enabled: bool,
    ) -> Self {
        Self {
            violations,
            hub,
            notifications,
            notifications_enabled,
            metrics: None,
        }
    }

    /// Attaches the shared `PipelineMetrics` sink so policy actions are
    /// counted by kind (§2a); optional for unit tests.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Calcule et applique la décision pour un `ProcessedEvent` déjà verdicté
    /// par C6, puis publie l'événement final (avec l'action résolue) sur C10.
    pub async fn handle(&self, mut event: ProcessedEvent) -> ProcessedEvent {
        let user_id = event.message.user_id.clone();

        let history = self.load_history(&user_id).await;
        let mut action = policy::decide(&event.verdict, &event.filter_outcome, &history);

        if should_persist(&action, event.verdict.decision) {
            let violation = UserViolation {
                violation_id: Uuid::new_v4().to_string(),
                user_id: user_id.clone(),
                message_id: event.message.message_id.clone(),
                channel_id: event.message.channel_id.clone(),
                decision: event.verdict.decision,
                severity: action.severity,
                created_at: event.message.timestamp,
                action_taken: action.kind,
                reason: action.reason.clone(),
                expires_at: action.expires_at,
            };

            if let Err(err) = self.violations.record(&violation).await {
                tracing::warn!(
                    error = %err,
                    message_id = %event.message.message_id,
                    "violation store unavailable, degrading action to log"
                );
                action.persistence_failure = true;
                action.kind = ActionKind::Log;
            }
        }

        if self.notifications_enabled {
            self.notifications
                .notify_if_needed(&event.message, &event.verdict, &action)
                .await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.policy_action(action.kind).await;
        }

        event.action = action;
        self.hub.publish(event.clone()).await;
        event
    }

    async fn load_history(&self, user_id: &str) -> UserHistory {
        let spam_count = self.violations.spam_count(user_id, SPAM_WINDOW).await;
        let critical_counts = self.violations.counts(user_id, HISTORY_WINDOW).await;

        match (spam_count, critical_counts) {
            (Ok(spam_24h), Ok(critical)) => UserHistory {
                spam_24h: spam_24h as u32,
                critical_30d: critical
                    .by_severity
                    .get(&Severity::Critical)
                    .copied()
                    .unwrap_or(0) as u32,
                total_violations: critical.total as u32,
            },
            _ => {
                tracing::warn!(user_id, "violation history unavailable, deciding with empty history");
                UserHistory::default()
            }
        }
    }
}

/// §4.9: persisted at `>= Medium` severity, plus every `Spam` verdict
/// regardless of severity — the 24h spam-escalation rule (§4.8) counts
/// occurrences, not just the ones already severe enough to act on.
fn should_persist(action: &Action, decision: VerdictDecision) -> bool {
    action.kind != ActionKind::Allow
        && (action.severity >= Severity::Medium || decision == VerdictDecision::Spam)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_action_is_never_persisted() {
        assert!(!should_persist(&Action::allow(), VerdictDecision::NonToxic));
    }

    #[test]
    fn medium_severity_flag_is_persisted() {
        let mut action = Action::allow();
        action.kind = ActionKind::Flag;
        action.severity = Severity::Medium;
        assert!(should_persist(&action, VerdictDecision::Pii));
    }

    #[test]
    fn low_severity_log_is_not_persisted() {
        let mut action = Action::allow();
        action.kind = ActionKind::Log;
        action.severity = Severity::Low;
        assert!(!should_persist(&action, VerdictDecision::Toxic));
    }

    #[test]
    fn low_severity_spam_is_still_persisted_to_accumulate_24h_history() {
        let mut action = Action::allow();
        action.kind = ActionKind::Log;
        action.severity = Severity::Low;
        assert!(should_persist(&action, VerdictDecision::Spam));
    }
}
