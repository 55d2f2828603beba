//! # Violation Store (C7)
//!
//! Persistance des violations en Postgres via `sqlx`, style requêtes brutes
//! (`sqlx::query` + `.bind()` + `.fetch_all`/`.execute`) plutôt que les macros
//! `query!`, à l'image de `moderation.rs` du teacher. Un balayage de
//! rétention en tâche de fond évince les lignes expirées, de la même forme
//! que `cleanup_expired_entries`/`cleanup_old_profiles` du teacher (§4.7, §9).

use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::models::{ActionKind, Severity, UserViolation, VerdictDecision, ViolationCounts};

/// Façade de persistance pour les violations d'utilisateur.
pub struct ViolationStore {
    pool: PgPool,
    retention_days: u32,
}

impl ViolationStore {
    pub fn new(pool: PgPool, retention_days: u32) -> Self {
        Self {
            pool,
            retention_days,
        }
    }

    /// Crée la table si absente. Appelé une fois au démarrage — les
    /// migrations `sqlx::migrate!` restent la voie canonique en production,
    /// ceci est le filet best-effort pour un déploiement à blanc.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_violations (
                violation_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                severity TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_violations_user_created \
             ON user_violations (user_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("ensure_schema_index", e))?;

        Ok(())
    }

    /// Enregistre une violation. §4.9: appelé pour severity >= Medium, et
    /// aussi pour tout verdict `Spam` quelle que soit sa sévérité (§4.8
    /// spam-escalation history).
    pub async fn record(&self, violation: &UserViolation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_violations
                (violation_id, user_id, message_id, channel_id, decision, severity,
                 action_taken, reason, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (violation_id) DO NOTHING
            "#,
        )
        .bind(&violation.violation_id)
        .bind(&violation.user_id)
        .bind(&violation.message_id)
        .bind(&violation.channel_id)
        .bind(serde_json::to_string(&violation.decision).unwrap_or_default())
        .bind(severity_label(violation.severity))
        .bind(action_label(violation.action_taken))
        .bind(&violation.reason)
        .bind(violation.created_at)
        .bind(violation.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("record_violation", e))?;

        Ok(())
    }

    /// Violations récentes d'un utilisateur, les plus récentes d'abord.
    pub async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<UserViolation>> {
        let rows = sqlx::query(
            r#"
            SELECT violation_id, user_id, message_id, channel_id, decision, severity,
                   action_taken, reason, created_at, expires_at
            FROM user_violations
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("recent_violations", e))?;

        rows.into_iter().map(row_to_violation).collect()
    }

    /// Compteurs par sévérité pour une fenêtre glissante de `window`.
    pub async fn counts(&self, user_id: &str, window: Duration) -> Result<ViolationCounts> {
        let since = chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();

        let rows = sqlx::query(
            "SELECT severity, COUNT(*) as n FROM user_violations \
             WHERE user_id = $1 AND created_at >= $2 GROUP BY severity",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("violation_counts", e))?;

        let mut counts = ViolationCounts::default();
        for row in rows {
            let severity_label: String = row.try_get("severity").unwrap_or_default();
            let n: i64 = row.try_get("n").unwrap_or(0);
            if let Some(severity) = label_to_severity(&severity_label) {
                counts.by_severity.insert(severity, n as u64);
                counts.total += n as u64;
            }
        }
        Ok(counts)
    }

    /// Nombre de verdicts `Spam` persistés pour un utilisateur sur une
    /// fenêtre glissante, indépendamment de leur sévérité (§4.8 escalation
    /// rule) : un `Spam` sous le seuil est journalisé à `low` et ne doit pas
    /// disparaître des compteurs `counts()` groupés par sévérité.
    pub async fn spam_count(&self, user_id: &str, window: Duration) -> Result<u64> {
        let since = chrono::Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let spam_label =
            serde_json::to_string(&VerdictDecision::Spam).unwrap_or_default();

        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM user_violations \
             WHERE user_id = $1 AND created_at >= $2 AND decision = $3",
        )
        .bind(user_id)
        .bind(since)
        .bind(spam_label)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("spam_count", e))?;

        Ok(row.try_get::<i64, _>("n").unwrap_or(0) as u64)
    }

    /// Supprime les violations expirées. Tâche de fond périodique (§9).
    pub async fn retention_sweep(&self) -> Result<u64> {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let result = sqlx::query(
            "DELETE FROM user_violations WHERE expires_at IS NOT NULL AND expires_at < $1 \
             OR (expires_at IS NULL AND created_at < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::database_error("retention_sweep", e))?;

        Ok(result.rows_affected())
    }

    /// Boucle de rétention en tâche de fond, sur un intervalle fixe, à
    /// l'image de `cleanup_expired_entries` du teacher tournant en tokio::spawn.
    pub async fn run_retention_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.retention_sweep().await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "violation retention sweep removed expired rows")
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "violation retention sweep failed, will retry next tick")
                }
            }
        }
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn label_to_severity(label: &str) -> Option<Severity> {
    match label {
        "low" => Some(Severity::Low),
        "medium" => Some(Severity::Medium),
        "high" => Some(Severity::High),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

fn action_label(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Allow => "allow",
        ActionKind::Log => "log",
        ActionKind::Flag => "flag",
        ActionKind::Escalate => "escalate",
        ActionKind::Timeout => "timeout",
        ActionKind::Ban => "ban",
    }
}

fn label_to_action(label: &str) -> ActionKind {
    match label {
        "allow" => ActionKind::Allow,
        "flag" => ActionKind::Flag,
        "escalate" => ActionKind::Escalate,
        "timeout" => ActionKind::Timeout,
        "ban" => ActionKind::Ban,
        _ => ActionKind::Log,
    }
}

fn row_to_violation(row: sqlx::postgres::PgRow) -> Result<UserViolation> {
    let decision_raw: String = row
        .try_get("decision")
        .map_err(|e| PipelineError::database_error("row_to_violation", e))?;
    let decision = serde_json::from_str(&decision_raw)
        .map_err(|e| PipelineError::Serialization { message: e.to_string() })?;
    let severity_raw: String = row
        .try_get("severity")
        .map_err(|e| PipelineError::database_error("row_to_violation", e))?;
    let action_raw: String = row
        .try_get("action_taken")
        .map_err(|e| PipelineError::database_error("row_to_violation", e))?;

    Ok(UserViolation {
        violation_id: row
            .try_get("violation_id")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        message_id: row
            .try_get("message_id")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        channel_id: row
            .try_get("channel_id")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        decision,
        severity: label_to_severity(&severity_raw).unwrap_or(Severity::Low),
        action_taken: label_to_action(&action_raw),
        reason: row
            .try_get("reason")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| PipelineError::database_error("row_to_violation", e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_label_roundtrips() {
        for s in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(label_to_severity(severity_label(s)), Some(s));
        }
    }

    #[test]
    fn action_label_roundtrips_for_known_variants() {
        for a in [
            ActionKind::Allow,
            ActionKind::Flag,
            ActionKind::Escalate,
            ActionKind::Timeout,
            ActionKind::Ban,
        ] {
            assert_eq!(label_to_action(action_label(a)), a);
        }
    }

    #[test]
    fn unknown_severity_label_is_rejected() {
        assert_eq!(label_to_severity("not_a_severity"), None);
    }
}
