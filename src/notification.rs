//! # Notification Sink (externe au pipeline, §7 `NotificationFailure`)
//!
//! POST best-effort vers un webhook externe quand une action d'enforcement
//! le justifie (`notify_moderators`). Les échecs sont journalisés et ne
//! remontent jamais au chemin de décision — le webhook collector lui-même
//! est hors-scope (§1 Non-goals), seul cet émetteur best-effort reste du
//! ressort du pipeline.

use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::models::{Action, IncomingMessage, ModerationVerdict};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    message_id: &'a str,
    user_id: &'a str,
    channel_id: &'a str,
    decision: &'a crate::models::VerdictDecision,
    severity: &'a crate::models::Severity,
    action: &'a crate::models::ActionKind,
    reason: &'a str,
}

/// Émetteur de notifications best-effort.
pub struct NotificationSink {
    http: reqwest::Client,
    url: Option<Url>,
}

impl NotificationSink {
    pub fn new(url: Option<Url>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            url,
        }
    }

    /// Envoie une notification si `action.notify_moderators` et qu'une URL
    /// est configurée. N'affecte jamais le chemin de décision : toute erreur
    /// est journalisée et avalée (§7).
    pub async fn notify_if_needed(
        &self,
        message: &IncomingMessage,
        verdict: &ModerationVerdict,
        action: &Action,
    ) {
        if !action.notify_moderators {
            return;
        }
        let Some(url) = self.url.clone() else {
            return;
        };

        let payload = NotificationPayload {
            message_id: &message.message_id,
            user_id: &message.user_id,
            channel_id: &message.channel_id,
            decision: &verdict.decision,
            severity: &action.severity,
            action: &action.kind,
            reason: &action.reason,
        };

        if let Err(err) = self.http.post(url).json(&payload).send().await {
            tracing::warn!(error = %err, message_id = %message.message_id, "notification POST failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_is_a_no_op_without_configured_url() {
        let sink = NotificationSink::new(None);
        let msg = IncomingMessage::new("u1", "alice", "c1", "hi");
        let verdict = ModerationVerdict::fallback_unknown("n/a", 1);
        let mut action = Action::allow();
        action.notify_moderators = true;
        sink.notify_if_needed(&msg, &verdict, &action).await;
    }

    #[tokio::test]
    async fn notify_is_a_no_op_when_not_required() {
        let sink = NotificationSink::new(Some("http://127.0.0.1:1/notify".parse().unwrap()));
        let msg = IncomingMessage::new("u1", "alice", "c1", "hi");
        let verdict = ModerationVerdict::fallback_unknown("n/a", 1);
        let action = Action::allow();
        sink.notify_if_needed(&msg, &verdict, &action).await;
    }
}
