//! # Policy Engine (C8)
//!
//! Fonction pure, sans I/O, qui traduit un verdict de modération et
//! l'historique de l'utilisateur en une action d'enforcement (§4.8). Aucun
//! état partagé : déterministe pour un `(verdict, history)` donné, donc
//! directement property-testable (§8 "Policy determinism").

use crate::models::{Action, ActionKind, FilterDecision, FilterOutcome, Severity, UserHistory, VerdictDecision};

/// Décide l'action à appliquer.
///
/// Table de décision, évaluée de haut en bas (la première règle qui
/// s'applique gagne), reprenant §4.8 terme à terme :
/// 1. `NonToxic` ∧ `filter.decision == pass`                → `Allow`.
/// 2. `Unknown` (échec LLM)                                → `Log`, `needs_review=true`.
/// 3. `RateLimited`                                        → `Timeout` (60 s).
/// 4. `Pii`, confiance ≥ 0.7                                → `Flag`, notifie.
/// 5. `Spam`, `spam_24h >= 3`                               → `Timeout` (300 s).
/// 6. `Toxic`/`Harassment`, confiance ≥ 0.9, `critical_30d >= 2` → `Ban`.
/// 7. `Toxic`/`Harassment`, confiance ≥ 0.9                 → `Timeout` (600 s), notifie.
/// 8. `Toxic`/`Harassment`, confiance ≥ 0.7                 → `Flag`, notifie.
/// 9. sinon (toxique ambigu, y compris `NonToxic` sur un message que le
///    filtre avait marqué PII)                              → `Log`.
///
/// Sévérité dérivée du `kind` choisi (`log`→`low`, `flag`→`medium`,
/// `timeout`→`high`, `ban`→`critical`) ; toute sévérité ≥ `high` déclenche
/// l'escalade (notification modérateurs), en plus des notifications déjà
/// explicites dans la table ci-dessus.
pub fn decide(
    verdict: &crate::models::ModerationVerdict,
    filter_outcome: &FilterOutcome,
    history: &UserHistory,
) -> Action {
    let confidence = verdict.confidence;
    let mut action = match verdict.decision {
        VerdictDecision::NonToxic if filter_outcome.decision == FilterDecision::Pass => {
            Action::allow()
        }

        VerdictDecision::Unknown => Action {
            kind: ActionKind::Log,
            severity: Severity::Low,
            reason: "moderation oracle unavailable, deferred to human review".to_string(),
            notify_moderators: false,
            timeout_duration_secs: None,
            expires_at: None,
            persistence_failure: false,
            needs_review: true,
        },

        VerdictDecision::RateLimited => Action {
            kind: ActionKind::Timeout,
            severity: Severity::High,
            reason: "client rate-limited before reaching the moderation oracle".to_string(),
            notify_moderators: false,
            timeout_duration_secs: Some(60),
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },

        VerdictDecision::Pii if confidence >= 0.7 => Action {
            kind: ActionKind::Flag,
            severity: Severity::Medium,
            reason: "personally identifiable information detected".to_string(),
            notify_moderators: true,
            timeout_duration_secs: None,
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },

        VerdictDecision::Spam if history.spam_24h >= 3 => Action {
            kind: ActionKind::Timeout,
            severity: Severity::High,
            reason: format!("repeated spam ({} in the last 24h)", history.spam_24h),
            notify_moderators: true,
            timeout_duration_secs: Some(300),
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },

        VerdictDecision::Toxic | VerdictDecision::Harassment
            if confidence >= 0.9 && history.critical_30d >= 2 =>
        {
            Action {
                kind: ActionKind::Ban,
                severity: Severity::Critical,
                reason: format!(
                    "repeated critical violations ({} in the last 30 days)",
                    history.critical_30d
                ),
                notify_moderators: true,
                timeout_duration_secs: None,
                expires_at: None,
                persistence_failure: false,
                needs_review: false,
            }
        }

        VerdictDecision::Toxic | VerdictDecision::Harassment if confidence >= 0.9 => Action {
            kind: ActionKind::Timeout,
            severity: Severity::High,
            reason: format!("{:?} content detected", verdict.decision),
            notify_moderators: true,
            timeout_duration_secs: Some(600),
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },

        VerdictDecision::Toxic | VerdictDecision::Harassment if confidence >= 0.7 => Action {
            kind: ActionKind::Flag,
            severity: Severity::Medium,
            reason: format!("{:?} content suspected", verdict.decision),
            notify_moderators: true,
            timeout_duration_secs: None,
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },

        // Tout autre cas : confiance basse, PII sous le seuil, ou un verdict
        // non-toxique sur un message que le filtre avait marqué PII — consigné
        // pour revue plutôt qu'appliqué en aveugle (§4.8 dernière ligne).
        _ => Action {
            kind: ActionKind::Log,
            severity: Severity::Low,
            reason: format!(
                "{:?} suspected at low confidence ({:.2})",
                verdict.decision, confidence
            ),
            notify_moderators: false,
            timeout_duration_secs: None,
            expires_at: None,
            persistence_failure: false,
            needs_review: false,
        },
    };

    // Escalade (§4.8): toute action de sévérité >= high notifie les
    // modérateurs, même quand la règle ci-dessus ne le demandait pas.
    if action.severity >= Severity::High {
        action.notify_moderators = true;
    }

    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModerationVerdict, PatternType};

    fn verdict(decision: VerdictDecision) -> ModerationVerdict {
        ModerationVerdict {
            decision,
            confidence: 0.9,
            reasoning: None,
            template_version: "moderation_prompt@1".to_string(),
            processing_ns: 1_000,
            categories: Default::default(),
        }
    }

    fn passed() -> FilterOutcome {
        FilterOutcome::pass(0)
    }

    fn pii_flagged() -> FilterOutcome {
        FilterOutcome::flagged(vec!["pii_email".to_string()], PatternType::Pii, true, 0.6, 0)
    }

    #[test]
    fn non_toxic_is_allowed() {
        let action = decide(&verdict(VerdictDecision::NonToxic), &passed(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Allow);
        assert!(action.is_valid());
    }

    #[test]
    fn non_toxic_on_a_pii_flagged_message_is_not_auto_allowed() {
        // §4.8 rule 1 requires filter.decision == pass; a message the filter
        // flagged as PII still gets logged for review even if the oracle
        // ultimately called it non-toxic, rather than silently allowed.
        let action = decide(&verdict(VerdictDecision::NonToxic), &pii_flagged(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Log);
    }

    #[test]
    fn toxic_first_offense_is_timeout_not_ban() {
        let history = UserHistory {
            critical_30d: 1,
            ..Default::default()
        };
        let action = decide(&verdict(VerdictDecision::Toxic), &passed(), &history);
        assert_eq!(action.kind, ActionKind::Timeout);
        assert!(action.is_valid());
    }

    #[test]
    fn toxic_with_repeated_critical_history_escalates_to_ban() {
        let history = UserHistory {
            critical_30d: 3,
            ..Default::default()
        };
        let action = decide(&verdict(VerdictDecision::Toxic), &passed(), &history);
        assert_eq!(action.kind, ActionKind::Ban);
        assert_eq!(action.severity, Severity::Critical);
    }

    #[test]
    fn repeated_spam_escalates_to_timeout() {
        let history = UserHistory {
            spam_24h: 5,
            ..Default::default()
        };
        let action = decide(&verdict(VerdictDecision::Spam), &passed(), &history);
        assert_eq!(action.kind, ActionKind::Timeout);
        assert!(action.is_valid());
    }

    #[test]
    fn first_spam_below_threshold_is_only_logged() {
        let action = decide(&verdict(VerdictDecision::Spam), &passed(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Log);
        assert!(!action.needs_review);
    }

    #[test]
    fn pii_notifies_moderators() {
        let action = decide(&verdict(VerdictDecision::Pii), &pii_flagged(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Flag);
        assert!(action.notify_moderators);
    }

    #[test]
    fn unknown_verdict_needs_review_but_does_not_punish() {
        let action = decide(&verdict(VerdictDecision::Unknown), &passed(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Log);
        assert!(action.needs_review);
    }

    #[test]
    fn rate_limited_verdict_applies_a_short_timeout() {
        let action = decide(
            &verdict(VerdictDecision::RateLimited),
            &FilterOutcome::rate_limited(0),
            &UserHistory::default(),
        );
        assert_eq!(action.kind, ActionKind::Timeout);
        assert_eq!(action.timeout_duration_secs, Some(60));
        assert!(action.is_valid());
    }

    #[test]
    fn low_confidence_toxic_is_logged_not_enforced() {
        let mut v = verdict(VerdictDecision::Toxic);
        v.confidence = 0.4;
        let action = decide(&v, &passed(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Log);
    }

    #[test]
    fn medium_confidence_toxic_is_flagged() {
        let mut v = verdict(VerdictDecision::Toxic);
        v.confidence = 0.75;
        let action = decide(&v, &passed(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Flag);
        assert!(action.notify_moderators);
    }

    #[test]
    fn low_confidence_pii_is_not_flagged() {
        let mut v = verdict(VerdictDecision::Pii);
        v.confidence = 0.3;
        let action = decide(&v, &pii_flagged(), &UserHistory::default());
        assert_eq!(action.kind, ActionKind::Log);
    }

    #[test]
    fn high_severity_always_notifies_moderators() {
        let action = decide(
            &verdict(VerdictDecision::RateLimited),
            &FilterOutcome::rate_limited(0),
            &UserHistory::default(),
        );
        assert!(action.severity >= Severity::High);
        assert!(action.notify_moderators);
    }
}
