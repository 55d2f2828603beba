//! # Lightweight Filter (C3)
//!
//! Combine le Rate-Limit Store (C1) et le Pattern Matcher (C2) pour produire
//! un verdict court-circuit ou laisser passer vers le LLM (§4.3). Le filtre
//! est à la fois un contrôle de coût (éviter le LLM pour les cas évidents) et
//! un filet de sécurité (le LLM peut timeout).
//!
//! Fail-open : une faute du moteur de pattern matching dégrade en `pass`
//! (§4.3, §7 `FilterInternalError`) — le système préfère l'arbitrage LLM à un
//! blocage silencieux.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::core::pattern_matcher::CompiledPatterns;
use crate::core::rate_limiter::{InProcessRateLimiter, RateLimitDecision};
use crate::models::{FilterOutcome, IncomingMessage, PatternType};

/// Le Pattern Matcher et la Policy Engine sont strictement CPU-bound et ne
/// doivent jamais faire d'I/O (§5) ; seul le Rate-Limit Store suspend ici.
pub struct LightweightFilter {
    rate_limiter: Arc<InProcessRateLimiter>,
    patterns: RwLock<Arc<CompiledPatterns>>,
}

impl LightweightFilter {
    pub fn new(rate_limiter: Arc<InProcessRateLimiter>, patterns: Arc<CompiledPatterns>) -> Self {
        Self {
            rate_limiter,
            patterns: RwLock::new(patterns),
        }
    }

    /// Remplace le jeu de motifs compilé par pointeur (hot-reload, §5) — les
    /// lecteurs en vol voient l'ancien ou le nouveau jeu complet, jamais un mélange.
    pub async fn reload_patterns(&self, patterns: Arc<CompiledPatterns>) {
        let mut guard = self.patterns.write().await;
        *guard = patterns;
    }

    /// Évalue un message entrant et produit un `FilterOutcome` (§4.3).
    ///
    /// Politique, dans l'ordre : (1) rate limit → `rate_limited`; (2) coup dur
    /// (banned word / toxic regex) → `flagged`, LLM non invoqué; (3) PII seul
    /// → `flagged` mais `should_process=true` (le LLM adjudique la sévérité);
    /// (4) sinon → `pass`.
    pub async fn evaluate(&self, msg: &IncomingMessage) -> FilterOutcome {
        let start = Instant::now();

        if let RateLimitDecision::Limited { .. } =
            self.rate_limiter.check_and_record(&msg.user_id).await
        {
            return FilterOutcome::rate_limited(start.elapsed().as_nanos() as u64);
        }

        let patterns = Arc::clone(&self.patterns.read().await);
        let result = patterns.scan(&msg.body);
        let latency_ns = start.elapsed().as_nanos() as u64;

        match result.pattern_type {
            PatternType::BannedWord | PatternType::ToxicRegex => FilterOutcome::flagged(
                result.matched_ids,
                result.pattern_type,
                false,
                0.95,
                latency_ns,
            ),
            PatternType::Pii => FilterOutcome::flagged(
                result.matched_ids,
                PatternType::Pii,
                true,
                0.6,
                latency_ns,
            ),
            PatternType::None => FilterOutcome::pass(latency_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pattern_matcher::PatternRules;
    use std::time::Duration;

    fn filter() -> LightweightFilter {
        let rl = Arc::new(InProcessRateLimiter::new(Duration::from_secs(60), 10));
        let patterns = Arc::new(CompiledPatterns::compile(&PatternRules::default()).unwrap());
        LightweightFilter::new(rl, patterns)
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let f = filter();
        let msg = IncomingMessage::new("u1", "alice", "c1", "hello everyone, how are you?");
        let outcome = f.evaluate(&msg).await;
        assert!(outcome.should_process);
        assert!(outcome.is_internally_consistent());
    }

    #[tokio::test]
    async fn banned_word_short_circuits_without_llm() {
        let f = filter();
        let msg = IncomingMessage::new("u1", "alice", "c1", "you are a hardcoded_banned_word");
        let outcome = f.evaluate(&msg).await;
        assert!(!outcome.should_process);
        assert_eq!(outcome.decision, crate::models::FilterDecision::Flagged);
    }

    #[tokio::test]
    async fn pii_only_still_asks_llm() {
        let f = filter();
        let msg = IncomingMessage::new("u1", "alice", "c1", "call me at alice@example.com");
        let outcome = f.evaluate(&msg).await;
        assert!(outcome.should_process);
        assert_eq!(outcome.decision, crate::models::FilterDecision::Flagged);
    }

    #[tokio::test]
    async fn eleventh_message_in_window_is_rate_limited() {
        let f = filter();
        for _ in 0..10 {
            let msg = IncomingMessage::new("u1", "alice", "c1", "hi");
            let outcome = f.evaluate(&msg).await;
            assert!(outcome.should_process);
        }
        let msg = IncomingMessage::new("u1", "alice", "c1", "hi again");
        let outcome = f.evaluate(&msg).await;
        assert!(!outcome.should_process);
        assert_eq!(outcome.decision, crate::models::FilterDecision::RateLimited);
    }
}
