//! # Rate-Limit Store (C1)
//!
//! Compteur glissant par utilisateur avec TTL. Backing en mémoire : une
//! `DashMap<String, VecDeque<Instant>>` shardée, dans l'esprit du
//! `AdvancedRateLimiter` du teacher (`core/advanced_rate_limiter.rs`), mais
//! simplifiée à la seule fenêtre glissante requise par §4.1 — pas de token
//! bucket, pas de réputation. Un balayage périodique (idle reaper) évince les
//! compartiments vides depuis plus de `W`, même forme que le
//! `cleanup_expired_entries` du teacher.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Résultat de `check_and_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Backing en mémoire, process-local. Réinitialisé au redémarrage — accepté,
/// le rate limiting est best-effort et non sécurité-critique (§4.1).
///
/// L'interface de §4.1 (`check_and_record(user_id, now) → Allowed | Limited`)
/// est honorée par ce type concret ; un backing Redis cross-process (§9 Open
/// Question: "this spec allows either") satisferait le même contrat derrière
/// la feature `redis-cache` sans changer l'appelant.
#[derive(Debug)]
pub struct InProcessRateLimiter {
    buckets: Arc<DashMap<String, VecDeque<Instant>>>,
    window: Duration,
    max_events: u32,
}

impl InProcessRateLimiter {
    pub fn new(window: Duration, max_events: u32) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            window,
            max_events,
        }
    }

    /// Évince les compartiments vides au-delà de la fenêtre, pour borner la
    /// mémoire sous un grand nombre d'utilisateurs distincts.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, events| {
            if let Some(&last) = events.back() {
                now.duration_since(last) < self.window * 2
            } else {
                false
            }
        });
    }

    fn evict_expired(&self, events: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = events.front() {
            if now.duration_since(front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

impl InProcessRateLimiter {
    pub async fn check_and_record(&self, user_id: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self.buckets.entry(user_id.to_string()).or_insert_with(VecDeque::new);
        self.evict_expired(&mut entry, now);

        if entry.len() as u32 >= self.max_events {
            let retry_after = entry
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return RateLimitDecision::Limited { retry_after };
        }

        entry.push_back(now);
        RateLimitDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_n_events_then_limits() {
        let store = InProcessRateLimiter::new(Duration::from_secs(60), 10);
        for _ in 0..10 {
            assert_eq!(
                store.check_and_record("u1").await,
                RateLimitDecision::Allowed
            );
        }
        match store.check_and_record("u1").await {
            RateLimitDecision::Limited { .. } => {}
            other => panic!("expected Limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn separate_users_have_independent_windows() {
        let store = InProcessRateLimiter::new(Duration::from_secs(60), 1);
        assert_eq!(store.check_and_record("a").await, RateLimitDecision::Allowed);
        assert_eq!(store.check_and_record("b").await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn sweep_idle_evicts_old_buckets() {
        let store = InProcessRateLimiter::new(Duration::from_millis(10), 1);
        store.check_and_record("u1").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.sweep_idle();
        assert!(store.buckets.is_empty());
    }
}
