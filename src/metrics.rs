//! # Métriques opérationnelles du pipeline
//!
//! Un `MetricsCollector` générique (compteurs/gauges/histogrammes derrière un
//! `RwLock<HashMap>`, dans l'esprit du `MetricsCollector` du teacher) et un
//! `PipelineMetrics` spécialisé qui trace les compteurs propres à ce pipeline
//! (messages traités, court-circuits du filtre, appels LLM, transitions du
//! disjoncteur, actions de policy, lag de fan-out). Exposé en texte Prometheus
//! sur `GET /metrics` — seule la surface d'export appartient au pipeline,
//! le scraping/alerting reste hors périmètre (§1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::models::ActionKind;

/// Collecteur générique de métriques.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
    histograms: Arc<RwLock<HashMap<String, Vec<f64>>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
            histograms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn increment(&self, name: &str) {
        self.increment_by(name, 1).await;
    }

    pub async fn increment_by(&self, name: &str, delta: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    pub async fn record(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        histograms.entry(name.to_string()).or_insert_with(Vec::new).push(value);
    }

    pub async fn counter_value(&self, name: &str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    /// Rend l'état courant au format d'exposition texte Prometheus.
    pub async fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.counters.read().await.iter() {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in self.gauges.read().await.iter() {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        for (name, values) in self.histograms.read().await.iter() {
            if values.is_empty() {
                continue;
            }
            let count = values.len() as f64;
            let sum: f64 = values.iter().sum();
            out.push_str(&format!(
                "# TYPE {name} histogram\n{name}_count {count}\n{name}_sum {sum}\n"
            ));
        }
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Métriques du pipeline de modération (§2a).
#[derive(Debug)]
pub struct PipelineMetrics {
    collector: MetricsCollector,
    started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            collector: MetricsCollector::new(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn message_processed(&self) {
        self.collector.increment("modline_messages_processed_total").await;
    }

    pub async fn filter_short_circuit(&self, decision: &str) {
        self.collector
            .increment(&format!("modline_filter_short_circuit_total_{decision}"))
            .await;
    }

    pub async fn llm_call(&self, outcome: &str) {
        self.collector
            .increment(&format!("modline_llm_calls_total_{outcome}"))
            .await;
    }

    pub async fn llm_latency_ns(&self, latency_ns: u64) {
        self.collector
            .record("modline_llm_latency_ns", latency_ns as f64)
            .await;
    }

    pub async fn circuit_transition(&self, to_state: &str) {
        self.collector
            .increment(&format!("modline_circuit_transitions_total_{to_state}"))
            .await;
    }

    pub async fn policy_action(&self, kind: ActionKind) {
        let label = match kind {
            ActionKind::Allow => "allow",
            ActionKind::Log => "log",
            ActionKind::Flag => "flag",
            ActionKind::Escalate => "escalate",
            ActionKind::Timeout => "timeout",
            ActionKind::Ban => "ban",
        };
        self.collector
            .increment(&format!("modline_policy_actions_total_{label}"))
            .await;
    }

    pub async fn session_lag(&self, channel_id: &str) {
        self.collector
            .increment(&format!("modline_session_lag_total_{channel_id}"))
            .await;
        let _ = channel_id; // label retained for future per-channel gauges
    }

    pub async fn render(&self) -> String {
        let mut out = self.collector.render_prometheus().await;
        out.push_str(&format!(
            "# TYPE modline_uptime_seconds gauge\nmodline_uptime_seconds {}\n",
            self.uptime().as_secs()
        ));
        out
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate() {
        let c = MetricsCollector::new();
        c.increment("x").await;
        c.increment("x").await;
        assert_eq!(c.counter_value("x").await, 2);
    }

    #[tokio::test]
    async fn pipeline_metrics_render_includes_uptime() {
        let m = PipelineMetrics::new();
        m.message_processed().await;
        let rendered = m.render().await;
        assert!(rendered.contains("modline_messages_processed_total 1"));
        assert!(rendered.contains("modline_uptime_seconds"));
    }
}
