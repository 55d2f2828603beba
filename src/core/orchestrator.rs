//! # Moderation Orchestrator (C6)
//!
//! Coordonne C3 (Lightweight Filter) → C4 (Template Registry) → C5 (LLM
//! Client) → synthèse de verdict, sous une unique deadline propagée de bout
//! en bout (§4.6). Dé-duplique par `message_id` via le `SmartCache` du
//! teacher (`cache.rs`), généralisé ici à une clé `String` sans valeur utile
//! (seule la présence compte) plutôt que spécialisé aux messages de salon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::SmartCache;
use crate::core::filter::LightweightFilter;
use crate::core::llm_client::{parse_moderation_response, CompletionOptions, LlmClient};
use crate::core::templates::TemplateRegistry;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::models::{
    FilterDecision, FilterOutcome, IncomingMessage, ModerationVerdict, PatternType, ProcessedEvent,
    VerdictDecision,
};

const DEDUP_CACHE_SIZE: usize = 100_000;
const DEDUP_TTL: Duration = Duration::from_secs(300);
const DEFAULT_TEMPLATE: &str = "moderation_prompt";

/// Options par invocation de l'orchestrateur.
#[derive(Debug, Clone)]
pub struct ModerateOptions {
    pub deadline: Instant,
    pub template_name: String,
}

impl Default for ModerateOptions {
    fn default() -> Self {
        Self {
            deadline: Instant::now() + Duration::from_secs(10),
            template_name: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Résultat d'une invocation de l'orchestrateur : soit un événement complet,
/// soit `None` si le message est un doublon déjà traité (§4.6 edge case).
pub enum OrchestrationOutcome {
    Processed(ProcessedEvent),
    Duplicate,
}

pub struct ModerationOrchestrator {
    filter: Arc<LightweightFilter>,
    templates: Arc<TemplateRegistry>,
    llm: Arc<LlmClient>,
    /// `None` while a message is in flight (blocks concurrent duplicates),
    /// `Some(event)` once C9 has finished so a retried duplicate gets back
    /// the exact same `ProcessedEvent` (§4.6 edge case, §8 at-most-once).
    dedup: SmartCache<String, Option<ProcessedEvent>>,
    /// `enable_lightweight_filter` (§6 feature toggle). When `false`, C3 is
    /// never consulted and every non-duplicate message is sent straight to
    /// the LLM — used for deployments that want the oracle to adjudicate
    /// everything (e.g. while tuning a new pattern set offline).
    filter_enabled: bool,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ModerationOrchestrator {
    pub fn new(
        filter: Arc<LightweightFilter>,
        templates: Arc<TemplateRegistry>,
        llm: Arc<LlmClient>,
    ) -> Self {
        Self::with_filter_toggle(filter, templates, llm, true)
    }

    pub fn with_filter_toggle(
        filter: Arc<LightweightFilter>,
        templates: Arc<TemplateRegistry>,
        llm: Arc<LlmClient>,
        filter_enabled: bool,
    ) -> Self {
        Self {
            filter,
            templates,
            llm,
            dedup: SmartCache::new(DEDUP_CACHE_SIZE, DEDUP_TTL),
            filter_enabled,
            metrics: None,
        }
    }

    /// Attaches the shared `PipelineMetrics` sink so short-circuits and LLM
    /// calls are counted (§2a); optional so unit tests can build an
    /// orchestrator without standing up the whole component graph.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Records the final, fully-decided `ProcessedEvent` (i.e. after C9 has
    /// resolved the action and persisted any violation) against the dedup
    /// cache, so a duplicate `message_id` arriving afterwards gets back the
    /// identical event instead of a bare `Duplicate` marker. Callers invoke
    /// this once per processed message, after `DecisionHandler::handle`.
    pub async fn finalize_dedup(&self, message_id: &str, event: &ProcessedEvent) {
        self.dedup
            .insert(message_id.to_string(), Some(event.clone()))
            .await;
    }

    /// `moderate(msg, opts) -> ProcessedEvent` (§4.6).
    pub async fn moderate(
        &self,
        message: IncomingMessage,
        options: ModerateOptions,
    ) -> OrchestrationOutcome {
        let start = Instant::now();

        match self.dedup.get(&message.message_id).await {
            Some(Some(cached)) => return OrchestrationOutcome::Processed(cached),
            Some(None) => return OrchestrationOutcome::Duplicate,
            None => {}
        }
        self.dedup.insert(message.message_id.clone(), None).await;

        let filter_outcome = if self.filter_enabled {
            self.filter.evaluate(&message).await
        } else {
            FilterOutcome::pass(0)
        };

        if !filter_outcome.should_process {
            if let Some(metrics) = &self.metrics {
                let label = match filter_outcome.decision {
                    FilterDecision::RateLimited => "rate_limited",
                    FilterDecision::Flagged => "flagged",
                    FilterDecision::Blocked => "blocked",
                    FilterDecision::Pass => "pass",
                };
                metrics.filter_short_circuit(label).await;
            }
            let verdict = match filter_outcome.decision {
                FilterDecision::RateLimited => ModerationVerdict {
                    decision: VerdictDecision::RateLimited,
                    confidence: 1.0,
                    reasoning: Some("rate limited before reaching the oracle".to_string()),
                    template_version: "filter".to_string(),
                    processing_ns: filter_outcome.latency_ns,
                    categories: Default::default(),
                },
                _ => ModerationVerdict {
                    decision: severity_to_verdict(&filter_outcome.pattern_type),
                    confidence: filter_outcome.confidence,
                    reasoning: Some("short-circuited by lightweight filter".to_string()),
                    template_version: "filter".to_string(),
                    processing_ns: filter_outcome.latency_ns,
                    categories: filter_outcome.matched_patterns.iter().cloned().collect(),
                },
            };
            let action = crate::core::policy::decide(&verdict, &filter_outcome, &Default::default());
            let event = ProcessedEvent::new(
                message,
                filter_outcome,
                verdict,
                action,
                start.elapsed().as_nanos() as u64,
            );
            return OrchestrationOutcome::Processed(event);
        }

        // §4.6 edge case: an empty (or whitespace-only) body carries nothing
        // for the oracle to adjudicate; skip the LLM entirely rather than
        // spend a call and a retry budget on it.
        let verdict = if message.body.trim().is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.filter_short_circuit("empty_body").await;
            }
            ModerationVerdict {
                decision: VerdictDecision::NonToxic,
                confidence: 1.0,
                reasoning: Some("empty message body, nothing to moderate".to_string()),
                template_version: "filter".to_string(),
                processing_ns: 0,
                categories: Default::default(),
            }
        } else {
            let breaker_before = self.llm.breaker_state();
            let llm_start = Instant::now();
            let llm_result = self.invoke_llm(&message, &filter_outcome, &options).await;
            if let Some(metrics) = &self.metrics {
                metrics
                    .llm_call(if llm_result.is_ok() { "ok" } else { "err" })
                    .await;
                metrics
                    .llm_latency_ns(llm_start.elapsed().as_nanos() as u64)
                    .await;
                let breaker_after = self.llm.breaker_state();
                if breaker_after != breaker_before {
                    metrics.circuit_transition(breaker_label(breaker_after)).await;
                }
            }
            llm_result.unwrap_or_else(|err| {
                ModerationVerdict::fallback_unknown(
                    format!("upstream failure: {err}"),
                    start.elapsed().as_nanos() as u64,
                )
            })
        };

        let action = crate::core::policy::decide(&verdict, &filter_outcome, &Default::default());
        let total_latency_ns = start.elapsed().as_nanos() as u64;
        OrchestrationOutcome::Processed(ProcessedEvent::new(
            message,
            filter_outcome,
            verdict,
            action,
            total_latency_ns,
        ))
    }

    async fn invoke_llm(
        &self,
        message: &IncomingMessage,
        filter_outcome: &crate::models::FilterOutcome,
        options: &ModerateOptions,
    ) -> Result<ModerationVerdict, PipelineError> {
        let template = self.templates.get(&options.template_name).await?;

        let mut variables = HashMap::new();
        variables.insert("chat_message".to_string(), message.truncated_body());
        variables.insert("channel_id".to_string(), message.channel_id.clone());
        variables.insert("user_id".to_string(), message.user_id.clone());
        variables.insert(
            "history_summary".to_string(),
            format!("matched_patterns={:?}", filter_outcome.matched_patterns),
        );

        let prompt = TemplateRegistry::render(&template, &variables)?;

        let completion_options = CompletionOptions {
            max_tokens: 256,
            temperature: 0.0,
            deadline: options.deadline,
        };

        let start = Instant::now();
        let response = self.llm.complete(&prompt, completion_options.clone()).await;

        let raw_text = match response {
            Ok(resp) => resp.text,
            Err(err) => return Err(err),
        };

        match parse_moderation_response(&raw_text) {
            Ok(verdict) => Ok(to_moderation_verdict(verdict, &template, start.elapsed())),
            Err(PipelineError::LLMUnparseable { .. }) => {
                // Une seule tentative supplémentaire en insistant sur le format strict.
                let retry_prompt = format!(
                    "{prompt}\n\nReminder: respond with valid JSON only, no prose, no markdown."
                );
                let retry = self
                    .llm
                    .complete(&retry_prompt, completion_options)
                    .await?;
                let verdict = parse_moderation_response(&retry.text)?;
                Ok(to_moderation_verdict(verdict, &template, start.elapsed()))
            }
            Err(err) => Err(err),
        }
    }
}

fn to_moderation_verdict(
    raw: crate::core::llm_client::RawVerdict,
    template: &crate::models::PromptTemplate,
    elapsed: Duration,
) -> ModerationVerdict {
    ModerationVerdict {
        decision: parse_verdict_decision(&raw.decision),
        confidence: raw.confidence.clamp(0.0, 1.0),
        reasoning: raw.reasoning,
        template_version: format!("{}@{}", template.name, template.version),
        processing_ns: elapsed.as_nanos() as u64,
        categories: raw.categories.into_iter().collect(),
    }
}

fn parse_verdict_decision(raw: &str) -> VerdictDecision {
    match raw.to_lowercase().replace(['-', '_', ' '], "").as_str() {
        "toxic" => VerdictDecision::Toxic,
        "nontoxic" => VerdictDecision::NonToxic,
        "spam" => VerdictDecision::Spam,
        "pii" => VerdictDecision::Pii,
        "harassment" => VerdictDecision::Harassment,
        _ => VerdictDecision::Unknown,
    }
}

fn breaker_label(state: crate::core::llm_client::CircuitState) -> &'static str {
    use crate::core::llm_client::CircuitState;
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

fn severity_to_verdict(pattern_type: &PatternType) -> VerdictDecision {
    match pattern_type {
        PatternType::BannedWord | PatternType::ToxicRegex => VerdictDecision::Toxic,
        PatternType::Pii => VerdictDecision::Pii,
        PatternType::None => VerdictDecision::NonToxic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, LlmConfig};
    use crate::core::pattern_matcher::{CompiledPatterns, PatternRules};
    use crate::core::rate_limiter::InProcessRateLimiter;

    fn build_orchestrator() -> ModerationOrchestrator {
        let rl = Arc::new(InProcessRateLimiter::new(Duration::from_secs(60), 1000));
        let patterns = Arc::new(CompiledPatterns::compile(&PatternRules::default()).unwrap());
        let filter = Arc::new(LightweightFilter::new(rl, patterns));
        let templates = Arc::new(TemplateRegistry::with_defaults().unwrap());
        let llm = Arc::new(LlmClient::new(
            LlmConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        ModerationOrchestrator::new(filter, templates, llm)
    }

    #[tokio::test]
    async fn banned_word_short_circuits_without_touching_llm() {
        let orch = build_orchestrator();
        let msg = IncomingMessage::new("u1", "alice", "c1", "hardcoded_banned_word here");
        let outcome = orch
            .moderate(msg, ModerateOptions::default())
            .await;
        match outcome {
            OrchestrationOutcome::Processed(event) => {
                assert_eq!(event.verdict.decision, VerdictDecision::Toxic);
                assert_eq!(event.verdict.template_version, "filter");
            }
            OrchestrationOutcome::Duplicate => panic!("expected a processed event"),
        }
    }

    #[tokio::test]
    async fn duplicate_message_id_in_flight_is_skipped() {
        let orch = build_orchestrator();
        let msg = IncomingMessage::new("u1", "alice", "c1", "hardcoded_banned_word");
        let first = orch.moderate(msg.clone(), ModerateOptions::default()).await;
        assert!(matches!(first, OrchestrationOutcome::Processed(_)));
        // Without a `finalize_dedup` call, the cache still holds the
        // in-flight placeholder, so a retry is reported as a duplicate
        // rather than replayed (§8: at most one Violation row per message).
        let second = orch.moderate(msg, ModerateOptions::default()).await;
        assert!(matches!(second, OrchestrationOutcome::Duplicate));
    }

    #[tokio::test]
    async fn duplicate_message_id_after_finalize_replays_the_same_event() {
        let orch = build_orchestrator();
        let msg = IncomingMessage::new("u1", "alice", "c1", "hardcoded_banned_word");
        let first = orch.moderate(msg.clone(), ModerateOptions::default()).await;
        let first_event = match first {
            OrchestrationOutcome::Processed(event) => event,
            OrchestrationOutcome::Duplicate => panic!("expected a processed event"),
        };
        orch.finalize_dedup(&msg.message_id, &first_event).await;

        let second = orch.moderate(msg.clone(), ModerateOptions::default()).await;
        match second {
            OrchestrationOutcome::Processed(event) => {
                assert_eq!(event.message_id, first_event.message_id);
                assert_eq!(event.verdict.decision, first_event.verdict.decision);
            }
            OrchestrationOutcome::Duplicate => panic!("expected the cached event to replay"),
        }
    }

    #[tokio::test]
    async fn disabled_filter_sends_everything_straight_to_the_llm() {
        let rl = Arc::new(InProcessRateLimiter::new(Duration::from_secs(60), 1000));
        let patterns = Arc::new(CompiledPatterns::compile(&PatternRules::default()).unwrap());
        let filter = Arc::new(LightweightFilter::new(rl, patterns));
        let templates = Arc::new(TemplateRegistry::with_defaults().unwrap());
        let llm = Arc::new(LlmClient::new(
            LlmConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        let orch =
            ModerationOrchestrator::with_filter_toggle(filter, templates, llm, false);

        let msg = IncomingMessage::new("u1", "alice", "c1", "hardcoded_banned_word here");
        let outcome = orch.moderate(msg, ModerateOptions::default()).await;
        match outcome {
            OrchestrationOutcome::Processed(event) => {
                // With C3 disabled, a banned word never short-circuits; the
                // unreachable test LLM fails instead, producing a fallback
                // rather than the filter's "short-circuited" reasoning.
                let reasoning = event.verdict.reasoning.unwrap_or_default();
                assert!(!reasoning.contains("short-circuited"));
            }
            OrchestrationOutcome::Duplicate => panic!("expected a processed event"),
        }
    }

    #[tokio::test]
    async fn empty_body_short_circuits_to_non_toxic_without_touching_llm() {
        let orch = build_orchestrator();
        let msg = IncomingMessage::new("u1", "alice", "c1", "   ");
        let outcome = orch.moderate(msg, ModerateOptions::default()).await;
        match outcome {
            OrchestrationOutcome::Processed(event) => {
                assert_eq!(event.verdict.decision, VerdictDecision::NonToxic);
                assert_eq!(event.verdict.confidence, 1.0);
                assert_eq!(event.verdict.template_version, "filter");
            }
            OrchestrationOutcome::Duplicate => panic!("expected a processed event"),
        }
    }

    #[tokio::test]
    async fn rate_limited_message_synthesizes_rate_limited_verdict() {
        let rl = Arc::new(InProcessRateLimiter::new(Duration::from_secs(60), 1));
        let patterns = Arc::new(CompiledPatterns::compile(&PatternRules::default()).unwrap());
        let filter = Arc::new(LightweightFilter::new(rl, patterns));
        let templates = Arc::new(TemplateRegistry::with_defaults().unwrap());
        let llm = Arc::new(LlmClient::new(
            LlmConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        let orch = ModerationOrchestrator::new(filter, templates, llm);

        let first = IncomingMessage::new("u1", "alice", "c1", "hi");
        orch.moderate(first, ModerateOptions::default()).await;
        let second = IncomingMessage::new("u1", "alice", "c1", "hi again");
        let outcome = orch.moderate(second, ModerateOptions::default()).await;
        match outcome {
            OrchestrationOutcome::Processed(event) => {
                assert_eq!(event.verdict.decision, VerdictDecision::RateLimited);
            }
            OrchestrationOutcome::Duplicate => panic!("expected a processed event"),
        }
    }
}
