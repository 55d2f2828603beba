//! # LLM Client (C5)
//!
//! Client HTTP borné vers l'oracle de modération upstream : timeout/deadline,
//! retries avec backoff exponentiel jitterisé, disjoncteur trois états, et
//! contrôle de concurrence sensible à la surcharge amont (§4.5). C'est le
//! mécanisme clé qui empêche la cascade observée quand l'oracle upstream
//! sature.
//!
//! Transport `reqwest` (promu dépendance non-optionnelle car C5 est sur le
//! chemin critique). État du disjoncteur et permis de concurrence derrière
//! `parking_lot::Mutex`/`tokio::sync::Semaphore`, comme le teacher choisit
//! `parking_lot` pour ses verrous de chemin chaud.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::{CircuitBreakerConfig, LlmConfig};
use crate::error::PipelineError;

/// Résultat d'un appel LLM réussi.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub duration_ns: u64,
}

/// Options par appel (§4.5 request contract).
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Instant,
}

/// État du disjoncteur (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    /// Fenêtre glissante de résultats (true = succès) avec horodatage.
    samples: std::collections::VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probes_in_flight: u32,
    probes_succeeded: u32,
    probes_failed: u32,
}

/// Disjoncteur à trois états, protégé par un mutex synchrone — les mises à
/// jour sont de courtes sections critiques CPU-bound, jamais de point de
/// suspension (§5).
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                samples: std::collections::VecDeque::new(),
                consecutive_failures: 0,
                opened_at: None,
                current_cooldown: cooldown,
                probes_in_flight: 0,
                probes_succeeded: 0,
                probes_failed: 0,
            }),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.transition_if_cooldown_elapsed(&mut inner);
        inner.state
    }

    fn transition_if_cooldown_elapsed(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= inner.current_cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 0;
                    inner.probes_succeeded = 0;
                    inner.probes_failed = 0;
                }
            }
        }
    }

    /// Autorise ou non une nouvelle tentative de requête, compte tenu de
    /// l'état courant. En `HalfOpen`, admet au plus `probe_max` sondes.
    pub fn admit(&self) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        self.transition_if_cooldown_elapsed(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(PipelineError::LLMCircuitOpen),
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_max {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(PipelineError::LLMCircuitOpen)
                }
            }
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner) {
        let cutoff = Instant::now() - self.config.rolling_window();
        while let Some(&(ts, _)) = inner.samples.front() {
            if ts < cutoff {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.samples.push_back((Instant::now(), true));
        self.prune_window(&mut inner);
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.probes_succeeded += 1;
            if inner.probes_succeeded >= self.config.probe_max {
                inner.state = CircuitState::Closed;
                inner.current_cooldown = self.config.cooldown();
                inner.samples.clear();
            }
        } else {
            self.evaluate_closed_trip(&mut inner);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.samples.push_back((Instant::now(), false));
        self.prune_window(&mut inner);
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probes_failed += 1;
                self.trip_open(&mut inner);
            }
            CircuitState::Closed => self.evaluate_closed_trip(&mut inner),
            CircuitState::Open => {}
        }
    }

    /// Évalue le basculement `Closed → Open` par ratio d'échecs ou échecs
    /// consécutifs. Appelé après chaque échantillon (succès ou échec) : un
    /// succès qui fait franchir `min_samples` à la fenêtre doit aussi pouvoir
    /// déclencher l'ouverture si le ratio déjà accumulé dépasse le seuil.
    fn evaluate_closed_trip(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Closed {
            return;
        }
        let total = inner.samples.len() as u32;
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count() as u32;
        let ratio = if total > 0 {
            failures as f64 / total as f64
        } else {
            0.0
        };
        let ratio_tripped = total >= self.config.min_samples && ratio > self.config.failure_ratio;
        let consecutive_tripped =
            inner.consecutive_failures >= self.config.consecutive_failure_threshold;
        if ratio_tripped || consecutive_tripped {
            self.trip_open(inner);
        }
    }

    fn trip_open(&self, inner: &mut BreakerInner) {
        let doubled = inner.current_cooldown * 2;
        let ceiling = Duration::from_secs(self.config.cooldown_ceiling_s);
        inner.current_cooldown = if inner.state == CircuitState::HalfOpen {
            doubled.min(ceiling)
        } else {
            self.config.cooldown()
        };
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.samples.clear();
    }
}

/// Pression amont détectée en dehors du disjoncteur : latence p95 soutenue,
/// fréquence de 503/429. Pendant la pression, le client injecte un délai
/// additionnel adaptatif et réduit le nombre de permis de concurrence (§4.5).
pub struct OverloadTracker {
    recent_latencies_ns: Mutex<std::collections::VecDeque<u64>>,
    pressure_signals: AtomicU32,
    slow_threshold_ns: u64,
}

impl OverloadTracker {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            recent_latencies_ns: Mutex::new(std::collections::VecDeque::with_capacity(64)),
            pressure_signals: AtomicU32::new(0),
            slow_threshold_ns: slow_threshold.as_nanos() as u64,
        }
    }

    pub fn record_latency(&self, latency_ns: u64) {
        let mut samples = self.recent_latencies_ns.lock();
        samples.push_back(latency_ns);
        if samples.len() > 64 {
            samples.pop_front();
        }
    }

    pub fn record_pressure_signal(&self) {
        self.pressure_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relief(&self) {
        let current = self.pressure_signals.load(Ordering::Relaxed);
        if current > 0 {
            self.pressure_signals.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn p95_ns(&self) -> u64 {
        let samples = self.recent_latencies_ns.lock();
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Vrai si l'upstream montre des signes de surcharge soutenue.
    pub fn is_pressured(&self) -> bool {
        self.p95_ns() > self.slow_threshold_ns || self.pressure_signals.load(Ordering::Relaxed) >= 3
    }

    /// Délai additionnel borné à injecter avant la prochaine requête.
    pub fn adaptive_delay(&self) -> Duration {
        if self.is_pressured() {
            Duration::from_millis(200)
        } else {
            Duration::ZERO
        }
    }

    /// Nombre de permis réduits lorsque sous pression (jamais en dessous de 1).
    pub fn reduced_permits(&self, base_permits: usize) -> usize {
        if self.is_pressured() {
            (base_permits / 2).max(1)
        } else {
            base_permits
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SCHÉMA DE REQUÊTE / RÉPONSE (style OpenAI chat-completions)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

/// Verdict brut extrait et validé depuis la réponse de l'upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawVerdict {
    pub decision: String,
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Client HTTP borné vers l'oracle de modération.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    breaker: Arc<CircuitBreaker>,
    overload: Arc<OverloadTracker>,
    permits: Semaphore,
}

impl LlmClient {
    pub fn new(config: LlmConfig, breaker_config: CircuitBreakerConfig) -> Self {
        let slow_threshold = Duration::from_millis(config.slow_threshold_ms);
        let concurrency = config.concurrency;
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .expect("reqwest client builds with static config"),
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            overload: Arc::new(OverloadTracker::new(slow_threshold)),
            permits: Semaphore::new(concurrency),
            config,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// `complete(prompt, options) → {text, duration_ns} | LLMError` (§4.5).
    pub async fn complete(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<LlmResponse, PipelineError> {
        self.breaker.admit()?;

        let remaining = options
            .deadline
            .saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.record_outcome(false);
            return Err(PipelineError::LLMDeadlineExceeded);
        }

        // Acquisition du permis bornée par la deadline restante : évite de
        // bloquer indéfiniment quand l'upstream sature (§4.5, §5).
        let permit = match timeout(remaining, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.record_outcome(false);
                return Err(PipelineError::Internal {
                    message: "LLM semaphore closed".to_string(),
                });
            }
            Err(_) => {
                self.record_outcome(false);
                return Err(PipelineError::LLMDeadlineExceeded);
            }
        };

        let delay = self.overload.adaptive_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay.min(remaining)).await;
        }

        let result = self.complete_with_retries(prompt, &options).await;
        drop(permit);

        match &result {
            Ok(resp) => {
                self.overload.record_latency(resp.duration_ns);
                self.record_outcome(true);
            }
            Err(_) => self.record_outcome(false),
        }
        result
    }

    fn record_outcome(&self, success: bool) {
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }

    async fn complete_with_retries(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<LlmResponse, PipelineError> {
        let mut last_err = PipelineError::LLMUpstreamError {
            reason: "no attempt made".to_string(),
        };

        for attempt in 0..=self.config.max_retries {
            let remaining = options.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PipelineError::LLMDeadlineExceeded);
            }
            let request_timeout = remaining.min(Duration::from_secs(30));

            match self.single_attempt(prompt, options, request_timeout).await {
                Ok(resp) => return Ok(resp),
                Err(err) if is_retryable(&err) && attempt < self.config.max_retries => {
                    last_err = err;
                    let backoff = jittered_backoff(self.config.retry_base(), attempt);
                    let remaining_after = options.deadline.saturating_duration_since(Instant::now());
                    if remaining_after.is_zero() {
                        return Err(PipelineError::LLMDeadlineExceeded);
                    }
                    tokio::time::sleep(backoff.min(remaining_after)).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(PipelineError::LLMTransient {
            attempts: self.config.max_retries + 1,
            reason: last_err.to_string(),
        })
    }

    async fn single_attempt(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        request_timeout: Duration,
    ) -> Result<LlmResponse, PipelineError> {
        let start = Instant::now();
        let body = ChatCompletionsBody {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self.http.post(self.config.endpoint.clone()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = timeout(request_timeout, request.send())
            .await
            .map_err(|_| PipelineError::LLMDeadlineExceeded)?
            .map_err(PipelineError::from)?;

        let status = response.status();
        if status.as_u16() == 503 || status.as_u16() == 429 {
            self.overload.record_pressure_signal();
        } else {
            self.overload.record_relief();
        }

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(PipelineError::LLMTransient {
                attempts: 1,
                reason: format!("status {status}"),
            });
        }
        if status.is_client_error() {
            let retryable_4xx = matches!(status.as_u16(), 408 | 425 | 429);
            let text = response.text().await.unwrap_or_default();
            if retryable_4xx {
                return Err(PipelineError::LLMTransient {
                    attempts: 1,
                    reason: format!("status {status}: {text}"),
                });
            }
            return Err(PipelineError::LLMBadRequest {
                status: status.as_u16(),
                reason: text,
            });
        }

        let value: Value = timeout(request_timeout, response.json())
            .await
            .map_err(|_| PipelineError::LLMDeadlineExceeded)?
            .map_err(|e| PipelineError::LLMUpstreamError {
                reason: e.to_string(),
            })?;

        let text = extract_message_text(&value).ok_or_else(|| PipelineError::LLMUnparseable {
            reason: "no recognised content path in upstream response".to_string(),
        })?;

        Ok(LlmResponse {
            text,
            duration_ns: start.elapsed().as_nanos() as u64,
        })
    }
}

/// Extrait le texte depuis `choices[0].message.content`, tolérant des chemins
/// alternatifs si le canonique est absent (§6).
fn extract_message_text(value: &Value) -> Option<String> {
    if let Some(text) = value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(text) = value.pointer("/choices/0/text").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }
    if let Some(text) = value.pointer("/content").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }
    if let Some(text) = value.as_str() {
        return Some(text.to_string());
    }
    None
}

/// Parser tolérant de la réponse libre de l'upstream (§4.5):
/// trim + fences → JSON strict → extraction du premier `{...}` équilibré → schéma.
pub fn parse_moderation_response(raw: &str) -> Result<RawVerdict, PipelineError> {
    let trimmed = strip_code_fences(raw.trim());

    if let Ok(verdict) = serde_json::from_str::<RawVerdict>(trimmed) {
        return Ok(verdict);
    }

    if let Some(candidate) = extract_balanced_object(trimmed) {
        if let Ok(verdict) = serde_json::from_str::<RawVerdict>(&candidate) {
            return Ok(verdict);
        }
    }

    Err(PipelineError::LLMUnparseable {
        reason: "could not extract a valid moderation verdict".to_string(),
    })
}

fn strip_code_fences(input: &str) -> &str {
    let input = input
        .strip_prefix("```json")
        .or_else(|| input.strip_prefix("```"))
        .unwrap_or(input);
    input.strip_suffix("```").unwrap_or(input).trim()
}

fn extract_balanced_object(input: &str) -> Option<String> {
    let start = input.find('{')?;
    let mut depth = 0i32;
    for (idx, ch) in input[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(input[start..start + idx + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn is_retryable(err: &PipelineError) -> bool {
    matches!(err, PipelineError::LLMTransient { .. })
}

fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_fraction = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered_ms = (exp.as_millis() as f64) * (1.0 + jitter_fraction);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_json() {
        let raw = r#"{"decision":"Non-Toxic","confidence":0.98,"reasoning":"greeting"}"#;
        let v = parse_moderation_response(raw).unwrap();
        assert_eq!(v.decision, "Non-Toxic");
    }

    #[test]
    fn extracts_embedded_object_from_prose() {
        let raw = "Sure thing! Here is my answer: {\"decision\":\"Toxic\",\"confidence\":0.91} — hope that helps";
        let v = parse_moderation_response(raw).unwrap();
        assert_eq!(v.decision, "Toxic");
        assert_eq!(v.confidence, 0.91);
    }

    #[test]
    fn strips_code_fences_before_parsing() {
        let raw = "```json\n{\"decision\":\"Spam\",\"confidence\":0.8}\n```";
        let v = parse_moderation_response(raw).unwrap();
        assert_eq!(v.decision, "Spam");
    }

    #[test]
    fn unparseable_prose_without_object_fails() {
        assert!(parse_moderation_response("this has no JSON whatsoever").is_err());
    }

    #[test]
    fn breaker_trips_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            consecutive_failure_threshold: 5,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn breaker_trips_on_failure_ratio() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            min_samples: 20,
            failure_ratio: 0.5,
            consecutive_failure_threshold: 1000,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..11 {
            breaker.record_failure();
        }
        for _ in 0..9 {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_circuit_rejects_without_admitting() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            consecutive_failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        breaker.record_failure();
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn half_open_admits_bounded_probes() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            consecutive_failure_threshold: 1,
            cooldown_s: 0,
            probe_max: 2,
            ..CircuitBreakerConfig::default()
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.admit().is_ok());
        assert!(breaker.admit().is_ok());
        assert!(breaker.admit().is_err());
    }
}
