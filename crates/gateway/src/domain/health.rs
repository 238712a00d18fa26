//! Provider/model health tracking.
//!
//! Passive mode counts consecutive failures reported by callers and opens a
//! circuit per (provider, model); an optional active prober hits each
//! configured health endpoint on a timer. Only server-side and transport
//! errors count against health; 4xx responses are the caller's problem.

use {
    dashmap::DashMap,
    model::ResolvedModel,
    serde::Deserialize,
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
    url::Url,
};

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct HealthConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Initial open-state cooldown; doubles on repeated opens.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Ceiling for the grown cooldown.
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// How a provider call failed, as seen by the health tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// 5xx from the provider.
    Server,
    /// Transport error or timeout.
    Network,
    /// 4xx (400/401/403/429). Not a health signal.
    Client,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    cooldown_until: Option<Instant>,
    /// Opens without an intervening close; drives cooldown growth.
    open_streak: u32,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            cooldown_until: None,
            open_streak: 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub model_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Shared circuit table. Clone-cheap.
#[derive(Clone)]
pub struct FailureDetector(Arc<Inner>);

struct Inner {
    circuits: DashMap<(String, String), Circuit>,
    config: HealthConfig,
}

impl FailureDetector {
    pub fn new(config: HealthConfig) -> Self {
        Self(Arc::new(Inner {
            circuits: DashMap::new(),
            config,
        }))
    }

    pub fn record_success(&self, provider: &str, model_id: &str) {
        let mut circuit = self.circuit(provider, model_id);
        circuit.consecutive_failures = 0;
        circuit.consecutive_successes += 1;
        if circuit.state != CircuitState::Closed {
            tracing::info!(provider, model_id, "circuit closed after success");
        }
        circuit.state = CircuitState::Closed;
        circuit.cooldown_until = None;
        circuit.open_streak = 0;
    }

    pub fn record_failure(&self, provider: &str, model_id: &str, kind: FailureKind, now: Instant) {
        if kind == FailureKind::Client {
            return;
        }
        let config = self.0.config;
        let mut circuit = self.circuit(provider, model_id);
        circuit.consecutive_successes = 0;
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::Closed if circuit.consecutive_failures >= config.failure_threshold => {
                open(&mut circuit, &config, now);
                tracing::warn!(
                    provider,
                    model_id,
                    failures = circuit.consecutive_failures,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                open(&mut circuit, &config, now);
                tracing::warn!(provider, model_id, "trial request failed, circuit reopened");
            }
            _ => (),
        }
    }

    /// A circuit is healthy unless OPEN. An expired cooldown moves the
    /// circuit to HALF_OPEN, letting exactly the next caller through as the
    /// trial request.
    pub fn is_healthy(&self, resolved: &ResolvedModel, now: Instant) -> bool {
        let mut circuit = self.circuit(&resolved.provider, &resolved.model_id);
        if circuit.state == CircuitState::Open
            && circuit.cooldown_until.is_some_and(|until| now >= until)
        {
            circuit.state = CircuitState::HalfOpen;
            circuit.cooldown_until = None;
        }
        circuit.state != CircuitState::Open
    }

    pub fn state(&self, provider: &str, model_id: &str) -> CircuitState {
        self.circuit(provider, model_id).state
    }

    /// Point-in-time view for diagnostics; never used for routing.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshot: Vec<_> = self
            .0
            .circuits
            .iter()
            .map(|entry| {
                let ((provider, model_id), circuit) = (entry.key(), entry.value());
                CircuitSnapshot {
                    provider: provider.clone(),
                    model_id: model_id.clone(),
                    state: circuit.state,
                    consecutive_failures: circuit.consecutive_failures,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| {
            (&a.provider, &a.model_id).cmp(&(&b.provider, &b.model_id))
        });
        snapshot
    }

    fn circuit(
        &self,
        provider: &str,
        model_id: &str,
    ) -> dashmap::mapref::one::RefMut<'_, (String, String), Circuit> {
        self.0
            .circuits
            .entry((provider.to_string(), model_id.to_string()))
            .or_default()
    }
}

fn open(circuit: &mut Circuit, config: &HealthConfig, now: Instant) {
    circuit.open_streak += 1;
    let growth = config
        .cooldown
        .saturating_mul(1u32 << (circuit.open_streak - 1).min(16));
    circuit.state = CircuitState::Open;
    circuit.cooldown_until = Some(now + growth.min(config.max_cooldown));
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProbeTarget {
    pub provider: String,
    pub model_id: String,
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ProberConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Periodically probes each target's health endpoint and feeds the outcome
/// into the failure detector.
pub struct HealthProber {
    client: reqwest::Client,
    targets: Vec<ProbeTarget>,
    detector: FailureDetector,
    config: ProberConfig,
    in_flight: AtomicBool,
}

impl HealthProber {
    pub fn new(targets: Vec<ProbeTarget>, detector: FailureDetector, config: ProberConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            targets,
            detector,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Runs until the shutdown signal flips. A cycle that is still in flight
    /// when the next tick fires is not overlapped; the tick is skipped.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => (),
            }
            if self.in_flight.swap(true, Ordering::SeqCst) {
                tracing::debug!("previous probe cycle still in flight, skipping tick");
                continue;
            }
            self.probe_cycle().await;
            self.in_flight.store(false, Ordering::SeqCst);
        }
        tracing::debug!("health prober stopped");
    }

    async fn probe_cycle(&self) {
        let probes = self.targets.iter().map(|target| self.probe(target));
        futures::future::join_all(probes).await;
    }

    async fn probe(&self, target: &ProbeTarget) {
        let request = self
            .client
            .get(target.url.clone())
            .timeout(self.config.timeout)
            .send()
            .await;
        let now = Instant::now();
        match request {
            Ok(response) if response.status().is_success() => {
                self.detector.record_success(&target.provider, &target.model_id);
            }
            Ok(response) if response.status().is_server_error() => {
                tracing::debug!(
                    provider = %target.provider,
                    status = response.status().as_u16(),
                    "health probe failed"
                );
                self.detector
                    .record_failure(&target.provider, &target.model_id, FailureKind::Server, now);
            }
            Ok(_) => (),
            Err(err) => {
                tracing::debug!(provider = %target.provider, ?err, "health probe unreachable");
                self.detector
                    .record_failure(&target.provider, &target.model_id, FailureKind::Network, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(provider: &str, model_id: &str) -> ResolvedModel {
        ResolvedModel {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            capabilities: Default::default(),
        }
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(HealthConfig::default())
    }

    #[test]
    fn success_resets_the_failure_count() {
        let detector = detector();
        let now = Instant::now();
        for _ in 0..4 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        }
        detector.record_success("openai", "gpt-4o");
        for _ in 0..4 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        }
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::Closed);
        assert!(detector.is_healthy(&resolved("openai", "gpt-4o"), now));
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let detector = detector();
        let now = Instant::now();
        for _ in 0..5 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        }
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::Open);
        assert!(!detector.is_healthy(&resolved("openai", "gpt-4o"), now));
    }

    #[test]
    fn client_errors_are_not_health_signals() {
        let detector = detector();
        let now = Instant::now();
        for _ in 0..100 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Client, now);
        }
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::Closed);
    }

    #[test]
    fn cooldown_expiry_half_opens_then_success_closes() {
        let detector = detector();
        let now = Instant::now();
        for _ in 0..5 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        }
        let target = resolved("openai", "gpt-4o");
        assert!(!detector.is_healthy(&target, now + Duration::from_secs(29)));

        // After the cooldown the trial request is let through.
        assert!(detector.is_healthy(&target, now + Duration::from_secs(31)));
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::HalfOpen);

        detector.record_success("openai", "gpt-4o");
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_with_longer_cooldown() {
        let detector = detector();
        let now = Instant::now();
        for _ in 0..5 {
            detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        }
        let target = resolved("openai", "gpt-4o");
        let after_first_cooldown = now + Duration::from_secs(31);
        assert!(detector.is_healthy(&target, after_first_cooldown));

        detector.record_failure("openai", "gpt-4o", FailureKind::Server, after_first_cooldown);
        assert_eq!(detector.state("openai", "gpt-4o"), CircuitState::Open);
        // Second open doubles the cooldown: 60s this time.
        assert!(!detector.is_healthy(&target, after_first_cooldown + Duration::from_secs(45)));
        assert!(detector.is_healthy(&target, after_first_cooldown + Duration::from_secs(61)));
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let detector = detector();
        let now = Instant::now();
        detector.record_failure("openai", "gpt-4o", FailureKind::Server, now);
        detector.record_failure("anthropic", "claude-3-opus", FailureKind::Network, now);
        let snapshot = detector.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].provider, "anthropic");
        assert_eq!(snapshot[1].consecutive_failures, 1);
    }
}
