//! Fail-closed billing conservation guard.
//!
//! Compiles the declarative constraints at boot and gates every billing
//! flow through a strict result lattice. Bypass exists for incident
//! response and is startup-only; no runtime error path ever widens the
//! gate. While degraded, a background timer retries compilation with
//! jittered exponential backoff.

pub mod evaluator;

pub use evaluator::{CheckContext, CompiledConstraint, Constraint, ContextValue};

use {
    rand::Rng,
    serde::Deserialize,
    std::{
        collections::{BTreeMap, HashMap},
        sync::{Arc, RwLock},
        time::Duration,
    },
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardState {
    Uninitialized,
    Ready,
    Degraded,
    Bypassed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorResult {
    Pass,
    Fail,
    Error,
    Bypassed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdhocResult {
    Pass,
    Fail,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effective {
    Pass,
    Fail,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvariantResult {
    pub ok: bool,
    pub invariant_id: String,
    pub evaluator_result: EvaluatorResult,
    pub adhoc_result: AdhocResult,
    pub effective: Effective,
}

/// The strict lattice: pass only when both sides are definitive passes, or
/// when the evaluator is bypassed and the ad-hoc check passes.
fn effective(evaluator: EvaluatorResult, adhoc: AdhocResult) -> Effective {
    match (evaluator, adhoc) {
        (EvaluatorResult::Pass, AdhocResult::Pass)
        | (EvaluatorResult::Bypassed, AdhocResult::Pass) => Effective::Pass,
        _ => Effective::Fail,
    }
}

/// Audit actions the guard writes through its sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    EvaluatorBypass,
    EvaluatorDegraded,
    EvaluatorRecovery,
}

/// Where guard audit entries go. Implementations must not fail the caller:
/// a sink that cannot write falls back to stderr.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, action: AuditAction, detail: &str);
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GuardConfig {
    pub constraints: Vec<Constraint>,
    /// Base recovery retry interval while degraded. Doubles per attempt,
    /// jittered ±25%, capped at ten times the base.
    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let constraint = |id: &str, expr: &str| Constraint {
            id: id.to_string(),
            expr: expr.to_string(),
        };
        Self {
            constraints: vec![
                constraint("spend_within_limit", "bigint_gte(limit, spent)"),
                constraint("cost_non_negative", "bigint_gte(cost, zero)"),
                constraint("reserve_within_allocation", "bigint_gte(allocation, reserve)"),
                constraint("ledger_conservation", "sum_is_zero(postings)"),
            ],
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// Context fields allowed to appear in failure logs. Everything else is
/// dropped before logging.
const INPUT_SUMMARY_ALLOWLIST: &[&str] = &[
    "limit",
    "spent",
    "cost",
    "allocation",
    "reserve",
    "rate",
    "postings_len",
];

#[derive(Clone)]
pub struct ConservationGuard(Arc<Inner>);

struct Inner {
    state: RwLock<GuardState>,
    compiled: RwLock<HashMap<String, CompiledConstraint>>,
    config: GuardConfig,
    audit: Arc<dyn AuditSink>,
}

impl ConservationGuard {
    /// Boot-time initialization. `bypass` comes from the environment signal
    /// and is the only way to reach the bypassed state. Compilation gets
    /// three attempts with 1s/2s backoff in between; exhausting them leaves
    /// the guard degraded with the recovery timer as the only way back.
    pub async fn init(config: GuardConfig, bypass: bool, audit: Arc<dyn AuditSink>) -> Self {
        let guard = Self(Arc::new(Inner {
            state: RwLock::new(GuardState::Uninitialized),
            compiled: RwLock::new(HashMap::new()),
            config,
            audit,
        }));

        if bypass {
            *guard.0.state.write().unwrap() = GuardState::Bypassed;
            guard
                .0
                .audit
                .record(AuditAction::EvaluatorBypass, "startup bypass signal present")
                .await;
            tracing::warn!("billing evaluator bypassed via startup signal");
            return guard;
        }

        let backoffs = [Duration::from_secs(1), Duration::from_secs(2)];
        for attempt in 0u32..3 {
            match guard.compile_all() {
                Ok(compiled) => {
                    *guard.0.compiled.write().unwrap() = compiled;
                    *guard.0.state.write().unwrap() = GuardState::Ready;
                    tracing::info!(
                        constraints = guard.0.config.constraints.len(),
                        "billing evaluator ready"
                    );
                    return guard;
                }
                Err(err) => {
                    guard
                        .0
                        .audit
                        .record(AuditAction::EvaluatorDegraded, &err.to_string())
                        .await;
                    tracing::error!(attempt, %err, "billing constraint compilation failed");
                    if let Some(backoff) = backoffs.get(attempt as usize) {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }

        *guard.0.state.write().unwrap() = GuardState::Degraded;
        Metrics::get().critical_alerts.inc();
        tracing::error!(
            "CRITICAL: billing evaluator degraded, all invariant checks will fail closed"
        );
        guard
    }

    pub fn state(&self) -> GuardState {
        *self.0.state.read().unwrap()
    }

    /// Billing ingress gate. True in ready and bypassed states only.
    pub fn is_billing_ready(&self) -> bool {
        matches!(self.state(), GuardState::Ready | GuardState::Bypassed)
    }

    /// Runs one invariant against the lattice.
    pub fn run_check(
        &self,
        id: &str,
        context: &CheckContext,
        adhoc: AdhocResult,
    ) -> InvariantResult {
        let evaluator_result = match self.state() {
            GuardState::Bypassed => EvaluatorResult::Bypassed,
            GuardState::Degraded | GuardState::Uninitialized => EvaluatorResult::Error,
            GuardState::Ready => {
                let compiled = self.0.compiled.read().unwrap();
                match compiled.get(id) {
                    None => EvaluatorResult::Error,
                    Some(constraint) => match constraint.evaluate(context) {
                        Ok(true) => EvaluatorResult::Pass,
                        Ok(false) => EvaluatorResult::Fail,
                        Err(err) => {
                            tracing::error!(invariant = id, %err, "evaluator raised");
                            EvaluatorResult::Error
                        }
                    },
                }
            }
        };

        let effective = effective(evaluator_result, adhoc);

        // Both sides definitive but disagreeing means one of them is wrong;
        // surface it even when the lattice already decided.
        let divergent = matches!(
            (evaluator_result, adhoc),
            (EvaluatorResult::Pass, AdhocResult::Fail) | (EvaluatorResult::Fail, AdhocResult::Pass)
        );
        if divergent {
            Metrics::get().divergences.with_label_values(&[id]).inc();
            tracing::warn!(invariant = id, ?evaluator_result, ?adhoc, "invariant divergence");
        }

        if effective == Effective::Fail {
            Metrics::get().hard_fails.with_label_values(&[id]).inc();
            tracing::error!(
                invariant = id,
                ?evaluator_result,
                ?adhoc,
                input_summary = %input_summary(context),
                "HARD_FAIL billing invariant"
            );
        }

        InvariantResult {
            ok: effective == Effective::Pass,
            invariant_id: id.to_string(),
            evaluator_result,
            adhoc_result: adhoc,
            effective,
        }
    }

    /// Background recovery loop; a no-op unless the guard is degraded.
    /// Interval doubles per failed attempt, jittered ±25%, capped at ten
    /// times the base.
    pub async fn run_recovery(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let base = self.0.config.recovery_interval;
        let cap = base.saturating_mul(10);
        let mut interval = base;
        loop {
            let jittered = jitter(interval);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(jittered) => (),
            }
            if self.state() != GuardState::Degraded {
                continue;
            }
            match self.compile_all() {
                Ok(compiled) => {
                    *self.0.compiled.write().unwrap() = compiled;
                    *self.0.state.write().unwrap() = GuardState::Ready;
                    self.0
                        .audit
                        .record(AuditAction::EvaluatorRecovery, "recompiled after degradation")
                        .await;
                    tracing::info!("billing evaluator recovered");
                    interval = base;
                }
                Err(err) => {
                    tracing::warn!(%err, "billing evaluator recovery attempt failed");
                    interval = (interval * 2).min(cap);
                }
            }
        }
    }

    fn compile_all(&self) -> Result<HashMap<String, CompiledConstraint>, evaluator::CompileError> {
        self.0
            .config
            .constraints
            .iter()
            .map(|constraint| {
                CompiledConstraint::compile(constraint)
                    .map(|compiled| (constraint.id.clone(), compiled))
            })
            .collect()
    }
}

fn jitter(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    duration.mul_f64(factor)
}

/// Builds the log-safe summary: allowlisted numeric fields only.
fn input_summary(context: &CheckContext) -> String {
    let summary: BTreeMap<&str, i128> = INPUT_SUMMARY_ALLOWLIST
        .iter()
        .filter_map(|&key| match context.get(key) {
            Some(ContextValue::Int(value)) => Some((key, *value)),
            Some(ContextValue::IntList(values)) if key == "postings_len" => {
                Some((key, values.len() as i128))
            }
            _ => None,
        })
        .collect();
    serde_json::to_string(&summary).unwrap_or_default()
}

/// Convenience constructors for common check contexts.
pub fn int_context(pairs: &[(&str, i128)]) -> CheckContext {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), ContextValue::Int(*value)))
        .collect()
}

pub fn postings_context(postings: &[i128]) -> CheckContext {
    CheckContext::from([(
        "postings".to_string(),
        ContextValue::IntList(postings.to_vec()),
    )])
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "billing_guard")]
struct Metrics {
    /// Invariant checks whose effective result was fail.
    #[metric(labels("invariant"))]
    hard_fails: prometheus::IntCounterVec,

    /// Definitive evaluator/ad-hoc disagreements.
    #[metric(labels("invariant"))]
    divergences: prometheus::IntCounterVec,

    /// Critical alerts raised by guard degradation.
    critical_alerts: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Self::instance(observe::metrics::get_metric_storage_registry())
            .expect("unexpected error getting metrics instance")
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[derive(Default)]
    struct CountingSink {
        bypasses: AtomicU32,
        degradations: AtomicU32,
        recoveries: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AuditSink for CountingSink {
        async fn record(&self, action: AuditAction, _: &str) {
            match action {
                AuditAction::EvaluatorBypass => &self.bypasses,
                AuditAction::EvaluatorDegraded => &self.degradations,
                AuditAction::EvaluatorRecovery => &self.recoveries,
            }
            .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn broken_config() -> GuardConfig {
        GuardConfig {
            constraints: vec![Constraint {
                id: "broken".into(),
                expr: "this is not an expression".into(),
            }],
            ..Default::default()
        }
    }

    async fn ready_guard() -> ConservationGuard {
        ConservationGuard::init(
            GuardConfig::default(),
            false,
            Arc::new(CountingSink::default()),
        )
        .await
    }

    #[test]
    fn lattice_is_strict() {
        assert_eq!(
            effective(EvaluatorResult::Pass, AdhocResult::Pass),
            Effective::Pass
        );
        assert_eq!(
            effective(EvaluatorResult::Bypassed, AdhocResult::Pass),
            Effective::Pass
        );
        for (evaluator, adhoc) in [
            (EvaluatorResult::Pass, AdhocResult::Fail),
            (EvaluatorResult::Fail, AdhocResult::Pass),
            (EvaluatorResult::Fail, AdhocResult::Fail),
            (EvaluatorResult::Error, AdhocResult::Pass),
            (EvaluatorResult::Error, AdhocResult::Fail),
            (EvaluatorResult::Bypassed, AdhocResult::Fail),
        ] {
            assert_eq!(effective(evaluator, adhoc), Effective::Fail);
        }
    }

    #[tokio::test]
    async fn ready_guard_passes_satisfied_invariants() {
        let guard = ready_guard().await;
        assert!(guard.is_billing_ready());

        let result = guard.run_check(
            "spend_within_limit",
            &int_context(&[("limit", 1_000), ("spent", 400)]),
            AdhocResult::Pass,
        );
        assert!(result.ok);
        assert_eq!(result.evaluator_result, EvaluatorResult::Pass);
        assert_eq!(result.effective, Effective::Pass);
    }

    #[tokio::test]
    async fn adhoc_failure_vetoes_even_a_passing_evaluator() {
        let guard = ready_guard().await;
        let result = guard.run_check(
            "cost_non_negative",
            &int_context(&[("cost", 5)]),
            AdhocResult::Fail,
        );
        assert!(!result.ok);
        assert_eq!(result.evaluator_result, EvaluatorResult::Pass);
        assert_eq!(result.effective, Effective::Fail);
    }

    #[tokio::test]
    async fn conservation_invariant_over_postings() {
        let guard = ready_guard().await;
        let balanced = guard.run_check(
            "ledger_conservation",
            &postings_context(&[1_000, -700, -300]),
            AdhocResult::Pass,
        );
        assert!(balanced.ok);

        let leaky = guard.run_check(
            "ledger_conservation",
            &postings_context(&[1_000, -700]),
            AdhocResult::Pass,
        );
        assert!(!leaky.ok);
        assert_eq!(leaky.evaluator_result, EvaluatorResult::Fail);
    }

    #[tokio::test]
    async fn evaluator_exception_fails_closed() {
        let guard = ready_guard().await;
        // Context is missing the fields the constraint needs.
        let result = guard.run_check("spend_within_limit", &CheckContext::new(), AdhocResult::Pass);
        assert!(!result.ok);
        assert_eq!(result.evaluator_result, EvaluatorResult::Error);
    }

    #[tokio::test]
    async fn unknown_invariant_fails_closed() {
        let guard = ready_guard().await;
        let result = guard.run_check("no_such_invariant", &CheckContext::new(), AdhocResult::Pass);
        assert!(!result.ok);
        assert_eq!(result.evaluator_result, EvaluatorResult::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn compile_failure_degrades_with_three_audit_entries() {
        let sink = Arc::new(CountingSink::default());
        let guard = ConservationGuard::init(broken_config(), false, sink.clone()).await;
        assert_eq!(guard.state(), GuardState::Degraded);
        assert!(!guard.is_billing_ready());
        assert_eq!(sink.degradations.load(Ordering::SeqCst), 3);

        // Degraded rejects everything, even a passing ad-hoc check.
        let result = guard.run_check(
            "spend_within_limit",
            &int_context(&[("limit", 10), ("spent", 0)]),
            AdhocResult::Pass,
        );
        assert!(!result.ok);
        assert_eq!(result.evaluator_result, EvaluatorResult::Error);
    }

    #[tokio::test]
    async fn bypass_is_startup_only_and_defers_to_adhoc() {
        let sink = Arc::new(CountingSink::default());
        let guard = ConservationGuard::init(GuardConfig::default(), true, sink.clone()).await;
        assert_eq!(guard.state(), GuardState::Bypassed);
        assert!(guard.is_billing_ready());
        assert_eq!(sink.bypasses.load(Ordering::SeqCst), 1);

        let pass = guard.run_check("anything", &CheckContext::new(), AdhocResult::Pass);
        assert!(pass.ok);
        assert_eq!(pass.evaluator_result, EvaluatorResult::Bypassed);

        let fail = guard.run_check("anything", &CheckContext::new(), AdhocResult::Fail);
        assert!(!fail.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_timer_restores_ready() {
        let sink = Arc::new(CountingSink::default());
        let guard = ConservationGuard::init(broken_config(), false, sink.clone()).await;
        assert_eq!(guard.state(), GuardState::Degraded);

        // Swap in a fixed config under the same guard by rebuilding inner
        // state the way a recovery would: here we simply verify the timer
        // path by running recovery against a guard whose config is valid
        // but which starts degraded.
        let guard = ConservationGuard(Arc::new(Inner {
            state: RwLock::new(GuardState::Degraded),
            compiled: RwLock::new(HashMap::new()),
            config: GuardConfig::default(),
            audit: sink.clone(),
        }));
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(guard.clone().run_recovery(shutdown_rx));

        // Wait until the recovery loop flips the state.
        for _ in 0..100 {
            if guard.state() == GuardState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        assert_eq!(guard.state(), GuardState::Ready);
        assert_eq!(sink.recoveries.load(Ordering::SeqCst), 1);
        handle.abort();
    }
}
