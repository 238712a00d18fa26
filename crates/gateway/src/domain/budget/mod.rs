//! Budget enforcement over the append-only cost ledger.
//!
//! Every dispatched request passes `precheck` before the provider call and
//! `record_cost` after it. Limits are configured per aggregation key; a
//! scope is over budget as soon as any of its keys is.

pub mod ledger;

pub use ledger::{Checkpoint, CostLedger, LedgerEntry, ReplayState, Scope};

use {
    chrono::Utc,
    dashmap::DashMap,
    model::Usage,
    serde::Deserialize,
    std::{
        collections::BTreeMap,
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        time::Duration,
    },
    units::{BasisPoints, MicroUsd},
};

/// What happens when a scope reaches its limit.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetMode {
    /// Deny the request.
    #[default]
    Block,
    /// Let the router substitute the downgrade chain.
    Downgrade,
    /// Allow and only warn.
    Warn,
}

/// Policy when the ledger itself cannot be written.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum WriteFailurePolicy {
    /// Count the cost in memory and keep serving.
    #[default]
    FailOpen,
    /// Block all subsequent requests until restart.
    FailClosed,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BudgetConfig {
    /// Limits per aggregation key, e.g. `"project:thj"`.
    pub limits: BTreeMap<String, MicroUsd>,
    /// Fraction of the limit at which prechecks start warning.
    pub warn_percent: BasisPoints,
    pub mode: BudgetMode,
    pub write_failure: WriteFailurePolicy,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limits: BTreeMap::new(),
            warn_percent: BasisPoints::new(8_000).unwrap(),
            mode: BudgetMode::Block,
            write_failure: WriteFailurePolicy::FailOpen,
        }
    }
}

/// Token pricing for one (provider, model), in MicroUSD per million tokens.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Pricing {
    pub input_per_million: MicroUsd,
    pub output_per_million: MicroUsd,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BudgetDecision {
    pub allow: bool,
    pub warn: bool,
    /// Set when the scope is over limit and the mode is downgrade.
    pub downgrade: bool,
}

#[derive(Clone, Debug)]
pub struct CostMeta {
    pub trace_id: String,
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub tenant_id: String,
    pub latency_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("cost arithmetic overflowed")]
    CostOverflow,
    #[error("ledger write failed and the policy is fail-closed: {0}")]
    LedgerUnavailable(anyhow::Error),
}

#[derive(Clone)]
pub struct BudgetEnforcer(Arc<Inner>);

struct Inner {
    ledger: CostLedger,
    config: BudgetConfig,
    spent: DashMap<String, i64>,
    entries: AtomicU64,
    /// Set after a fail-closed ledger write failure; blocks every precheck.
    poisoned: AtomicBool,
}

impl BudgetEnforcer {
    /// Opens the ledger, replaying checkpoint and tail into memory. The
    /// checkpoint lives in the given object store under
    /// [`ledger::CHECKPOINT_KEY`].
    pub async fn open(
        ledger_path: PathBuf,
        checkpoints: Arc<dyn crate::infra::stores::ObjectStore>,
        config: BudgetConfig,
    ) -> anyhow::Result<Self> {
        let (ledger, replay) = CostLedger::open(ledger_path, checkpoints).await?;
        if replay.normalized > 0 {
            Metrics::get().observe("lenient_normalized", replay.normalized);
            tracing::warn!(
                count = replay.normalized,
                "ledger replay normalized non-canonical monetary values"
            );
        }
        let spent = DashMap::new();
        for (key, atoms) in &replay.spent {
            spent.insert(key.clone(), *atoms);
        }
        Ok(Self(Arc::new(Inner {
            ledger,
            config,
            spent,
            entries: AtomicU64::new(replay.entries),
            poisoned: AtomicBool::new(false),
        })))
    }

    pub fn mode(&self) -> BudgetMode {
        self.0.config.mode
    }

    /// Checks the scope against its configured limits.
    pub fn precheck(&self, scope: &Scope, mode: BudgetMode) -> BudgetDecision {
        if self.0.poisoned.load(Ordering::SeqCst) {
            return BudgetDecision {
                allow: false,
                warn: true,
                downgrade: false,
            };
        }
        let mut decision = BudgetDecision {
            allow: true,
            warn: false,
            downgrade: false,
        };
        for key in scope.keys() {
            let Some(limit) = self.0.config.limits.get(&key) else {
                continue;
            };
            let spent = self.spent_atoms(&key);
            if spent >= limit.atoms() {
                match mode {
                    BudgetMode::Block => {
                        Metrics::get().observe("blocked", 1);
                        decision.allow = false;
                    }
                    BudgetMode::Downgrade => {
                        Metrics::get().observe("downgraded", 1);
                        decision.downgrade = true;
                    }
                    BudgetMode::Warn => {
                        Metrics::get().observe("warned", 1);
                    }
                }
                decision.warn = true;
                tracing::warn!(%key, spent, limit = limit.atoms(), "budget limit reached");
            } else if spent >= self.0.config.warn_percent.of(*limit).atoms() {
                decision.warn = true;
            }
        }
        decision
    }

    /// Computes the request cost, appends it to the ledger and folds it into
    /// the in-memory aggregates.
    pub async fn record_cost(
        &self,
        scope: &Scope,
        usage: &Usage,
        pricing: &Pricing,
        meta: CostMeta,
    ) -> Result<MicroUsd, BudgetError> {
        let cost = MicroUsd::from_tokens(usage.prompt_tokens, pricing.input_per_million)
            .zip(MicroUsd::from_tokens(
                usage.completion_tokens,
                pricing.output_per_million,
            ))
            .and_then(|(input, output)| input.checked_add(output))
            .ok_or(BudgetError::CostOverflow)?;

        let entry = LedgerEntry {
            trace_id: meta.trace_id,
            scope: scope.clone(),
            agent: meta.agent,
            provider: meta.provider,
            model: meta.model,
            tenant_id: meta.tenant_id,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            reasoning_tokens: usage.reasoning_tokens,
            cost_micro_usd: cost,
            latency_ms: meta.latency_ms,
            timestamp: Utc::now(),
        };

        match self.0.ledger.append(&entry).await {
            Ok(()) => {
                self.0.entries.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                Metrics::get().observe("write_failure", 1);
                match self.0.config.write_failure {
                    WriteFailurePolicy::FailOpen => {
                        // The cost was incurred either way; keep counting it.
                        tracing::error!(?err, "ledger write failed, continuing fail-open");
                    }
                    WriteFailurePolicy::FailClosed => {
                        self.0.poisoned.store(true, Ordering::SeqCst);
                        tracing::error!(?err, "ledger write failed, blocking further requests");
                        return Err(BudgetError::LedgerUnavailable(err));
                    }
                }
            }
        }

        for key in scope.keys() {
            *self.0.spent.entry(key).or_default() += cost.atoms();
        }
        Ok(cost)
    }

    pub fn spent(&self, key: &str) -> MicroUsd {
        MicroUsd::from_atoms(self.spent_atoms(key))
    }

    pub fn limit(&self, key: &str) -> Option<MicroUsd> {
        self.0.config.limits.get(key).copied()
    }

    /// Persists the current aggregates so the next startup replays less.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let checkpoint = Checkpoint {
            entries: self.0.entries.load(Ordering::SeqCst),
            spent: self
                .0
                .spent
                .iter()
                .map(|entry| (entry.key().clone(), MicroUsd::from_atoms(*entry.value())))
                .collect(),
        };
        self.0.ledger.write_checkpoint(&checkpoint).await
    }

    /// Periodic checkpoint task. Runs until shutdown, flushing one final
    /// checkpoint on the way out.
    pub async fn run_checkpointer(
        self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => (),
            }
            if let Err(err) = self.checkpoint().await {
                tracing::error!(?err, "failed to write budget checkpoint");
            }
        }
        if let Err(err) = self.checkpoint().await {
            tracing::error!(?err, "failed to write final budget checkpoint");
        }
    }

    fn spent_atoms(&self, key: &str) -> i64 {
        self.0.spent.get(key).map(|entry| *entry.value()).unwrap_or(0)
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "budget")]
struct Metrics {
    /// Budget enforcement events.
    #[metric(labels("event"))]
    events: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Self::instance(observe::metrics::get_metric_storage_registry())
            .expect("unexpected error getting metrics instance")
    }

    fn observe(&self, event: &str, count: u64) {
        self.events.with_label_values(&[event]).inc_by(count);
    }
}
