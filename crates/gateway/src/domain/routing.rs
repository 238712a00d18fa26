//! Request routing: binds an agent invocation to a concrete provider and
//! model, then drives the full dispatch sequence.
//!
//! Candidate selection walks the primary target plus its configured
//! fallback chain, dropping candidates that miss required capabilities or
//! whose circuit is open. A scope over budget in downgrade mode swaps the
//! chain for the configured downgrade targets. The dispatch sequence is
//! rate-limit acquire, budget precheck, invariant precheck, provider call
//! (with the tool loop), health bookkeeping, cost recording and the
//! invariant post-check.

use {
    super::{
        budget::{BudgetEnforcer, CostMeta, Pricing, Scope},
        guard::{self, AdhocResult, ConservationGuard},
        health::FailureDetector,
        pools::{PoolRegistry, Tables},
        tenant::{self, SelectError},
        tools::{self, Generate, ToolExecutor, ToolLoopConfig, ToolLoopError},
    },
    crate::infra::provider::{ProviderClient, ProviderError},
    model::{
        Capabilities,
        CompletionRequest,
        CompletionResult,
        ErrorCode,
        PoolId,
        ResolvedModel,
        TaskType,
        TenantContext,
        ThinkingTraces,
        Tier,
    },
    rate_limit::ProviderRateLimiter,
    serde::Deserialize,
    std::{
        collections::{BTreeMap, BTreeSet, HashSet},
        sync::Arc,
        time::Instant,
    },
    units::MicroUsd,
};

/// Capabilities an agent binding demands of any model it runs on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CapabilityRequirements {
    pub tool_calling: bool,
    pub thinking_traces: ThinkingTraces,
    pub vision: bool,
    pub native_runtime: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapabilityGap {
    ToolCalling,
    ThinkingTraces,
    Vision,
    NativeRuntime,
}

impl CapabilityRequirements {
    /// The first capability `capabilities` fails to satisfy, if any.
    /// A required thinking-trace level is never satisfied by a lower one,
    /// and native runtime is only satisfied by a local runtime adapter.
    pub fn unmet(
        &self,
        capabilities: &Capabilities,
        local_runtime: bool,
    ) -> Option<CapabilityGap> {
        if self.tool_calling && !capabilities.tool_calling {
            return Some(CapabilityGap::ToolCalling);
        }
        let thinking_ok = match self.thinking_traces {
            ThinkingTraces::Off => true,
            ThinkingTraces::Optional => capabilities.thinking_traces != ThinkingTraces::Off,
            ThinkingTraces::Required => capabilities.thinking_traces == ThinkingTraces::Required,
        };
        if !thinking_ok {
            return Some(CapabilityGap::ThinkingTraces);
        }
        if self.vision && !capabilities.vision {
            return Some(CapabilityGap::Vision);
        }
        if self.native_runtime && !local_runtime {
            return Some(CapabilityGap::NativeRuntime);
        }
        None
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AgentBinding {
    pub task: TaskType,
    #[serde(default)]
    pub requirements: CapabilityRequirements,
}

/// A (provider, model) reference in fallback and downgrade chains.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

fn model_key(resolved: &ResolvedModel) -> String {
    format!("{}/{}", resolved.provider, resolved.model_id)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RouterConfig {
    pub bindings: BTreeMap<String, AgentBinding>,
    /// Fallback chains keyed by `provider/model` of the primary target.
    pub fallbacks: BTreeMap<String, Vec<ModelRef>>,
    /// Downgrade chains substituted when a scope is over budget in
    /// downgrade mode.
    pub downgrades: BTreeMap<String, Vec<ModelRef>>,
    /// Pricing keyed by `provider/model`. Absent means free.
    pub pricing: BTreeMap<String, Pricing>,
    /// Providers backed by a local runtime adapter.
    pub local_runtime_providers: BTreeSet<String>,
    pub tool_loop: ToolLoopConfig,
    /// TPM estimate when the request does not set `max_tokens`.
    pub estimated_tokens_default: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let binding = |task| AgentBinding {
            task,
            requirements: CapabilityRequirements::default(),
        };
        Self {
            bindings: BTreeMap::from([
                ("chat-agent".to_string(), binding(TaskType::Chat)),
                ("code-agent".to_string(), binding(TaskType::Code)),
                (
                    "review-agent".to_string(),
                    AgentBinding {
                        task: TaskType::Review,
                        requirements: CapabilityRequirements {
                            tool_calling: true,
                            ..Default::default()
                        },
                    },
                ),
                (
                    "architect-agent".to_string(),
                    binding(TaskType::Architecture),
                ),
            ]),
            fallbacks: BTreeMap::new(),
            downgrades: BTreeMap::new(),
            pricing: BTreeMap::new(),
            local_runtime_providers: BTreeSet::from(["qwen-local".to_string()]),
            tool_loop: ToolLoopConfig::default(),
            estimated_tokens_default: 1_024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown agent binding {0:?}")]
    BindingInvalid(String),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("no healthy capable candidate remained")]
    ProviderUnavailable,
    #[error("provider rate limits exhausted")]
    RateLimited,
    #[error("scope budget exhausted")]
    BudgetExceeded,
    #[error("required native runtime not available in the candidate chain")]
    NativeRuntimeRequired,
    #[error("billing invariant {0} failed")]
    InvariantViolated(&'static str),
    #[error(transparent)]
    ToolLoop(ToolLoopError),
    #[error("cost recording failed: {0}")]
    Budget(#[from] super::budget::BudgetError),
}

impl RouteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BindingInvalid(_) => ErrorCode::BindingInvalid,
            Self::Select(err) => err.code(),
            Self::ProviderUnavailable => ErrorCode::ProviderUnavailable,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::BudgetExceeded => ErrorCode::BudgetExceeded,
            Self::NativeRuntimeRequired => ErrorCode::NativeRuntimeRequired,
            Self::InvariantViolated(_) => ErrorCode::BillingInvariantViolated,
            Self::ToolLoop(err) => err.code().unwrap_or(ErrorCode::ProviderUnavailable),
            Self::Budget(_) => ErrorCode::BudgetExceeded,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub agent: String,
    /// Overrides the binding's default task.
    pub task: Option<TaskType>,
    pub scope: Scope,
    pub trace_id: String,
    pub request: CompletionRequest,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub pool: PoolId,
    pub resolved: ResolvedModel,
    pub result: CompletionResult,
    pub cost: MicroUsd,
    pub downgraded: bool,
    pub budget_warning: bool,
}

#[derive(Clone)]
pub struct Router(Arc<Inner>);

struct Inner {
    registry: PoolRegistry,
    detector: FailureDetector,
    limiter: ProviderRateLimiter,
    budget: BudgetEnforcer,
    guard: ConservationGuard,
    provider: Arc<dyn ProviderClient>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: PoolRegistry,
        detector: FailureDetector,
        limiter: ProviderRateLimiter,
        budget: BudgetEnforcer,
        guard: ConservationGuard,
        provider: Arc<dyn ProviderClient>,
        config: RouterConfig,
    ) -> Self {
        Self(Arc::new(Inner {
            registry,
            detector,
            limiter,
            budget,
            guard,
            provider,
            config,
        }))
    }

    /// Ensures every agent binding can resolve to a capable target under the
    /// widest tier. Run at startup so broken configuration fails the boot,
    /// not the first request.
    pub fn validate_bindings(&self) -> Result<(), RouteError> {
        let tables = self.0.registry.load();
        for (name, binding) in &self.0.config.bindings {
            let pool = tables.resolve_pool(Tier::Enterprise, binding.task, &BTreeMap::new());
            let Some(target) = tables.target(pool) else {
                tracing::error!(agent = %name, %pool, "binding resolves to an unregistered pool");
                return Err(RouteError::BindingInvalid(name.clone()));
            };
            let local = self.is_local_runtime(&target.provider);
            if let Some(gap) = binding.requirements.unmet(&target.capabilities, local) {
                tracing::error!(agent = %name, %pool, ?gap, "binding requirements unsatisfiable");
                return Err(RouteError::BindingInvalid(name.clone()));
            }
        }
        Ok(())
    }

    /// Routes and executes one request.
    pub async fn dispatch(
        &self,
        ctx: &TenantContext,
        dispatch: DispatchRequest,
        executor: &dyn ToolExecutor,
    ) -> Result<DispatchOutcome, RouteError> {
        let binding = self
            .0
            .config
            .bindings
            .get(&dispatch.agent)
            .ok_or_else(|| RouteError::BindingInvalid(dispatch.agent.clone()))?;
        let task = dispatch.task.unwrap_or(binding.task);

        let tables = self.0.registry.load();
        let pool = tenant::select_authorized_pool(ctx, task, &tables)?;
        let primary = tables.target(pool).cloned().ok_or_else(|| {
            tracing::error!(%pool, "authorized pool has no registered target");
            RouteError::ProviderUnavailable
        })?;

        let decision = self.0.budget.precheck(&dispatch.scope, self.0.budget.mode());
        if !decision.allow {
            return Err(RouteError::BudgetExceeded);
        }
        let candidates = self.candidates(&primary, decision.downgrade, &tables)?;

        let mut saw_rate_limit = false;
        let mut saw_native_gap = false;
        let mut attempted = false;
        let mut acquired: HashSet<String> = HashSet::new();

        for candidate in candidates {
            let local = self.is_local_runtime(&candidate.provider);
            if let Some(gap) = binding.requirements.unmet(&candidate.capabilities, local) {
                saw_native_gap |= gap == CapabilityGap::NativeRuntime;
                tracing::debug!(candidate = %candidate, ?gap, "skipping incapable candidate");
                continue;
            }
            if !self.0.detector.is_healthy(&candidate, Instant::now()) {
                tracing::debug!(candidate = %candidate, "skipping unhealthy candidate");
                continue;
            }

            // One acquire per logical request and provider; a fallback to a
            // different provider needs its own tokens, a retry does not.
            if !acquired.contains(&candidate.provider) {
                let estimate = dispatch
                    .request
                    .max_tokens
                    .unwrap_or(self.0.config.estimated_tokens_default);
                if !self.0.limiter.acquire(&candidate.provider, estimate).await {
                    saw_rate_limit = true;
                    continue;
                }
                acquired.insert(candidate.provider.clone());
            }

            self.precheck_invariants(&dispatch.scope, decision.downgrade)?;

            attempted = true;
            match self.attempt(&candidate, &dispatch, executor).await {
                Ok(outcome) => {
                    return self
                        .finish(ctx, &dispatch, pool, candidate, outcome, &decision)
                        .await;
                }
                Err(AttemptError::Provider(err)) => {
                    self.0.detector.record_failure(
                        &candidate.provider,
                        &candidate.model_id,
                        err.failure_kind(),
                        Instant::now(),
                    );
                    tracing::warn!(candidate = %candidate, %err, "candidate failed, trying next");
                }
                Err(AttemptError::Loop(err)) => return Err(RouteError::ToolLoop(err)),
            }
        }

        if saw_rate_limit && !attempted {
            return Err(RouteError::RateLimited);
        }
        if saw_native_gap && !attempted {
            return Err(RouteError::NativeRuntimeRequired);
        }
        Err(RouteError::ProviderUnavailable)
    }

    /// Builds the candidate chain for the primary target, substituting the
    /// downgrade chain when the budget decision asks for it.
    fn candidates(
        &self,
        primary: &ResolvedModel,
        downgrade: bool,
        tables: &Tables,
    ) -> Result<Vec<ResolvedModel>, RouteError> {
        let key = model_key(primary);
        let refs: Vec<ModelRef> = if downgrade {
            let chain = self.0.config.downgrades.get(&key).cloned().unwrap_or_default();
            if chain.is_empty() {
                // Downgrade was requested but nowhere to go.
                return Err(RouteError::BudgetExceeded);
            }
            chain
        } else {
            let mut chain = vec![ModelRef {
                provider: primary.provider.clone(),
                model_id: primary.model_id.clone(),
            }];
            chain.extend(self.0.config.fallbacks.get(&key).cloned().unwrap_or_default());
            chain
        };

        Ok(refs
            .into_iter()
            .map(|reference| self.resolve_ref(reference, primary, tables))
            .collect())
    }

    /// Capabilities come from the registry when some pool declares this
    /// exact (provider, model); chain entries outside every pool inherit
    /// the primary's capabilities, as chains are expected to stay
    /// in-family.
    fn resolve_ref(
        &self,
        reference: ModelRef,
        primary: &ResolvedModel,
        tables: &Tables,
    ) -> ResolvedModel {
        let declared = tables
            .pools()
            .map(|(_, target)| target)
            .find(|target| {
                target.provider == reference.provider && target.model_id == reference.model_id
            })
            .map(|target| target.capabilities);
        ResolvedModel {
            provider: reference.provider,
            model_id: reference.model_id,
            capabilities: declared.unwrap_or(primary.capabilities),
        }
    }

    /// Spend invariant cross-check. Skipped when the budget explicitly
    /// authorized exceeding the limit via a downgrade; the guard still
    /// gates the post-call cost check either way.
    fn precheck_invariants(&self, scope: &Scope, downgraded: bool) -> Result<(), RouteError> {
        if downgraded {
            return Ok(());
        }
        for key in scope.keys() {
            let Some(limit) = self.0.budget.limit(&key) else {
                continue;
            };
            let spent = self.0.budget.spent(&key);
            let context = guard::int_context(&[
                ("limit", i128::from(limit.atoms())),
                ("spent", i128::from(spent.atoms())),
            ]);
            let adhoc = if spent <= limit {
                AdhocResult::Pass
            } else {
                AdhocResult::Fail
            };
            let result = self.0.guard.run_check("spend_within_limit", &context, adhoc);
            if !result.ok {
                return Err(RouteError::InvariantViolated("spend_within_limit"));
            }
        }
        Ok(())
    }

    async fn attempt(
        &self,
        candidate: &ResolvedModel,
        dispatch: &DispatchRequest,
        executor: &dyn ToolExecutor,
    ) -> Result<tools::ToolLoopOutcome, AttemptError> {
        let turn = ProviderTurn {
            client: self.0.provider.as_ref(),
            resolved: candidate,
        };
        tools::invoke_with_tools(
            &turn,
            executor,
            dispatch.request.clone(),
            self.0.config.tool_loop,
        )
        .await
        .map_err(|err| match err {
            ToolLoopError::Generate(inner) => match inner.downcast::<ProviderError>() {
                Ok(provider) => AttemptError::Provider(provider),
                Err(other) => {
                    AttemptError::Provider(ProviderError::Network(other.to_string()))
                }
            },
            other => AttemptError::Loop(other),
        })
    }

    async fn finish(
        &self,
        ctx: &TenantContext,
        dispatch: &DispatchRequest,
        pool: PoolId,
        candidate: ResolvedModel,
        outcome: tools::ToolLoopOutcome,
        decision: &super::budget::BudgetDecision,
    ) -> Result<DispatchOutcome, RouteError> {
        self.0
            .detector
            .record_success(&candidate.provider, &candidate.model_id);

        let pricing = self
            .0
            .config
            .pricing
            .get(&model_key(&candidate))
            .copied()
            .unwrap_or_default();
        let cost = self
            .0
            .budget
            .record_cost(
                &dispatch.scope,
                &outcome.total_usage,
                &pricing,
                CostMeta {
                    trace_id: dispatch.trace_id.clone(),
                    agent: dispatch.agent.clone(),
                    provider: candidate.provider.clone(),
                    model: candidate.model_id.clone(),
                    tenant_id: ctx.claims().tenant_id.clone(),
                    latency_ms: outcome.result.metadata.latency_ms,
                },
            )
            .await?;

        let context = guard::int_context(&[("cost", i128::from(cost.atoms()))]);
        let adhoc = if cost.is_negative() {
            AdhocResult::Fail
        } else {
            AdhocResult::Pass
        };
        let post = self.0.guard.run_check("cost_non_negative", &context, adhoc);
        if !post.ok {
            return Err(RouteError::InvariantViolated("cost_non_negative"));
        }

        Ok(DispatchOutcome {
            pool,
            resolved: candidate,
            result: outcome.result,
            cost,
            downgraded: decision.downgrade,
            budget_warning: decision.warn,
        })
    }

    fn is_local_runtime(&self, provider: &str) -> bool {
        self.0.config.local_runtime_providers.contains(provider)
    }
}

enum AttemptError {
    Provider(ProviderError),
    Loop(ToolLoopError),
}

/// Adapts the selected candidate to the tool loop's model-turn trait.
struct ProviderTurn<'a> {
    client: &'a dyn ProviderClient,
    resolved: &'a ResolvedModel,
}

#[async_trait::async_trait]
impl Generate for ProviderTurn<'_> {
    async fn generate(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResult> {
        self.client
            .invoke(self.resolved, request)
            .await
            .map_err(anyhow::Error::new)
    }
}
