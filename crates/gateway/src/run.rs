//! Process wiring: builds every component from arguments and
//! configuration, spawns the background tasks and serves until shutdown.

use {
    crate::{
        arguments::Arguments,
        config::Configuration,
        domain::{
            budget::BudgetEnforcer,
            guard::ConservationGuard,
            health::{FailureDetector, HealthProber},
            pools::{PoolRegistry, Tables},
            routing::Router,
            tenant::EnforcementConfig,
            tools::NoopToolExecutor,
        },
        infra::{
            api::{self, ApiState, StaticTokenVerifier},
            provider::HttpProviderClient,
            stores::FsObjectStore,
            wal::{FileWal, RunContext, WalAuditSink},
        },
        shutdown_controller::ShutdownController,
    },
    anyhow::Context,
    clap::Parser,
    observe::metrics::LivenessChecking,
    rate_limit::ProviderRateLimiter,
    std::{
        sync::Arc,
        time::{Duration, Instant},
    },
};

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing_init(&args.log_filter);
    tracing::info!(pod_id = %args.pod_id, build_sha = %args.build_sha, "starting gateway");
    if let Err(err) = run(args).await {
        tracing::error!(?err, "gateway exited with error");
        std::process::exit(1);
    }
}

struct ProcessLiveness;

#[async_trait::async_trait]
impl LivenessChecking for ProcessLiveness {
    async fn is_alive(&self) -> bool {
        true
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Number of seconds the gateway has been running for.
    seconds_alive: prometheus::IntGauge,
}

async fn run(args: Arguments) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Configuration::from_path(path).await?.validate()?,
        None => Configuration::default(),
    };

    for path in [&args.ledger_path, &args.audit_wal_path] {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    tokio::fs::create_dir_all(&args.object_store_root)
        .await
        .with_context(|| format!("creating {}", args.object_store_root.display()))?;

    let registry = PoolRegistry::new(Tables::builtin());
    let detector = FailureDetector::new(config.health);
    let limiter = ProviderRateLimiter::new(config.limiter.clone());
    let budget = BudgetEnforcer::open(
        args.ledger_path.clone(),
        Arc::new(FsObjectStore::new(args.object_store_root.clone())),
        config.budget.clone(),
    )
    .await
    .context("opening cost ledger")?;

    let hmac_key = args
        .audit_hmac_key
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("decoding audit HMAC key")?;
    let wal = Arc::new(
        FileWal::open(
            args.audit_wal_path.clone(),
            RunContext {
                pod_id: args.pod_id.clone(),
                build_sha: args.build_sha.clone(),
            },
            hmac_key,
        )
        .await
        .context("opening audit wal")?,
    );

    let guard = ConservationGuard::init(
        config.guard.clone(),
        args.billing_evaluator_bypass,
        Arc::new(WalAuditSink::new(wal)),
    )
    .await;

    let provider = Arc::new(
        HttpProviderClient::new(config.provider_base_urls(), args.provider_timeout)
            .context("building provider client")?,
    );
    let router = Router::new(
        registry.clone(),
        detector.clone(),
        limiter,
        budget.clone(),
        guard.clone(),
        provider,
        config.router.clone(),
    );
    router.validate_bindings().context("validating agent bindings")?;

    let shutdown = ShutdownController::new_shutdown_on_signal();

    tokio::spawn(
        budget
            .clone()
            .run_checkpointer(args.checkpoint_interval, shutdown.subscribe()),
    );
    tokio::spawn(guard.clone().run_recovery(shutdown.subscribe()));
    if config.active_probing {
        let prober = HealthProber::new(
            config.probe_targets(&registry.load()),
            detector.clone(),
            config.prober,
        );
        tokio::spawn(prober.run(shutdown.subscribe()));
    }

    tokio::spawn(async {
        let start = Instant::now();
        let metrics = Metrics::instance(observe::metrics::get_metric_storage_registry())
            .expect("unexpected error getting metrics instance");
        loop {
            let alive = i64::try_from(start.elapsed().as_secs()).unwrap_or(i64::MAX);
            metrics.seconds_alive.set(alive);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    tokio::spawn(observe::metrics::serve_metrics(
        Arc::new(ProcessLiveness),
        args.metrics_address,
    ));

    let state = ApiState {
        router,
        guard,
        registry,
        detector,
        verifier: Arc::new(StaticTokenVerifier::new(config.tenants.clone())),
        executor: Arc::new(NoopToolExecutor),
        enforcement: EnforcementConfig {
            strict: config.strict_pool_claims,
        },
    };
    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(api::serve(state, args.bind_address, api_shutdown_rx));

    shutdown.wait().await;
    tracing::info!("shutting down");
    let _ = api_shutdown_tx.send(());
    server.await?.context("api server")?;
    Ok(())
}
