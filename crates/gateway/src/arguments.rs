//! Process-level arguments. Everything here can also come from the
//! environment; routing-universe configuration lives in the TOML file.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(clap::Parser, Debug)]
pub struct Arguments {
    /// Path to the TOML configuration file. Without it the built-in
    /// registry and defaults apply.
    #[clap(long, env)]
    pub config: Option<PathBuf>,

    #[clap(long, env, default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,

    #[clap(long, env, default_value = "0.0.0.0:9589")]
    pub metrics_address: SocketAddr,

    /// Tracing env-filter applied when RUST_LOG is unset.
    #[clap(long, env, default_value = "info,gateway=debug")]
    pub log_filter: String,

    #[clap(long, env, default_value = "data/cost-ledger.jsonl")]
    pub ledger_path: PathBuf,

    /// Root of the object store holding the budget checkpoint.
    #[clap(long, env, default_value = "data/objects")]
    pub object_store_root: PathBuf,

    #[clap(long, env, default_value = "data/audit-wal.jsonl")]
    pub audit_wal_path: PathBuf,

    /// How often the budget checkpointer persists aggregates.
    #[clap(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub checkpoint_interval: Duration,

    /// Outbound provider call timeout.
    #[clap(long, env, default_value = "120s", value_parser = humantime::parse_duration)]
    pub provider_timeout: Duration,

    /// Startup-only billing evaluator bypass. Runtime errors never set
    /// this; only the environment at boot does.
    #[clap(long, env = "BILLING_EVALUATOR_BYPASS")]
    pub billing_evaluator_bypass: bool,

    #[clap(long, env, default_value = "local")]
    pub pod_id: String,

    #[clap(long, env, default_value = "dev")]
    pub build_sha: String,

    /// Key for HMAC-signing audit WAL records, hex encoded.
    #[clap(long, env, hide_env_values = true)]
    pub audit_hmac_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use {super::*, clap::Parser};

    #[test]
    fn defaults_parse() {
        let args = Arguments::parse_from(["gateway"]);
        assert_eq!(args.checkpoint_interval, Duration::from_secs(60));
        assert!(!args.billing_evaluator_bypass);
        assert!(args.config.is_none());
    }

    #[test]
    fn durations_accept_humantime() {
        let args = Arguments::parse_from(["gateway", "--checkpoint-interval", "5m"]);
        assert_eq!(args.checkpoint_interval, Duration::from_secs(300));
    }
}
