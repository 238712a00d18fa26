//! Gateway configuration file.
//!
//! Process-level knobs live in [`crate::arguments::Arguments`]; everything
//! that describes the routing universe — providers, rate limits, budgets,
//! guard constraints, chains — comes from a TOML file deserialized into
//! [`Configuration`] and validated before anything is built from it.

use {
    crate::{
        domain::{
            budget::BudgetConfig,
            guard::GuardConfig,
            health::{HealthConfig, ProbeTarget, ProberConfig},
            routing::RouterConfig,
        },
        infra::listener::ListenerConfig,
    },
    anyhow::{Context, ensure},
    rate_limit::RateLimiterConfig,
    serde::Deserialize,
    std::{collections::BTreeMap, path::Path},
    url::Url,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProviderEntry {
    pub base_url: Url,
    #[serde(default)]
    pub local_runtime: bool,
    /// Probe endpoint; defaults to `base_url` + `/health` when probing is
    /// enabled.
    #[serde(default)]
    pub health_url: Option<Url>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Configuration {
    pub providers: BTreeMap<String, ProviderEntry>,
    pub limiter: RateLimiterConfig,
    pub health: HealthConfig,
    pub prober: ProberConfig,
    pub active_probing: bool,
    pub budget: BudgetConfig,
    pub guard: GuardConfig,
    pub router: RouterConfig,
    pub listener: ListenerConfig,
    pub strict_pool_claims: bool,
    /// Development-only static tenants: bearer token → claims. Production
    /// deployments use the JWT verifier collaborator instead.
    pub tenants: BTreeMap<String, model::TenantClaims>,
}

impl Configuration {
    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        toml::from_str(&raw).context("parsing configuration")
    }

    /// Rejects configurations the router would only trip over at request
    /// time: chain references to unknown providers and providers marked
    /// local that also have remote limits nobody will use.
    pub fn validate(self) -> anyhow::Result<Self> {
        for (key, chain) in self.router.fallbacks.iter().chain(&self.router.downgrades) {
            for reference in chain {
                ensure!(
                    self.providers.contains_key(&reference.provider),
                    "chain for {key} references unconfigured provider {}",
                    reference.provider,
                );
            }
        }
        for provider in &self.router.local_runtime_providers {
            ensure!(
                self.providers.contains_key(provider),
                "local runtime provider {provider} is not configured",
            );
        }
        for provider in self.limiter.providers.keys() {
            ensure!(
                self.providers.contains_key(provider),
                "rate limits configured for unknown provider {provider}",
            );
        }
        Ok(self)
    }

    /// Base URLs for the HTTP provider client.
    pub fn provider_base_urls(&self) -> BTreeMap<String, Url> {
        self.providers
            .iter()
            .map(|(name, entry)| (name.clone(), entry.base_url.clone()))
            .collect()
    }

    /// Probe targets for every provider/model pair the registry routes to.
    pub fn probe_targets(&self, tables: &crate::domain::pools::Tables) -> Vec<ProbeTarget> {
        tables
            .pools()
            .filter_map(|(_, target)| {
                let entry = self.providers.get(&target.provider)?;
                let url = entry
                    .health_url
                    .clone()
                    .or_else(|| entry.base_url.join("health").ok())?;
                Some(ProbeTarget {
                    provider: target.provider.clone(),
                    model_id: target.model_id.clone(),
                    url,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::domain::pools::Tables};

    fn base() -> Configuration {
        toml::from_str(
            r#"
            [providers.qwen-local]
            base-url = "http://localhost:8000/"
            local-runtime = true

            [providers.openai]
            base-url = "https://api.openai.example/"

            [providers.anthropic]
            base-url = "https://api.anthropic.example/"

            [limiter.providers.openai]
            requests-per-minute = 120
            tokens-per-minute = 200000
            queue-timeout = "10s"

            [budget]
            warn-percent = 7500
            mode = "downgrade"

            [budget.limits]
            "project:thj" = "1000"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn parses_and_validates() {
        let config = base().validate().unwrap();
        assert_eq!(config.providers.len(), 3);
        assert_eq!(
            config
                .limiter
                .providers
                .get("openai")
                .unwrap()
                .requests_per_minute,
            120
        );
        assert_eq!(
            config.budget.limits.get("project:thj").unwrap().atoms(),
            1_000
        );
    }

    #[test]
    fn rejects_chains_to_unknown_providers() {
        let mut config = base();
        config.router.fallbacks.insert(
            "openai/gpt-4o".to_string(),
            vec![crate::domain::routing::ModelRef {
                provider: "mystery".into(),
                model_id: "m".into(),
            }],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_limits_for_unknown_providers() {
        let mut config = base();
        config
            .limiter
            .providers
            .insert("mystery".to_string(), Default::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn probe_targets_cover_registered_pools() {
        let config = base();
        let targets = config.probe_targets(&Tables::builtin());
        assert!(
            targets
                .iter()
                .any(|t| t.provider == "openai" && t.url.as_str().ends_with("/health"))
        );
        assert_eq!(targets.len(), 5);
    }
}
