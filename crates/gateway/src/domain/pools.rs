//! Pool registry and tier bridge: the static mapping from tiers to
//! accessible pools and from pools to their preferred provider and model.
//!
//! Loaded once at startup; the only mutation is an explicit full-replace
//! reload under a lock. Routing never selects a pool outside
//! [`PoolRegistry::accessible_pools`] for the tenant's tier.

use {
    model::{Capabilities, PoolId, ResolvedModel, TaskType, ThinkingTraces, Tier},
    std::{
        collections::BTreeMap,
        sync::{Arc, RwLock},
    },
};

/// Immutable registry tables. Swapped wholesale on reload.
#[derive(Clone, Debug)]
pub struct Tables {
    pools: BTreeMap<PoolId, ResolvedModel>,
    tier_access: BTreeMap<Tier, Vec<PoolId>>,
    task_chains: BTreeMap<TaskType, Vec<PoolId>>,
}

impl Tables {
    pub fn new(
        pools: BTreeMap<PoolId, ResolvedModel>,
        tier_access: BTreeMap<Tier, Vec<PoolId>>,
        task_chains: BTreeMap<TaskType, Vec<PoolId>>,
    ) -> Self {
        Self {
            pools,
            tier_access,
            task_chains,
        }
    }

    /// The built-in registry. Deployments override it via configuration.
    pub fn builtin() -> Self {
        let model = |provider: &str, model_id: &str, capabilities| ResolvedModel {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            capabilities,
        };
        let tools = Capabilities {
            tool_calling: true,
            streaming: true,
            ..Default::default()
        };
        Self {
            pools: BTreeMap::from([
                (PoolId::Cheap, model("qwen-local", "Qwen2.5-7B", tools)),
                (
                    PoolId::FastCode,
                    model("qwen-local", "Qwen2.5-Coder-7B", tools),
                ),
                (
                    PoolId::Reviewer,
                    model(
                        "openai",
                        "gpt-4o",
                        Capabilities {
                            vision: true,
                            ..tools
                        },
                    ),
                ),
                (
                    PoolId::Reasoning,
                    model(
                        "anthropic",
                        "claude-3-7-sonnet",
                        Capabilities {
                            thinking_traces: ThinkingTraces::Required,
                            ..tools
                        },
                    ),
                ),
                (
                    PoolId::Architect,
                    model(
                        "anthropic",
                        "claude-3-opus",
                        Capabilities {
                            thinking_traces: ThinkingTraces::Optional,
                            vision: true,
                            ..tools
                        },
                    ),
                ),
            ]),
            tier_access: BTreeMap::from([
                (Tier::Free, vec![PoolId::Cheap]),
                (
                    Tier::Pro,
                    vec![PoolId::Cheap, PoolId::FastCode, PoolId::Reviewer],
                ),
                (
                    Tier::Enterprise,
                    vec![
                        PoolId::Cheap,
                        PoolId::FastCode,
                        PoolId::Reviewer,
                        PoolId::Reasoning,
                        PoolId::Architect,
                    ],
                ),
            ]),
            task_chains: BTreeMap::from([
                (TaskType::Chat, vec![PoolId::Cheap]),
                (TaskType::Code, vec![PoolId::FastCode, PoolId::Cheap]),
                (
                    TaskType::Review,
                    vec![PoolId::Reviewer, PoolId::FastCode, PoolId::Cheap],
                ),
                (
                    TaskType::Reasoning,
                    vec![PoolId::Reasoning, PoolId::Reviewer, PoolId::Cheap],
                ),
                (
                    TaskType::Architecture,
                    vec![PoolId::Architect, PoolId::Reasoning, PoolId::Cheap],
                ),
            ]),
        }
    }

    /// Pools accessible to a tier, in deterministic registry order.
    pub fn accessible_pools(&self, tier: Tier) -> &[PoolId] {
        self.tier_access.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tier_has_access(&self, tier: Tier, pool: PoolId) -> bool {
        self.accessible_pools(tier).contains(&pool)
    }

    /// Preferred pool for a task: an explicit preference the tier allows
    /// wins, then the task's fallback chain, then `cheap`.
    pub fn resolve_pool(
        &self,
        tier: Tier,
        task: TaskType,
        preferences: &BTreeMap<TaskType, PoolId>,
    ) -> PoolId {
        if let Some(&preferred) = preferences.get(&task) {
            if self.tier_has_access(tier, preferred) {
                return preferred;
            }
        }
        self.task_chains
            .get(&task)
            .into_iter()
            .flatten()
            .copied()
            .find(|&pool| self.tier_has_access(tier, pool))
            .unwrap_or(PoolId::Cheap)
    }

    pub fn target(&self, pool: PoolId) -> Option<&ResolvedModel> {
        self.pools.get(&pool)
    }

    pub fn pools(&self) -> impl Iterator<Item = (&PoolId, &ResolvedModel)> {
        self.pools.iter()
    }
}

/// Shared handle over the registry tables. Reads take a cheap `Arc` clone;
/// `replace` swaps the whole table set atomically.
#[derive(Clone)]
pub struct PoolRegistry(Arc<RwLock<Arc<Tables>>>);

impl PoolRegistry {
    pub fn new(tables: Tables) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(tables))))
    }

    /// A consistent view for multi-step lookups within one request.
    pub fn load(&self) -> Arc<Tables> {
        self.0.read().unwrap().clone()
    }

    /// Full-replace reload.
    pub fn replace(&self, tables: Tables) {
        *self.0.write().unwrap() = Arc::new(tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_access_is_ordered_and_closed() {
        let tables = Tables::builtin();
        assert_eq!(tables.accessible_pools(Tier::Free), &[PoolId::Cheap]);
        assert_eq!(
            tables.accessible_pools(Tier::Pro),
            &[PoolId::Cheap, PoolId::FastCode, PoolId::Reviewer]
        );
        assert!(tables.tier_has_access(Tier::Enterprise, PoolId::Architect));
        assert!(!tables.tier_has_access(Tier::Free, PoolId::FastCode));
    }

    #[test]
    fn preferences_win_when_the_tier_allows_them() {
        let tables = Tables::builtin();
        let preferences = BTreeMap::from([(TaskType::Chat, PoolId::Reviewer)]);
        assert_eq!(
            tables.resolve_pool(Tier::Pro, TaskType::Chat, &preferences),
            PoolId::Reviewer
        );
        // The same preference is ignored for a tier that cannot access it.
        assert_eq!(
            tables.resolve_pool(Tier::Free, TaskType::Chat, &preferences),
            PoolId::Cheap
        );
    }

    #[test]
    fn fallback_chain_respects_the_tier() {
        let tables = Tables::builtin();
        let no_preferences = BTreeMap::new();
        // Reasoning chain starts at a pool pro cannot access.
        assert_eq!(
            tables.resolve_pool(Tier::Pro, TaskType::Reasoning, &no_preferences),
            PoolId::Reviewer
        );
        assert_eq!(
            tables.resolve_pool(Tier::Enterprise, TaskType::Reasoning, &no_preferences),
            PoolId::Reasoning
        );
        assert_eq!(
            tables.resolve_pool(Tier::Free, TaskType::Architecture, &no_preferences),
            PoolId::Cheap
        );
    }

    #[test]
    fn reload_replaces_everything() {
        let registry = PoolRegistry::new(Tables::builtin());
        assert!(registry.load().target(PoolId::Cheap).is_some());

        registry.replace(Tables::new(
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeMap::new(),
        ));
        assert!(registry.load().target(PoolId::Cheap).is_none());
        assert!(registry.load().accessible_pools(Tier::Pro).is_empty());
    }
}
