//! Tenants, tiers, pools and the immutable per-request context.

use {
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// Symbolic model pool. A closed set; anything outside it is rejected at the
/// wire boundary. Variants are declared in lexicographic order so the derived
/// `Ord` matches ordering by pool id, which routing relies on for
/// deterministic tie-breaks.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PoolId {
    Architect,
    Cheap,
    FastCode,
    Reasoning,
    Reviewer,
}

impl PoolId {
    /// Membership test against the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

/// Tenant class. Deterministically yields the set of accessible pools.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TaskType {
    Architecture,
    Chat,
    Code,
    Reasoning,
    Review,
}

/// Claims carried by a verified tenant token. `pool_id` and `allowed_pools`
/// arrive as raw strings on purpose: validating them against the closed pool
/// set is the authorization layer's job, not the decoder's.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TenantClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub tenant_id: String,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_pools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_preferences: BTreeMap<TaskType, PoolId>,
    #[serde(default)]
    pub byok: bool,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_hash: Option<String>,
}

/// Everything the core needs to know about the caller. Created once at
/// authentication and immutable for the lifetime of the request.
#[derive(Clone, Debug)]
pub struct TenantContext {
    claims: TenantClaims,
    resolved_pools: Vec<PoolId>,
    requested_pool: Option<PoolId>,
}

impl TenantContext {
    pub fn new(
        claims: TenantClaims,
        resolved_pools: Vec<PoolId>,
        requested_pool: Option<PoolId>,
    ) -> Self {
        Self {
            claims,
            resolved_pools,
            requested_pool,
        }
    }

    pub fn claims(&self) -> &TenantClaims {
        &self.claims
    }

    /// Pools the tenant's tier permits, derived at authentication.
    pub fn resolved_pools(&self) -> &[PoolId] {
        &self.resolved_pools
    }

    /// The pool the token is bound to, if any.
    pub fn requested_pool(&self) -> Option<PoolId> {
        self.requested_pool
    }

    pub fn is_nft_routed(&self) -> bool {
        self.claims.nft_id.is_some() && !self.claims.model_preferences.is_empty()
    }

    pub fn is_byok(&self) -> bool {
        self.claims.byok
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThinkingTraces {
    #[default]
    Off,
    Optional,
    Required,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Capabilities {
    pub tool_calling: bool,
    pub thinking_traces: ThinkingTraces,
    pub vision: bool,
    pub streaming: bool,
    pub native_runtime_required: bool,
}

/// A concrete routing target.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResolvedModel {
    pub provider: String,
    pub model_id: String,
    pub capabilities: Capabilities,
}

impl std::fmt::Display for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_id)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, strum::IntoEnumIterator};

    #[test]
    fn pool_ids_parse_their_wire_form() {
        assert_eq!(PoolId::parse("fast-code"), Some(PoolId::FastCode));
        assert_eq!(PoolId::parse("cheap"), Some(PoolId::Cheap));
        assert_eq!(PoolId::parse("gpt-4o"), None);
        assert_eq!(PoolId::parse(""), None);
    }

    #[test]
    fn pool_order_matches_wire_ids() {
        let mut ids: Vec<_> = PoolId::iter().map(|p| p.to_string()).collect();
        let sorted_enum: Vec<_> = {
            let mut pools: Vec<_> = PoolId::iter().collect();
            pools.sort();
            pools.iter().map(|p| p.to_string()).collect()
        };
        ids.sort();
        assert_eq!(ids, sorted_enum);
    }

    #[test]
    fn nft_routing_requires_preferences() {
        let mut claims = TenantClaims {
            iss: "loa".into(),
            aud: "gateway".into(),
            sub: "user".into(),
            tenant_id: "t1".into(),
            tier: Tier::Pro,
            nft_id: Some("42".into()),
            pool_id: None,
            allowed_pools: None,
            model_preferences: BTreeMap::new(),
            byok: false,
            iat: 0,
            exp: i64::MAX,
            req_hash: None,
        };
        let ctx = TenantContext::new(claims.clone(), vec![PoolId::Cheap], None);
        assert!(!ctx.is_nft_routed());

        claims
            .model_preferences
            .insert(TaskType::Chat, PoolId::Cheap);
        let ctx = TenantContext::new(claims, vec![PoolId::Cheap], None);
        assert!(ctx.is_nft_routed());
    }
}
