//! Tenant pool authorization.
//!
//! [`enforce_pool_claims`] derives the pool grant from the tenant's tier and
//! cross-checks every pool the token claims; [`select_authorized_pool`] is
//! the sole entry point for binding a request to a pool on every execution
//! path. Both fail closed: an empty grant is a denial, never an escalation.

use {
    super::pools::Tables,
    model::{ErrorCode, PoolId, TaskType, TenantClaims, TenantContext, Tier},
    sha2::{Digest, Sha256},
    std::collections::BTreeMap,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct EnforcementConfig {
    /// In strict mode a claimed superset of the tier grant is a hard denial
    /// instead of a logged anomaly.
    pub strict: bool,
}

/// A discrepancy between `claims.allowed_pools` and the tier-derived grant,
/// in detection priority order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolMismatch {
    /// An entry is outside the closed pool set.
    InvalidEntry,
    /// The token claims a pool the tier does not grant.
    Superset,
    /// The token claims fewer pools than the tier grants.
    Subset,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Enforcement {
    pub resolved_pools: Vec<PoolId>,
    pub requested_pool: Option<PoolId>,
    pub mismatch: Option<PoolMismatch>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    #[error("tier {0} grants no pool access")]
    EmptyGrant(Tier),
    #[error("pool id {0:?} is not a known pool")]
    UnknownPool(String),
    #[error("tier {tier} cannot access pool {pool}")]
    AccessDenied { tier: Tier, pool: PoolId },
    #[error("claimed pool set exceeds the tier grant")]
    ClaimedSuperset,
}

impl EnforcementError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownPool(_) => ErrorCode::UnknownPool,
            Self::EmptyGrant(_) | Self::AccessDenied { .. } | Self::ClaimedSuperset => {
                ErrorCode::PoolAccessDenied
            }
        }
    }
}

/// Validates a token's pool claims against the tier-derived grant. Pure
/// except for logging. The caller builds the request's [`TenantContext`]
/// from the returned [`Enforcement`].
pub fn enforce_pool_claims(
    claims: &TenantClaims,
    tables: &Tables,
    config: EnforcementConfig,
) -> Result<Enforcement, EnforcementError> {
    let resolved_pools = tables.accessible_pools(claims.tier).to_vec();
    if resolved_pools.is_empty() {
        return Err(EnforcementError::EmptyGrant(claims.tier));
    }

    let requested_pool = match claims.pool_id.as_deref() {
        Some(raw) if !raw.is_empty() => {
            let pool =
                PoolId::parse(raw).ok_or_else(|| EnforcementError::UnknownPool(raw.to_string()))?;
            if !tables.tier_has_access(claims.tier, pool) {
                return Err(EnforcementError::AccessDenied {
                    tier: claims.tier,
                    pool,
                });
            }
            Some(pool)
        }
        _ => None,
    };

    let mismatch = match claims.allowed_pools.as_deref() {
        Some(claimed) if !claimed.is_empty() => {
            detect_mismatch(claimed, &resolved_pools, claims.tier, config)?
        }
        _ => None,
    };

    Ok(Enforcement {
        resolved_pools,
        requested_pool,
        mismatch,
    })
}

fn detect_mismatch(
    claimed: &[String],
    resolved: &[PoolId],
    tier: Tier,
    config: EnforcementConfig,
) -> Result<Option<PoolMismatch>, EnforcementError> {
    let claimed_digest = pool_list_digest(claimed.to_vec());
    let resolved_digest = pool_list_digest(resolved.iter().map(ToString::to_string).collect());

    let parsed: Vec<Option<PoolId>> = claimed.iter().map(|raw| PoolId::parse(raw)).collect();
    if parsed.iter().any(Option::is_none) {
        tracing::error!(
            %tier,
            claimed = %claimed_digest,
            derived = %resolved_digest,
            "token claims a pool outside the closed set"
        );
        return Ok(Some(PoolMismatch::InvalidEntry));
    }

    // Duplicates carry no extra authority; compare set cardinalities.
    let mut distinct: Vec<PoolId> = parsed.into_iter().flatten().collect();
    distinct.sort();
    distinct.dedup();

    if distinct.iter().any(|pool| !resolved.contains(pool)) {
        if config.strict {
            return Err(EnforcementError::ClaimedSuperset);
        }
        tracing::warn!(
            %tier,
            claimed = %claimed_digest,
            derived = %resolved_digest,
            "token claims broader pool access than the tier grants"
        );
        return Ok(Some(PoolMismatch::Superset));
    }
    if distinct.len() < resolved.len() {
        tracing::info!(
            %tier,
            claimed = %claimed_digest,
            derived = %resolved_digest,
            "token claims narrower pool access than the tier grants"
        );
        return Ok(Some(PoolMismatch::Subset));
    }
    Ok(None)
}

/// SHA-256 prefix over the sorted list. Logs carry this instead of raw pool
/// names.
fn pool_list_digest(mut pools: Vec<String>) -> String {
    pools.sort_unstable();
    let mut hasher = Sha256::new();
    for pool in pools {
        hasher.update(pool.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("tier {tier} cannot access preferred pool {pool}")]
    TierUnauthorized { tier: Tier, pool: PoolId },
    #[error("pool selection denied: {reason}")]
    AccessDenied { reason: &'static str },
}

impl SelectError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TierUnauthorized { .. } => ErrorCode::TierUnauthorized,
            Self::AccessDenied { .. } => ErrorCode::PoolAccessDenied,
        }
    }
}

/// Binds a request to a pool. The single entry point for pool selection on
/// every execution path.
pub fn select_authorized_pool(
    ctx: &TenantContext,
    task: TaskType,
    tables: &Tables,
) -> Result<PoolId, SelectError> {
    let claims = ctx.claims();

    // An explicit preference outside the tier grant is an escalation
    // attempt, not something to silently downgrade.
    if let Some(&preferred) = claims.model_preferences.get(&task) {
        if !tables.tier_has_access(claims.tier, preferred) {
            return Err(SelectError::TierUnauthorized {
                tier: claims.tier,
                pool: preferred,
            });
        }
    }

    let pool = tables.resolve_pool(claims.tier, task, &claims.model_preferences);

    if let Some(requested) = ctx.requested_pool() {
        if requested != pool {
            return Err(SelectError::AccessDenied {
                reason: "selected pool differs from the token-bound pool",
            });
        }
    }
    if ctx.resolved_pools().is_empty() {
        return Err(SelectError::AccessDenied {
            reason: "tenant context has an empty pool grant",
        });
    }
    if !ctx.resolved_pools().contains(&pool) {
        return Err(SelectError::AccessDenied {
            reason: "selected pool is outside the tenant grant",
        });
    }
    Ok(pool)
}

/// Pools the tenant may use, ranked by affinity descending with ties broken
/// by pool id ascending. An empty result means no eligible pool; callers
/// MUST treat that as a failure rather than widening the set.
pub fn affinity_ranked_pools(
    ctx: &TenantContext,
    affinity: &BTreeMap<PoolId, f64>,
    tables: &Tables,
) -> Vec<PoolId> {
    let mut pools: Vec<PoolId> = tables
        .accessible_pools(ctx.claims().tier)
        .iter()
        .filter(|pool| ctx.resolved_pools().contains(pool))
        .copied()
        .collect();
    pools.sort_by(|a, b| {
        let score = |p: &PoolId| affinity.get(p).copied().unwrap_or(0.0);
        score(b).total_cmp(&score(a)).then(a.cmp(b))
    });
    pools
}
