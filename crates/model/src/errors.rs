//! The wire-visible error taxonomy and its HTTP mapping.

use serde::{Deserialize, Serialize};

/// Broad failure classes. Transient errors are retried internally and only
/// surface after exhaustion; policy denials propagate immediately; input
/// faults never retry; internal errors fail closed unless a documented
/// fail-open mode is configured.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputFault,
    PolicyDenial,
    Transient,
    Internal,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PoolAccessDenied,
    UnknownPool,
    TierUnauthorized,
    BindingInvalid,
    NativeRuntimeRequired,
    ProviderUnavailable,
    BudgetExceeded,
    BillingEvaluatorUnavailable,
    BillingInvariantViolated,
    ToolCallMaxIterations,
    ToolCallConsecutiveFailures,
    RateLimited,
    ConfigInvalid,
    WireBoundaryViolation,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::UnknownPool
            | Self::BindingInvalid
            | Self::NativeRuntimeRequired
            | Self::ConfigInvalid
            | Self::WireBoundaryViolation => ErrorKind::InputFault,
            Self::PoolAccessDenied
            | Self::TierUnauthorized
            | Self::BudgetExceeded
            | Self::BillingInvariantViolated => ErrorKind::PolicyDenial,
            Self::RateLimited | Self::ProviderUnavailable => ErrorKind::Transient,
            Self::BillingEvaluatorUnavailable
            | Self::ToolCallMaxIterations
            | Self::ToolCallConsecutiveFailures => ErrorKind::Internal,
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::ConfigInvalid
            | Self::WireBoundaryViolation
            | Self::UnknownPool
            | Self::NativeRuntimeRequired => 400,
            Self::PoolAccessDenied | Self::TierUnauthorized | Self::BillingInvariantViolated => 403,
            Self::BindingInvalid => 404,
            Self::RateLimited | Self::BudgetExceeded => 429,
            Self::ToolCallMaxIterations | Self::ToolCallConsecutiveFailures => 500,
            Self::BillingEvaluatorUnavailable | Self::ProviderUnavailable => 503,
        }
    }
}

/// The structured object returned to callers on failure. Details carry only
/// allowlisted safe fields; provider error bodies and key material never
/// appear here.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApiError {
    pub error: ErrorKind,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            error: code.kind(),
            code,
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, details: serde_json::Value) -> Self {
        Self {
            error: code.kind(),
            code,
            details: Some(details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::PoolAccessDenied).unwrap(),
            "\"POOL_ACCESS_DENIED\""
        );
        assert_eq!(ErrorCode::BillingEvaluatorUnavailable.to_string(), "BILLING_EVALUATOR_UNAVAILABLE");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::WireBoundaryViolation.status(), 400);
        assert_eq!(ErrorCode::PoolAccessDenied.status(), 403);
        assert_eq!(ErrorCode::BindingInvalid.status(), 404);
        assert_eq!(ErrorCode::RateLimited.status(), 429);
        assert_eq!(ErrorCode::BudgetExceeded.status(), 429);
        assert_eq!(ErrorCode::BillingEvaluatorUnavailable.status(), 503);
        assert_eq!(ErrorCode::ProviderUnavailable.status(), 503);
    }

    #[test]
    fn kinds_partition_the_taxonomy() {
        assert_eq!(ErrorCode::UnknownPool.kind(), ErrorKind::InputFault);
        assert_eq!(ErrorCode::TierUnauthorized.kind(), ErrorKind::PolicyDenial);
        assert_eq!(ErrorCode::RateLimited.kind(), ErrorKind::Transient);
        assert_eq!(
            ErrorCode::BillingEvaluatorUnavailable.kind(),
            ErrorKind::Internal
        );
    }
}
