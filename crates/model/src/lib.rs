//! Domain types shared by every crate in the workspace: tenants and their
//! claims, the closed pool/tier/task sets, completion DTOs and the
//! wire-visible error taxonomy.

pub mod completion;
pub mod errors;
pub mod tenant;

pub use {
    completion::{
        CompletionMetadata,
        CompletionRequest,
        CompletionResult,
        Message,
        Role,
        ToolCall,
        ToolSpec,
        Usage,
    },
    errors::{ApiError, ErrorCode, ErrorKind},
    tenant::{
        Capabilities,
        PoolId,
        ResolvedModel,
        TaskType,
        TenantClaims,
        TenantContext,
        ThinkingTraces,
        Tier,
    },
};
