//! Ingress HTTP API.
//!
//! One dispatch route behind the billing-readiness gate plus a diagnostics
//! route. Failures map onto the wire-visible error taxonomy; nothing from a
//! provider error body or a token ever reaches a response.

use {
    crate::domain::{
        budget::Scope,
        guard::ConservationGuard,
        health::FailureDetector,
        pools::PoolRegistry,
        routing::{DispatchRequest, RouteError, Router},
        tenant::{EnforcementConfig, enforce_pool_claims},
        tools::ToolExecutor,
    },
    axum::{
        Json,
        Router as AxumRouter,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    model::{
        ApiError,
        ErrorCode,
        Message,
        TaskType,
        TenantClaims,
        TenantContext,
        ToolSpec,
        Usage,
    },
    rand::RngCore,
    serde::{Deserialize, Serialize},
    std::{net::SocketAddr, sync::Arc},
    tokio::sync::oneshot,
    units::MicroUsd,
};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("request is not authenticated")]
    Unauthenticated,
    #[error("token is not acceptable here")]
    Forbidden,
}

/// Verifies a bearer token into tenant claims. The JWT mechanics live with
/// the collaborator; the core only consumes the result.
#[async_trait::async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<TenantClaims, AuthError>;
}

/// Development verifier over a static token → claims table. Expired claims
/// are rejected even here.
pub struct StaticTokenVerifier {
    tenants: std::collections::BTreeMap<String, TenantClaims>,
}

impl StaticTokenVerifier {
    pub fn new(tenants: std::collections::BTreeMap<String, TenantClaims>) -> Self {
        Self { tenants }
    }
}

#[async_trait::async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TenantClaims, AuthError> {
        let claims = self
            .tenants
            .get(token)
            .cloned()
            .ok_or(AuthError::Unauthenticated)?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Forbidden);
        }
        Ok(claims)
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub router: Router,
    pub guard: ConservationGuard,
    pub registry: PoolRegistry,
    pub detector: FailureDetector,
    pub verifier: Arc<dyn AuthVerifier>,
    pub executor: Arc<dyn ToolExecutor>,
    pub enforcement: EnforcementConfig,
}

pub fn app(state: ApiState) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/dispatch", post(dispatch))
        .route("/v1/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until the shutdown signal fires.
pub async fn serve(
    state: ApiState,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(?addr, "serving gateway API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            shutdown.await.ok();
        })
        .await
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchBody {
    agent: String,
    #[serde(default)]
    task: Option<TaskType>,
    project_id: String,
    #[serde(default)]
    phase_id: Option<String>,
    #[serde(default)]
    sprint_id: Option<String>,
    messages: Vec<Message>,
    #[serde(default)]
    tools: Vec<ToolSpec>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    pool: model::PoolId,
    provider: String,
    model: String,
    cost_micro_usd: MicroUsd,
    usage: Usage,
    trace_id: String,
    downgraded: bool,
    budget_warning: bool,
}

async fn dispatch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<DispatchBody>,
) -> Response {
    // Billing ingress gate: a guard that cannot evaluate refuses service
    // rather than letting spend through unchecked.
    if !state.guard.is_billing_ready() {
        return error_response(ErrorCode::BillingEvaluatorUnavailable, None);
    }

    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let tables = state.registry.load();
    let enforcement = match enforce_pool_claims(&claims, &tables, state.enforcement) {
        Ok(enforcement) => enforcement,
        Err(err) => {
            return error_response(err.code(), None);
        }
    };
    let ctx = TenantContext::new(claims, enforcement.resolved_pools, enforcement.requested_pool);

    let trace_id = body.trace_id.unwrap_or_else(generated_trace_id);
    let request = DispatchRequest {
        agent: body.agent,
        task: body.task,
        scope: Scope {
            project_id: body.project_id,
            phase_id: body.phase_id,
            sprint_id: body.sprint_id,
        },
        trace_id: trace_id.clone(),
        request: model::CompletionRequest {
            messages: body.messages,
            tools: body.tools,
            max_tokens: body.max_tokens,
        },
    };

    match state.router.dispatch(&ctx, request, state.executor.as_ref()).await {
        Ok(outcome) => Json(DispatchResponse {
            content: outcome.result.content,
            thinking: outcome.result.thinking,
            pool: outcome.pool,
            provider: outcome.resolved.provider,
            model: outcome.resolved.model_id,
            cost_micro_usd: outcome.cost,
            usage: outcome.result.usage,
            trace_id,
            downgraded: outcome.downgraded,
            budget_warning: outcome.budget_warning,
        })
        .into_response(),
        Err(err) => route_error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    billing_ready: bool,
    circuits: Vec<CircuitView>,
}

#[derive(Debug, Serialize)]
struct CircuitView {
    provider: String,
    model: String,
    state: String,
    consecutive_failures: u32,
}

async fn health(State(state): State<ApiState>) -> Response {
    let circuits = state
        .detector
        .snapshot()
        .into_iter()
        .map(|snapshot| CircuitView {
            provider: snapshot.provider,
            model: snapshot.model_id,
            state: format!("{:?}", snapshot.state),
            consecutive_failures: snapshot.consecutive_failures,
        })
        .collect();
    Json(HealthResponse {
        billing_ready: state.guard.is_billing_ready(),
        circuits,
    })
    .into_response()
}

async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<TenantClaims, Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| auth_error_response(&AuthError::Unauthenticated))?;
    state
        .verifier
        .verify(token)
        .await
        .map_err(|err| auth_error_response(&err))
}

fn auth_error_response(err: &AuthError) -> Response {
    let (status, label) = match err {
        AuthError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        AuthError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
    };
    (status, Json(serde_json::json!({ "error": label }))).into_response()
}

fn route_error_response(err: RouteError) -> Response {
    let code = err.code();
    tracing::debug!(%err, ?code, "dispatch failed");
    error_response(code, None)
}

fn error_response(code: ErrorCode, details: Option<serde_json::Value>) -> Response {
    let status =
        StatusCode::from_u16(code.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match details {
        Some(details) => ApiError::with_details(code, details),
        None => ApiError::new(code),
    };
    (status, Json(body)).into_response()
}

fn generated_trace_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
