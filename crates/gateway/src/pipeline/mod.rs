//! Review/action pipeline: the gateway's own downstream consumer.
//!
//! Runs a fixed phase order per item: resolve → hash → marker pre-check →
//! claim → invoke → sanitize → marker re-check → post → finalize. A failure
//! in any phase leaves the claim in progress to expire, so a crashed run
//! can never double-post and a healthy retry picks the item up after the
//! TTL.

pub mod claims;

pub use claims::{ClaimKey, ClaimOutcome, ClaimStore};

use {
    crate::domain::{
        budget::Scope,
        routing::{DispatchRequest, Router},
        tools::ToolExecutor,
    },
    chrono::{Duration, Utc},
    model::{CompletionRequest, Message, TaskType, TenantContext},
    sha2::{Digest, Sha256},
    std::sync::Arc,
};

/// An actionable item, e.g. a pull request awaiting review. `volatile`
/// holds fields excluded from the state hash (timestamps, reactions,
/// assignees); editing them must not retrigger the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionItem {
    pub repo: String,
    pub pr_number: u64,
    pub head_sha: String,
    pub title: String,
    pub body: String,
    pub volatile: std::collections::BTreeMap<String, String>,
}

impl ActionItem {
    /// Hash over canonical fields only.
    pub fn state_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            &self.repo,
            &self.pr_number.to_string(),
            &self.head_sha,
            &self.title,
            &self.body,
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        hex::encode(hasher.finalize())
    }

    fn claim_key(&self) -> ClaimKey {
        ClaimKey {
            repo: self.repo.clone(),
            pr_number: self.pr_number,
            head_sha: self.state_hash(),
        }
    }
}

#[async_trait::async_trait]
pub trait ItemSource: Send + Sync {
    async fn resolve_items(&self) -> anyhow::Result<Vec<ActionItem>>;
}

/// Downstream system markers: what state hash, if any, the item was last
/// processed at.
#[async_trait::async_trait]
pub trait MarkerStore: Send + Sync {
    async fn processed_at(&self, item: &ActionItem) -> anyhow::Result<Option<String>>;
}

#[async_trait::async_trait]
pub trait ActionSink: Send + Sync {
    async fn post(&self, item: &ActionItem, body: &str) -> anyhow::Result<()>;
}

/// Produces the action body for one item. The gateway-backed implementation
/// routes through the full enforcement stack.
#[async_trait::async_trait]
pub trait ReviewInvoker: Send + Sync {
    async fn review(&self, item: &ActionItem) -> anyhow::Result<String>;
}

/// [`ReviewInvoker`] over the router, dispatching as a fixed service tenant.
pub struct RouterReviewer {
    pub router: Router,
    pub ctx: TenantContext,
    pub agent: String,
    pub scope: Scope,
    pub executor: Arc<dyn ToolExecutor>,
}

#[async_trait::async_trait]
impl ReviewInvoker for RouterReviewer {
    async fn review(&self, item: &ActionItem) -> anyhow::Result<String> {
        let prompt = format!(
            "Review pull request #{} ({}) at {}.\n\n{}\n\n{}",
            item.pr_number, item.repo, item.head_sha, item.title, item.body,
        );
        let outcome = self
            .router
            .dispatch(
                &self.ctx,
                DispatchRequest {
                    agent: self.agent.clone(),
                    task: Some(TaskType::Review),
                    scope: self.scope.clone(),
                    trace_id: format!("review-{}-{}", item.pr_number, &item.state_hash()[..8]),
                    request: CompletionRequest {
                        messages: vec![Message::user(prompt)],
                        ..Default::default()
                    },
                },
                self.executor.as_ref(),
            )
            .await?;
        Ok(outcome.result.content)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemOutcome {
    Posted,
    /// The downstream marker already shows this state processed.
    SkippedMarker,
    /// Another actor holds the claim (or already posted it).
    SkippedClaimed,
    /// A concurrent run completed between pre-check and post.
    SkippedConcurrent,
    /// Phase name that failed. The claim is left to expire.
    Failed(&'static str),
}

pub struct ActionPipeline {
    source: Arc<dyn ItemSource>,
    markers: Arc<dyn MarkerStore>,
    sink: Arc<dyn ActionSink>,
    invoker: Arc<dyn ReviewInvoker>,
    claims: ClaimStore,
    claim_ttl: Duration,
}

impl ActionPipeline {
    pub fn new(
        source: Arc<dyn ItemSource>,
        markers: Arc<dyn MarkerStore>,
        sink: Arc<dyn ActionSink>,
        invoker: Arc<dyn ReviewInvoker>,
        claims: ClaimStore,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            source,
            markers,
            sink,
            invoker,
            claims,
            claim_ttl,
        }
    }

    /// One pipeline sweep over all resolved items.
    pub async fn run_once(&self) -> anyhow::Result<Vec<(ActionItem, ItemOutcome)>> {
        let items = self.source.resolve_items().await?;
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let outcome = self.process(&item).await;
            tracing::debug!(
                repo = %item.repo,
                pr = item.pr_number,
                ?outcome,
                "pipeline item processed"
            );
            outcomes.push((item, outcome));
        }
        Ok(outcomes)
    }

    async fn process(&self, item: &ActionItem) -> ItemOutcome {
        let state_hash = item.state_hash();

        match self.markers.processed_at(item).await {
            Ok(Some(marker)) if marker == state_hash => return ItemOutcome::SkippedMarker,
            Ok(_) => (),
            Err(err) => {
                tracing::warn!(?err, "marker pre-check failed");
                return ItemOutcome::Failed("marker-pre-check");
            }
        }

        match self
            .claims
            .try_claim(item.claim_key(), self.claim_ttl, Utc::now())
            .await
        {
            Ok(ClaimOutcome::Acquired) => (),
            Ok(ClaimOutcome::Held | ClaimOutcome::AlreadyPosted) => {
                return ItemOutcome::SkippedClaimed;
            }
            Err(err) => {
                tracing::warn!(?err, "claim acquisition failed");
                return ItemOutcome::Failed("claim");
            }
        }

        let review = match self.invoker.review(item).await {
            Ok(review) => review,
            Err(err) => {
                tracing::warn!(?err, "review invocation failed, claim left to expire");
                return ItemOutcome::Failed("invoke");
            }
        };

        let sanitized = observe::scrub::scrub(&review);

        match self.markers.processed_at(item).await {
            Ok(Some(marker)) if marker == state_hash => return ItemOutcome::SkippedConcurrent,
            Ok(_) => (),
            Err(err) => {
                tracing::warn!(?err, "marker re-check failed");
                return ItemOutcome::Failed("marker-re-check");
            }
        }

        if let Err(err) = self.sink.post(item, &sanitized).await {
            tracing::warn!(?err, "post failed, claim left to expire");
            return ItemOutcome::Failed("post");
        }

        if let Err(err) = self.claims.finalize(&item.claim_key()).await {
            // The action is posted; an unfinalized claim merely expires.
            tracing::warn!(?err, "claim finalization failed");
        }
        ItemOutcome::Posted
    }
}
