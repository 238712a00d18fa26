//! Idempotency claims for the action pipeline.
//!
//! A claim is keyed by item identity plus the state hash it was processed
//! at. Acquisition runs the atomic claim-acquire script on the key-value
//! collaborator, so at most one concurrent actor holds a live claim even
//! across processes. In-progress claims expire after their TTL; posted
//! claims never do.

use {
    crate::infra::stores::{InMemoryKeyValueStore, KeyValueStore, StoreError, scripts},
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClaimKey {
    pub repo: String,
    pub pr_number: u64,
    pub head_sha: String,
}

impl ClaimKey {
    fn storage_key(&self) -> String {
        format!("claim:{}:{}:{}", self.repo, self.pr_number, self.head_sha)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimStatus {
    InProgress { expires_at: DateTime<Utc> },
    Posted,
}

/// Stored form of a claim. `expires_at_ms` is absent on posted records;
/// the acquire script compares it against the caller's clock.
#[derive(Debug, Deserialize, Serialize)]
struct ClaimRecord {
    status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum RecordStatus {
    InProgress,
    Posted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now holds the claim.
    Acquired,
    /// Another actor holds a live in-progress claim.
    Held,
    /// The action was already posted for this key.
    AlreadyPosted,
}

#[derive(Clone)]
pub struct ClaimStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ClaimStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Store backed by the in-memory double, for tests and single-process
    /// deployments.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryKeyValueStore::default()))
    }

    /// Create-if-absent via the atomic acquire script. An expired
    /// in-progress claim counts as absent.
    pub async fn try_claim(
        &self,
        key: ClaimKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let record = ClaimRecord {
            status: RecordStatus::InProgress,
            expires_at_ms: Some((now + ttl).timestamp_millis()),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::Other(err.into()))?;
        let outcome = self
            .kv
            .eval(
                scripts::CLAIM_ACQUIRE,
                &[key.storage_key()],
                &[payload, now.timestamp_millis().to_string()],
            )
            .await?;
        match outcome.as_str() {
            Some("acquired") => Ok(ClaimOutcome::Acquired),
            Some("held") => Ok(ClaimOutcome::Held),
            Some("posted") => Ok(ClaimOutcome::AlreadyPosted),
            _ => Err(StoreError::Other(anyhow::anyhow!(
                "claim script returned {outcome}"
            ))),
        }
    }

    /// Transitions the claim to posted; posted claims carry no TTL.
    pub async fn finalize(&self, key: &ClaimKey) -> Result<(), StoreError> {
        let record = ClaimRecord {
            status: RecordStatus::Posted,
            expires_at_ms: None,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::Other(err.into()))?;
        self.kv.set(&key.storage_key(), payload).await
    }

    pub async fn status(&self, key: &ClaimKey) -> Result<Option<ClaimStatus>, StoreError> {
        let Some(raw) = self.kv.get(&key.storage_key()).await? else {
            return Ok(None);
        };
        let record: ClaimRecord =
            serde_json::from_str(&raw).map_err(|err| StoreError::Other(err.into()))?;
        Ok(Some(match record.status {
            RecordStatus::Posted => ClaimStatus::Posted,
            RecordStatus::InProgress => ClaimStatus::InProgress {
                expires_at: record
                    .expires_at_ms
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or_default(),
            },
        }))
    }
}
