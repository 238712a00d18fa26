//! Append-only cost ledger with a periodic checkpoint.
//!
//! The ledger is one JSON entry per line in a local file; the checkpoint
//! lives in object storage behind etag-guarded writes, so concurrent
//! checkpointers cannot clobber each other blindly. Startup reads the
//! checkpoint and replays only the ledger tail behind it. The replay path
//! uses the lenient monetary parser and reports how many values needed
//! normalization so the caller can emit a metric; the append path asserts
//! canonical form before anything reaches disk.

use {
    crate::infra::stores::{ObjectStore, StoreError},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, path::PathBuf, sync::Arc},
    tokio::io::AsyncWriteExt,
    units::MicroUsd,
};

/// Object-store key the checkpoint is kept under.
pub const CHECKPOINT_KEY: &str = "cost-checkpoint.json";

/// Spend attribution for one request. Keys aggregate hierarchically: a
/// sprint entry also counts toward its phase and project.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Scope {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<String>,
}

impl Scope {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            phase_id: None,
            sprint_id: None,
        }
    }

    /// Aggregation keys from coarse to fine.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec![format!("project:{}", self.project_id)];
        if let Some(phase) = &self.phase_id {
            keys.push(format!("project:{}/phase:{phase}", self.project_id));
            if let Some(sprint) = &self.sprint_id {
                keys.push(format!(
                    "project:{}/phase:{phase}/sprint:{sprint}",
                    self.project_id
                ));
            }
        }
        keys
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub trace_id: String,
    pub scope: Scope,
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub tenant_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_micro_usd: MicroUsd,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate state persisted between restarts so replay only covers the
/// ledger tail.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Checkpoint {
    /// Ledger entries already folded into `spent`.
    pub entries: u64,
    pub spent: BTreeMap<String, MicroUsd>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplayState {
    pub entries: u64,
    pub spent: BTreeMap<String, i64>,
    /// Monetary values that needed lenient normalization during replay.
    pub normalized: u64,
}

pub struct CostLedger {
    file: tokio::sync::Mutex<tokio::fs::File>,
    checkpoints: Arc<dyn ObjectStore>,
    /// Etag of the checkpoint this process last read or wrote.
    checkpoint_etag: tokio::sync::Mutex<Option<String>>,
}

impl CostLedger {
    /// Opens (creating if needed) the ledger and replays checkpoint + tail.
    pub async fn open(
        path: PathBuf,
        checkpoints: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<(Self, ReplayState)> {
        let mut state = ReplayState::default();
        let mut etag = None;
        if let Some((bytes, tag)) = checkpoints.get(CHECKPOINT_KEY).await? {
            let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
            state.entries = checkpoint.entries;
            state.spent = checkpoint
                .spent
                .into_iter()
                .map(|(key, value)| (key, value.atoms()))
                .collect();
            etag = Some(tag);
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => replay_tail(&raw, &mut state),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok((
            Self {
                file: tokio::sync::Mutex::new(file),
                checkpoints,
                checkpoint_etag: tokio::sync::Mutex::new(etag),
            },
            state,
        ))
    }

    /// Appends one entry. Total order is the append order under the file
    /// lock.
    pub async fn append(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        units::assert_canonical(&entry.cost_micro_usd.to_string())
            .map_err(|err| anyhow::anyhow!("non-canonical cost at write boundary: {err}"))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replaces the checkpoint under etag compare-and-swap. A lost race
    /// refreshes the etag and retries once against the current object.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        let mut etag = self.checkpoint_etag.lock().await;
        let first = match etag.as_deref() {
            Some(tag) => {
                self.checkpoints
                    .put_if_match(CHECKPOINT_KEY, bytes.clone(), tag)
                    .await
            }
            None => self.checkpoints.put_if_absent(CHECKPOINT_KEY, bytes.clone()).await,
        };
        let new_tag = match first {
            Ok(tag) => tag,
            Err(StoreError::PreconditionFailed) => {
                tracing::debug!("checkpoint etag stale, retrying against current object");
                match self.checkpoints.get(CHECKPOINT_KEY).await? {
                    Some((_, current)) => {
                        self.checkpoints
                            .put_if_match(CHECKPOINT_KEY, bytes, &current)
                            .await?
                    }
                    None => self.checkpoints.put_if_absent(CHECKPOINT_KEY, bytes).await?,
                }
            }
            Err(err) => return Err(err.into()),
        };
        *etag = Some(new_tag);
        Ok(())
    }
}

/// Folds every ledger line past the checkpoint into the spent map. Broken
/// lines are skipped with a warning: a torn final write must not take the
/// whole gateway down.
fn replay_tail(raw: &str, state: &mut ReplayState) {
    for (index, line) in raw.lines().enumerate() {
        if (index as u64) < state.entries || line.trim().is_empty() {
            continue;
        }
        let parsed: serde_json::Value = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(line = index + 1, %err, "skipping unparseable ledger line");
                continue;
            }
        };
        let Some(cost_raw) = parsed.get("cost_micro_usd").and_then(|v| v.as_str()) else {
            tracing::warn!(line = index + 1, "ledger line without a cost field");
            continue;
        };
        let cost = match MicroUsd::parse_lenient(cost_raw) {
            Ok(lenient) => {
                state.normalized += u64::from(lenient.normalized);
                lenient.value
            }
            Err(err) => {
                tracing::warn!(line = index + 1, %err, "skipping ledger line with bad cost");
                continue;
            }
        };
        let Some(scope) = parsed
            .get("scope")
            .and_then(|v| serde_json::from_value::<Scope>(v.clone()).ok())
        else {
            tracing::warn!(line = index + 1, "ledger line without a scope");
            continue;
        };
        for key in scope.keys() {
            *state.spent.entry(key).or_default() += cost.atoms();
        }
        state.entries += 1;
    }
}
