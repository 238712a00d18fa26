//! Hash-chained audit write-ahead log.
//!
//! Each record carries the hash of its predecessor, so tampering with or
//! losing an entry breaks the chain on replay. Replay tolerates record
//! types it does not know (a newer writer may have added some) by skipping
//! them with a warning.

use {
    chrono::{DateTime, Utc},
    hmac::{Hmac, Mac},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::path::PathBuf,
    tokio::io::AsyncWriteExt,
};

/// Record types this build understands. Replay skips anything else.
const KNOWN_TYPES: &[&str] = &["guard", "budget", "pipeline"];

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Process identity stamped on every record.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RunContext {
    pub pod_id: String,
    pub build_sha: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WalRecord {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub ts: DateTime<Utc>,
    /// Record type, e.g. `guard`.
    pub phase: String,
    /// Operation within the type, e.g. `evaluator_degraded`.
    pub action: String,
    pub target: String,
    /// Caller-redacted parameters; the WAL never scrubs.
    pub params: serde_json::Value,
    pub run_ctx: RunContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

#[async_trait::async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Appends one record, returning its sequence number.
    async fn append(
        &self,
        phase: &str,
        action: &str,
        target: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<u64>;

    /// Replays all known records in append order.
    async fn replay(&self) -> anyhow::Result<Vec<WalRecord>>;
}

pub struct FileWal {
    path: PathBuf,
    run_ctx: RunContext,
    hmac_key: Option<Vec<u8>>,
    state: tokio::sync::Mutex<ChainState>,
}

struct ChainState {
    file: tokio::fs::File,
    seq: u64,
    prev_hash: String,
}

impl FileWal {
    /// Opens the segment, scanning any existing records to restore the
    /// chain head.
    pub async fn open(
        path: PathBuf,
        run_ctx: RunContext,
        hmac_key: Option<Vec<u8>>,
    ) -> anyhow::Result<Self> {
        let mut seq = 0;
        let mut prev_hash = GENESIS_HASH.to_string();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                    let record: WalRecord = serde_json::from_str(line)?;
                    seq = record.seq + 1;
                    prev_hash = record.hash;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            run_ctx,
            hmac_key,
            state: tokio::sync::Mutex::new(ChainState {
                file,
                seq,
                prev_hash,
            }),
        })
    }
}

fn record_hash(prev_hash: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn record_hmac(key: &[u8], hash: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(hash.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait::async_trait]
impl WriteAheadLog for FileWal {
    async fn append(
        &self,
        phase: &str,
        action: &str,
        target: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let ts = Utc::now();
        let body = serde_json::json!({
            "seq": state.seq,
            "ts": ts,
            "phase": phase,
            "action": action,
            "target": target,
            "params": params,
            "run_ctx": self.run_ctx,
        });
        let hash = record_hash(&state.prev_hash, &body);
        let record = WalRecord {
            seq: state.seq,
            prev_hash: state.prev_hash.clone(),
            hash: hash.clone(),
            ts,
            phase: phase.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            params,
            run_ctx: self.run_ctx.clone(),
            hmac: self.hmac_key.as_deref().map(|key| record_hmac(key, &hash)),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        state.file.write_all(line.as_bytes()).await?;
        state.file.flush().await?;
        let seq = state.seq;
        state.seq += 1;
        state.prev_hash = hash;
        Ok(seq)
    }

    async fn replay(&self) -> anyhow::Result<Vec<WalRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        let mut prev_hash = GENESIS_HASH.to_string();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: WalRecord = serde_json::from_str(line)
                .map_err(|err| anyhow::anyhow!("wal line {}: {err}", index + 1))?;
            anyhow::ensure!(
                record.prev_hash == prev_hash,
                "wal chain broken at seq {}",
                record.seq
            );
            prev_hash = record.hash.clone();
            if !KNOWN_TYPES.contains(&record.phase.as_str()) {
                tracing::warn!(
                    seq = record.seq,
                    phase = %record.phase,
                    "skipping wal record of unknown type"
                );
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }
}

/// Guard audit sink backed by the WAL. A failed write degrades to stderr
/// and never propagates.
pub struct WalAuditSink {
    wal: std::sync::Arc<dyn WriteAheadLog>,
}

impl WalAuditSink {
    pub fn new(wal: std::sync::Arc<dyn WriteAheadLog>) -> Self {
        Self { wal }
    }
}

#[async_trait::async_trait]
impl crate::domain::guard::AuditSink for WalAuditSink {
    async fn record(&self, action: crate::domain::guard::AuditAction, detail: &str) {
        let result = self
            .wal
            .append(
                "guard",
                &action.to_string(),
                "billing_evaluator",
                serde_json::json!({ "detail": detail }),
            )
            .await;
        if let Err(err) = result {
            eprintln!("audit wal write failed for {action}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext {
            pod_id: "pod-1".into(),
            build_sha: "deadbeef".into(),
        }
    }

    #[tokio::test]
    async fn chain_links_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let wal = FileWal::open(path.clone(), ctx(), None).await.unwrap();

        assert_eq!(
            wal.append("guard", "evaluator_degraded", "billing_evaluator", serde_json::json!({}))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            wal.append("guard", "evaluator_recovery", "billing_evaluator", serde_json::json!({}))
                .await
                .unwrap(),
            1
        );

        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
    }

    #[tokio::test]
    async fn reopen_resumes_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let wal = FileWal::open(path.clone(), ctx(), None).await.unwrap();
            wal.append("guard", "evaluator_bypass", "billing_evaluator", serde_json::json!({}))
                .await
                .unwrap();
        }
        let wal = FileWal::open(path, ctx(), None).await.unwrap();
        let seq = wal
            .append("budget", "checkpoint", "ledger", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(seq, 1);
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn unknown_types_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let wal = FileWal::open(path.clone(), ctx(), None).await.unwrap();
        wal.append("guard", "evaluator_bypass", "billing_evaluator", serde_json::json!({}))
            .await
            .unwrap();
        wal.append("hologram", "from_the_future", "n/a", serde_json::json!({}))
            .await
            .unwrap();
        wal.append("pipeline", "claim", "pr-1", serde_json::json!({}))
            .await
            .unwrap();

        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].phase, "guard");
        assert_eq!(records[1].phase, "pipeline");
    }

    #[tokio::test]
    async fn tampering_breaks_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let wal = FileWal::open(path.clone(), ctx(), None).await.unwrap();
        wal.append("guard", "a", "t", serde_json::json!({})).await.unwrap();
        wal.append("guard", "b", "t", serde_json::json!({})).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = raw.lines().collect();
        lines.remove(0);
        std::fs::write(&path, lines.join("\n")).unwrap();

        assert!(wal.replay().await.is_err());
    }

    #[tokio::test]
    async fn hmac_is_attached_when_keyed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let wal = FileWal::open(path, ctx(), Some(b"secret".to_vec()))
            .await
            .unwrap();
        wal.append("guard", "a", "t", serde_json::json!({})).await.unwrap();
        let records = wal.replay().await.unwrap();
        let record = &records[0];
        assert_eq!(
            record.hmac.as_deref(),
            Some(record_hmac(b"secret", &record.hash).as_str())
        );
    }
}
