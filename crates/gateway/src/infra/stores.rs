//! Collaborator storage interfaces.
//!
//! The budget checkpoint persists through [`ObjectStore`] with etag-guarded
//! writes and the pipeline's claims go through [`KeyValueStore`], whose
//! `eval` runs the atomic claim-acquire script. The in-memory doubles back
//! the test suites; [`FsObjectStore`] is the adapter the binary runs with.

use {
    dashmap::DashMap,
    sha2::{Digest, Sha256},
    std::{
        path::PathBuf,
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::io::AsyncWriteExt,
};

/// Scripts known to the key-value collaborator. A production deployment
/// ships these to Redis verbatim; the in-memory double interprets them by
/// identity.
pub mod scripts {
    /// Atomic claim acquire. `KEYS[1]` is the claim key, `ARGV[1]` the
    /// in-progress record to install, `ARGV[2]` the caller's clock in epoch
    /// milliseconds. Returns `acquired`, `held` or `posted`.
    pub const CLAIM_ACQUIRE: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw then
  local record = cjson.decode(raw)
  if record.status == 'posted' then
    return 'posted'
  end
  if record.expires_at_ms > tonumber(ARGV[2]) then
    return 'held'
  end
end
redis.call('SET', KEYS[1], ARGV[1])
return 'acquired'
"#;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("operation unsupported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Object storage with optimistic concurrency.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Create-if-absent; fails with `PreconditionFailed` when the key exists.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError>;
    /// Replace only when the stored etag still matches.
    async fn put_if_match(
        &self,
        key: &str,
        value: Vec<u8>,
        etag: &str,
    ) -> Result<String, StoreError>;
}

/// Redis-shaped key-value store. `eval` is the atomic multi-key entry point;
/// implementations only need to know the scripts in [`scripts`].
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<serde_json::Value, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<DashMap<String, (Vec<u8>, u64)>>,
}

fn version_etag(version: u64) -> String {
    format!("v{version}")
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        Ok(self
            .objects
            .get(key)
            .map(|entry| (entry.0.clone(), version_etag(entry.1))))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError> {
        let mut entry = self.objects.entry(key.to_string()).or_insert((Vec::new(), 0));
        entry.1 += 1;
        entry.0 = value;
        Ok(version_etag(entry.1))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError> {
        match self.objects.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::PreconditionFailed),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((value, 1));
                Ok(version_etag(1))
            }
        }
    }

    async fn put_if_match(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: &str,
    ) -> Result<String, StoreError> {
        let mut entry = self
            .objects
            .get_mut(key)
            .ok_or(StoreError::PreconditionFailed)?;
        if version_etag(entry.1) != expected {
            return Err(StoreError::PreconditionFailed);
        }
        entry.1 += 1;
        entry.0 = value;
        Ok(version_etag(entry.1))
    }
}

/// Filesystem-backed object store for single-node deployments. Etags are
/// content hashes, so a compare-and-swap survives process restarts.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn content_etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn write_via_rename(path: &PathBuf, value: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, value)
        .await
        .map_err(|err| StoreError::Other(err.into()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| StoreError::Other(err.into()))
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => {
                let etag = content_etag(&bytes);
                Ok(Some((bytes, etag)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Other(err.into())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError> {
        write_via_rename(&self.path_for(key), &value).await?;
        Ok(content_etag(&value))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Other(err.into())),
        }
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<String, StoreError> {
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_for(key))
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::PreconditionFailed);
            }
            Err(err) => return Err(StoreError::Other(err.into())),
        };
        file.write_all(&value)
            .await
            .map_err(|err| StoreError::Other(err.into()))?;
        file.flush()
            .await
            .map_err(|err| StoreError::Other(err.into()))?;
        Ok(content_etag(&value))
    }

    async fn put_if_match(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: &str,
    ) -> Result<String, StoreError> {
        let path = self.path_for(key);
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::PreconditionFailed);
            }
            Err(err) => return Err(StoreError::Other(err.into())),
        };
        if content_etag(&current) != expected {
            return Err(StoreError::PreconditionFailed);
        }
        write_via_rename(&path, &value).await?;
        Ok(content_etag(&value))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    values: Arc<DashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryKeyValueStore {
    fn live(&self, key: &str) -> Option<String> {
        let entry = self.values.get(key)?;
        match entry.1 {
            Some(deadline) if Instant::now() >= deadline => {
                drop(entry);
                self.values.remove(key);
                None
            }
            _ => Some(entry.0.clone()),
        }
    }

    /// The claim-acquire script, evaluated atomically under the key's
    /// entry lock.
    fn eval_claim_acquire(
        &self,
        keys: &[String],
        args: &[String],
    ) -> Result<serde_json::Value, StoreError> {
        let (key, payload, now_ms) = match (keys.first(), args.first(), args.get(1)) {
            (Some(key), Some(payload), Some(now)) => (key, payload, now),
            _ => {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "claim acquire expects one key and two arguments"
                )));
            }
        };
        let now_ms: i64 = now_ms
            .parse()
            .map_err(|_| StoreError::Other(anyhow::anyhow!("clock argument is not an integer")))?;

        let outcome = match self.values.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let record: serde_json::Value = serde_json::from_str(&occupied.get().0)
                    .map_err(|err| StoreError::Other(err.into()))?;
                if record["status"] == "posted" {
                    "posted"
                } else if record["expires_at_ms"].as_i64().unwrap_or(0) > now_ms {
                    "held"
                } else {
                    occupied.insert((payload.clone(), None));
                    "acquired"
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((payload.clone(), None));
                "acquired"
            }
        };
        Ok(serde_json::Value::String(outcome.to_string()))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert(("0".to_string(), None));
        let current: i64 = entry.0.parse().map_err(|_| {
            StoreError::Other(anyhow::anyhow!("value at {key} is not an integer"))
        })?;
        let next = current + delta;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<serde_json::Value, StoreError> {
        if script == scripts::CLAIM_ACQUIRE {
            return self.eval_claim_acquire(keys, args);
        }
        Err(StoreError::Unsupported("unknown script"))
    }
}
