//! Durable drain-progress tracking.
//!
//! Each watched table owns one key in a string key-value store. The value is
//! the JSON payload `{"date": "YYYY-MM-DD HH:MM:SS", "offset": <int>}`:
//! every row with `modified < date` is done, and within the tie-group at
//! `date` the first `offset` rows have been emitted. The coordinator is the
//! only component that interprets the payload; the store itself moves opaque
//! strings.
//!
//! Two backends are provided behind [`CheckpointBackend`]: Redis for
//! production and a JSON file for single-host setups and tests. The
//! [`CheckpointStore`] wrapper retries backend calls under backoff so a
//! transient store outage stalls the drain instead of failing it.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::backoff::{retry_forever, Backoff, Shutdown};

/// Timestamp layout used in checkpoint payloads and `EPOCH_DEFAULT`.
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Drain progress for one watched table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "stamp")]
    pub date: DateTime<Utc>,
    pub offset: i64,
}

impl Checkpoint {
    /// Starting point for a table that has never been drained.
    pub fn seed(epoch: DateTime<Utc>) -> Self {
        Self {
            date: epoch,
            offset: 0,
        }
    }

    pub fn encode(&self) -> String {
        serde_json::json!({
            "date": self.date.format(STAMP_FORMAT).to_string(),
            "offset": self.offset,
        })
        .to_string()
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).with_context(|| format!("malformed checkpoint payload '{raw}'"))
    }
}

mod stamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::STAMP_FORMAT;

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(STAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, STAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// A durable string key-value mapping.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Last value written for `key`, or `None` if never set.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Persist `value` under `key`; visible after restart once this returns.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Redis-backed checkpoint storage.
///
/// The connection manager re-establishes dropped connections on its own; the
/// retry layer in [`CheckpointStore`] covers the window where it cannot.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CheckpointBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }
}

/// JSON-file checkpoint storage: a single object mapping keys to payloads.
///
/// Writes go through a temp file + rename so a crash mid-write never leaves
/// a torn payload behind.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt checkpoint file {}", self.path.display()))
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string(map)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }
}

/// Backend wrapper that retries every operation under backoff.
pub struct CheckpointStore {
    backend: Box<dyn CheckpointBackend>,
    policy: Backoff,
    shutdown: Shutdown,
}

impl CheckpointStore {
    pub fn new(backend: Box<dyn CheckpointBackend>, policy: Backoff, shutdown: Shutdown) -> Self {
        Self {
            backend,
            policy,
            shutdown,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        retry_forever(self.policy, &self.shutdown, "checkpoint get", || async {
            self.backend.get(key).await
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        retry_forever(self.policy, &self.shutdown, "checkpoint set", || async {
            self.backend.set(key, value).await
        })
        .await
    }
}
