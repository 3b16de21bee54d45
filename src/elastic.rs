//! Writes into the search backend over its HTTP bulk API.
//!
//! The sink speaks plain Elasticsearch HTTP: `HEAD`/`PUT` per index at
//! startup, `POST /_bulk` with NDJSON `index` actions afterwards. Every
//! action is keyed by `(_index, _id)`, so re-sending a batch replaces the
//! same documents — the retry path below is free to re-apply a whole batch.
//!
//! Status handling follows one rule set: transport errors, 429 and 5xx are
//! retried on the backoff ladder without bound; any other 4xx fails the call
//! so the coordinator can log it and move on; per-item rejections inside a
//! 200 response are logged and tolerated (the next modification of the row
//! retries them).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backoff::{Backoff, Shutdown};
use crate::config::ElasticSettings;
use crate::mappings;
use crate::models::SearchDocument;

pub const MOVIES_INDEX: &str = "movies";
pub const PERSONS_INDEX: &str = "persons";
pub const GENRES_INDEX: &str = "genres";

/// One id-keyed body bound for an index.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDoc {
    pub id: String,
    pub source: Value,
}

/// Serialize documents into bulk entries.
pub fn to_bulk<T, I>(docs: I) -> Result<Vec<BulkDoc>>
where
    T: SearchDocument,
    I: IntoIterator<Item = T>,
{
    docs.into_iter()
        .map(|doc| {
            Ok(BulkDoc {
                id: doc.doc_id(),
                source: serde_json::to_value(&doc)?,
            })
        })
        .collect()
}

/// Render the NDJSON payload for one `_bulk` request.
pub fn ndjson_body(index: &str, docs: &[BulkDoc]) -> Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = serde_json::json!({"index": {"_index": index, "_id": doc.id}});
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.source)?);
        body.push('\n');
    }
    Ok(body)
}

/// Write interface over the search backend.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Create any missing index with its bundled mapping. Startup-fatal on
    /// failure.
    async fn ensure_indices(&self) -> Result<()>;

    /// Upsert one batch of documents into `index`. The caller bounds batch
    /// size; ids within a batch are unique.
    async fn bulk_upsert(&self, index: &str, docs: &[BulkDoc]) -> Result<()>;
}

pub struct ElasticSink {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    policy: Backoff,
    shutdown: Shutdown,
}

impl ElasticSink {
    pub fn new(settings: &ElasticSettings, policy: Backoff, shutdown: Shutdown) -> Result<Self> {
        Self::with_base_url(
            settings.base_url(),
            settings.user.clone(),
            settings.password.clone(),
            policy,
            shutdown,
        )
    }

    pub fn with_base_url(
        base_url: String,
        user: Option<String>,
        password: Option<String>,
        policy: Backoff,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            user,
            password,
            policy,
            shutdown,
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn ensure_index(&self, name: &str, body: &Value) -> Result<()> {
        let probe = self
            .authed(self.client.head(format!("{}/{}", self.base_url, name)))
            .send()
            .await
            .with_context(|| format!("failed to probe index {name}"))?;
        if probe.status().is_success() {
            return Ok(());
        }
        if probe.status().as_u16() != 404 {
            bail!("index {name} probe returned {}", probe.status());
        }

        let response = self
            .authed(self.client.put(format!("{}/{}", self.base_url, name)))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to create index {name}"))?;
        let status = response.status();
        if status.is_success() {
            info!("created index {name}");
            return Ok(());
        }
        // Lost the creation race to another writer; the mapping is in place.
        if status.as_u16() == 400 {
            warn!("index {name} already exists");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        bail!("failed to create index {name}: {status}: {text}")
    }
}

#[async_trait]
impl Sink for ElasticSink {
    async fn ensure_indices(&self) -> Result<()> {
        let indices = [
            (MOVIES_INDEX, mappings::movies_index_body()),
            (PERSONS_INDEX, mappings::persons_index_body()),
        ];
        for (name, body) in &indices {
            self.ensure_index(name, body).await?;
        }
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, docs: &[BulkDoc]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = ndjson_body(index, docs)?;

        let mut attempt: u32 = 0;
        loop {
            let sent = self
                .authed(self.client.post(format!("{}/_bulk", self.base_url)))
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let summary: Value = response
                            .json()
                            .await
                            .context("malformed bulk response from search backend")?;
                        log_item_failures(index, &summary);
                        return Ok(());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        error!("bulk upsert into {index} returned {status}: {text}; retrying");
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        bail!("bulk upsert into {index} rejected with {status}: {text}");
                    }
                }
                Err(err) => {
                    error!("bulk upsert into {index} connection error: {err}; retrying");
                }
            }

            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            if !self.shutdown.sleep(delay).await {
                bail!("bulk upsert into {index}: shutdown requested during retry");
            }
        }
    }
}

fn log_item_failures(index: &str, summary: &Value) {
    if summary.get("errors").and_then(Value::as_bool) != Some(true) {
        return;
    }
    let Some(items) = summary.get("items").and_then(Value::as_array) else {
        return;
    };
    for item in items {
        let Some(entry) = item.get("index") else {
            continue;
        };
        if let Some(err) = entry.get("error") {
            let id = entry.get("_id").and_then(Value::as_str).unwrap_or("?");
            error!("document {id} rejected by index {index}: {err}");
        }
    }
}
