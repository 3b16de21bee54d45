//! Configuration parsing and validation.
//!
//! The daemon is configured entirely from the process environment (a local
//! `.env` file is honored via `dotenvy` before settings are read):
//!
//! - `POSTGRES_{DB,USER,PASSWORD,HOST,PORT}` — source catalog connection
//! - `ELASTIC_{HOST,PORT,USER,PASSWORD}` — search backend connection
//! - `REDIS_{HOST,PORT}` — checkpoint store connection
//! - `CHUNK_SIZE` — page size for modified-id scans and bulk batch size
//! - `RESTART_INTERVAL_SECONDS` — sleep between replication cycles
//! - `EPOCH_DEFAULT` — seed timestamp used when a table has no checkpoint

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::checkpoint::STAMP_FORMAT;

#[derive(Debug, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    pub elastic: ElasticSettings,
    pub redis: RedisSettings,
    /// Page size for modified-id scans; also the bulk upsert batch size.
    pub chunk_size: usize,
    /// Sleep between full replication cycles.
    pub restart_interval: Duration,
    /// Seed timestamp for tables that have never been drained.
    pub epoch_default: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub db: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ElasticSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ElasticSettings {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
}

impl RedisSettings {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

fn default_chunk_size() -> usize {
    100
}

fn default_restart_interval_seconds() -> u64 {
    60
}

fn default_epoch() -> &'static str {
    "2021-06-13 00:00:00"
}

/// Load settings from the process environment.
pub fn load_settings() -> Result<Settings> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build settings from an arbitrary key lookup.
///
/// Split out from [`load_settings`] so validation can be exercised without
/// mutating the process environment.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let required = |key: &str| -> Result<String> {
        lookup(key).with_context(|| format!("missing required environment variable {key}"))
    };
    let port = |key: &str, default: u16| -> Result<u16> {
        match lookup(key) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("{key} must be a port number, got '{raw}'")),
            None => Ok(default),
        }
    };

    let postgres = PostgresSettings {
        db: required("POSTGRES_DB")?,
        user: required("POSTGRES_USER")?,
        password: required("POSTGRES_PASSWORD")?,
        host: required("POSTGRES_HOST")?,
        port: port("POSTGRES_PORT", 5432)?,
    };

    let elastic = ElasticSettings {
        host: required("ELASTIC_HOST")?,
        port: port("ELASTIC_PORT", 9200)?,
        user: lookup("ELASTIC_USER"),
        password: lookup("ELASTIC_PASSWORD"),
    };

    let redis = RedisSettings {
        host: required("REDIS_HOST")?,
        port: port("REDIS_PORT", 6379)?,
    };

    let chunk_size = match lookup("CHUNK_SIZE") {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("CHUNK_SIZE must be an integer, got '{raw}'"))?,
        None => default_chunk_size(),
    };
    if chunk_size == 0 {
        anyhow::bail!("CHUNK_SIZE must be > 0");
    }

    let restart_seconds = match lookup("RESTART_INTERVAL_SECONDS") {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("RESTART_INTERVAL_SECONDS must be an integer, got '{raw}'"))?,
        None => default_restart_interval_seconds(),
    };
    if restart_seconds == 0 {
        anyhow::bail!("RESTART_INTERVAL_SECONDS must be > 0");
    }

    let epoch_raw = lookup("EPOCH_DEFAULT").unwrap_or_else(|| default_epoch().to_string());
    let epoch_default = NaiveDateTime::parse_from_str(&epoch_raw, STAMP_FORMAT)
        .with_context(|| {
            format!(
                "EPOCH_DEFAULT must look like '{}', got '{epoch_raw}'",
                default_epoch()
            )
        })?
        .and_utc();

    Ok(Settings {
        postgres,
        elastic,
        redis,
        chunk_size,
        restart_interval: Duration::from_secs(restart_seconds),
        epoch_default,
    })
}
