//! The replication coordinator.
//!
//! One *cycle* drains the watched tables in `genre → person → film_work`
//! order. Draining a table pages through its modified ids from the last
//! checkpoint; for the dependent tables each page also refreshes its own
//! index (persons/genres) and fans out to the films it touches, so a changed
//! person or genre re-emits every film document it appears in. Pure film
//! modifications are caught by the `film_work` drain at the end. A film
//! touched both ways in one cycle is written twice — redundant but
//! idempotent, since writes are id-keyed upserts.
//!
//! Checkpoints hold `{date, offset}`: while a drain pages through rows the
//! `date` stays put and only `offset` advances, so a crash resumes inside
//! the same `modified` tie-group; a finished drain persists
//! `{date: cycle_date, offset: 0}` with `cycle_date` captured before the
//! first page query.
//!
//! Only startup errors escape: a failed drain is logged and the next table
//! (and the next cycle) proceeds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backoff::Shutdown;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Settings;
use crate::elastic::{to_bulk, Sink, GENRES_INDEX, MOVIES_INDEX, PERSONS_INDEX};
use crate::source::{Catalog, ModifiedPages, WatchedTable};
use crate::transform;

pub struct Etl {
    catalog: Arc<dyn Catalog>,
    sink: Arc<dyn Sink>,
    checkpoints: CheckpointStore,
    chunk_size: usize,
    restart_interval: Duration,
    epoch_default: DateTime<Utc>,
    shutdown: Shutdown,
}

impl Etl {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        sink: Arc<dyn Sink>,
        checkpoints: CheckpointStore,
        settings: &Settings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            catalog,
            sink,
            checkpoints,
            chunk_size: settings.chunk_size,
            restart_interval: settings.restart_interval,
            epoch_default: settings.epoch_default,
            shutdown,
        }
    }

    /// Run replication cycles until shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_cycle().await;
            if self.shutdown.is_triggered() || !self.shutdown.sleep(self.restart_interval).await {
                info!("shutdown requested; stopping");
                return Ok(());
            }
        }
    }

    /// One pass over all watched tables.
    pub async fn run_cycle(&self) {
        for table in WatchedTable::DRAIN_ORDER {
            if self.shutdown.is_triggered() {
                return;
            }
            info!("load table \"{}\" - start", table.name());
            match self.drain_table(table).await {
                Ok(()) => info!("load table \"{}\" - success", table.name()),
                Err(err) => error!("load table \"{}\" failed: {err:#}", table.name()),
            }
        }
    }

    async fn drain_table(&self, table: WatchedTable) -> Result<()> {
        let checkpoint = self.load_checkpoint(table).await?;
        let since = checkpoint.date;
        let mut offset = checkpoint.offset;
        let cycle_date = Utc::now();

        let mut pages_seen = 0u64;
        let mut films_written = 0u64;

        let mut pages = ModifiedPages::new(
            self.catalog.as_ref(),
            table,
            since,
            self.chunk_size as i64,
            offset,
        );
        while let Some(page) = pages.next_page().await? {
            let ids: Vec<Uuid> = page.iter().map(|row| row.id).collect();

            let film_ids = if table.is_dependent() {
                self.refresh_dependent_index(table, &ids).await?;
                self.catalog.film_ids_for(table, &ids).await?
            } else {
                ids
            };

            for batch in film_ids.chunks(self.chunk_size) {
                films_written += self.refresh_films(batch).await?;
            }

            pages_seen += 1;
            offset += self.chunk_size as i64;
            self.store_checkpoint(table, Checkpoint { date: since, offset }).await?;
        }

        self.store_checkpoint(
            table,
            Checkpoint {
                date: cycle_date,
                offset: 0,
            },
        )
        .await?;

        info!(
            "table \"{}\": {pages_seen} pages drained, {films_written} film documents written",
            table.name()
        );
        Ok(())
    }

    /// Rebuild and upsert the documents of the dependent index itself
    /// (`persons` or `genres`) for one page of changed ids.
    async fn refresh_dependent_index(&self, table: WatchedTable, ids: &[Uuid]) -> Result<()> {
        match table {
            WatchedTable::Person => {
                let rows = self.catalog.person_rows(ids).await?;
                let docs = transform::fold_persons(&rows);
                if docs.is_empty() {
                    return Ok(());
                }
                self.sink
                    .bulk_upsert(PERSONS_INDEX, &to_bulk(docs.into_values())?)
                    .await
            }
            WatchedTable::Genre => {
                let rows = self.catalog.genre_rows(ids).await?;
                let docs = transform::fold_genres(&rows);
                if docs.is_empty() {
                    return Ok(());
                }
                self.sink
                    .bulk_upsert(GENRES_INDEX, &to_bulk(docs.into_values())?)
                    .await
            }
            WatchedTable::FilmWork => Ok(()),
        }
    }

    /// Fetch the join-expanded rows for one batch of films and upsert the
    /// folded documents.
    async fn refresh_films(&self, film_ids: &[Uuid]) -> Result<u64> {
        let rows = self.catalog.film_rows(film_ids).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let docs = transform::fold_films(&rows);
        let count = docs.len() as u64;
        self.sink
            .bulk_upsert(MOVIES_INDEX, &to_bulk(docs.into_values())?)
            .await?;
        Ok(count)
    }

    async fn load_checkpoint(&self, table: WatchedTable) -> Result<Checkpoint> {
        match self.checkpoints.get(table.name()).await? {
            Some(raw) => match Checkpoint::decode(&raw) {
                Ok(checkpoint) => Ok(checkpoint),
                Err(err) => {
                    warn!(
                        "checkpoint for \"{}\" is unreadable ({err:#}); reseeding from the default epoch",
                        table.name()
                    );
                    Ok(Checkpoint::seed(self.epoch_default))
                }
            },
            None => Ok(Checkpoint::seed(self.epoch_default)),
        }
    }

    async fn store_checkpoint(&self, table: WatchedTable, checkpoint: Checkpoint) -> Result<()> {
        self.checkpoints.set(table.name(), &checkpoint.encode()).await
    }
}
