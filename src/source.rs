//! Source-side reads against the relational catalog.
//!
//! Three kinds of queries feed the pipeline, all scoped to schema `content`:
//!
//! 1. paged modified-id scans (`SELECT id, modified … ORDER BY modified
//!    LIMIT … OFFSET …`) that tail a watched table from a checkpoint;
//! 2. fan-out resolution — the film ids connected to a page of changed
//!    genres or persons via the respective link table;
//! 3. join-expanded row fetches for films, persons, and genres.
//!
//! Ties on `modified` are broken by database row order, which is
//! unspecified; the checkpoint therefore carries an offset into the
//! tie-group in addition to the timestamp.
//!
//! [`PgCatalog`] retries a transport-shaped failure once immediately (the
//! pool re-establishes the connection, so re-running the statement is the
//! reconnect) and hands anything persistent to the unbounded backoff ladder.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::backoff::{retry_forever, Backoff, Shutdown};
use crate::models::{FilmRow, GenreRow, ModifiedRow, PersonRow};

/// The source tables the pipeline tails, in drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedTable {
    Genre,
    Person,
    FilmWork,
}

impl WatchedTable {
    /// Dependent tables drain before `film_work` so films they touch are
    /// refreshed in the same cycle as the pure film-row modifications.
    pub const DRAIN_ORDER: [WatchedTable; 3] =
        [WatchedTable::Genre, WatchedTable::Person, WatchedTable::FilmWork];

    /// Table name under schema `content`; also the checkpoint key.
    pub fn name(&self) -> &'static str {
        match self {
            WatchedTable::Genre => "genre",
            WatchedTable::Person => "person",
            WatchedTable::FilmWork => "film_work",
        }
    }

    /// Whether changes to this table re-index films through a link table.
    pub fn is_dependent(&self) -> bool {
        !matches!(self, WatchedTable::FilmWork)
    }
}

/// Read interface over the relational catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// One page of `{id, modified}` rows with `modified >= since`, ordered by
    /// `modified`, at the given offset.
    async fn modified_page(
        &self,
        table: WatchedTable,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ModifiedRow>>;

    /// Film ids connected to the given genre/person ids, ordered by film
    /// `modified` ascending.
    async fn film_ids_for(&self, table: WatchedTable, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Left-join cross-product rows (film × person-role × genre) for the
    /// given film ids.
    async fn film_rows(&self, film_ids: &[Uuid]) -> Result<Vec<FilmRow>>;

    async fn person_rows(&self, person_ids: &[Uuid]) -> Result<Vec<PersonRow>>;

    async fn genre_rows(&self, genre_ids: &[Uuid]) -> Result<Vec<GenreRow>>;
}

/// Lazy sequence of modified-id pages.
///
/// Yields pages until the scan returns a short (or empty) page, advancing
/// its own offset by `limit` each time. The caller tracks checkpoint offsets
/// separately — a resumed drain passes the persisted offset as the start.
pub struct ModifiedPages<'a> {
    catalog: &'a dyn Catalog,
    table: WatchedTable,
    since: DateTime<Utc>,
    limit: i64,
    offset: i64,
    done: bool,
}

impl<'a> ModifiedPages<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        table: WatchedTable,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Self {
        Self {
            catalog,
            table,
            since,
            limit,
            offset,
            done: false,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<ModifiedRow>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .catalog
            .modified_page(self.table, self.since, self.limit, self.offset)
            .await?;
        if page.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if (page.len() as i64) < self.limit {
            self.done = true;
        }
        self.offset += self.limit;
        Ok(Some(page))
    }
}

/// Postgres-backed catalog reader.
pub struct PgCatalog {
    pool: PgPool,
    policy: Backoff,
    shutdown: Shutdown,
}

impl PgCatalog {
    pub fn new(pool: PgPool, policy: Backoff, shutdown: Shutdown) -> Self {
        Self {
            pool,
            policy,
            shutdown,
        }
    }

    /// Run a statement, retrying it exactly once when the failure looks like
    /// a lost connection. Persistent errors bubble to the backoff ladder.
    async fn with_reconnect<T, F, Fut>(&self, label: &str, run: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match run().await {
            Ok(value) => Ok(value),
            Err(err) if is_transient(&err) => {
                warn!("postgres connection lost during {label}: {err}; retrying statement");
                Ok(run().await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn modified_page(
        &self,
        table: WatchedTable,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ModifiedRow>> {
        let sql = format!(
            "SELECT id, modified FROM content.{} \
             WHERE modified >= $1 ORDER BY modified LIMIT $2 OFFSET $3",
            table.name()
        );
        retry_forever(self.policy, &self.shutdown, "modified-id page", || async {
            self.with_reconnect("modified-id page", || {
                sqlx::query_as::<_, ModifiedRow>(&sql)
                    .bind(since)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
            })
            .await
        })
        .await
    }

    async fn film_ids_for(&self, table: WatchedTable, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        anyhow::ensure!(
            table.is_dependent(),
            "film fan-out is defined for genre and person only"
        );
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let name = table.name();
        let sql = format!(
            "SELECT fw.id FROM content.film_work fw \
             LEFT JOIN content.{name}_film_work link ON link.film_work_id = fw.id \
             WHERE link.{name}_id = ANY($1) ORDER BY fw.modified"
        );
        retry_forever(self.policy, &self.shutdown, "film fan-out", || async {
            self.with_reconnect("film fan-out", || {
                sqlx::query_scalar::<_, Uuid>(&sql).bind(ids).fetch_all(&self.pool)
            })
            .await
        })
        .await
    }

    async fn film_rows(&self, film_ids: &[Uuid]) -> Result<Vec<FilmRow>> {
        if film_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = "SELECT fw.id AS fw_id, fw.title, fw.description, fw.rating, fw.type, \
                   fw.created, fw.modified, pfw.role, p.id AS person_id, p.full_name, \
                   g.name AS genre_name, g.id AS genre_id \
                   FROM content.film_work fw \
                   LEFT JOIN content.person_film_work pfw ON pfw.film_work_id = fw.id \
                   LEFT JOIN content.person p ON p.id = pfw.person_id \
                   LEFT JOIN content.genre_film_work gfw ON gfw.film_work_id = fw.id \
                   LEFT JOIN content.genre g ON g.id = gfw.genre_id \
                   WHERE fw.id = ANY($1)";
        retry_forever(self.policy, &self.shutdown, "film rows", || async {
            self.with_reconnect("film rows", || {
                sqlx::query_as::<_, FilmRow>(sql).bind(film_ids).fetch_all(&self.pool)
            })
            .await
        })
        .await
    }

    async fn person_rows(&self, person_ids: &[Uuid]) -> Result<Vec<PersonRow>> {
        if person_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = "SELECT p.id, p.full_name, pfw.role, pfw.film_work_id \
                   FROM content.person p \
                   LEFT JOIN content.person_film_work pfw ON p.id = pfw.person_id \
                   WHERE p.id = ANY($1)";
        retry_forever(self.policy, &self.shutdown, "person rows", || async {
            self.with_reconnect("person rows", || {
                sqlx::query_as::<_, PersonRow>(sql).bind(person_ids).fetch_all(&self.pool)
            })
            .await
        })
        .await
    }

    async fn genre_rows(&self, genre_ids: &[Uuid]) -> Result<Vec<GenreRow>> {
        if genre_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = "SELECT g.id, g.name, g.description, gfw.film_work_id \
                   FROM content.genre g \
                   JOIN content.genre_film_work gfw ON g.id = gfw.genre_id \
                   WHERE g.id = ANY($1)";
        retry_forever(self.policy, &self.shutdown, "genre rows", || async {
            self.with_reconnect("genre rows", || {
                sqlx::query_as::<_, GenreRow>(sql).bind(genre_ids).fetch_all(&self.pool)
            })
            .await
        })
        .await
    }
}
