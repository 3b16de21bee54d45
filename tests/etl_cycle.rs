//! Full-cycle coordinator tests against an in-memory catalog and a
//! recording sink, with checkpoints persisted through the file backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use cinesync::backoff::{Backoff, Shutdown};
use cinesync::checkpoint::{Checkpoint, CheckpointBackend, CheckpointStore, FileBackend};
use cinesync::config::{self, Settings};
use cinesync::elastic::{BulkDoc, Sink};
use cinesync::etl::Etl;
use cinesync::models::{FilmRow, GenreRow, ModifiedRow, PersonRow};
use cinesync::source::{Catalog, WatchedTable};

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}

#[derive(Clone)]
struct FilmFixture {
    id: Uuid,
    title: String,
    rating: Option<f64>,
    modified: DateTime<Utc>,
}

#[derive(Clone)]
struct PersonFixture {
    id: Uuid,
    name: String,
    modified: DateTime<Utc>,
}

#[derive(Clone)]
struct GenreFixture {
    id: Uuid,
    name: String,
    modified: DateTime<Utc>,
}

/// In-memory stand-in for the relational catalog.
#[derive(Default)]
struct FakeCatalog {
    films: Vec<FilmFixture>,
    persons: Vec<PersonFixture>,
    genres: Vec<GenreFixture>,
    /// (film, person, role)
    credits: Vec<(Uuid, Uuid, String)>,
    /// (film, genre)
    film_genres: Vec<(Uuid, Uuid)>,
}

impl FakeCatalog {
    fn add_film(&mut self, title: &str, rating: f64, modified: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.films.push(FilmFixture {
            id,
            title: title.to_string(),
            rating: Some(rating),
            modified: at(modified),
        });
        id
    }

    fn add_person(&mut self, name: &str, modified: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.persons.push(PersonFixture {
            id,
            name: name.to_string(),
            modified: at(modified),
        });
        id
    }

    fn add_genre(&mut self, name: &str, modified: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.genres.push(GenreFixture {
            id,
            name: name.to_string(),
            modified: at(modified),
        });
        id
    }

    fn credit(&mut self, film: Uuid, person: Uuid, role: &str) {
        self.credits.push((film, person, role.to_string()));
    }

    fn tag(&mut self, film: Uuid, genre: Uuid) {
        self.film_genres.push((film, genre));
    }

    fn slice(mut rows: Vec<ModifiedRow>, limit: i64, offset: i64) -> Vec<ModifiedRow> {
        rows.sort_by_key(|row| row.modified);
        rows.into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn modified_page(
        &self,
        table: WatchedTable,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ModifiedRow>> {
        let rows = match table {
            WatchedTable::Genre => self
                .genres
                .iter()
                .filter(|g| g.modified >= since)
                .map(|g| ModifiedRow {
                    id: g.id,
                    modified: g.modified,
                })
                .collect(),
            WatchedTable::Person => self
                .persons
                .iter()
                .filter(|p| p.modified >= since)
                .map(|p| ModifiedRow {
                    id: p.id,
                    modified: p.modified,
                })
                .collect(),
            WatchedTable::FilmWork => self
                .films
                .iter()
                .filter(|f| f.modified >= since)
                .map(|f| ModifiedRow {
                    id: f.id,
                    modified: f.modified,
                })
                .collect(),
        };
        Ok(Self::slice(rows, limit, offset))
    }

    async fn film_ids_for(&self, table: WatchedTable, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut films: Vec<&FilmFixture> = self
            .films
            .iter()
            .filter(|film| match table {
                WatchedTable::Genre => self
                    .film_genres
                    .iter()
                    .any(|(fw, genre)| *fw == film.id && ids.contains(genre)),
                WatchedTable::Person => self
                    .credits
                    .iter()
                    .any(|(fw, person, _)| *fw == film.id && ids.contains(person)),
                WatchedTable::FilmWork => false,
            })
            .collect();
        films.sort_by_key(|film| film.modified);
        Ok(films.into_iter().map(|film| film.id).collect())
    }

    async fn film_rows(&self, film_ids: &[Uuid]) -> Result<Vec<FilmRow>> {
        let mut rows = Vec::new();
        for id in film_ids {
            let Some(film) = self.films.iter().find(|f| f.id == *id) else {
                continue;
            };
            let credits: Vec<(&str, &PersonFixture)> = self
                .credits
                .iter()
                .filter(|(fw, _, _)| fw == id)
                .filter_map(|(_, person, role)| {
                    self.persons
                        .iter()
                        .find(|p| p.id == *person)
                        .map(|p| (role.as_str(), p))
                })
                .collect();
            let genres: Vec<&GenreFixture> = self
                .film_genres
                .iter()
                .filter(|(fw, _)| fw == id)
                .filter_map(|(_, genre)| self.genres.iter().find(|g| g.id == *genre))
                .collect();

            let credit_dim: Vec<Option<(&str, &PersonFixture)>> = if credits.is_empty() {
                vec![None]
            } else {
                credits.into_iter().map(Some).collect()
            };
            let genre_dim: Vec<Option<&GenreFixture>> = if genres.is_empty() {
                vec![None]
            } else {
                genres.into_iter().map(Some).collect()
            };

            for credit in &credit_dim {
                for genre in &genre_dim {
                    rows.push(FilmRow {
                        fw_id: film.id,
                        title: film.title.clone(),
                        description: None,
                        rating: film.rating,
                        kind: "movie".to_string(),
                        created: film.modified,
                        modified: film.modified,
                        role: credit.map(|(role, _)| role.to_string()),
                        person_id: credit.map(|(_, person)| person.id),
                        full_name: credit.map(|(_, person)| person.name.clone()),
                        genre_name: genre.map(|g| g.name.clone()),
                        genre_id: genre.map(|g| g.id),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn person_rows(&self, person_ids: &[Uuid]) -> Result<Vec<PersonRow>> {
        let mut rows = Vec::new();
        for id in person_ids {
            let Some(person) = self.persons.iter().find(|p| p.id == *id) else {
                continue;
            };
            let credits: Vec<(&Uuid, &String)> = self
                .credits
                .iter()
                .filter(|(_, pid, _)| pid == id)
                .map(|(film, _, role)| (film, role))
                .collect();
            if credits.is_empty() {
                rows.push(PersonRow {
                    id: person.id,
                    full_name: person.name.clone(),
                    role: None,
                    film_work_id: None,
                });
            } else {
                for (film, role) in credits {
                    rows.push(PersonRow {
                        id: person.id,
                        full_name: person.name.clone(),
                        role: Some(role.clone()),
                        film_work_id: Some(*film),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn genre_rows(&self, genre_ids: &[Uuid]) -> Result<Vec<GenreRow>> {
        let mut rows = Vec::new();
        for id in genre_ids {
            let Some(genre) = self.genres.iter().find(|g| g.id == *id) else {
                continue;
            };
            for (film, _) in self.film_genres.iter().filter(|(_, gid)| gid == id) {
                rows.push(GenreRow {
                    id: genre.id,
                    name: genre.name.clone(),
                    description: None,
                    film_work_id: *film,
                });
            }
        }
        Ok(rows)
    }
}

/// Captures every bulk write in arrival order.
#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<(String, Vec<BulkDoc>)>>,
}

impl RecordingSink {
    fn index_sequence(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(index, _)| index.clone())
            .collect()
    }

    fn docs_for(&self, index: &str) -> Vec<BulkDoc> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == index)
            .flat_map(|(_, docs)| docs.clone())
            .collect()
    }

    fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn ensure_indices(&self) -> Result<()> {
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, docs: &[BulkDoc]) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((index.to_string(), docs.to_vec()));
        Ok(())
    }
}

/// File backend wrapper that logs every checkpoint write.
struct RecordingBackend {
    inner: FileBackend,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl CheckpointBackend for RecordingBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.inner.set(key, value).await
    }
}

fn test_settings(chunk_size: usize) -> Settings {
    let env: HashMap<&str, String> = HashMap::from([
        ("POSTGRES_DB", "movies".to_string()),
        ("POSTGRES_USER", "app".to_string()),
        ("POSTGRES_PASSWORD", "secret".to_string()),
        ("POSTGRES_HOST", "db".to_string()),
        ("ELASTIC_HOST", "search".to_string()),
        ("REDIS_HOST", "cache".to_string()),
        ("CHUNK_SIZE", chunk_size.to_string()),
    ]);
    config::from_lookup(|key| env.get(key).cloned()).unwrap()
}

struct Harness {
    etl: Etl,
    sink: Arc<RecordingSink>,
    checkpoint_log: Arc<Mutex<Vec<(String, String)>>>,
    dir: TempDir,
}

impl Harness {
    fn new(catalog: FakeCatalog, chunk_size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let checkpoint_log = Arc::new(Mutex::new(Vec::new()));
        let backend = RecordingBackend {
            inner: FileBackend::new(&path),
            log: checkpoint_log.clone(),
        };
        let store = CheckpointStore::new(Box::new(backend), Backoff::default(), Shutdown::new());

        let sink = Arc::new(RecordingSink::default());
        let etl = Etl::new(
            Arc::new(catalog),
            sink.clone(),
            store,
            &test_settings(chunk_size),
            Shutdown::new(),
        );

        Self {
            etl,
            sink,
            checkpoint_log,
            dir,
        }
    }

    /// Seed a checkpoint before the first cycle runs.
    async fn seed_checkpoint(&self, table: &str, date: &str, offset: i64) {
        let backend = FileBackend::new(self.dir.path().join("checkpoints.json"));
        let payload = Checkpoint {
            date: at(date),
            offset,
        }
        .encode();
        backend.set(table, &payload).await.unwrap();
    }

    fn checkpoints_set_for(&self, table: &str) -> Vec<Checkpoint> {
        self.checkpoint_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == table)
            .map(|(_, value)| Checkpoint::decode(value).unwrap())
            .collect()
    }
}

fn doc_ids(docs: &[BulkDoc]) -> Vec<String> {
    docs.iter().map(|doc| doc.id.clone()).collect()
}

#[tokio::test]
async fn cold_start_projects_one_film_with_credits() {
    let mut catalog = FakeCatalog::default();
    let film = catalog.add_film("A", 7.5, "2024-01-01T00:00:00Z");
    let ann = catalog.add_person("Ann", "2024-01-01T00:00:00Z");
    let drama = catalog.add_genre("Drama", "2024-01-01T00:00:00Z");
    catalog.credit(film, ann, "actor");
    catalog.tag(film, drama);

    let harness = Harness::new(catalog, 100);
    harness.etl.run_cycle().await;

    // Dependent drains first, each followed by its film fan-out, then the
    // film_work drain itself.
    assert_eq!(
        harness.sink.index_sequence(),
        ["genres", "movies", "persons", "movies", "movies"]
    );

    let movies = harness.sink.docs_for("movies");
    assert!(movies.iter().all(|doc| doc.id == film.to_string()));
    let body = &movies[0].source;
    assert_eq!(body["title"], "A");
    assert_eq!(body["imdb_rating"], 7.5);
    assert_eq!(
        body["actors"],
        json!([{"id": ann.to_string(), "name": "Ann"}])
    );
    assert_eq!(body["actors_names"], json!(["Ann"]));
    assert_eq!(body["writers"], json!([]));
    assert_eq!(body["writers_names"], json!([]));
    assert_eq!(body["directors"], json!([]));
    assert_eq!(
        body["genres"],
        json!([{"id": drama.to_string(), "name": "Drama"}])
    );
    assert_eq!(body["genres_names"], json!(["Drama"]));

    let persons = harness.sink.docs_for("persons");
    assert_eq!(doc_ids(&persons), [ann.to_string()]);
    assert_eq!(persons[0].source["role"], json!(["actor"]));
    assert_eq!(persons[0].source["film_ids"], json!([film.to_string()]));

    let genres = harness.sink.docs_for("genres");
    assert_eq!(doc_ids(&genres), [drama.to_string()]);

    // Every table finished its drain with a reset checkpoint.
    for table in ["genre", "person", "film_work"] {
        let last = *harness.checkpoints_set_for(table).last().unwrap();
        assert_eq!(last.offset, 0);
        assert!(last.date > at("2024-01-01T00:00:00Z"));
    }
}

#[tokio::test]
async fn modified_person_fans_out_to_every_credited_film() {
    let mut catalog = FakeCatalog::default();
    let first = catalog.add_film("First", 6.0, "2024-01-01T00:00:00Z");
    let second = catalog.add_film("Second", 8.0, "2024-01-02T00:00:00Z");
    let ann = catalog.add_person("Ann", "2024-03-01T00:00:00Z");
    catalog.credit(first, ann, "actor");
    catalog.credit(second, ann, "producer");

    let harness = Harness::new(catalog, 100);
    // Films and genres are already caught up; only the person row is new.
    harness
        .seed_checkpoint("film_work", "2025-01-01T00:00:00Z", 0)
        .await;
    harness
        .seed_checkpoint("genre", "2025-01-01T00:00:00Z", 0)
        .await;
    harness.etl.run_cycle().await;

    let mut movie_ids = doc_ids(&harness.sink.docs_for("movies"));
    movie_ids.sort();
    let mut expected = vec![first.to_string(), second.to_string()];
    expected.sort();
    assert_eq!(movie_ids, expected);

    let persons = harness.sink.docs_for("persons");
    assert_eq!(persons[0].source["role"], json!(["actor", "producer"]));
    let mut film_ids: Vec<String> = persons[0].source["film_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_str().unwrap().to_string())
        .collect();
    film_ids.sort();
    assert_eq!(film_ids, expected);

    assert!(harness.sink.docs_for("genres").is_empty());
}

#[tokio::test]
async fn checkpoints_advance_page_by_page_and_reset_at_drain_end() {
    let mut catalog = FakeCatalog::default();
    let tie = "2024-05-01T00:00:00Z";
    catalog.add_film("One", 1.0, tie);
    catalog.add_film("Two", 2.0, tie);
    catalog.add_film("Three", 3.0, tie);

    let harness = Harness::new(catalog, 2);
    harness.etl.run_cycle().await;

    let sets = harness.checkpoints_set_for("film_work");
    assert_eq!(sets.len(), 3);
    // The drain date holds while offsets advance through the tie-group.
    assert_eq!(sets[0].date, at("2021-06-13T00:00:00Z"));
    assert_eq!(sets[0].offset, 2);
    assert_eq!(sets[1].date, at("2021-06-13T00:00:00Z"));
    assert_eq!(sets[1].offset, 4);
    // Drain end resets the offset and moves the date forward.
    assert_eq!(sets[2].offset, 0);
    assert!(sets[2].date > at(tie));

    assert_eq!(harness.sink.docs_for("movies").len(), 3);
}

#[tokio::test]
async fn drain_resumes_from_a_mid_tie_group_offset() {
    let mut catalog = FakeCatalog::default();
    let tie = "2024-05-01T00:00:00Z";
    catalog.add_film("One", 1.0, tie);
    catalog.add_film("Two", 2.0, tie);
    let third = catalog.add_film("Three", 3.0, tie);

    let harness = Harness::new(catalog, 2);
    // Crash happened after the first page's checkpoint persisted.
    harness.seed_checkpoint("film_work", tie, 2).await;
    harness
        .seed_checkpoint("genre", "2025-01-01T00:00:00Z", 0)
        .await;
    harness
        .seed_checkpoint("person", "2025-01-01T00:00:00Z", 0)
        .await;
    harness.etl.run_cycle().await;

    // Only the film beyond the persisted offset is re-emitted.
    assert_eq!(doc_ids(&harness.sink.docs_for("movies")), [third.to_string()]);
}

#[tokio::test]
async fn quiescent_second_cycle_writes_nothing() {
    let mut catalog = FakeCatalog::default();
    let film = catalog.add_film("A", 7.5, "2024-01-01T00:00:00Z");
    let ann = catalog.add_person("Ann", "2024-01-01T00:00:00Z");
    catalog.credit(film, ann, "actor");

    let harness = Harness::new(catalog, 100);
    harness.etl.run_cycle().await;
    assert!(!harness.sink.docs_for("movies").is_empty());

    harness.sink.clear();
    harness.etl.run_cycle().await;
    assert!(harness.sink.index_sequence().is_empty());
}
