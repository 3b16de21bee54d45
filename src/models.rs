//! Core data models used throughout the pipeline.
//!
//! Raw row types mirror the shapes returned by the catalog queries in
//! [`crate::source`]; document types are the denormalized bodies written to
//! the search backend. The film query is a left-join cross-product (one row
//! per film × person-role × genre combination), so the person and genre
//! columns of [`FilmRow`] are nullable.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One element of a modified-id page: `SELECT id, modified FROM content.<table>`.
#[derive(Debug, Clone, FromRow)]
pub struct ModifiedRow {
    pub id: Uuid,
    pub modified: DateTime<Utc>,
}

/// Raw film row from the join-expanded film query.
#[derive(Debug, Clone, FromRow)]
pub struct FilmRow {
    pub fw_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub rating: Option<f64>,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub role: Option<String>,
    pub person_id: Option<Uuid>,
    pub full_name: Option<String>,
    pub genre_name: Option<String>,
    pub genre_id: Option<Uuid>,
}

/// Raw person row: one per person × film × role. The link columns come from
/// a left join and are null for persons with no film credits.
#[derive(Debug, Clone, FromRow)]
pub struct PersonRow {
    pub id: Uuid,
    pub full_name: String,
    pub role: Option<String>,
    pub film_work_id: Option<Uuid>,
}

/// Raw genre row: one per genre × film (inner join, links always present).
#[derive(Debug, Clone, FromRow)]
pub struct GenreRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub film_work_id: Uuid,
}

/// Person credit roles recognized by the film document.
///
/// The source stores the value `producer` for what the `movies` index calls
/// `writers`; that mapping is a wire contract with index consumers and must
/// not be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Actor,
    Writer,
    Director,
}

impl Role {
    /// Classify a raw `person_film_work.role` value. Unknown roles map to
    /// `None` and are skipped by the transformer.
    pub fn from_source(raw: &str) -> Option<Role> {
        match raw {
            "actor" => Some(Role::Actor),
            "producer" => Some(Role::Writer),
            "director" => Some(Role::Director),
            _ => None,
        }
    }
}

/// `{id, name}` entry in a film document's person lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// `{id, name}` entry in a film document's genre list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreRef {
    pub id: Uuid,
    pub name: String,
}

/// Denormalized film body for the `movies` index, keyed by film id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmDocument {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub imdb_rating: Option<f64>,
    pub actors: Vec<PersonRef>,
    pub actors_names: Vec<String>,
    pub writers: Vec<PersonRef>,
    pub writers_names: Vec<String>,
    pub directors: Vec<PersonRef>,
    pub directors_names: Vec<String>,
    pub genres: Vec<GenreRef>,
    pub genres_names: Vec<String>,
}

/// Denormalized person body for the `persons` index, keyed by person id.
///
/// Both collections are sets: a person holding the same role in several
/// films, or several roles in one film, collapses to unique entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDocument {
    pub id: Uuid,
    pub name: String,
    pub role: BTreeSet<String>,
    pub film_ids: BTreeSet<Uuid>,
}

/// Denormalized genre body, keyed by genre id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreDocument {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub film_ids: BTreeSet<Uuid>,
}

/// A body that can be addressed by `(_index, _id)` in a bulk upsert.
pub trait SearchDocument: Serialize {
    fn doc_id(&self) -> String;
}

impl SearchDocument for FilmDocument {
    fn doc_id(&self) -> String {
        self.id.to_string()
    }
}

impl SearchDocument for PersonDocument {
    fn doc_id(&self) -> String {
        self.id.to_string()
    }
}

impl SearchDocument for GenreDocument {
    fn doc_id(&self) -> String {
        self.id.to_string()
    }
}
