//! Folds from join cross-product row sets into search documents.
//!
//! All three folds are pure: they group rows by entity id and collapse the
//! join repetition into one document per entity. A film row may repeat the
//! same person once per genre (and vice versa), so every list append is
//! guarded by a membership check.
//!
//! Credit lists dedupe by `full_name`, not person id: two distinct persons
//! sharing a name collapse to a single entry. Index consumers depend on the
//! name-keyed behavior, so it is preserved as-is.

use std::collections::{BTreeMap, BTreeSet};

use tracing::error;
use uuid::Uuid;

use crate::models::{
    FilmDocument, FilmRow, GenreDocument, GenreRef, GenreRow, PersonDocument, PersonRef,
    PersonRow, Role,
};

/// Collapse film cross-product rows into one document per film.
pub fn fold_films(rows: &[FilmRow]) -> BTreeMap<Uuid, FilmDocument> {
    let mut result = BTreeMap::new();
    for row in rows {
        let doc = result.entry(row.fw_id).or_insert_with(|| FilmDocument {
            id: row.fw_id,
            title: row.title.clone(),
            description: row.description.clone(),
            imdb_rating: row.rating,
            actors: Vec::new(),
            actors_names: Vec::new(),
            writers: Vec::new(),
            writers_names: Vec::new(),
            directors: Vec::new(),
            directors_names: Vec::new(),
            genres: Vec::new(),
            genres_names: Vec::new(),
        });

        if let (Some(genre_id), Some(genre_name)) = (row.genre_id, row.genre_name.as_deref()) {
            if !doc.genres_names.iter().any(|name| name == genre_name) {
                doc.genres_names.push(genre_name.to_string());
                doc.genres.push(GenreRef {
                    id: genre_id,
                    name: genre_name.to_string(),
                });
            }
        }

        if let Some(raw_role) = row.role.as_deref() {
            match (Role::from_source(raw_role), row.person_id, row.full_name.as_deref()) {
                (Some(role), Some(person_id), Some(name)) => {
                    add_credit(doc, role, person_id, name);
                }
                // Roles outside the document contract are skipped without noise.
                (None, _, _) => {}
                _ => {
                    error!(
                        "film {} row with role '{raw_role}' is missing person fields; row dropped",
                        row.fw_id
                    );
                }
            }
        }
    }
    result
}

fn add_credit(doc: &mut FilmDocument, role: Role, person_id: Uuid, name: &str) {
    let (refs, names) = match role {
        Role::Actor => (&mut doc.actors, &mut doc.actors_names),
        Role::Writer => (&mut doc.writers, &mut doc.writers_names),
        Role::Director => (&mut doc.directors, &mut doc.directors_names),
    };
    if !names.iter().any(|existing| existing == name) {
        names.push(name.to_string());
        refs.push(PersonRef {
            id: person_id,
            name: name.to_string(),
        });
    }
}

/// Collapse person×film×role rows into one document per person.
///
/// Rows without link columns (persons with no film credits survive the left
/// join with nulls) fail validation and are dropped; such a person carries
/// nothing worth indexing.
pub fn fold_persons(rows: &[PersonRow]) -> BTreeMap<Uuid, PersonDocument> {
    let mut result = BTreeMap::new();
    for row in rows {
        let (role, film_id) = match (row.role.as_deref(), row.film_work_id) {
            (Some(role), Some(film_id)) => (role, film_id),
            _ => {
                error!(
                    "person {} ('{}') has no film credits; row dropped",
                    row.id, row.full_name
                );
                continue;
            }
        };
        let doc = result.entry(row.id).or_insert_with(|| PersonDocument {
            id: row.id,
            name: row.full_name.clone(),
            role: BTreeSet::new(),
            film_ids: BTreeSet::new(),
        });
        doc.role.insert(role.to_string());
        doc.film_ids.insert(film_id);
    }
    result
}

/// Collapse genre×film rows into one document per genre.
pub fn fold_genres(rows: &[GenreRow]) -> BTreeMap<Uuid, GenreDocument> {
    let mut result = BTreeMap::new();
    for row in rows {
        let doc = result.entry(row.id).or_insert_with(|| GenreDocument {
            id: row.id,
            name: row.name.clone(),
            description: row.description.clone(),
            film_ids: BTreeSet::new(),
        });
        doc.film_ids.insert(row.film_work_id);
    }
    result
}
