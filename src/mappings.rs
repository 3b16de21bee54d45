//! Bundled index bodies for the search backend.
//!
//! Both indices use one analyzer stack (`ru_en`: standard tokenizer,
//! lowercase, english/russian stop words and stemmers) over every text
//! field, and strict dynamic mappings so a drifting document shape fails
//! loudly instead of polluting the index.

use serde_json::{json, Value};

fn index_settings() -> Value {
    json!({
        "index": {
            "refresh_interval": "1s",
            "number_of_shards": "1",
            "number_of_replicas": "1",
            "analysis": {
                "filter": {
                    "russian_stemmer": {"type": "stemmer", "language": "russian"},
                    "english_stemmer": {"type": "stemmer", "language": "english"},
                    "english_possessive_stemmer": {"type": "stemmer", "language": "possessive_english"},
                    "russian_stop": {"type": "stop", "stopwords": "_russian_"},
                    "english_stop": {"type": "stop", "stopwords": "_english_"}
                },
                "analyzer": {
                    "ru_en": {
                        "tokenizer": "standard",
                        "filter": [
                            "lowercase",
                            "english_stop",
                            "english_stemmer",
                            "english_possessive_stemmer",
                            "russian_stop",
                            "russian_stemmer"
                        ]
                    }
                }
            }
        }
    })
}

fn ru_en_text() -> Value {
    json!({"type": "text", "analyzer": "ru_en"})
}

fn nested_refs() -> Value {
    json!({
        "type": "nested",
        "dynamic": "strict",
        "properties": {
            "id": {"type": "keyword"},
            "name": ru_en_text()
        }
    })
}

/// Body for `PUT /movies`.
pub fn movies_index_body() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": {"type": "keyword"},
                "title": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": {"raw": {"type": "keyword"}}
                },
                "description": ru_en_text(),
                "imdb_rating": {"type": "float"},
                "actors": nested_refs(),
                "actors_names": ru_en_text(),
                "writers": nested_refs(),
                "writers_names": ru_en_text(),
                "directors": nested_refs(),
                "directors_names": ru_en_text(),
                "genres": nested_refs(),
                "genres_names": ru_en_text()
            }
        }
    })
}

/// Body for `PUT /persons`.
pub fn persons_index_body() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": {"type": "keyword"},
                "name": ru_en_text(),
                "role": {"type": "keyword"},
                "film_ids": {"type": "keyword"}
            }
        }
    })
}
