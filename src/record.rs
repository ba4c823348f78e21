//! Record module.
//!
//! Typed view over the JSON order collection that other parts of the
//! application keep in the shared store.

use crate::store::{LocalStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while reading a collection.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Malformed collection payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Collection payload is not a list")]
    NotAList,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// One item of a watched collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Owner the record belongs to.
    #[serde(rename = "userId")]
    pub owner_id: String,
    /// Creation instant.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Fields the watcher does not care about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn new(owner_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            created_at,
            extra: Map::new(),
        }
    }
}

/// Parsed contents of a collection key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    records: Vec<Record>,
}

impl Collection {
    /// Parses a serialized collection.
    ///
    /// An empty payload is an empty collection. Items that are not valid
    /// records are skipped, so they never match an owner.
    pub fn parse(raw: &str) -> Result<Self, CollectionError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let Value::Array(items) = serde_json::from_str::<Value>(raw)? else {
            return Err(CollectionError::NotAList);
        };

        let records = items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value::<Record>(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::debug!("Skipping invalid record at index {}: {}", index, e);
                    None
                }
            })
            .collect();

        Ok(Self { records })
    }

    /// Parses an optional payload, absence meaning an empty collection.
    pub fn parse_optional(raw: Option<&str>) -> Result<Self, CollectionError> {
        raw.map_or_else(|| Ok(Self::default()), Self::parse)
    }

    /// Records belonging to `owner_id`.
    pub fn owned_by<'a>(&'a self, owner_id: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter(move |r| r.owner_id == owner_id)
    }

    pub fn count_owned_by(&self, owner_id: &str) -> usize {
        self.owned_by(owner_id).count()
    }

    /// Records of `owner_id` created strictly after `instant`.
    pub fn created_after<'a>(
        &'a self,
        owner_id: &'a str,
        instant: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.owned_by(owner_id).filter(move |r| r.created_at > instant)
    }
}

/// Appends `record` to the collection under `key`, returning the new length.
///
/// Items already stored are written back untouched, whatever their shape.
/// A malformed collection is left alone.
pub fn append_record(
    store: &LocalStore,
    key: &str,
    record: &Record,
) -> Result<usize, CollectionError> {
    let mut items = match store.get_item(key)? {
        Some(raw) if !raw.trim().is_empty() => match serde_json::from_str::<Value>(&raw)? {
            Value::Array(items) => items,
            _ => return Err(CollectionError::NotAList),
        },
        _ => Vec::new(),
    };

    items.push(serde_json::to_value(record)?);
    store.set_item(key, &serde_json::to_string(&items)?)?;

    log::debug!("Appended record for {} to {:?}", record.owner_id, key);
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn parses_records_and_keeps_extra_fields() {
        let raw = r#"[
            {"id": 7, "userId": "alice", "createdAt": "2024-03-01T10:00:00.000Z", "total": 12.5}
        ]"#;
        let collection = Collection::parse(raw).unwrap();

        let record = &collection.records[0];
        assert_eq!(record.owner_id, "alice");
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(record.extra.get("id"), Some(&Value::from(7)));
        assert_eq!(record.extra.get("total"), Some(&Value::from(12.5)));
    }

    #[test]
    fn skips_invalid_items() {
        let raw = r#"[
            {"userId": "alice", "createdAt": "2024-03-01T10:00:00Z"},
            {"userId": "alice"},
            {"userId": "alice", "createdAt": "yesterday"},
            {"createdAt": "2024-03-01T10:00:00Z"},
            42
        ]"#;
        let collection = Collection::parse(raw).unwrap();
        assert_eq!(collection.records.len(), 1);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            Collection::parse("{not json"),
            Err(CollectionError::Malformed(_))
        ));
        assert!(matches!(
            Collection::parse(r#"{"userId": "alice"}"#),
            Err(CollectionError::NotAList)
        ));
    }

    #[test]
    fn empty_or_absent_payload_is_empty_collection() {
        assert_eq!(Collection::parse("").unwrap(), Collection::default());
        assert_eq!(Collection::parse_optional(None).unwrap(), Collection::default());
    }

    #[test]
    fn filters_by_owner_and_creation_time() {
        let collection = Collection {
            records: vec![
                Record::new("alice", at(0)),
                Record::new("alice", at(10)),
                Record::new("bob", at(20)),
            ],
        };

        assert_eq!(collection.count_owned_by("alice"), 2);
        assert_eq!(collection.count_owned_by("carol"), 0);
        assert_eq!(collection.created_after("alice", at(0)).count(), 1);
        assert_eq!(collection.created_after("alice", at(10)).count(), 0);
        assert_eq!(collection.created_after("bob", at(0)).count(), 1);
    }

    #[test]
    fn append_preserves_existing_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.set_item("orders", r#"[{"legacy": true}]"#).unwrap();

        let len = append_record(&store, "orders", &Record::new("alice", at(5))).unwrap();
        assert_eq!(len, 2);

        let raw = store.get_item("orders").unwrap().unwrap();
        let items: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(items[0], serde_json::json!({"legacy": true}));

        let collection = Collection::parse(&raw).unwrap();
        assert_eq!(collection.records, vec![Record::new("alice", at(5))]);
    }

    #[test]
    fn append_refuses_malformed_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.set_item("orders", "oops").unwrap();

        assert!(append_record(&store, "orders", &Record::new("alice", at(0))).is_err());
        assert_eq!(store.get_item("orders").unwrap().as_deref(), Some("oops"));
    }
}
