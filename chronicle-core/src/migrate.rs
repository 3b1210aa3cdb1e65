//! Version migration chain for persisted stores.
//!
//! Each step is a pure transform on the raw JSON document that upgrades it by
//! exactly one version. Loading folds the steps starting at the document's own
//! version, so no intermediate version is ever skipped. Versions outside the
//! chain are rejected instead of being forced forward.
//!
//! | Step  | Change |
//! |-------|--------|
//! | 1 → 2 | flat `characters` split into `knownCharacterAttitudes` and NPC dossiers |
//! | 2 → 3 | pages gain `categories` and `characters`; empty `embeddings` cache |
//! | 3 → 4 | `lastProcessedIndex` moves into `processing`; empty `recallLog` |

use crate::store::{name_key, Category, MemoryStore, Roster, CURRENT_VERSION};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors from loading a persisted document.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("store document is not a JSON object")]
    NotAnObject,

    #[error("store version tag is not a positive integer: {0}")]
    InvalidVersionTag(Value),

    #[error("unsupported store version {found} (this build reads 1..={CURRENT_VERSION})")]
    UnsupportedVersion { found: u64 },

    #[error("store document is malformed after migration: {0}")]
    Malformed(#[from] serde_json::Error),
}

type Step = fn(Map<String, Value>, &Roster) -> Map<String, Value>;

/// Ordered chain, keyed by the version each step upgrades from.
const CHAIN: [(u32, Step); 3] = [(1, split_characters), (2, backfill_page_fields), (3, nest_processing)];

/// A store loaded from disk, and the version it was stored at.
#[derive(Debug)]
pub struct Migrated {
    pub store: MemoryStore,
    pub from_version: u32,
}

impl Migrated {
    /// Whether any step ran (and the result should be persisted).
    pub fn changed(&self) -> bool {
        self.from_version != CURRENT_VERSION
    }
}

/// Read the version tag. A document without one predates tagging and is v1.
fn version_of(doc: &Map<String, Value>) -> Result<u32, MigrationError> {
    let found = match doc.get("version") {
        None | Some(Value::Null) => return Ok(1),
        Some(tag) => tag
            .as_u64()
            .ok_or_else(|| MigrationError::InvalidVersionTag(tag.clone()))?,
    };
    if found == 0 || found > u64::from(CURRENT_VERSION) {
        return Err(MigrationError::UnsupportedVersion { found });
    }
    Ok(found as u32)
}

/// Bring a raw document up to [`CURRENT_VERSION`] and decode it.
pub fn migrate(raw: Value, roster: &Roster) -> Result<Migrated, MigrationError> {
    let Value::Object(doc) = raw else {
        return Err(MigrationError::NotAnObject);
    };
    let from_version = version_of(&doc)?;

    let upgraded = CHAIN
        .iter()
        .filter(|(from, _)| *from >= from_version)
        .fold(doc, |doc, (from, step)| {
            let mut next = step(doc, roster);
            next.insert("version".to_string(), json!(from + 1));
            tracing::debug!(from = *from, to = from + 1, "migrated store document");
            next
        });

    let store: MemoryStore = serde_json::from_value(Value::Object(upgraded))?;
    Ok(Migrated { store, from_version })
}

fn take_array(doc: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match doc.remove(key) {
        Some(Value::Array(values)) => values,
        _ => Vec::new(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// 1 → 2: classify every character record against the roster.
fn split_characters(mut doc: Map<String, Value>, roster: &Roster) -> Map<String, Value> {
    let mut known: Vec<Value> = Vec::new();
    let mut npcs: Vec<Value> = Vec::new();

    for record in take_array(&mut doc, "characters") {
        let name = str_field(&record, "name").trim();
        if name.is_empty() || roster.is_protagonist(name) {
            continue;
        }
        if let Some(canonical) = roster.canonical_known(name) {
            known.push(json!({
                "name": canonical,
                "attitude": str_field(&record, "attitude"),
            }));
        } else {
            npcs.push(json!({
                "name": name,
                "appearance": str_field(&record, "appearance"),
                "personality": str_field(&record, "personality"),
                "attitude": str_field(&record, "attitude"),
            }));
        }
    }

    doc.insert("knownCharacterAttitudes".to_string(), Value::Array(known));
    doc.insert("characters".to_string(), Value::Array(npcs));
    doc
}

/// 2 → 3: pages get filtered categories and derived character lists.
fn backfill_page_fields(mut doc: Map<String, Value>, _roster: &Roster) -> Map<String, Value> {
    let npc_names: Vec<String> = doc
        .get("characters")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|c| str_field(c, "name").to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let pages = take_array(&mut doc, "pages")
        .into_iter()
        .map(|mut page| {
            if let Value::Object(fields) = &mut page {
                let categories: Vec<Value> = fields
                    .get("categories")
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .filter_map(Category::parse)
                            .map(|c| json!(c.label()))
                            .collect()
                    })
                    .unwrap_or_default();

                let keywords: Vec<String> = fields
                    .get("keywords")
                    .and_then(Value::as_array)
                    .map(|k| k.iter().filter_map(Value::as_str).map(name_key).collect())
                    .unwrap_or_default();
                let characters: Vec<Value> = npc_names
                    .iter()
                    .filter(|n| keywords.contains(&name_key(n)))
                    .map(|n| json!(n))
                    .collect();

                fields.insert("categories".to_string(), Value::Array(categories));
                fields.insert("characters".to_string(), Value::Array(characters));
            }
            page
        })
        .collect();

    doc.insert("pages".to_string(), Value::Array(pages));
    doc.entry("embeddings").or_insert_with(|| json!({}));
    doc
}

/// 3 → 4: extraction bookkeeping moves under `processing`.
fn nest_processing(mut doc: Map<String, Value>, _roster: &Roster) -> Map<String, Value> {
    let last = doc
        .remove("lastProcessedIndex")
        .and_then(|v| v.as_u64())
        .map(Value::from)
        .unwrap_or(Value::Null);

    doc.insert(
        "processing".to_string(),
        json!({ "lastExtractedIndex": last, "inProgress": false }),
    );
    doc.entry("recallLog").or_insert_with(|| json!({}));
    doc
}
