//! The per-conversation memory store.

use super::character::{name_key, Item, KnownCharacterAttitude, NpcDossier, Roster};
use super::page::{CompressionLevel, Page, PageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version tag written by this build. See `migrate` for the chain.
pub const CURRENT_VERSION: u32 = 4;

/// Extraction bookkeeping, persisted with the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    /// Highest message index already folded into the store.
    #[serde(default)]
    pub last_extracted_index: Option<usize>,
    /// Non-reentrancy guard for extraction.
    #[serde(default)]
    pub in_progress: bool,
}

/// One conversation's memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStore {
    version: u32,
    #[serde(default)]
    timeline: String,
    #[serde(default)]
    known_character_attitudes: Vec<KnownCharacterAttitude>,
    #[serde(default)]
    characters: Vec<NpcDossier>,
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    pages: Vec<Page>,
    #[serde(default)]
    embeddings: BTreeMap<PageId, Vec<f32>>,
    #[serde(default)]
    processing: ProcessingState,
    #[serde(default)]
    recall_log: BTreeMap<u64, Vec<PageId>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store at the current version.
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION,
            timeline: String::new(),
            known_character_attitudes: Vec::new(),
            characters: Vec::new(),
            items: Vec::new(),
            pages: Vec::new(),
            embeddings: BTreeMap::new(),
            processing: ProcessingState::default(),
            recall_log: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    // =========================================================================
    // Timeline
    // =========================================================================

    pub fn timeline(&self) -> &str {
        &self.timeline
    }

    pub fn set_timeline(&mut self, timeline: impl Into<String>) {
        self.timeline = timeline.into().trim().to_string();
    }

    /// Non-blank timeline lines.
    pub fn timeline_lines(&self) -> Vec<&str> {
        self.timeline
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    // =========================================================================
    // Characters and items
    // =========================================================================

    pub fn known_attitudes(&self) -> &[KnownCharacterAttitude] {
        &self.known_character_attitudes
    }

    pub fn characters(&self) -> &[NpcDossier] {
        &self.characters
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Find a dossier by name (case-insensitive).
    pub fn find_character(&self, name: &str) -> Option<&NpcDossier> {
        let key = name_key(name);
        self.characters.iter().find(|c| name_key(&c.name) == key)
    }

    /// Upsert attitude records. Names outside the known set are dropped.
    /// Returns how many records were applied.
    pub fn merge_known_attitudes(
        &mut self,
        records: impl IntoIterator<Item = KnownCharacterAttitude>,
        roster: &Roster,
    ) -> usize {
        let mut applied = 0;
        for record in records {
            let Some(canonical) = roster.canonical_known(&record.name) else {
                tracing::debug!(name = %record.name, "dropping attitude for unknown character");
                continue;
            };
            let attitude = record.attitude.trim().to_string();
            if attitude.is_empty() {
                continue;
            }
            match self
                .known_character_attitudes
                .iter_mut()
                .find(|k| name_key(&k.name) == name_key(canonical))
            {
                Some(existing) => existing.attitude = attitude,
                None => self.known_character_attitudes.push(KnownCharacterAttitude {
                    name: canonical.to_string(),
                    attitude,
                }),
            }
            applied += 1;
        }
        applied
    }

    /// Replace the NPC list wholesale. Known names, the protagonist and
    /// duplicate names are dropped.
    pub fn replace_characters(&mut self, dossiers: Vec<NpcDossier>, roster: &Roster) {
        let mut kept: Vec<NpcDossier> = Vec::with_capacity(dossiers.len());
        for mut dossier in dossiers {
            dossier.name = dossier.name.trim().to_string();
            if !roster.is_npc(&dossier.name) {
                tracing::debug!(name = %dossier.name, "dropping dossier outside the NPC set");
                continue;
            }
            if kept.iter().any(|k| name_key(&k.name) == name_key(&dossier.name)) {
                continue;
            }
            kept.push(dossier);
        }
        self.characters = kept;
    }

    /// Replace the item list wholesale. Nameless items are dropped.
    pub fn replace_items(&mut self, items: Vec<Item>) {
        self.items = items
            .into_iter()
            .filter(|i| !i.name.trim().is_empty())
            .collect();
    }

    /// NPC names (canonical spelling) that appear among `keywords`.
    pub fn characters_in(&self, keywords: &[String]) -> Vec<String> {
        self.characters
            .iter()
            .filter(|c| keywords.iter().any(|k| name_key(k) == name_key(&c.name)))
            .map(|c| c.name.clone())
            .collect()
    }

    // =========================================================================
    // Pages
    // =========================================================================

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, id: &PageId) -> Option<&Page> {
        self.pages.iter().find(|p| &p.id == id)
    }

    /// Pages that take part in retrieval (FRESH or SUMMARY).
    pub fn retrievable_pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().filter(|p| p.is_retrievable())
    }

    pub fn add_page(&mut self, page: Page) -> PageId {
        let id = page.id.clone();
        self.pages.push(page);
        id
    }

    pub fn count_at(&self, level: CompressionLevel) -> usize {
        self.pages
            .iter()
            .filter(|p| p.compression_level == level)
            .count()
    }

    /// Ids of pages at `level`, oldest first. Ties keep insertion order.
    pub fn oldest_at(&self, level: CompressionLevel) -> Vec<PageId> {
        let mut pages: Vec<&Page> = self
            .pages
            .iter()
            .filter(|p| p.compression_level == level)
            .collect();
        pages.sort_by_key(|p| p.created_at);
        pages.into_iter().map(|p| p.id.clone()).collect()
    }

    /// Overwrite a FRESH page with its summary and advance it to SUMMARY.
    ///
    /// The cached vector describes the old text, so it is dropped here and
    /// must be recomputed by the embedding index.
    pub fn summarize_page(&mut self, id: &PageId, summary: String, at: DateTime<Utc>) -> bool {
        let Some(page) = self.pages.iter_mut().find(|p| &p.id == id) else {
            return false;
        };
        if page.compression_level != CompressionLevel::Fresh {
            return false;
        }
        page.content = summary;
        page.advance_to(CompressionLevel::Summary, at);
        self.embeddings.remove(id);
        true
    }

    /// Archive a page: remove it together with its vector and every recall
    /// log reference. Returns the removed page marked ARCHIVED.
    pub fn archive_page(&mut self, id: &PageId, at: DateTime<Utc>) -> Option<Page> {
        let position = self.pages.iter().position(|p| &p.id == id)?;
        let mut page = self.pages.remove(position);
        page.advance_to(CompressionLevel::Archived, at);

        self.embeddings.remove(id);
        for ids in self.recall_log.values_mut() {
            ids.retain(|r| r != id);
        }
        Some(page)
    }

    // =========================================================================
    // Embedding cache
    // =========================================================================

    pub fn embeddings(&self) -> &BTreeMap<PageId, Vec<f32>> {
        &self.embeddings
    }

    /// Cache a vector. Refused for pages that are missing or not retrievable.
    pub fn set_embedding(&mut self, id: &PageId, vector: Vec<f32>) -> bool {
        if !self.page(id).is_some_and(Page::is_retrievable) {
            return false;
        }
        self.embeddings.insert(id.clone(), vector);
        true
    }

    /// Drop vectors whose page is gone. Returns how many were removed.
    pub fn prune_embeddings(&mut self) -> usize {
        let before = self.embeddings.len();
        let live: Vec<PageId> = self.retrievable_pages().map(|p| p.id.clone()).collect();
        self.embeddings.retain(|id, _| live.contains(id));
        before - self.embeddings.len()
    }

    /// Retrievable pages that have no cached vector yet.
    pub fn pages_missing_embeddings(&self) -> Vec<&Page> {
        self.retrievable_pages()
            .filter(|p| !self.embeddings.contains_key(&p.id))
            .collect()
    }

    pub fn clear_embeddings(&mut self) {
        self.embeddings.clear();
    }

    // =========================================================================
    // Processing state
    // =========================================================================

    pub fn processing(&self) -> &ProcessingState {
        &self.processing
    }

    /// Set the extraction guard. Returns false if it was already set.
    pub fn begin_processing(&mut self) -> bool {
        if self.processing.in_progress {
            return false;
        }
        self.processing.in_progress = true;
        true
    }

    /// Clear the extraction guard, recording progress if any was made.
    pub fn finish_processing(&mut self, last_extracted: Option<usize>) {
        self.processing.in_progress = false;
        if let Some(index) = last_extracted {
            let current = self.processing.last_extracted_index;
            self.processing.last_extracted_index = Some(current.map_or(index, |c| c.max(index)));
        }
    }

    // =========================================================================
    // Recall log
    // =========================================================================

    pub fn recall_log(&self) -> &BTreeMap<u64, Vec<PageId>> {
        &self.recall_log
    }

    /// The most recent recorded turn.
    pub fn last_recall(&self) -> Option<(u64, &[PageId])> {
        self.recall_log
            .last_key_value()
            .map(|(turn, ids)| (*turn, ids.as_slice()))
    }

    /// Record which pages were injected for a turn, keeping the newest `limit` turns.
    ///
    /// Ids of pages no longer in the store are dropped; the selection may have
    /// been made against an older snapshot.
    pub fn record_recall(&mut self, turn: u64, mut pages: Vec<PageId>, limit: usize) {
        pages.retain(|id| self.page(id).is_some());
        self.recall_log.insert(turn, pages);
        while self.recall_log.len() > limit.max(1) {
            self.recall_log.pop_first();
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn character_count(&self) -> usize {
        self.characters.len()
    }

    /// Every page id referenced by the recall log that no longer exists.
    pub fn dangling_recall_ids(&self) -> Vec<&PageId> {
        self.recall_log
            .values()
            .flatten()
            .filter(|id| self.page(id).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn page_at(title: &str, minutes: i64) -> Page {
        Page::new("Day 1", title, format!("{title} happened and it mattered."))
            .with_created_at(Utc::now() + Duration::minutes(minutes))
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryStore::new();
        assert_eq!(store.version(), CURRENT_VERSION);
        assert_eq!(store.page_count(), 0);
        assert!(store.timeline_lines().is_empty());
        assert!(store.last_recall().is_none());
    }

    #[test]
    fn test_archive_prunes_embeddings_and_recall_log() {
        let mut store = MemoryStore::new();
        let a = store.add_page(page_at("A", 0));
        let b = store.add_page(page_at("B", 1));
        assert!(store.set_embedding(&a, vec![1.0, 0.0]));
        assert!(store.set_embedding(&b, vec![0.0, 1.0]));
        store.record_recall(1, vec![a.clone(), b.clone()], 10);
        store.record_recall(2, vec![a.clone()], 10);

        let archived = store.archive_page(&a, Utc::now()).unwrap();

        assert_eq!(archived.compression_level, CompressionLevel::Archived);
        assert!(store.page(&a).is_none());
        assert!(!store.embeddings().contains_key(&a));
        assert!(store.embeddings().contains_key(&b));
        assert_eq!(store.recall_log()[&1], vec![b]);
        assert!(store.recall_log()[&2].is_empty());
        assert!(store.dangling_recall_ids().is_empty());
    }

    #[test]
    fn test_summarize_only_touches_fresh_pages() {
        let mut store = MemoryStore::new();
        let id = store.add_page(page_at("A", 0));
        store.set_embedding(&id, vec![1.0]);

        assert!(store.summarize_page(&id, "short".into(), Utc::now()));
        assert!(!store.summarize_page(&id, "shorter".into(), Utc::now()));

        let page = store.page(&id).unwrap();
        assert_eq!(page.content, "short");
        assert_eq!(page.compression_level, CompressionLevel::Summary);
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_oldest_at_sorts_by_creation_time() {
        let mut store = MemoryStore::new();
        let late = store.add_page(page_at("late", 10));
        let early = store.add_page(page_at("early", -10));
        let middle = store.add_page(page_at("middle", 0));

        assert_eq!(
            store.oldest_at(CompressionLevel::Fresh),
            vec![early, middle, late]
        );
    }

    #[test]
    fn test_set_embedding_refuses_unknown_pages() {
        let mut store = MemoryStore::new();
        assert!(!store.set_embedding(&PageId::from_raw("pg-missing"), vec![1.0]));
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_known_attitudes_drop_unknown_names() {
        let roster = Roster::new("Aria", ["Kael".to_string()]);
        let mut store = MemoryStore::new();
        let applied = store.merge_known_attitudes(
            vec![
                KnownCharacterAttitude { name: "kael".into(), attitude: "protective".into() },
                KnownCharacterAttitude { name: "Stranger".into(), attitude: "curious".into() },
                KnownCharacterAttitude { name: "Aria".into(), attitude: "self".into() },
            ],
            &roster,
        );
        assert_eq!(applied, 1);
        assert_eq!(store.known_attitudes().len(), 1);
        assert_eq!(store.known_attitudes()[0].name, "Kael");

        store.merge_known_attitudes(
            vec![KnownCharacterAttitude { name: "KAEL".into(), attitude: "distant".into() }],
            &roster,
        );
        assert_eq!(store.known_attitudes().len(), 1);
        assert_eq!(store.known_attitudes()[0].attitude, "distant");
    }

    #[test]
    fn test_replace_characters_keeps_lists_disjoint() {
        let roster = Roster::new("Aria", ["Kael".to_string()]);
        let mut store = MemoryStore::new();
        store.replace_characters(
            vec![
                NpcDossier::new("Brannoc"),
                NpcDossier::new("Kael"),
                NpcDossier::new("aria"),
                NpcDossier::new("brannoc "),
            ],
            &roster,
        );
        let names: Vec<_> = store.characters().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Brannoc"]);
    }

    #[test]
    fn test_recall_log_is_bounded() {
        let mut store = MemoryStore::new();
        for turn in 0..5 {
            store.record_recall(turn, Vec::new(), 3);
        }
        let turns: Vec<_> = store.recall_log().keys().copied().collect();
        assert_eq!(turns, vec![2, 3, 4]);
        assert_eq!(store.last_recall().map(|(t, _)| t), Some(4));
    }

    #[test]
    fn test_recall_log_drops_pages_archived_since_selection() {
        let mut store = MemoryStore::new();
        let a = store.add_page(page_at("A", 0));
        let b = store.add_page(page_at("B", 1));
        store.archive_page(&a, Utc::now()).unwrap();

        store.record_recall(1, vec![a, b.clone()], 10);

        assert_eq!(store.recall_log()[&1], vec![b]);
        assert!(store.dangling_recall_ids().is_empty());
    }

    #[test]
    fn test_processing_guard() {
        let mut store = MemoryStore::new();
        assert!(store.begin_processing());
        assert!(!store.begin_processing());
        store.finish_processing(Some(7));
        assert!(!store.processing().in_progress);
        store.finish_processing(Some(3));
        assert_eq!(store.processing().last_extracted_index, Some(7));
    }

    #[test]
    fn test_store_roundtrips_through_json() {
        let mut store = MemoryStore::new();
        let id = store.add_page(page_at("A", 0));
        store.set_embedding(&id, vec![0.5, 0.5]);
        store.record_recall(12, vec![id.clone()], 10);

        let json = serde_json::to_value(&store).unwrap();
        assert!(json["recallLog"]["12"].is_array());
        assert!(json["knownCharacterAttitudes"].is_array());
        assert_eq!(json["processing"]["inProgress"], false);

        let back: MemoryStore = serde_json::from_value(json).unwrap();
        assert_eq!(back, store);
    }
}
