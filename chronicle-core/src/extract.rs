//! Extraction engine: new conversation in, store mutations out.
//!
//! One generation call per batch. The reply goes through the tolerant parser
//! into a typed [`ParsedExtraction`], then a pure merge applies it. A batch
//! either merges completely or not at all; within a merge, invalid records
//! are dropped one at a time.

use crate::config::ChronicleConfig;
use crate::gateway::{GatewayError, TextGateway};
use crate::parser::{self, ParseFailure};
use crate::persist::Checkpoint;
use crate::prompts;
use crate::store::{
    Category, Item, KnownCharacterAttitude, MemoryStore, NpcDossier, Page, PageId, Significance,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that abort an extraction batch.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("generation failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("unusable extraction reply: {0}")]
    Parse(#[from] ParseFailure),
}

/// One message of the conversation being remembered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Position in the full conversation.
    pub index: usize,
    pub speaker: String,
    pub text: String,
}

impl ConversationMessage {
    pub fn new(index: usize, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            index,
            speaker: speaker.into(),
            text: text.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("[{}] {}: {}", self.index, self.speaker, self.text)
    }
}

/// A page as proposed by the model, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageDraft {
    pub day: String,
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub categories: Vec<Category>,
    pub significance: Significance,
    pub sources: Vec<usize>,
}

/// The typed shape of an extraction reply.
///
/// `characters` and `items` are `None` when the reply omits the key, which
/// leaves the stored list alone. A present list, even an empty one, replaces it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedExtraction {
    pub timeline: Option<String>,
    pub known_attitudes: Vec<KnownCharacterAttitude>,
    pub characters: Option<Vec<NpcDossier>>,
    pub items: Option<Vec<Item>>,
    pub pages: Vec<PageDraft>,
}

fn text_of(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// A list of strings, tolerating a single string or a comma-separated one.
fn strings_of(value: &Value, key: &str) -> Vec<String> {
    let raw: Vec<String> = match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn records<'a>(map: &'a Map<String, Value>, key: &str) -> Option<Vec<&'a Value>> {
    match map.get(key) {
        Some(Value::Array(items)) => Some(items.iter().filter(|v| v.is_object()).collect()),
        _ => None,
    }
}

impl ParsedExtraction {
    /// Lift a parsed JSON object into typed records, dropping malformed ones.
    pub fn from_object(map: &Map<String, Value>) -> Self {
        let timeline = match map.get("timeline") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(lines)) => Some(
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
        .filter(|t| !t.trim().is_empty());

        let known_attitudes = records(map, "knownCharacterAttitudes")
            .unwrap_or_default()
            .into_iter()
            .map(|r| KnownCharacterAttitude {
                name: text_of(r, "name"),
                attitude: text_of(r, "attitude"),
            })
            .filter(|k| !k.name.is_empty())
            .collect();

        let characters = records(map, "characters").map(|list| {
            list.into_iter()
                .map(|r| {
                    NpcDossier::new(text_of(r, "name"))
                        .with_appearance(text_of(r, "appearance"))
                        .with_personality(text_of(r, "personality"))
                        .with_attitude(text_of(r, "attitude"))
                })
                .filter(|c| !c.name.is_empty())
                .collect()
        });

        let items = records(map, "items").map(|list| {
            list.into_iter()
                .map(|r| Item {
                    name: text_of(r, "name"),
                    status: text_of(r, "status"),
                    significance: text_of(r, "significance"),
                })
                .filter(|i| !i.name.is_empty())
                .collect()
        });

        let pages = records(map, "pages")
            .unwrap_or_default()
            .into_iter()
            .map(|r| PageDraft {
                day: text_of(r, "day"),
                title: text_of(r, "title"),
                content: text_of(r, "content"),
                keywords: strings_of(r, "keywords"),
                categories: strings_of(r, "categories")
                    .iter()
                    .filter_map(|tag| {
                        let parsed = Category::parse(tag);
                        if parsed.is_none() {
                            tracing::debug!(tag = %tag, "dropping unknown category");
                        }
                        parsed
                    })
                    .collect(),
                significance: Significance::parse(&text_of(r, "significance")),
                sources: r
                    .get("sourceMessageIndices")
                    .and_then(Value::as_array)
                    .map(|ix| {
                        ix.iter()
                            .filter_map(Value::as_u64)
                            .map(|i| i as usize)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();

        Self {
            timeline,
            known_attitudes,
            characters,
            items,
            pages,
        }
    }

    /// Parse a raw reply. Fails only when no JSON object can be recovered.
    pub fn parse(raw: &str) -> Result<Self, ParseFailure> {
        parser::parse_object(raw).map(|map| Self::from_object(&map))
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractReport {
    pub pages_added: Vec<PageId>,
    pub pages_rejected: usize,
    pub attitudes_updated: usize,
    pub timeline_updated: bool,
    pub characters_replaced: bool,
    pub items_replaced: bool,
    /// Highest message index covered by the batch.
    pub last_index: Option<usize>,
}

/// Why an extraction call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another extraction holds the guard.
    InProgress,
    /// The batch was empty.
    NothingNew,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    Skipped(SkipReason),
    Applied(ExtractReport),
}

/// Batch content: either conversation messages or static reference text.
#[derive(Debug, Clone, Copy)]
enum Batch<'a> {
    Messages(&'a [ConversationMessage]),
    Reference(&'a str),
}

impl Batch<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Batch::Messages(m) => m.is_empty(),
            Batch::Reference(text) => text.trim().is_empty(),
        }
    }

    fn indices(&self) -> Vec<usize> {
        match self {
            Batch::Messages(m) => m.iter().map(|m| m.index).collect(),
            Batch::Reference(_) => Vec::new(),
        }
    }
}

/// Apply a parsed extraction. Pure with respect to the gateway.
pub fn merge(
    store: &mut MemoryStore,
    parsed: ParsedExtraction,
    config: &ChronicleConfig,
    batch_indices: &[usize],
) -> ExtractReport {
    let roster = config.roster();
    let mut report = ExtractReport {
        last_index: batch_indices.iter().copied().max(),
        ..ExtractReport::default()
    };

    report.attitudes_updated = store.merge_known_attitudes(parsed.known_attitudes, &roster);

    if let Some(characters) = parsed.characters {
        store.replace_characters(characters, &roster);
        report.characters_replaced = true;
    }
    if let Some(items) = parsed.items {
        store.replace_items(items);
        report.items_replaced = true;
    }
    if let Some(timeline) = parsed.timeline {
        store.set_timeline(timeline);
        report.timeline_updated = true;
    }

    for draft in parsed.pages {
        if draft.title.is_empty()
            || draft.content.chars().count() < config.min_page_content_chars
            || draft.keywords.is_empty()
        {
            tracing::debug!(title = %draft.title, "dropping invalid page");
            report.pages_rejected += 1;
            continue;
        }

        let mut sources: Vec<usize> = draft
            .sources
            .into_iter()
            .filter(|i| batch_indices.contains(i))
            .collect();
        if sources.is_empty() {
            sources = batch_indices.to_vec();
        }
        sources.sort_unstable();
        sources.dedup();

        let characters = store.characters_in(&draft.keywords);
        let day = if draft.day.is_empty() {
            "Undated".to_string()
        } else {
            draft.day
        };
        let page = Page::new(day, draft.title, draft.content)
            .with_keywords(draft.keywords)
            .with_characters(characters)
            .with_categories(draft.categories)
            .with_significance(draft.significance)
            .with_sources(sources);
        report.pages_added.push(store.add_page(page));
    }

    report
}

/// Runs extraction batches against a text gateway.
pub struct Extractor<'a> {
    gateway: &'a dyn TextGateway,
    config: &'a ChronicleConfig,
}

impl<'a> Extractor<'a> {
    pub fn new(gateway: &'a dyn TextGateway, config: &'a ChronicleConfig) -> Self {
        Self { gateway, config }
    }

    /// Fold new messages into the store.
    ///
    /// Skipped when the persisted guard is already set. The guard is always
    /// cleared afterwards, whether the batch merged or failed.
    pub async fn extract(
        &self,
        store: &mut MemoryStore,
        messages: &[ConversationMessage],
        checkpoint: &dyn Checkpoint,
    ) -> Result<ExtractOutcome, ExtractError> {
        self.run(store, Batch::Messages(messages), checkpoint).await
    }

    /// Fold static reference material into the store.
    pub async fn extract_reference(
        &self,
        store: &mut MemoryStore,
        reference: &str,
        checkpoint: &dyn Checkpoint,
    ) -> Result<ExtractOutcome, ExtractError> {
        self.run(store, Batch::Reference(reference), checkpoint).await
    }

    async fn run(
        &self,
        store: &mut MemoryStore,
        batch: Batch<'_>,
        checkpoint: &dyn Checkpoint,
    ) -> Result<ExtractOutcome, ExtractError> {
        if batch.is_empty() {
            return Ok(ExtractOutcome::Skipped(SkipReason::NothingNew));
        }
        if !store.begin_processing() {
            tracing::debug!("extraction already in progress, skipping");
            return Ok(ExtractOutcome::Skipped(SkipReason::InProgress));
        }
        checkpoint.checkpoint(store).await;

        let result = self.generate(store, batch).await;
        let outcome = match result {
            Ok(parsed) => {
                let indices = batch.indices();
                let report = merge(store, parsed, self.config, &indices);
                store.finish_processing(report.last_index);
                tracing::info!(
                    pages = report.pages_added.len(),
                    rejected = report.pages_rejected,
                    attitudes = report.attitudes_updated,
                    "extraction merged"
                );
                Ok(ExtractOutcome::Applied(report))
            }
            Err(e) => {
                store.finish_processing(None);
                tracing::warn!(error = %e, "extraction failed");
                Err(e)
            }
        };
        checkpoint.checkpoint(store).await;
        outcome
    }

    async fn generate(
        &self,
        store: &MemoryStore,
        batch: Batch<'_>,
    ) -> Result<ParsedExtraction, ExtractError> {
        let prompt = match batch {
            Batch::Messages(messages) => prompts::extraction_prompt(
                store,
                self.config,
                &prompts::render_messages(messages),
                false,
            ),
            Batch::Reference(text) => prompts::extraction_prompt(store, self.config, text, true),
        };
        let raw = self
            .gateway
            .generate(
                prompts::EXTRACTION_SYSTEM,
                &prompt,
                self.config.extraction_max_tokens,
            )
            .await?;
        Ok(ParsedExtraction::parse(&raw)?)
    }

    /// Run the merge over history in fixed-size chunks, reference material first.
    ///
    /// Stops at the first failed chunk; chunks before it stay merged.
    pub async fn backfill(
        &self,
        store: &mut MemoryStore,
        reference: Option<&str>,
        history: &[ConversationMessage],
        checkpoint: &dyn Checkpoint,
    ) -> Result<BackfillReport, ExtractError> {
        let mut report = BackfillReport::default();

        let mut batches: Vec<Batch<'_>> = Vec::new();
        if let Some(text) = reference.filter(|t| !t.trim().is_empty()) {
            batches.push(Batch::Reference(text));
        }
        batches.extend(history.chunks(self.config.chunk_size()).map(Batch::Messages));

        for batch in batches {
            match self.run(store, batch, checkpoint).await? {
                ExtractOutcome::Applied(chunk) => {
                    report.chunks += 1;
                    report.pages_added += chunk.pages_added.len();
                }
                ExtractOutcome::Skipped(SkipReason::InProgress) => {
                    report.interrupted = true;
                    break;
                }
                ExtractOutcome::Skipped(SkipReason::NothingNew) => {}
            }
        }

        Ok(report)
    }
}

/// Summary of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub chunks: usize,
    pub pages_added: usize,
    /// The guard was held by another extraction.
    pub interrupted: bool,
}

/// A user-facing warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice(pub String);

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counts consecutive extraction failures.
///
/// Reaching the threshold yields one warning and resets the count, so
/// extraction keeps being attempted.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self, error: &ExtractError) -> Option<Notice> {
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return None;
        }
        let failures = self.consecutive;
        self.consecutive = 0;
        tracing::warn!(failures, error = %error, "memory extraction keeps failing");
        Some(Notice(format!(
            "Memory extraction failed {failures} times in a row (last error: {error}). It will keep retrying."
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NoCheckpoint;
    use crate::store::CompressionLevel;
    use crate::testing::ScriptedGateway;

    fn config() -> ChronicleConfig {
        ChronicleConfig::new()
            .with_protagonist("Aria")
            .with_known_characters(["Kael"])
    }

    fn messages(range: std::ops::Range<usize>) -> Vec<ConversationMessage> {
        range
            .map(|i| ConversationMessage::new(i, "Narrator", format!("event {i}")))
            .collect()
    }

    const REPLY: &str = r#"```json
{
  "timeline": "D1: Aria met Brannoc\nD2: Brannoc betrayed her",
  "knownCharacterAttitudes": [{"name": "kael", "attitude": "protective"}, {"name": "Stranger", "attitude": "cold"}],
  "characters": [
    {"name": "Brannoc", "appearance": "scar", "personality": "sly", "attitude": "hostile"},
    {"name": "Aria", "attitude": "self"},
    {"name": "Kael", "attitude": "ally"}
  ],
  "items": [{"name": "locket", "status": "stolen", "significance": "heirloom"}],
  "pages": [
    {"day": "Day 2", "title": "Betrayal", "content": "Brannoc sold Aria out because the guild paid him.", "keywords": ["betrayal", "Brannoc"], "categories": ["conflict", "villainy"], "significance": "high", "sourceMessageIndices": [5, 99]},
    {"day": "Day 2", "title": "Short", "content": "too short", "keywords": ["x"]},
    {"day": "Day 2", "title": "No keywords", "content": "A long enough content string about nothing.", "keywords": []},
  ]
}
```"#;

    #[test]
    fn test_parse_tolerates_shapes() {
        let parsed = ParsedExtraction::parse(
            r#"{"timeline": ["D1: a", "D2: b"], "pages": [{"title": "T", "keywords": "a, b", "categories": "promise"}, 7]}"#,
        )
        .unwrap();
        assert_eq!(parsed.timeline.as_deref(), Some("D1: a\nD2: b"));
        assert!(parsed.characters.is_none());
        assert_eq!(parsed.pages.len(), 1);
        assert_eq!(parsed.pages[0].keywords, vec!["a", "b"]);
        assert_eq!(parsed.pages[0].categories, vec![Category::Promise]);
    }

    #[test]
    fn test_merge_rules() {
        let mut store = MemoryStore::new();
        store.replace_characters(vec![NpcDossier::new("Old Wen")], &config().roster());
        let parsed = ParsedExtraction::parse(REPLY).unwrap();

        let report = merge(&mut store, parsed, &config(), &[4, 5, 6]);

        assert_eq!(report.attitudes_updated, 1);
        assert_eq!(store.known_attitudes()[0].name, "Kael");
        // NPC list replaced wholesale: Old Wen is gone, Aria and Kael filtered.
        let names: Vec<&str> = store.characters().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Brannoc"]);
        assert_eq!(store.items()[0].status, "stolen");
        assert_eq!(store.timeline_lines().len(), 2);

        assert_eq!(report.pages_added.len(), 1);
        assert_eq!(report.pages_rejected, 2);
        let page = store.page(&report.pages_added[0]).unwrap();
        assert_eq!(page.categories, vec![Category::Conflict]);
        assert_eq!(page.characters, vec!["Brannoc".to_string()]);
        assert_eq!(page.significance, Significance::High);
        assert_eq!(page.source_message_indices, vec![5]);
        assert_eq!(page.compression_level, CompressionLevel::Fresh);
        assert_eq!(report.last_index, Some(6));
    }

    #[test]
    fn test_pages_without_sources_cover_the_batch() {
        let mut store = MemoryStore::new();
        let parsed = ParsedExtraction::parse(
            r#"{"pages": [{"title": "Oath", "content": "Kael swore an oath because he owed a debt.", "keywords": ["oath"]}]}"#,
        )
        .unwrap();
        let report = merge(&mut store, parsed, &config(), &[7, 8]);
        let page = store.page(&report.pages_added[0]).unwrap();
        assert_eq!(page.source_message_indices, vec![7, 8]);
        assert_eq!(page.day, "Undated");
    }

    #[tokio::test]
    async fn test_extract_applies_and_clears_guard() {
        let gateway = ScriptedGateway::new();
        gateway.push_text(REPLY);
        let config = config();
        let extractor = Extractor::new(&gateway, &config);
        let mut store = MemoryStore::new();

        let outcome = extractor
            .extract(&mut store, &messages(4..7), &NoCheckpoint)
            .await
            .unwrap();

        assert!(matches!(outcome, ExtractOutcome::Applied(_)));
        assert!(!store.processing().in_progress);
        assert_eq!(store.processing().last_extracted_index, Some(6));
        assert!(gateway.prompts()[0].user.contains("[4] Narrator: event 4"));
    }

    #[tokio::test]
    async fn test_parse_failure_leaves_store_untouched() {
        let gateway = ScriptedGateway::new();
        gateway.push_text("I could not do that.");
        let config = config();
        let extractor = Extractor::new(&gateway, &config);
        let mut store = MemoryStore::new();
        store.set_timeline("D1: before");
        let before = store.clone();

        let err = extractor
            .extract(&mut store, &messages(0..3), &NoCheckpoint)
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Parse(_)));
        assert_eq!(store, before);
    }

    #[tokio::test]
    async fn test_gateway_failure_clears_guard() {
        let gateway = ScriptedGateway::new();
        gateway.push_failure("connection reset");
        let config = config();
        let extractor = Extractor::new(&gateway, &config);
        let mut store = MemoryStore::new();

        let err = extractor
            .extract(&mut store, &messages(0..3), &NoCheckpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Gateway(_)));
        assert!(!store.processing().in_progress);
        assert_eq!(store.processing().last_extracted_index, None);
    }

    #[tokio::test]
    async fn test_guard_skips_without_calling_gateway() {
        let gateway = ScriptedGateway::new();
        let config = config();
        let extractor = Extractor::new(&gateway, &config);
        let mut store = MemoryStore::new();
        assert!(store.begin_processing());

        let outcome = extractor
            .extract(&mut store, &messages(0..3), &NoCheckpoint)
            .await
            .unwrap();
        assert_eq!(outcome, ExtractOutcome::Skipped(SkipReason::InProgress));
        assert_eq!(gateway.calls(), 0);
        assert!(store.processing().in_progress);
    }

    #[tokio::test]
    async fn test_backfill_runs_reference_first_then_chunks() {
        let gateway = ScriptedGateway::new();
        for _ in 0..3 {
            gateway.push_text(r#"{"pages": []}"#);
        }
        let config = config().with_backfill_chunk_size(2);
        let extractor = Extractor::new(&gateway, &config);
        let mut store = MemoryStore::new();

        let report = extractor
            .backfill(&mut store, Some("The city of Vell sits on a river."), &messages(0..4), &NoCheckpoint)
            .await
            .unwrap();

        assert_eq!(report.chunks, 3);
        assert!(!report.interrupted);
        let prompts = gateway.prompts();
        assert!(prompts[0].user.contains("## Reference Material"));
        assert!(prompts[1].user.contains("[0] Narrator") && prompts[1].user.contains("[1] Narrator"));
        assert!(prompts[2].user.contains("[3] Narrator"));
        assert_eq!(store.processing().last_extracted_index, Some(3));
    }

    #[test]
    fn test_failure_tracker_warns_once_then_resets() {
        let mut tracker = FailureTracker::new(3);
        let err = ExtractError::Parse(ParseFailure {
            last_error: "x".to_string(),
        });
        assert!(tracker.record_failure(&err).is_none());
        assert!(tracker.record_failure(&err).is_none());
        assert!(tracker.record_failure(&err).is_some());
        assert_eq!(tracker.consecutive(), 0);
        assert!(tracker.record_failure(&err).is_none());
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
    }
}
