//! Engine configuration.

use crate::store::Roster;
use serde::{Deserialize, Serialize};

/// Hard cap on characters injected per turn.
pub const CHARACTER_CAP: usize = 2;

/// Configuration for the memory engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronicleConfig {
    /// Protagonist name. Never tracked as a character.
    pub protagonist: String,

    /// Pre-declared characters tracked by attitude only.
    pub known_characters: Vec<String>,

    /// Unprocessed messages needed before an automatic extraction.
    pub extract_every: usize,

    /// Messages per backfill chunk.
    pub backfill_chunk_size: usize,

    /// Recent messages used as the retrieval query.
    pub recall_window: usize,

    /// Page cap per turn.
    pub max_pages: usize,

    /// Character cap per turn. Clamped to [`CHARACTER_CAP`].
    pub max_characters: usize,

    /// Candidate pages kept by the embedding pre-filter.
    pub embedding_top_k: usize,

    /// Timeline compaction runs once the line count exceeds this.
    pub timeline_max_lines: usize,

    /// Lines kept verbatim by timeline compaction.
    pub timeline_keep_recent: usize,

    /// Per-line length cap for timeline entries.
    pub timeline_line_chars: usize,

    /// FRESH pages allowed before compression.
    pub fresh_ceiling: usize,

    /// SUMMARY pages allowed before archiving.
    pub summary_ceiling: usize,

    /// Output-length band (characters) for page summaries.
    pub summary_chars: (usize, usize),

    /// Minimum content length of a newly extracted page.
    pub min_page_content_chars: usize,

    /// Consecutive extraction failures before a warning.
    pub failure_warn_threshold: u32,

    /// Run a compression cycle after each successful extraction.
    pub auto_compress: bool,

    /// Most recent turns kept in the recall log.
    pub recall_log_limit: usize,

    pub extraction_max_tokens: usize,
    pub compression_max_tokens: usize,
    pub agent_max_tokens: usize,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            protagonist: String::new(),
            known_characters: Vec::new(),
            extract_every: 4,
            backfill_chunk_size: 20,
            recall_window: 6,
            max_pages: 3,
            max_characters: CHARACTER_CAP,
            embedding_top_k: 8,
            timeline_max_lines: 40,
            timeline_keep_recent: 10,
            timeline_line_chars: 80,
            fresh_ceiling: 20,
            summary_ceiling: 40,
            summary_chars: (60, 120),
            min_page_content_chars: 20,
            failure_warn_threshold: 3,
            auto_compress: true,
            recall_log_limit: 50,
            extraction_max_tokens: 4096,
            compression_max_tokens: 1024,
            agent_max_tokens: 1024,
        }
    }
}

impl ChronicleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protagonist(mut self, name: impl Into<String>) -> Self {
        self.protagonist = name.into();
        self
    }

    pub fn with_known_characters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_characters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extract_every(mut self, messages: usize) -> Self {
        self.extract_every = messages;
        self
    }

    pub fn with_backfill_chunk_size(mut self, messages: usize) -> Self {
        self.backfill_chunk_size = messages;
        self
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_embedding_top_k(mut self, k: usize) -> Self {
        self.embedding_top_k = k;
        self
    }

    pub fn with_fresh_ceiling(mut self, ceiling: usize) -> Self {
        self.fresh_ceiling = ceiling;
        self
    }

    pub fn with_summary_ceiling(mut self, ceiling: usize) -> Self {
        self.summary_ceiling = ceiling;
        self
    }

    pub fn with_timeline_limits(mut self, max_lines: usize, keep_recent: usize) -> Self {
        self.timeline_max_lines = max_lines;
        self.timeline_keep_recent = keep_recent;
        self
    }

    pub fn with_auto_compress(mut self, enabled: bool) -> Self {
        self.auto_compress = enabled;
        self
    }

    pub fn with_failure_warn_threshold(mut self, failures: u32) -> Self {
        self.failure_warn_threshold = failures;
        self
    }

    /// Protagonist plus known-name set.
    pub fn roster(&self) -> Roster {
        Roster::new(self.protagonist.clone(), self.known_characters.iter().cloned())
    }

    /// Effective character cap.
    pub fn character_cap(&self) -> usize {
        self.max_characters.min(CHARACTER_CAP)
    }

    /// Effective backfill chunk size (at least one message).
    pub fn chunk_size(&self) -> usize {
        self.backfill_chunk_size.max(1)
    }
}
