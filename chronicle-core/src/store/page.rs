//! Pages: the compressible units of recorded narrative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    /// Generate a fresh collision-resistant id.
    pub fn generate() -> Self {
        Self(format!("pg-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing id string (from storage or a tool call).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed set of narrative categories a page may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Emotional,
    Relationship,
    Intimate,
    Promise,
    Conflict,
    Discovery,
    TurningPoint,
    Daily,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Emotional,
        Category::Relationship,
        Category::Intimate,
        Category::Promise,
        Category::Conflict,
        Category::Discovery,
        Category::TurningPoint,
        Category::Daily,
    ];

    /// Wire label, as stored and as shown to the model.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Emotional => "emotional",
            Category::Relationship => "relationship",
            Category::Intimate => "intimate",
            Category::Promise => "promise",
            Category::Conflict => "conflict",
            Category::Discovery => "discovery",
            Category::TurningPoint => "turning_point",
            Category::Daily => "daily",
        }
    }

    /// Lenient parse of a generated tag. Anything outside the enum is `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|c| c.label() == normalized)
    }

    /// Labels of every category, in declaration order.
    pub fn labels() -> Vec<String> {
        Self::ALL.iter().map(|c| c.label().to_string()).collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How much a page matters to the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    High,
    #[default]
    Medium,
}

impl Significance {
    /// Anything that is not clearly "high" is medium.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("high") {
            Significance::High
        } else {
            Significance::Medium
        }
    }
}

/// Compression level of a page. Only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionLevel {
    #[default]
    Fresh,
    Summary,
    Archived,
}

impl CompressionLevel {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionLevel::Fresh => "FRESH",
            CompressionLevel::Summary => "SUMMARY",
            CompressionLevel::Archived => "ARCHIVED",
        }
    }
}

/// A single unit of recorded narrative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: PageId,
    /// In-story day label, e.g. "Day 3".
    pub day: String,
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
    /// NPC names found among the keywords.
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub significance: Significance,
    #[serde(default)]
    pub compression_level: CompressionLevel,
    #[serde(default)]
    pub source_message_indices: Vec<usize>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub compressed_at: Option<DateTime<Utc>>,
}

impl Page {
    /// Create a new FRESH page with a generated id.
    pub fn new(day: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: PageId::generate(),
            day: day.into(),
            title: title.into(),
            content: content.into(),
            keywords: Vec::new(),
            characters: Vec::new(),
            categories: Vec::new(),
            significance: Significance::Medium,
            compression_level: CompressionLevel::Fresh,
            source_message_indices: Vec::new(),
            created_at: Utc::now(),
            compressed_at: None,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_characters<I, S>(mut self, characters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.characters = characters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn with_significance(mut self, significance: Significance) -> Self {
        self.significance = significance;
        self
    }

    pub fn with_sources(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.source_message_indices = indices.into_iter().collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// FRESH or SUMMARY pages take part in retrieval.
    pub fn is_retrievable(&self) -> bool {
        self.compression_level <= CompressionLevel::Summary
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }

    /// Text used for embeddings: title, keywords, then content.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.title,
            self.keywords.join(", "),
            self.content
        )
    }

    /// One-line listing used in catalogs and tool results.
    pub fn listing(&self) -> String {
        format!("[{}] {} | {}", self.id, self.day, self.title)
    }

    /// Advance to `level`. Returns false (and changes nothing) if that would regress.
    pub(crate) fn advance_to(&mut self, level: CompressionLevel, at: DateTime<Utc>) -> bool {
        if level <= self.compression_level {
            return false;
        }
        self.compression_level = level;
        self.compressed_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse_is_lenient_but_closed() {
        assert_eq!(Category::parse("Conflict"), Some(Category::Conflict));
        assert_eq!(Category::parse("turning-point"), Some(Category::TurningPoint));
        assert_eq!(Category::parse(" turning point "), Some(Category::TurningPoint));
        assert_eq!(Category::parse("romance"), None);
        assert_eq!(Category::parse(""), None);
    }

    #[test]
    fn test_compression_level_only_moves_forward() {
        let mut page = Page::new("Day 1", "Arrival", "They arrived at the harbor at dusk.");
        let now = Utc::now();

        assert!(page.advance_to(CompressionLevel::Summary, now));
        assert!(!page.advance_to(CompressionLevel::Fresh, now));
        assert!(!page.advance_to(CompressionLevel::Summary, now));
        assert_eq!(page.compression_level, CompressionLevel::Summary);
        assert_eq!(page.compressed_at, Some(now));
    }

    #[test]
    fn test_page_serializes_in_persisted_layout() {
        let page = Page::new("Day 2", "The vow", "Mira swore to return the locket.")
            .with_categories([Category::Promise, Category::TurningPoint])
            .with_significance(Significance::High);
        let json = serde_json::to_value(&page).unwrap();

        assert_eq!(json["compressionLevel"], "FRESH");
        assert_eq!(json["significance"], "high");
        assert_eq!(json["categories"][1], "turning_point");
        assert!(json["sourceMessageIndices"].is_array());
        assert!(json["id"].as_str().unwrap().starts_with("pg-"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PageId::generate();
        let b = PageId::generate();
        assert_ne!(a, b);
    }
}
