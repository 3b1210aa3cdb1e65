//! Compression engine: keeps the store bounded.
//!
//! A cycle runs three steps in order:
//!
//! 1. timeline compaction, when the timeline has more lines than allowed
//! 2. page compression, oldest excess FRESH pages rewritten as SUMMARY
//! 3. archiving, oldest excess SUMMARY pages deleted
//!
//! The store is checkpointed after every page, so a failure part-way through
//! loses at most the unit in flight. A failed page simply stays where it was
//! and is retried next cycle.

use crate::config::ChronicleConfig;
use crate::embedding::EmbeddingIndex;
use crate::gateway::{GatewayError, TextGateway};
use crate::persist::Checkpoint;
use crate::prompts;
use crate::store::{CompressionLevel, MemoryStore, PageId};
use chrono::Utc;
use thiserror::Error;

/// Errors from a single compression unit.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("generation failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("generator returned nothing")]
    Empty,

    #[error("compacted timeline has {after} lines, original has {before}")]
    TimelineGrew { before: usize, after: usize },

    #[error("page {0} is not FRESH")]
    NotFresh(PageId),
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionReport {
    /// The cycle was skipped because automatic compression is off.
    pub skipped: bool,
    pub timeline_compacted: bool,
    pub timeline_rejected: bool,
    pub summarized: Vec<PageId>,
    pub summary_failures: usize,
    pub archived: Vec<PageId>,
}

impl CompressionReport {
    pub fn changed(&self) -> bool {
        self.timeline_compacted || !self.summarized.is_empty() || !self.archived.is_empty()
    }
}

/// Drop an enclosing code fence, if the model added one.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.split_once('\n').map_or(inner, |(_, rest)| rest);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Runs compression cycles.
pub struct Compressor<'a> {
    gateway: Option<&'a dyn TextGateway>,
    index: Option<&'a EmbeddingIndex>,
    config: &'a ChronicleConfig,
}

impl<'a> Compressor<'a> {
    pub fn new(config: &'a ChronicleConfig) -> Self {
        Self {
            gateway: None,
            index: None,
            config,
        }
    }

    pub fn with_gateway(mut self, gateway: &'a dyn TextGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_index(mut self, index: Option<&'a EmbeddingIndex>) -> Self {
        self.index = index;
        self
    }

    /// Run one cycle. `force` runs it even when automatic compression is off;
    /// the ceilings apply either way.
    pub async fn run_cycle(
        &self,
        store: &mut MemoryStore,
        force: bool,
        checkpoint: &dyn Checkpoint,
    ) -> CompressionReport {
        let mut report = CompressionReport::default();
        if !force && !self.config.auto_compress {
            report.skipped = true;
            return report;
        }

        if let Some(gateway) = self.gateway {
            match self.compact_timeline(gateway, store).await {
                Ok(true) => {
                    report.timeline_compacted = true;
                    checkpoint.checkpoint(store).await;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "timeline compaction rejected");
                    report.timeline_rejected = true;
                }
            }

            for id in self.excess(store, CompressionLevel::Fresh, self.config.fresh_ceiling) {
                match self.summarize(gateway, store, &id).await {
                    Ok(()) => {
                        report.summarized.push(id);
                        checkpoint.checkpoint(store).await;
                    }
                    Err(e) => {
                        tracing::warn!(page = %id, error = %e, "page compression failed");
                        report.summary_failures += 1;
                    }
                }
            }
        }

        for id in self.excess(store, CompressionLevel::Summary, self.config.summary_ceiling) {
            if let Some(page) = store.archive_page(&id, Utc::now()) {
                tracing::info!(
                    page = %page.id,
                    day = %page.day,
                    title = %page.title,
                    "archived page"
                );
                report.archived.push(id);
                checkpoint.checkpoint(store).await;
            }
        }

        report
    }

    /// Oldest pages beyond `ceiling` at `level`. Exactly at the ceiling is none.
    fn excess(&self, store: &MemoryStore, level: CompressionLevel, ceiling: usize) -> Vec<PageId> {
        let over = store.count_at(level).saturating_sub(ceiling);
        store.oldest_at(level).into_iter().take(over).collect()
    }

    /// Compact the timeline if it is over the line limit. Returns whether it changed.
    pub async fn compact_timeline(
        &self,
        gateway: &dyn TextGateway,
        store: &mut MemoryStore,
    ) -> Result<bool, CompressError> {
        let lines = store.timeline_lines();
        let before = lines.len();
        if before <= self.config.timeline_max_lines {
            return Ok(false);
        }

        let prompt = prompts::timeline_prompt(&lines, self.config);
        let raw = gateway
            .generate(
                prompts::TIMELINE_SYSTEM,
                &prompt,
                self.config.compression_max_tokens,
            )
            .await?;

        let compacted: Vec<&str> = strip_fence(&raw)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let after = compacted.len();
        if after == 0 {
            return Err(CompressError::Empty);
        }
        if after > before {
            return Err(CompressError::TimelineGrew { before, after });
        }

        store.set_timeline(compacted.join("\n"));
        tracing::info!(before, after, "timeline compacted");
        Ok(true)
    }

    /// Rewrite one FRESH page as a SUMMARY.
    pub async fn summarize(
        &self,
        gateway: &dyn TextGateway,
        store: &mut MemoryStore,
        id: &PageId,
    ) -> Result<(), CompressError> {
        let page = store
            .page(id)
            .filter(|p| p.compression_level == CompressionLevel::Fresh)
            .ok_or_else(|| CompressError::NotFresh(id.clone()))?;
        let prompt = prompts::summary_prompt(page, self.config);

        let raw = gateway
            .generate(
                prompts::SUMMARY_SYSTEM,
                &prompt,
                self.config.compression_max_tokens,
            )
            .await?;
        let summary = strip_fence(&raw).to_string();
        if summary.is_empty() {
            return Err(CompressError::Empty);
        }

        let (_, max) = self.config.summary_chars;
        let length = summary.chars().count();
        if length > max {
            tracing::debug!(page = %id, length, max, "summary longer than requested");
        }

        if !store.summarize_page(id, summary, Utc::now()) {
            return Err(CompressError::NotFresh(id.clone()));
        }

        if let Some(index) = self.index {
            if let Err(e) = index.refresh_page(store, id).await {
                tracing::warn!(page = %id, error = %e, "could not re-embed summarized page");
            }
        }
        Ok(())
    }
}
