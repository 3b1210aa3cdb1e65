//! Text command surface.
//!
//! Commands take no flags and always answer with text; failures come back
//! as messages, never as errors.

use crate::chronicle::{Chronicle, ExtractStatus};
use crate::extract::{ConversationMessage, SkipReason};
use crate::store::{CompressionLevel, MemoryStore};

/// A parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ForceExtract,
    ShowLastRecall,
    ShowIndex,
    ListPages,
    ForceCompress,
    ResetStore,
    Help,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::ForceExtract,
        Command::ShowLastRecall,
        Command::ShowIndex,
        Command::ListPages,
        Command::ForceCompress,
        Command::ResetStore,
        Command::Help,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::ForceExtract => "force-extract",
            Command::ShowLastRecall => "show-last-recall",
            Command::ShowIndex => "show-index",
            Command::ListPages => "list-pages",
            Command::ForceCompress => "force-compress",
            Command::ResetStore => "reset-store",
            Command::Help => "help",
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            Command::ForceExtract => "extract unprocessed messages now",
            Command::ShowLastRecall => "pages injected on the most recent turn",
            Command::ShowIndex => "store statistics",
            Command::ListPages => "every page with its compression level",
            Command::ForceCompress => "run a compression cycle now",
            Command::ResetStore => "erase this conversation's memory",
            Command::Help => "this list",
        }
    }

    /// Parse the first word of a line, with or without a leading `/`.
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?.trim_start_matches('/');
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(word))
    }
}

pub fn usage() -> String {
    let lines: Vec<String> = Command::ALL
        .iter()
        .map(|c| format!("  {:<18}{}", c.name(), c.summary()))
        .collect();
    format!("Memory commands:\n{}", lines.join("\n"))
}

/// Run one command line against a conversation key.
pub async fn execute(
    chronicle: &Chronicle,
    key: &str,
    line: &str,
    messages: &[ConversationMessage],
) -> String {
    let Some(command) = Command::parse(line) else {
        return format!("Unknown command: {}\n{}", line.trim(), usage());
    };
    tracing::debug!(key = %key, command = command.name(), "memory command");

    match command {
        Command::Help => usage(),
        Command::ForceExtract => match chronicle.force_extract(key, messages).await {
            Ok(report) => {
                let mut text = match report.extraction {
                    ExtractStatus::Applied(r) => format!(
                        "Extracted {} new page(s), rejected {}.",
                        r.pages_added.len(),
                        r.pages_rejected
                    ),
                    ExtractStatus::Skipped(SkipReason::InProgress) => {
                        "Extraction already running; skipped.".to_string()
                    }
                    ExtractStatus::Skipped(SkipReason::NothingNew)
                    | ExtractStatus::NotDue { .. } => "Nothing new to extract.".to_string(),
                    ExtractStatus::Failed(e) => format!("Extraction failed: {e}"),
                    ExtractStatus::NoGateway => {
                        "Extraction needs a text generation gateway.".to_string()
                    }
                };
                if let Some(notice) = report.notice {
                    text.push('\n');
                    text.push_str(&notice.0);
                }
                text
            }
            Err(e) => format!("Error: {e}"),
        },
        Command::ForceCompress => match chronicle.compress(key, true).await {
            Ok(report) => format!(
                "Compression: timeline {}, {} page(s) summarized, {} failed, {} archived.",
                if report.timeline_compacted {
                    "compacted"
                } else if report.timeline_rejected {
                    "kept (compaction rejected)"
                } else {
                    "unchanged"
                },
                report.summarized.len(),
                report.summary_failures,
                report.archived.len()
            ),
            Err(e) => format!("Error: {e}"),
        },
        Command::ResetStore => match chronicle.reset(key).await {
            Ok(()) => "Memory reset.".to_string(),
            Err(e) => format!("Error: {e}"),
        },
        Command::ShowLastRecall | Command::ShowIndex | Command::ListPages => {
            match chronicle.snapshot(key).await {
                Ok(store) => match command {
                    Command::ShowLastRecall => show_last_recall(&store),
                    Command::ShowIndex => show_index(&store),
                    _ => list_pages(&store),
                },
                Err(e) => format!("Error: {e}"),
            }
        }
    }
}

fn show_last_recall(store: &MemoryStore) -> String {
    let Some((turn, ids)) = store.last_recall() else {
        return "No recall recorded yet.".to_string();
    };
    if ids.is_empty() {
        return format!("Turn {turn}: nothing recalled.");
    }
    let lines: Vec<String> = ids
        .iter()
        .map(|id| match store.page(id) {
            Some(page) => format!("- {}", page.listing()),
            None => format!("- [{id}] (no longer stored)"),
        })
        .collect();
    format!("Turn {turn}:\n{}", lines.join("\n"))
}

fn show_index(store: &MemoryStore) -> String {
    let last = store
        .processing()
        .last_extracted_index
        .map_or_else(|| "none".to_string(), |i| i.to_string());
    format!(
        "Store v{}\n\
         Timeline: {} line(s)\n\
         Pages: {} fresh, {} summary\n\
         NPCs: {} | Known attitudes: {} | Items: {}\n\
         Embeddings: {}\n\
         Last extracted message: {}\n\
         Recall log: {} turn(s)",
        store.version(),
        store.timeline_lines().len(),
        store.count_at(CompressionLevel::Fresh),
        store.count_at(CompressionLevel::Summary),
        store.character_count(),
        store.known_attitudes().len(),
        store.items().len(),
        store.embeddings().len(),
        last,
        store.recall_log().len(),
    )
}

fn list_pages(store: &MemoryStore) -> String {
    if store.pages().is_empty() {
        return "No pages.".to_string();
    }
    store
        .pages()
        .iter()
        .map(|p| format!("{} {}", p.compression_level.name(), p.listing()))
        .collect::<Vec<_>>()
        .join("\n")
}
