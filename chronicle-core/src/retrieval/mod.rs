//! Read-side retrieval: which memory goes into the next generation.
//!
//! Tiers run in order and each one degrades into the next:
//!
//! 1. embedding pre-filter narrows the catalog (optional)
//! 2. the retrieval agent picks pages and characters (needs a text gateway)
//! 3. keyword fallback scores pages locally when the agent picks nothing
//!
//! Retrieval only reads the store.

pub mod agent;
pub mod keyword;
pub mod tools;

pub use agent::{AgentSelection, RetrievalAgent};
pub use keyword::{fallback, query_tokens, score_page, KeywordSelection};

use crate::config::ChronicleConfig;
use crate::embedding::EmbeddingIndex;
use crate::extract::ConversationMessage;
use crate::gateway::TextGateway;
use crate::prompts;
use crate::store::{MemoryStore, NpcDossier, Page, PageId};

/// Which tier produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Agent,
    Keyword,
    /// Nothing was selected.
    Empty,
}

/// Pages and dossiers chosen for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub pages: Vec<Page>,
    pub characters: Vec<NpcDossier>,
    pub tier: Tier,
    /// The embedding pre-filter narrowed the catalog.
    pub prefiltered: bool,
}

impl Selection {
    fn empty(prefiltered: bool) -> Self {
        Self {
            pages: Vec::new(),
            characters: Vec::new(),
            tier: Tier::Empty,
            prefiltered,
        }
    }

    /// Resolve ids against the store, enforcing both caps.
    fn resolve(
        store: &MemoryStore,
        page_ids: &[PageId],
        names: &[String],
        config: &ChronicleConfig,
        tier: Tier,
        prefiltered: bool,
    ) -> Self {
        let pages: Vec<Page> = page_ids
            .iter()
            .filter_map(|id| store.page(id))
            .filter(|p| p.is_retrievable())
            .take(config.max_pages)
            .cloned()
            .collect();
        let characters: Vec<NpcDossier> = names
            .iter()
            .filter_map(|name| store.find_character(name))
            .take(config.character_cap())
            .cloned()
            .collect();
        if pages.is_empty() && characters.is_empty() {
            return Self::empty(prefiltered);
        }
        Self {
            pages,
            characters,
            tier,
            prefiltered,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.characters.is_empty()
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.id.clone()).collect()
    }
}

fn recent_window(messages: &[ConversationMessage], window: usize) -> &[ConversationMessage] {
    &messages[messages.len().saturating_sub(window.max(1))..]
}

/// The last `window` messages, rendered as the retrieval query.
pub fn recent_text(messages: &[ConversationMessage], window: usize) -> String {
    prompts::render_messages(recent_window(messages, window))
}

/// Only the message bodies of the last `window` messages, for keyword scoring.
pub fn recent_words(messages: &[ConversationMessage], window: usize) -> String {
    recent_window(messages, window)
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the tiers.
pub struct Retriever<'a> {
    gateway: Option<&'a dyn TextGateway>,
    index: Option<&'a EmbeddingIndex>,
    config: &'a ChronicleConfig,
}

impl<'a> Retriever<'a> {
    pub fn new(config: &'a ChronicleConfig) -> Self {
        Self {
            gateway: None,
            index: None,
            config,
        }
    }

    pub fn with_gateway(mut self, gateway: Option<&'a dyn TextGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_index(mut self, index: Option<&'a EmbeddingIndex>) -> Self {
        self.index = index;
        self
    }

    /// Select memory for the turn that follows `messages`.
    pub async fn retrieve(&self, store: &MemoryStore, messages: &[ConversationMessage]) -> Selection {
        let recent = recent_text(messages, self.config.recall_window);
        if recent.trim().is_empty() {
            return Selection::empty(false);
        }

        let candidates = match self.index {
            Some(index) => {
                index
                    .pre_filter(store, &recent, self.config.embedding_top_k)
                    .await
            }
            None => None,
        };
        let prefiltered = candidates.is_some();

        if let Some(gateway) = self.gateway {
            let picked = RetrievalAgent::new(gateway, self.config)
                .select(store, &recent, candidates.as_deref())
                .await;
            if !picked.is_empty() {
                let selection = Selection::resolve(
                    store,
                    &picked.pages,
                    &picked.characters,
                    self.config,
                    Tier::Agent,
                    prefiltered,
                );
                if !selection.is_empty() {
                    return selection;
                }
            }
        }

        let picked = fallback(
            store,
            &recent_words(messages, self.config.recall_window),
            self.config.max_pages,
            self.config.character_cap(),
        );
        tracing::debug!(pages = picked.pages.len(), "keyword fallback used");
        Selection::resolve(
            store,
            &picked.pages,
            &picked.characters,
            self.config,
            Tier::Keyword,
            prefiltered,
        )
    }
}

/// The context block handed to the generator. Empty sections are left out.
pub fn render_injection(store: &MemoryStore, selection: &Selection) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !store.timeline().is_empty() {
        sections.push(format!("## Story So Far\n{}", store.timeline()));
    }
    if !store.known_attitudes().is_empty() {
        let lines: Vec<String> = store
            .known_attitudes()
            .iter()
            .map(|k| format!("- {}: {}", k.name, k.attitude))
            .collect();
        sections.push(format!("## Attitudes\n{}", lines.join("\n")));
    }
    if !store.items().is_empty() {
        let lines: Vec<String> = store
            .items()
            .iter()
            .map(|i| {
                if i.status.is_empty() {
                    format!("- {}", i.name)
                } else {
                    format!("- {} ({})", i.name, i.status)
                }
            })
            .collect();
        sections.push(format!("## Items\n{}", lines.join("\n")));
    }
    if !selection.pages.is_empty() {
        let pages: Vec<String> = selection
            .pages
            .iter()
            .map(|p| format!("### {} | {}\n{}", p.day, p.title, p.content))
            .collect();
        sections.push(format!("## Recalled Memories\n{}", pages.join("\n\n")));
    }
    if !selection.characters.is_empty() {
        let dossiers: Vec<String> = selection
            .characters
            .iter()
            .map(NpcDossier::describe)
            .collect();
        sections.push(format!("## Characters\n{}", dossiers.join("\n")));
    }

    sections.join("\n\n")
}
