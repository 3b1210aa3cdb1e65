//! Tool-directed selection.
//!
//! At most two reasoning calls per turn, driven as an explicit state machine:
//!
//! ```text
//! AwaitingRound1 ──searches──▶ ExecutingSearches ──▶ AwaitingRound2 ──▶ Done
//!        │                                                                ▲
//!        └──────────────────── fetches only / caps reached ───────────────┘
//! ```
//!
//! Caps are enforced here whatever the model asks for. Fetches are checked
//! against the candidate pages and the stored dossiers, so nothing outside
//! them can be selected. A gateway failure yields an empty selection.

use super::tools::{self, AgentCall, Search};
use crate::config::ChronicleConfig;
use crate::gateway::{TextGateway, ToolCall};
use crate::prompts;
use crate::store::{name_key, MemoryStore, Page, PageId};

/// What the agent picked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSelection {
    pub pages: Vec<PageId>,
    pub characters: Vec<String>,
}

impl AgentSelection {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.characters.is_empty()
    }
}

enum AgentState {
    AwaitingRound1,
    ExecutingSearches(Vec<Search>),
    AwaitingRound2(String),
    Done,
}

/// Accumulates fetches under the caps.
struct Picks<'a> {
    store: &'a MemoryStore,
    candidates: &'a [&'a Page],
    max_pages: usize,
    max_characters: usize,
    selection: AgentSelection,
}

impl<'a> Picks<'a> {
    fn pages_left(&self) -> usize {
        self.max_pages.saturating_sub(self.selection.pages.len())
    }

    fn characters_left(&self) -> usize {
        self.max_characters
            .saturating_sub(self.selection.characters.len())
    }

    fn full(&self) -> bool {
        self.pages_left() == 0 && self.characters_left() == 0
    }

    fn fetch_page(&mut self, id: PageId) {
        if self.pages_left() == 0 || self.selection.pages.contains(&id) {
            return;
        }
        if self.candidates.iter().any(|p| p.id == id) {
            self.selection.pages.push(id);
        } else {
            tracing::debug!(page = %id, "ignoring fetch outside the candidate set");
        }
    }

    fn fetch_character(&mut self, name: &str) {
        let Some(dossier) = self.store.find_character(name) else {
            tracing::debug!(name = %name, "ignoring fetch of unknown character");
            return;
        };
        let key = name_key(&dossier.name);
        if self.characters_left() == 0
            || self.selection.characters.iter().any(|c| name_key(c) == key)
        {
            return;
        }
        self.selection.characters.push(dossier.name.clone());
    }

    /// Apply fetches; return the searches (if `allow_search`).
    fn absorb(&mut self, calls: &[ToolCall], allow_search: bool) -> Vec<Search> {
        let mut searches = Vec::new();
        for call in calls.iter().filter_map(AgentCall::parse) {
            match call {
                AgentCall::FetchPage(id) => self.fetch_page(id),
                AgentCall::FetchCharacter(name) => self.fetch_character(&name),
                AgentCall::Search(search) if allow_search => {
                    if !searches.contains(&search) {
                        searches.push(search);
                    }
                }
                AgentCall::Search(_) => {
                    tracing::debug!("ignoring search in the final round");
                }
            }
        }
        searches
    }
}

/// Runs the two-round selection protocol.
pub struct RetrievalAgent<'a> {
    gateway: &'a dyn TextGateway,
    config: &'a ChronicleConfig,
}

impl<'a> RetrievalAgent<'a> {
    pub fn new(gateway: &'a dyn TextGateway, config: &'a ChronicleConfig) -> Self {
        Self { gateway, config }
    }

    /// Select pages and characters for the turn.
    ///
    /// `candidates` restricts the catalog (pre-filter output); `None` means
    /// every retrievable page.
    pub async fn select(
        &self,
        store: &MemoryStore,
        recent: &str,
        candidates: Option<&[Page]>,
    ) -> AgentSelection {
        let catalog: Vec<&Page> = match candidates {
            Some(pages) => pages.iter().filter(|p| p.is_retrievable()).collect(),
            None => store.retrievable_pages().collect(),
        };
        if catalog.is_empty() && store.characters().is_empty() {
            return AgentSelection::default();
        }

        let choices = tools::choices(&catalog, store.characters());
        let mut picks = Picks {
            store,
            candidates: &catalog,
            max_pages: self.config.max_pages,
            max_characters: self.config.character_cap(),
            selection: AgentSelection::default(),
        };

        let mut state = AgentState::AwaitingRound1;
        loop {
            state = match state {
                AgentState::AwaitingRound1 => {
                    let prompt = prompts::agent_round_one(
                        &catalog,
                        store.characters(),
                        recent,
                        picks.max_pages,
                        picks.max_characters,
                    );
                    let turn = match self
                        .gateway
                        .generate_with_tools(
                            &prompt,
                            &tools::full_palette(&choices),
                            self.config.agent_max_tokens,
                        )
                        .await
                    {
                        Ok(turn) => turn,
                        Err(e) => {
                            tracing::warn!(error = %e, "retrieval agent unavailable");
                            return AgentSelection::default();
                        }
                    };
                    let searches = picks.absorb(&turn.tool_calls, true);
                    if searches.is_empty() || picks.full() {
                        AgentState::Done
                    } else {
                        AgentState::ExecutingSearches(searches)
                    }
                }
                AgentState::ExecutingSearches(searches) => {
                    let results = searches
                        .iter()
                        .map(|search| {
                            let hits = search.run(&catalog);
                            let listing = if hits.is_empty() {
                                "(no matches)".to_string()
                            } else {
                                hits.iter()
                                    .map(|p| format!("- {}", p.listing()))
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            };
                            format!("### {}\n{listing}", search.describe())
                        })
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    AgentState::AwaitingRound2(results)
                }
                AgentState::AwaitingRound2(results) => {
                    let prompt = prompts::agent_round_two(
                        recent,
                        &results,
                        picks.pages_left(),
                        picks.characters_left(),
                    );
                    match self
                        .gateway
                        .generate_with_tools(
                            &prompt,
                            &tools::fetch_palette(&choices),
                            self.config.agent_max_tokens,
                        )
                        .await
                    {
                        Ok(turn) => {
                            picks.absorb(&turn.tool_calls, false);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "retrieval agent failed in round two");
                            return AgentSelection::default();
                        }
                    }
                    AgentState::Done
                }
                AgentState::Done => break,
            };
        }

        tracing::debug!(
            pages = picks.selection.pages.len(),
            characters = picks.selection.characters.len(),
            "retrieval agent selected"
        );
        picks.selection
    }
}
