//! The retrieval agent's tool palette.
//!
//! Two direct fetches resolve to selections. Four searches run locally over
//! the candidate pages and return id + title listings for a second round.

use crate::gateway::ToolCall;
use crate::store::{name_key, Category, NpcDossier, Page, PageId};
use chronicle_macros::Tool;
use serde::Deserialize;
use std::collections::HashMap;

/// Read one memory page in full and add it to the storyteller's context
#[derive(Tool, Deserialize)]
#[tool(name = "fetch_page")]
pub struct FetchPage {
    /// Id of the page to fetch
    #[tool(choices = "page_ids")]
    pub page_id: String,
}

/// Add one character's dossier to the storyteller's context
#[derive(Tool, Deserialize)]
#[tool(name = "fetch_character")]
pub struct FetchCharacter {
    /// Exact character name
    #[tool(choices = "character_names")]
    pub name: String,
}

/// List pages tagged with a category
#[derive(Tool, Deserialize)]
#[tool(name = "search_by_category")]
pub struct SearchByCategory {
    /// Category label
    #[tool(choices = "categories")]
    pub category: String,
}

/// List pages whose day label contains the given text, e.g. "Day 3"
#[derive(Tool, Deserialize)]
#[tool(name = "search_by_day")]
pub struct SearchByDay {
    /// Day label or part of one
    pub day: String,
}

/// List pages involving a character whose name contains the given text
#[derive(Tool, Deserialize)]
#[tool(name = "search_by_relationship")]
pub struct SearchByRelationship {
    /// Character name or part of one
    pub name: String,
}

/// List pages whose title, keywords or content contain the given text
#[derive(Tool, Deserialize)]
#[tool(name = "search_by_keyword")]
pub struct SearchByKeyword {
    /// Word or phrase to look for
    pub query: String,
}

/// Live enum values for the tool schemas.
pub fn choices(candidates: &[&Page], characters: &[NpcDossier]) -> HashMap<&'static str, Vec<String>> {
    let mut choices = HashMap::new();
    choices.insert(
        "page_ids",
        candidates.iter().map(|p| p.id.to_string()).collect(),
    );
    choices.insert(
        "character_names",
        characters.iter().map(|c| c.name.clone()).collect(),
    );
    choices.insert("categories", Category::labels());
    choices
}

/// Every tool, for round one.
pub fn full_palette(choices: &HashMap<&str, Vec<String>>) -> Vec<claude::Tool> {
    vec![
        FetchPage::as_tool_with(choices),
        FetchCharacter::as_tool_with(choices),
        SearchByCategory::as_tool_with(choices),
        SearchByDay::as_tool_with(choices),
        SearchByRelationship::as_tool_with(choices),
        SearchByKeyword::as_tool_with(choices),
    ]
}

/// Direct fetches only, for round two.
pub fn fetch_palette(choices: &HashMap<&str, Vec<String>>) -> Vec<claude::Tool> {
    vec![
        FetchPage::as_tool_with(choices),
        FetchCharacter::as_tool_with(choices),
    ]
}

/// A local search over candidate pages.
#[derive(Debug, Clone, PartialEq)]
pub enum Search {
    Category(Category),
    Day(String),
    Relationship(String),
    Keyword(String),
}

impl Search {
    /// Matching pages, in candidate order.
    pub fn run<'p>(&self, candidates: &[&'p Page]) -> Vec<&'p Page> {
        candidates
            .iter()
            .copied()
            .filter(|page| self.matches(page))
            .collect()
    }

    fn matches(&self, page: &Page) -> bool {
        match self {
            Search::Category(category) => page.has_category(*category),
            Search::Day(day) => name_key(&page.day).contains(&name_key(day)),
            Search::Relationship(name) => {
                let needle = name_key(name);
                page.characters
                    .iter()
                    .any(|c| name_key(c).contains(&needle))
            }
            Search::Keyword(query) => {
                let needle = name_key(query);
                page.keywords.iter().any(|k| name_key(k).contains(&needle))
                    || name_key(&page.title).contains(&needle)
                    || page.content.to_lowercase().contains(&needle)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Search::Category(c) => format!("category = {c}"),
            Search::Day(d) => format!("day ~ {d}"),
            Search::Relationship(n) => format!("character ~ {n}"),
            Search::Keyword(q) => format!("keyword ~ {q}"),
        }
    }
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    FetchPage(PageId),
    FetchCharacter(String),
    Search(Search),
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl AgentCall {
    /// Decode a raw call. Unknown tools and malformed arguments give `None`.
    pub fn parse(call: &ToolCall) -> Option<Self> {
        let args = call.arguments.clone();
        let parsed = match call.name.as_str() {
            "fetch_page" => serde_json::from_value::<FetchPage>(args)
                .ok()
                .and_then(|a| non_blank(a.page_id))
                .map(|id| AgentCall::FetchPage(PageId::from_raw(id))),
            "fetch_character" => serde_json::from_value::<FetchCharacter>(args)
                .ok()
                .and_then(|a| non_blank(a.name))
                .map(AgentCall::FetchCharacter),
            "search_by_category" => serde_json::from_value::<SearchByCategory>(args)
                .ok()
                .and_then(|a| Category::parse(&a.category))
                .map(|c| AgentCall::Search(Search::Category(c))),
            "search_by_day" => serde_json::from_value::<SearchByDay>(args)
                .ok()
                .and_then(|a| non_blank(a.day))
                .map(|d| AgentCall::Search(Search::Day(d))),
            "search_by_relationship" => serde_json::from_value::<SearchByRelationship>(args)
                .ok()
                .and_then(|a| non_blank(a.name))
                .map(|n| AgentCall::Search(Search::Relationship(n))),
            "search_by_keyword" => serde_json::from_value::<SearchByKeyword>(args)
                .ok()
                .and_then(|a| non_blank(a.query))
                .map(|q| AgentCall::Search(Search::Keyword(q))),
            _ => None,
        };
        if parsed.is_none() {
            tracing::debug!(tool = %call.name, "dropping malformed tool call");
        }
        parsed
    }
}
