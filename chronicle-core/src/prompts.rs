//! Prompt builders for every generation call the engines make.

use crate::config::ChronicleConfig;
use crate::extract::ConversationMessage;
use crate::store::{Category, MemoryStore, NpcDossier, Page, Roster};

/// System prompt shared by extraction calls.
pub const EXTRACTION_SYSTEM: &str = "You maintain the long-term memory of an ongoing story. \
You read new conversation and return a single JSON object that updates the memory. \
Respond with the JSON object only.";

/// System prompt for timeline compaction.
pub const TIMELINE_SYSTEM: &str = "You compress a story timeline. \
Return only the compacted timeline lines, one entry per line, with no commentary.";

/// System prompt for page compression.
pub const SUMMARY_SYSTEM: &str = "You compress one story memory into a short summary. \
Return only the summary text.";

/// Render messages one per line, tagged with their index.
pub fn render_messages(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(ConversationMessage::render)
        .collect::<Vec<_>>()
        .join("\n")
}

fn bullet_list(lines: impl IntoIterator<Item = String>) -> String {
    let joined: Vec<String> = lines.into_iter().map(|l| format!("- {l}")).collect();
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined.join("\n")
    }
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        "(empty)"
    } else {
        text
    }
}

fn snapshot_sections(store: &MemoryStore) -> String {
    let attitudes = bullet_list(
        store
            .known_attitudes()
            .iter()
            .map(|k| format!("{}: {}", k.name, k.attitude)),
    );
    let npcs = bullet_list(store.characters().iter().map(|c| {
        format!(
            "{} | appearance: {} | personality: {} | attitude: {}",
            c.name, c.appearance, c.personality, c.attitude
        )
    }));
    let items = bullet_list(
        store
            .items()
            .iter()
            .map(|i| format!("{} | status: {} | significance: {}", i.name, i.status, i.significance)),
    );

    format!(
        r#"## Current Timeline
{timeline}

## Known Character Attitudes
{attitudes}

## NPC Dossiers
{npcs}

## Items
{items}"#,
        timeline = or_none(store.timeline()),
    )
}

fn roster_rules(roster: &Roster) -> String {
    let known = if roster.known.is_empty() {
        "(none)".to_string()
    } else {
        roster.known.join(", ")
    };
    format!(
        r#"- The protagonist is "{protagonist}". Never record the protagonist in either character list.
- Known characters: {known}. Matching is case-insensitive. For a known character, only report an updated attitude in "knownCharacterAttitudes".
- Every other named character is an NPC and needs a full dossier in "characters"."#,
        protagonist = roster.protagonist,
    )
}

/// The extraction prompt: store snapshot, new content, and the schema contract.
///
/// `reference` switches the content header for static reference material.
pub fn extraction_prompt(
    store: &MemoryStore,
    config: &ChronicleConfig,
    content: &str,
    reference: bool,
) -> String {
    let snapshot = snapshot_sections(store);
    let roster = roster_rules(&config.roster());
    let categories = Category::labels().join(", ");
    let header = if reference {
        "## Reference Material (static background, not events)"
    } else {
        "## New Conversation"
    };

    format!(
        r#"{snapshot}

{header}
{content}

## Instructions
Update the memory with what the new content establishes.

### Timeline
- Return the complete updated timeline in "timeline", one event per line.
- Keep the most recent {keep} lines verbatim. Merge older lines into date-range entries such as "D3-D5: ...".
- No line may exceed {line_chars} characters. The timeline must not exceed {max_lines} lines.

### Characters
{roster}
- "characters" is the complete NPC list for the story so far. It replaces the previous list, so carry forward every NPC still relevant.

### Items
- "items" is the complete corrected item list. It replaces the previous list.

### Pages
- Write a page only for content that matters later. Skip small talk and narratively inert exchanges.
- Prefer causes and motives ("why", "because") over a literal replay of who said what.
- Every page needs a title, at least {min_chars} characters of content, and at least one keyword.
- Put character names that appear in the page among its keywords.
- "categories" must come from: {categories}.
- "significance" is "high" or "medium".
- "sourceMessageIndices" lists the message indices the page draws on.

Respond with ONLY a JSON object in this shape:
{{
  "timeline": "D1: ...\nD2: ...",
  "knownCharacterAttitudes": [{{"name": "...", "attitude": "..."}}],
  "characters": [{{"name": "...", "appearance": "...", "personality": "...", "attitude": "..."}}],
  "items": [{{"name": "...", "status": "...", "significance": "..."}}],
  "pages": [{{"day": "Day 1", "title": "...", "content": "...", "keywords": ["..."], "categories": ["..."], "significance": "medium", "sourceMessageIndices": [0]}}]
}}"#,
        keep = config.timeline_keep_recent,
        line_chars = config.timeline_line_chars,
        max_lines = config.timeline_max_lines,
        min_chars = config.min_page_content_chars,
    )
}

/// Timeline compaction prompt.
pub fn timeline_prompt(timeline_lines: &[&str], config: &ChronicleConfig) -> String {
    format!(
        r#"## Timeline ({count} lines)
{timeline}

## Instructions
- Keep the last {keep} lines exactly as they are.
- Merge the older lines into date-range entries such as "D1-D4: ...", keeping names, promises and unresolved conflicts.
- No line may exceed {line_chars} characters.
- The result must have fewer lines than the input."#,
        count = timeline_lines.len(),
        timeline = timeline_lines.join("\n"),
        keep = config.timeline_keep_recent,
        line_chars = config.timeline_line_chars,
    )
}

/// Page compression prompt.
pub fn summary_prompt(page: &Page, config: &ChronicleConfig) -> String {
    let (min, max) = config.summary_chars;
    format!(
        r#"## Memory: {title} ({day})
{content}

## Instructions
Summarize this memory in {min} to {max} characters.
Keep who acted, what they did, why, and what came of it."#,
        title = page.title,
        day = page.day,
        content = page.content,
    )
}

/// Round one of the retrieval agent: catalog, characters and recent text.
pub fn agent_round_one(
    catalog: &[&Page],
    characters: &[NpcDossier],
    recent: &str,
    max_pages: usize,
    max_characters: usize,
) -> String {
    let pages = bullet_list(catalog.iter().map(|p| {
        let categories: Vec<&str> = p.categories.iter().map(Category::label).collect();
        format!(
            "{} [{}] keywords: {}",
            p.listing(),
            categories.join(", "),
            p.keywords.join(", ")
        )
    }));
    let names = bullet_list(characters.iter().map(|c| c.name.clone()));

    format!(
        r#"You choose which memories the storyteller should see before writing the next reply.

## Recent Conversation
{recent}

## Memory Pages
{pages}

## Characters
{names}

## Instructions
- Use fetch_page and fetch_character for anything clearly relevant.
- Use the search tools when you need to look something up first.
- Select at most {max_pages} pages and {max_characters} characters.
- If nothing is relevant, call no tools."#
    )
}

/// Round two: search results, fetch-only.
pub fn agent_round_two(
    recent: &str,
    search_results: &str,
    pages_left: usize,
    characters_left: usize,
) -> String {
    format!(
        r#"You choose which memories the storyteller should see before writing the next reply.

## Recent Conversation
{recent}

## Search Results
{search_results}

## Instructions
Finish now using only fetch_page and fetch_character.
You may select at most {pages_left} more pages and {characters_left} more characters."#
    )
}
