//! Deterministic last-resort retrieval. No external calls.

use crate::store::{name_key, CompressionLevel, MemoryStore, Page, PageId, Significance};
use std::collections::BTreeSet;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // kana
        | '\u{3400}'..='\u{4DBF}' // ext A
        | '\u{4E00}'..='\u{9FFF}' // unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // hangul
        | '\u{F900}'..='\u{FAFF}'
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Run {
    None,
    Cjk,
    Latin,
}

/// Query tokens: CJK runs of 2+ characters, other alphanumeric runs of 3+,
/// lowercased.
pub fn query_tokens(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    let mut kind = Run::None;

    let mut flush = |current: &mut String, kind: Run| {
        let min = if kind == Run::Cjk { 2 } else { 3 };
        if kind != Run::None && current.chars().count() >= min {
            tokens.insert(current.to_lowercase());
        }
        current.clear();
    };

    for c in text.chars() {
        let next = if is_cjk(c) {
            Run::Cjk
        } else if c.is_alphanumeric() {
            Run::Latin
        } else {
            Run::None
        };
        if next != kind {
            flush(&mut current, kind);
            kind = next;
        }
        if next != Run::None {
            current.push(c);
        }
    }
    flush(&mut current, kind);

    tokens
}

/// Score a page against query tokens.
///
/// +2 per keyword equal to a token, +1 per (token, keyword) pair where one
/// contains the other; then, only if that is positive, +1 for high
/// significance and +0.5 while FRESH.
pub fn score_page(page: &Page, tokens: &BTreeSet<String>) -> f32 {
    let keywords: Vec<String> = page.keywords.iter().map(|k| name_key(k)).collect();

    let mut score = 0.0;
    for keyword in keywords.iter().filter(|k| !k.is_empty()) {
        if tokens.contains(keyword) {
            score += 2.0;
        }
        for token in tokens {
            if token != keyword && (token.contains(keyword.as_str()) || keyword.contains(token.as_str())) {
                score += 1.0;
            }
        }
    }

    if score > 0.0 {
        if page.significance == Significance::High {
            score += 1.0;
        }
        if page.compression_level == CompressionLevel::Fresh {
            score += 0.5;
        }
    }
    score
}

/// Result of the keyword tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSelection {
    pub pages: Vec<PageId>,
    pub characters: Vec<String>,
}

/// Pick up to `max_pages` pages and `max_characters` dossiers for `recent`.
pub fn fallback(
    store: &MemoryStore,
    recent: &str,
    max_pages: usize,
    max_characters: usize,
) -> KeywordSelection {
    let tokens = query_tokens(recent);
    if tokens.is_empty() {
        return KeywordSelection::default();
    }

    let mut scored: Vec<(f32, &Page)> = store
        .retrievable_pages()
        .map(|page| (score_page(page, &tokens), page))
        .filter(|(score, _)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(max_pages);

    let mut characters: Vec<String> = Vec::new();
    let from_pages = scored.iter().flat_map(|(_, page)| page.characters.iter());
    let named = store
        .characters()
        .iter()
        .filter(|c| tokens.contains(&name_key(&c.name)))
        .map(|c| &c.name);
    for name in from_pages.chain(named) {
        if characters.len() >= max_characters {
            break;
        }
        let Some(dossier) = store.find_character(name) else {
            continue;
        };
        if !characters.iter().any(|c| name_key(c) == name_key(&dossier.name)) {
            characters.push(dossier.name.clone());
        }
    }

    KeywordSelection {
        pages: scored.into_iter().map(|(_, page)| page.id.clone()).collect(),
        characters,
    }
}
