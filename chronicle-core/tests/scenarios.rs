//! End-to-end retrieval and compression scenarios with scripted gateways.

use chronicle_core::gateway::ToolCall;
use chronicle_core::persist::NoCheckpoint;
use chronicle_core::retrieval::{recent_text, Retriever, Tier};
use chronicle_core::{
    Category, Chronicle, ChronicleConfig, CompressionLevel, Compressor, ConversationMessage,
    EmbeddingIndex, HashEmbedder, InMemoryPersistence, MemoryStore, NpcDossier, Page, PageId,
    Persistence, Roster, ScriptedGateway,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// Scenario A: keyword fallback with no generation gateway
// =============================================================================

#[tokio::test]
async fn test_keyword_fallback_without_gateway() {
    let mut store = MemoryStore::new();
    store.set_timeline("D1: A met B");
    store.replace_characters(
        vec![NpcDossier::new("B").with_attitude("treacherous")],
        &Roster::new("A", Vec::new()),
    );
    let betrayal = store.add_page(
        Page::new("Day 1", "The betrayal", "B betrayed A at the river because of an old debt.")
            .with_keywords(["betrayal", "B", "river"])
            .with_characters(["B"])
            .with_categories([Category::Conflict]),
    );

    let persistence = Arc::new(InMemoryPersistence::new());
    persistence.save("chat", &store).await.unwrap();
    let chronicle = Chronicle::new(ChronicleConfig::default(), persistence);

    let turn = [ConversationMessage::new(
        1,
        "User",
        "I still can't forgive the betrayal. Where is B now?",
    )];
    let recall = chronicle.recall("chat", 1, &turn).await.unwrap();

    assert_eq!(recall.selection.tier, Tier::Keyword);
    assert_eq!(recall.selection.page_ids(), vec![betrayal]);
    assert_eq!(recall.selection.characters[0].name, "B");
    assert!(recall.injection.contains("D1: A met B"));
    assert!(recall.injection.contains("old debt"));
}

// =============================================================================
// Scenario B: ceiling + 3 FRESH pages
// =============================================================================

#[tokio::test]
async fn test_compression_takes_exactly_the_oldest_excess() {
    let ceiling = 5;
    let config = ChronicleConfig::new().with_fresh_ceiling(ceiling);
    let gateway = ScriptedGateway::new();
    for i in 0..3 {
        gateway.push_text(format!("Summary of event {i}."));
    }

    let mut store = MemoryStore::new();
    let base = Utc::now() - Duration::hours(1);
    // Inserted out of order: age, not position, decides.
    let mut ids: Vec<(i64, PageId)> = [7, 2, 0, 5, 1, 3, 6, 4]
        .into_iter()
        .map(|minute| {
            let id = store.add_page(
                Page::new("Day 1", format!("Event {minute}"), format!("Event {minute} happened for a reason."))
                    .with_keywords([format!("event{minute}")])
                    .with_created_at(base + Duration::minutes(minute)),
            );
            (minute, id)
        })
        .collect();
    ids.sort_by_key(|(minute, _)| *minute);
    assert_eq!(store.count_at(CompressionLevel::Fresh), ceiling + 3);

    let report = Compressor::new(&config)
        .with_gateway(&gateway)
        .run_cycle(&mut store, false, &NoCheckpoint)
        .await;

    let oldest: Vec<PageId> = ids[..3].iter().map(|(_, id)| id.clone()).collect();
    assert_eq!(report.summarized, oldest);
    for (minute, id) in &ids {
        let expected = if *minute < 3 {
            CompressionLevel::Summary
        } else {
            CompressionLevel::Fresh
        };
        assert_eq!(store.page(id).unwrap().compression_level, expected);
    }
    assert_eq!(store.count_at(CompressionLevel::Fresh), ceiling);
    assert_eq!(gateway.remaining(), 0);

    // A second cycle at the ceiling does nothing.
    let again = Compressor::new(&config)
        .with_gateway(&gateway)
        .run_cycle(&mut store, false, &NoCheckpoint)
        .await;
    assert!(!again.changed());
}

// =============================================================================
// Scenario C: pre-filter restricts the agent's choices
// =============================================================================

#[tokio::test]
async fn test_prefilter_restricts_agent_choices() {
    let mut store = MemoryStore::new();
    for (title, keywords, content) in [
        ("Harbor fire", ["harbor", "fire"], "The harbor burned after the smugglers fled."),
        ("Orchard", ["orchard", "apples"], "Mirel hid the apples in the orchard cellar."),
        ("Forge", ["forge", "sword"], "Oska reforged the broken sword at dawn."),
        ("Crypt", ["crypt", "bones"], "Bones lined the crypt beneath the chapel."),
    ] {
        store.add_page(Page::new("Day 2", title, content).with_keywords(keywords));
    }

    let index = EmbeddingIndex::new(Arc::new(HashEmbedder::new(512)));
    assert_eq!(index.sync(&mut store).await.unwrap(), 4);

    let messages = [ConversationMessage::new(
        4,
        "User",
        "Smoke from the harbor fire drifted over the orchard apples.",
    )];
    let config = ChronicleConfig::new().with_embedding_top_k(2);
    let query = recent_text(&messages, config.recall_window);
    let expected: BTreeSet<String> = index
        .pre_filter(&store, &query, 2)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id.to_string())
        .collect();
    assert_eq!(expected.len(), 2);

    let inside = PageId::from_raw(expected.iter().next().unwrap().clone());
    let outside = store
        .pages()
        .iter()
        .map(|p| p.id.clone())
        .find(|id| !expected.contains(id.as_str()))
        .unwrap();

    let gateway = ScriptedGateway::new();
    gateway.push_tools(vec![
        ToolCall::new("fetch_page", json!({"page_id": outside.as_str()})),
        ToolCall::new("fetch_page", json!({"page_id": inside.as_str()})),
    ]);

    let selection = Retriever::new(&config)
        .with_gateway(Some(&gateway))
        .with_index(Some(&index))
        .retrieve(&store, &messages)
        .await;

    let tools = &gateway.tool_sets()[0];
    let fetch = tools.iter().find(|t| t.name == "fetch_page").unwrap();
    let offered: BTreeSet<String> = fetch.input_schema["properties"]["page_id"]["enum"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(offered, expected);

    assert!(selection.prefiltered);
    assert_eq!(selection.tier, Tier::Agent);
    assert_eq!(selection.page_ids(), vec![inside]);
}

// =============================================================================
// Caps hold across tiers
// =============================================================================

#[tokio::test]
async fn test_caps_hold_in_every_tier() {
    let mut store = MemoryStore::new();
    let names = ["Brannoc", "Mirel", "Oska", "Tavi"];
    store.replace_characters(names.iter().map(|n| NpcDossier::new(*n)).collect(), &Roster::default());
    for i in 0..6 {
        store.add_page(
            Page::new("Day 1", format!("Raid {i}"), "The raid on the granary went badly.")
                .with_keywords(["raid", "granary"])
                .with_characters(names),
        );
    }
    let config = ChronicleConfig::default();
    let turn = [ConversationMessage::new(0, "User", "Tell me about the raid on the granary")];

    let keyword = Retriever::new(&config).retrieve(&store, &turn).await;
    assert_eq!(keyword.tier, Tier::Keyword);
    assert_eq!(keyword.pages.len(), config.max_pages);
    assert_eq!(keyword.characters.len(), 2);

    let gateway = ScriptedGateway::new();
    let mut calls: Vec<ToolCall> = store
        .pages()
        .iter()
        .map(|p| ToolCall::new("fetch_page", json!({"page_id": p.id.as_str()})))
        .collect();
    calls.extend(names.iter().map(|n| ToolCall::new("fetch_character", json!({"name": n}))));
    gateway.push_tools(calls);

    let agent = Retriever::new(&config)
        .with_gateway(Some(&gateway))
        .retrieve(&store, &turn)
        .await;
    assert_eq!(agent.tier, Tier::Agent);
    assert_eq!(agent.pages.len(), config.max_pages);
    assert_eq!(agent.characters.len(), 2);
}
