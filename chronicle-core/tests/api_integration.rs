//! Integration tests against the live Claude and Voyage APIs.
//!
//! Run with: cargo test -p chronicle-core --test api_integration -- --ignored

use chronicle_core::{
    Chronicle, ChronicleConfig, ConversationMessage, ExtractStatus, InMemoryPersistence,
};
use std::sync::Arc;

fn setup() {
    let _ = dotenvy::dotenv();
}

fn has_api_key() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok()
}

fn conversation() -> Vec<ConversationMessage> {
    [
        ("User", "Aria and Kael finally reach the gates of Vell at dusk."),
        ("Narrator", "A scarred cartographer named Brannoc waits by the gate, offering a map of the Deep Roads."),
        ("User", "Aria pays him half their gold for the map, even though Kael objects."),
        ("Narrator", "Brannoc grins and warns them that the vault below the city is guarded by the Ash Order."),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (speaker, text))| ConversationMessage::new(i, speaker, text))
    .collect()
}

#[tokio::test]
#[ignore]
async fn test_live_extract_then_recall() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let config = ChronicleConfig::new()
        .with_protagonist("Aria")
        .with_known_characters(["Kael"]);
    let chronicle = Chronicle::from_env(config, Arc::new(InMemoryPersistence::new()))
        .expect("Failed to create chronicle");

    let history = conversation();
    let report = chronicle
        .on_new_turn("live", &history)
        .await
        .expect("Turn failed");
    let ExtractStatus::Applied(extracted) = &report.extraction else {
        panic!("Extraction did not apply: {:?}", report.extraction);
    };
    println!("Extracted {} page(s)", extracted.pages_added.len());
    assert!(!extracted.pages_added.is_empty());

    let store = chronicle.snapshot("live").await.unwrap();
    assert!(!store.timeline().is_empty());
    assert!(store.characters().iter().all(|c| c.name != "Aria"));

    let question = ConversationMessage::new(4, "User", "What did Brannoc say about the vault?");
    let recall = chronicle
        .recall("live", 5, &[question])
        .await
        .expect("Recall failed");
    println!("Tier: {:?}\n{}", recall.selection.tier, recall.injection);
    assert!(recall.selection.pages.len() <= chronicle.config().max_pages);
    assert!(recall.selection.characters.len() <= chronicle.config().character_cap());
}

#[tokio::test]
#[ignore]
async fn test_live_forced_compression() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let config = ChronicleConfig::new()
        .with_protagonist("Aria")
        .with_fresh_ceiling(0)
        .with_auto_compress(false);
    let chronicle = Chronicle::from_env(config, Arc::new(InMemoryPersistence::new()))
        .expect("Failed to create chronicle");

    chronicle
        .force_extract("live", &conversation())
        .await
        .expect("Extraction failed");
    let before = chronicle.snapshot("live").await.unwrap().page_count();

    let report = chronicle.compress("live", true).await.expect("Compression failed");
    println!("{report:?}");
    assert_eq!(report.summarized.len() + report.summary_failures, before);
}
