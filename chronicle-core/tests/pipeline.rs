//! Full write/read cycles against on-disk persistence.

use async_trait::async_trait;
use chronicle_core::extract::SkipReason;
use chronicle_core::gateway::ToolCall;
use chronicle_core::{
    execute, Chronicle, ChronicleConfig, CompressionLevel, ConversationMessage, ExtractStatus,
    GatewayError, InMemoryPersistence, JsonDirPersistence, MemoryStore, Page, Persistence,
    ScriptedGateway, TextGateway, ToolTurn,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;

const EXTRACTION: &str = r#"Here is the memory update:
```json
{
  "timeline": ["D1: Aria and Kael reach Vell", "D1: Brannoc sells them a map"],
  "knownCharacterAttitudes": [{"name": "kael", "attitude": "wary of the map"}],
  "characters": [
    {"name": "Brannoc", "appearance": "scarred cartographer", "personality": "greedy", "attitude": "helpful for a price"},
    {"name": "Aria", "appearance": "the protagonist", "personality": "", "attitude": ""}
  ],
  "items": [{"name": "Map of the Deep Roads", "status": "held by Aria", "significance": "leads to the vault"}],
  "pages": [
    {"day": "Day 1", "title": "Gates of Vell", "content": "Aria and Kael reached Vell because the letter summoned them.", "keywords": ["vell", "letter", "gates"], "categories": ["discovery"], "significance": "medium", "sourceMessageIndices": [0]},
    {"day": "Day 1", "title": "The map deal", "content": "Brannoc sold the map for half their gold, so they are nearly broke.", "keywords": ["map", "Brannoc", "gold"], "categories": ["relationship"], "significance": "high", "sourceMessageIndices": [1]}
  ]
}
```"#;

fn conversation() -> Vec<ConversationMessage> {
    vec![
        ConversationMessage::new(0, "User", "We finally reach the gates of Vell."),
        ConversationMessage::new(1, "Narrator", "Brannoc offers a map for half your gold."),
    ]
}

#[tokio::test]
async fn test_extract_compress_persist_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = ChronicleConfig::new()
        .with_protagonist("Aria")
        .with_known_characters(["Kael"])
        .with_extract_every(2)
        .with_fresh_ceiling(1);

    let gateway = Arc::new(ScriptedGateway::new());
    gateway
        .push_text(EXTRACTION)
        .push_text("Aria and Kael reached Vell, summoned by a letter.");

    let chronicle = Chronicle::new(config.clone(), Arc::new(JsonDirPersistence::new(dir.path())))
        .with_text_gateway(gateway.clone());

    let report = chronicle.on_new_turn("campaign", &conversation()).await.unwrap();
    let ExtractStatus::Applied(extracted) = &report.extraction else {
        panic!("expected extraction, got {:?}", report.extraction);
    };
    assert_eq!(extracted.pages_added.len(), 2);
    assert_eq!(extracted.last_index, Some(1));
    let compression = report.compression.unwrap();
    assert_eq!(compression.summarized, vec![extracted.pages_added[0].clone()]);
    assert_eq!(gateway.remaining(), 0);

    let store = chronicle.snapshot("campaign").await.unwrap();
    assert_eq!(store.count_at(CompressionLevel::Fresh), 1);
    assert_eq!(store.count_at(CompressionLevel::Summary), 1);
    assert_eq!(store.timeline_lines().len(), 2);
    assert_eq!(store.known_attitudes()[0].name, "Kael");
    let npcs: Vec<&str> = store.characters().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(npcs, vec!["Brannoc"]);
    assert_eq!(store.items().len(), 1);
    let deal = store.page(&extracted.pages_added[1]).unwrap();
    assert_eq!(deal.characters, vec!["Brannoc".to_string()]);

    // Nothing new since the last extraction.
    let again = chronicle.on_new_turn("campaign", &conversation()).await.unwrap();
    assert_eq!(again.extraction, ExtractStatus::NotDue { pending: 0 });

    let reopened = Chronicle::new(config, Arc::new(JsonDirPersistence::new(dir.path())));
    assert_eq!(
        reopened.export("campaign").await.unwrap(),
        chronicle.export("campaign").await.unwrap()
    );

    let listing = execute(&reopened, "campaign", "/list-pages", &[]).await;
    assert!(listing.contains("SUMMARY"));
    assert!(listing.contains("FRESH"));

    let recall = reopened
        .recall(
            "campaign",
            3,
            &[ConversationMessage::new(2, "User", "Can Brannoc's map get us into the vault?")],
        )
        .await
        .unwrap();
    assert_eq!(recall.selection.page_ids(), vec![extracted.pages_added[1].clone()]);
    assert!(recall.injection.contains("## Characters"));
    assert!(recall.injection.contains("scarred cartographer"));

    let shown = execute(&reopened, "campaign", "show-last-recall", &[]).await;
    assert!(shown.starts_with("Turn 3:"));
    assert!(shown.contains("The map deal"));
}

/// Which calls a [`GatedGateway`] holds.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    Text,
    Tools,
}

/// Holds every gated call until released.
struct GatedGateway {
    inner: ScriptedGateway,
    gate: Gate,
    entered: Notify,
    release: Notify,
}

impl GatedGateway {
    fn new(inner: ScriptedGateway, gate: Gate) -> Self {
        Self {
            inner,
            gate,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    async fn wait_if(&self, gate: Gate) {
        if self.gate == gate {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl TextGateway for GatedGateway {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
    ) -> Result<String, GatewayError> {
        self.wait_if(Gate::Text).await;
        self.inner.generate(system, user, max_tokens).await
    }

    async fn generate_with_tools(
        &self,
        prompt: &str,
        tools: &[claude::Tool],
        max_tokens: usize,
    ) -> Result<ToolTurn, GatewayError> {
        self.wait_if(Gate::Tools).await;
        self.inner.generate_with_tools(prompt, tools, max_tokens).await
    }
}

#[tokio::test]
async fn test_reads_and_duplicate_extractions_do_not_wait_on_writer() {
    let inner = ScriptedGateway::new();
    inner.push_text(EXTRACTION);
    let gateway = Arc::new(GatedGateway::new(inner, Gate::Text));
    let config = ChronicleConfig::new()
        .with_protagonist("Aria")
        .with_auto_compress(false);
    let chronicle = Arc::new(
        Chronicle::new(config, Arc::new(InMemoryPersistence::new()))
            .with_text_gateway(gateway.clone()),
    );

    let writer = {
        let chronicle = chronicle.clone();
        tokio::spawn(async move { chronicle.force_extract("k", &conversation()).await })
    };
    gateway.entered.notified().await;

    // A second extraction is skipped, not queued.
    let duplicate = chronicle.force_extract("k", &conversation()).await.unwrap();
    assert_eq!(duplicate.extraction, ExtractStatus::Skipped(SkipReason::InProgress));

    // A recall reads the last snapshot while the writer holds the store.
    // Nothing is stored yet, so no model call is made.
    let recall = chronicle
        .recall("k", 1, &[ConversationMessage::new(2, "User", "What about the map?")])
        .await
        .unwrap();
    assert!(recall.selection.is_empty());

    gateway.release.notify_one();
    let written = writer.await.unwrap().unwrap();
    assert!(matches!(written.extraction, ExtractStatus::Applied(_)));
    assert!(written.compression.is_none());

    // The deferred recall-log write lands once the writer is done.
    let mut logged = false;
    for _ in 0..1000 {
        if chronicle.snapshot("k").await.unwrap().last_recall().is_some() {
            logged = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(logged);
    let store = chronicle.snapshot("k").await.unwrap();
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.last_recall().map(|(turn, ids)| (turn, ids.len())), Some((1, 0)));
}

#[tokio::test]
async fn test_page_archived_during_recall_is_not_logged() {
    let mut store = MemoryStore::new();
    let base = Utc::now() - Duration::hours(1);
    let old = store.add_page(
        Page::new("Day 1", "Old deal", "Brannoc sold the map because he needed gold.")
            .with_keywords(["map"])
            .with_created_at(base),
    );
    let newer = store.add_page(
        Page::new("Day 2", "The vault", "The vault opened because the map was true.")
            .with_keywords(["vault"])
            .with_created_at(base + Duration::minutes(5)),
    );
    for id in [&old, &newer] {
        store.summarize_page(id, "Summarized.".to_string(), Utc::now());
    }
    let persistence = Arc::new(InMemoryPersistence::new());
    persistence.save("k", &store).await.unwrap();

    let inner = ScriptedGateway::new();
    inner.push_tools(vec![ToolCall::new("fetch_page", json!({"page_id": old.as_str()}))]);
    let gateway = Arc::new(GatedGateway::new(inner, Gate::Tools));
    let config = ChronicleConfig::new().with_summary_ceiling(1);
    let chronicle = Arc::new(
        Chronicle::new(config, persistence).with_text_gateway(gateway.clone()),
    );

    // The recall selects from the snapshot taken before compression runs.
    let recall = {
        let chronicle = chronicle.clone();
        tokio::spawn(async move {
            let turn = [ConversationMessage::new(0, "User", "What about the map?")];
            chronicle.recall("k", 1, &turn).await
        })
    };
    gateway.entered.notified().await;

    let report = chronicle.compress("k", true).await.unwrap();
    assert_eq!(report.archived, vec![old.clone()]);

    gateway.release.notify_one();
    let recall = recall.await.unwrap().unwrap();
    assert_eq!(recall.selection.page_ids(), vec![old.clone()]);

    let store = chronicle.snapshot("k").await.unwrap();
    assert!(store.page(&old).is_none());
    assert_eq!(store.last_recall().map(|(turn, ids)| (turn, ids.len())), Some((1, 0)));
    assert!(store.dangling_recall_ids().is_empty());
}
