//! The `Chronicle` facade: one bounded memory per conversation key.
//!
//! Each key gets a slot holding the live store behind a single-writer lock,
//! a `watch` channel publishing the last committed snapshot, and an
//! extraction flag. Writers (extraction, compression, reset, import) take the
//! lock; retrieval reads the snapshot and never waits on a running writer.
//! A second extraction while one is running is skipped, not queued.

use crate::archive::{ArchiveError, ArchiveTransport, Locator};
use crate::compress::{CompressionReport, Compressor};
use crate::config::ChronicleConfig;
use crate::embedding::EmbeddingIndex;
use crate::extract::{
    BackfillReport, ConversationMessage, ExtractError, ExtractOutcome, ExtractReport, Extractor,
    FailureTracker, Notice, SkipReason,
};
use crate::gateway::{EmbeddingGateway, GatewayError, TextGateway};
use crate::migrate::{migrate, MigrationError};
use crate::persist::{Checkpoint, PersistError, Persistence, SaveCheckpoint};
use crate::retrieval::{render_injection, Retriever, Selection};
use crate::store::MemoryStore;
use async_trait::async_trait;
use claude::{Claude, Voyage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OnceCell};

/// Errors from facade operations.
#[derive(Debug, Error)]
pub enum ChronicleError {
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("no text generation gateway configured")]
    NoTextGateway,

    #[error("no archive transport configured")]
    NoArchive,
}

/// How the extraction step of a turn went.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractStatus {
    /// Fewer unprocessed messages than the interval requires.
    NotDue { pending: usize },
    Skipped(SkipReason),
    Applied(ExtractReport),
    /// The batch failed; the store is unchanged.
    Failed(String),
    NoGateway,
}

/// Result of a write-side turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub extraction: ExtractStatus,
    pub compression: Option<CompressionReport>,
    pub notice: Option<Notice>,
}

impl TurnReport {
    fn status(extraction: ExtractStatus) -> Self {
        Self {
            extraction,
            compression: None,
            notice: None,
        }
    }
}

/// Result of a read-side turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Recall {
    pub selection: Selection,
    /// Context block for the generator. Empty when nothing is known yet.
    pub injection: String,
}

struct Slot {
    store: Mutex<MemoryStore>,
    snapshot: watch::Sender<Arc<MemoryStore>>,
    extracting: AtomicBool,
    failures: std::sync::Mutex<FailureTracker>,
}

impl Slot {
    fn new(store: MemoryStore, warn_threshold: u32) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(store.clone()));
        Self {
            store: Mutex::new(store),
            snapshot,
            extracting: AtomicBool::new(false),
            failures: std::sync::Mutex::new(FailureTracker::new(warn_threshold)),
        }
    }

    fn current(&self) -> Arc<MemoryStore> {
        self.snapshot.borrow().clone()
    }

    fn with_failures<T>(&self, f: impl FnOnce(&mut FailureTracker) -> T) -> T {
        let mut tracker = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut tracker)
    }
}

/// Clears the extraction flag when dropped.
struct ExtractingGuard<'a>(&'a AtomicBool);

impl<'a> ExtractingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ExtractingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Saves the store and publishes it as the new snapshot.
struct SlotCheckpoint<'a> {
    save: SaveCheckpoint<'a>,
    snapshot: &'a watch::Sender<Arc<MemoryStore>>,
}

#[async_trait]
impl Checkpoint for SlotCheckpoint<'_> {
    async fn checkpoint(&self, store: &MemoryStore) {
        self.save.checkpoint(store).await;
        self.snapshot.send_replace(Arc::new(store.clone()));
    }
}

/// Messages after the last extracted index.
fn pending(store: &MemoryStore, messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
    let last = store.processing().last_extracted_index;
    messages
        .iter()
        .filter(|m| last.map_or(true, |l| m.index > l))
        .cloned()
        .collect()
}

/// Bounded conversation memory across many conversation keys.
pub struct Chronicle {
    config: ChronicleConfig,
    text: Option<Arc<dyn TextGateway>>,
    index: Option<EmbeddingIndex>,
    persistence: Arc<dyn Persistence>,
    archive: Option<Arc<dyn ArchiveTransport>>,
    slots: std::sync::Mutex<HashMap<String, Arc<OnceCell<Arc<Slot>>>>>,
}

impl Chronicle {
    /// A chronicle with no gateways: keyword retrieval and archiving only.
    pub fn new(config: ChronicleConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            text: None,
            index: None,
            persistence,
            archive: None,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Text gateway from ANTHROPIC_API_KEY; embeddings from VOYAGE_API_KEY when set.
    pub fn from_env(
        config: ChronicleConfig,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, ChronicleError> {
        let claude = Claude::from_env().map_err(GatewayError::from)?;
        let chronicle = Self::new(config, persistence).with_text_gateway(Arc::new(claude));
        match Voyage::from_env() {
            Ok(voyage) => Ok(chronicle.with_embedding_gateway(Arc::new(voyage))),
            Err(_) => {
                tracing::info!("VOYAGE_API_KEY not set, embedding pre-filter disabled");
                Ok(chronicle)
            }
        }
    }

    pub fn with_text_gateway(mut self, gateway: Arc<dyn TextGateway>) -> Self {
        self.text = Some(gateway);
        self
    }

    pub fn with_embedding_gateway(mut self, gateway: Arc<dyn EmbeddingGateway>) -> Self {
        self.index = Some(EmbeddingIndex::new(gateway));
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveTransport>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &ChronicleConfig {
        &self.config
    }

    async fn slot(&self, key: &str) -> Result<Arc<Slot>, ChronicleError> {
        // The map lock only covers the lookup; loading one key never blocks
        // another. Concurrent first uses of the same key share one load.
        let cell = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        let slot = cell
            .get_or_try_init(|| async {
                let store = self.load(key).await?;
                Ok::<_, ChronicleError>(Arc::new(Slot::new(
                    store,
                    self.config.failure_warn_threshold,
                )))
            })
            .await?;
        Ok(slot.clone())
    }

    /// Load, migrate and repair a store the first time a key is seen.
    async fn load(&self, key: &str) -> Result<MemoryStore, ChronicleError> {
        let Some(raw) = self.persistence.load(key).await? else {
            tracing::debug!(key = %key, "starting empty store");
            return Ok(MemoryStore::new());
        };

        let migrated = migrate(raw, &self.config.roster())?;
        let mut dirty = migrated.changed();
        if dirty {
            tracing::info!(key = %key, from = migrated.from_version, "migrated store");
        }
        let mut store = migrated.store;
        if store.processing().in_progress {
            tracing::warn!(key = %key, "clearing stale extraction guard");
            store.finish_processing(None);
            dirty = true;
        }
        if dirty {
            self.persistence.save(key, &store).await?;
        }
        Ok(store)
    }

    fn checkpoint<'a>(&'a self, key: &'a str, slot: &'a Slot) -> SlotCheckpoint<'a> {
        SlotCheckpoint {
            save: SaveCheckpoint::new(self.persistence.as_ref(), key),
            snapshot: &slot.snapshot,
        }
    }

    /// The last committed state of a key's store.
    pub async fn snapshot(&self, key: &str) -> Result<Arc<MemoryStore>, ChronicleError> {
        Ok(self.slot(key).await?.current())
    }

    /// Follow committed snapshots of a key's store.
    pub async fn subscribe(
        &self,
        key: &str,
    ) -> Result<watch::Receiver<Arc<MemoryStore>>, ChronicleError> {
        Ok(self.slot(key).await?.snapshot.subscribe())
    }

    /// Write side of a turn: extract once enough new messages have piled up.
    ///
    /// `messages` is the conversation so far (or its tail); indices at or
    /// below the last extracted one are ignored.
    pub async fn on_new_turn(
        &self,
        key: &str,
        messages: &[ConversationMessage],
    ) -> Result<TurnReport, ChronicleError> {
        let slot = self.slot(key).await?;
        let batch = pending(&slot.current(), messages);
        if batch.len() < self.config.extract_every.max(1) {
            return Ok(TurnReport::status(ExtractStatus::NotDue {
                pending: batch.len(),
            }));
        }
        self.run_extraction(key, &slot, &batch).await
    }

    /// Extract every unprocessed message now, ignoring the interval.
    pub async fn force_extract(
        &self,
        key: &str,
        messages: &[ConversationMessage],
    ) -> Result<TurnReport, ChronicleError> {
        let slot = self.slot(key).await?;
        let batch = pending(&slot.current(), messages);
        self.run_extraction(key, &slot, &batch).await
    }

    async fn run_extraction(
        &self,
        key: &str,
        slot: &Slot,
        batch: &[ConversationMessage],
    ) -> Result<TurnReport, ChronicleError> {
        let Some(gateway) = self.text.as_deref() else {
            return Ok(TurnReport::status(ExtractStatus::NoGateway));
        };
        if batch.is_empty() {
            return Ok(TurnReport::status(ExtractStatus::Skipped(SkipReason::NothingNew)));
        }
        let Some(_guard) = ExtractingGuard::acquire(&slot.extracting) else {
            tracing::debug!(key = %key, "extraction already running, skipping");
            return Ok(TurnReport::status(ExtractStatus::Skipped(SkipReason::InProgress)));
        };

        let mut store = slot.store.lock().await;
        let checkpoint = self.checkpoint(key, slot);
        let outcome = Extractor::new(gateway, &self.config)
            .extract(&mut store, batch, &checkpoint)
            .await;

        match outcome {
            Ok(ExtractOutcome::Skipped(reason)) => {
                Ok(TurnReport::status(ExtractStatus::Skipped(reason)))
            }
            Ok(ExtractOutcome::Applied(report)) => {
                slot.with_failures(FailureTracker::record_success);
                let compression = self.after_write(&mut store, &checkpoint).await;
                Ok(TurnReport {
                    extraction: ExtractStatus::Applied(report),
                    compression,
                    notice: None,
                })
            }
            Err(e) => {
                let notice = slot.with_failures(|tracker| tracker.record_failure(&e));
                Ok(TurnReport {
                    extraction: ExtractStatus::Failed(e.to_string()),
                    compression: None,
                    notice,
                })
            }
        }
    }

    /// Embed new pages, then run an automatic compression cycle.
    async fn after_write(
        &self,
        store: &mut MemoryStore,
        checkpoint: &dyn Checkpoint,
    ) -> Option<CompressionReport> {
        self.sync_embeddings(store, checkpoint).await;

        let mut compressor = Compressor::new(&self.config).with_index(self.index.as_ref());
        if let Some(gateway) = self.text.as_deref() {
            compressor = compressor.with_gateway(gateway);
        }
        let report = compressor.run_cycle(store, false, checkpoint).await;
        (!report.skipped).then_some(report)
    }

    async fn sync_embeddings(&self, store: &mut MemoryStore, checkpoint: &dyn Checkpoint) {
        let Some(index) = &self.index else {
            return;
        };
        match index.sync(store).await {
            Ok(0) => {}
            Ok(_) => checkpoint.checkpoint(store).await,
            Err(e) => tracing::warn!(error = %e, "embedding sync failed"),
        }
    }

    /// Rebuild memory from history: reference material first, then chunks.
    pub async fn backfill(
        &self,
        key: &str,
        reference: Option<&str>,
        history: &[ConversationMessage],
    ) -> Result<BackfillReport, ChronicleError> {
        let gateway = self.text.as_deref().ok_or(ChronicleError::NoTextGateway)?;
        let slot = self.slot(key).await?;
        let Some(_guard) = ExtractingGuard::acquire(&slot.extracting) else {
            return Ok(BackfillReport {
                interrupted: true,
                ..BackfillReport::default()
            });
        };

        let mut store = slot.store.lock().await;
        let checkpoint = self.checkpoint(key, &slot);
        let result = Extractor::new(gateway, &self.config)
            .backfill(&mut store, reference, history, &checkpoint)
            .await;
        // Chunks merged before a failure are kept, so follow-up work runs either way.
        self.after_write(&mut store, &checkpoint).await;
        Ok(result?)
    }

    /// Run a compression cycle now. `force` ignores the automatic switch.
    pub async fn compress(&self, key: &str, force: bool) -> Result<CompressionReport, ChronicleError> {
        let slot = self.slot(key).await?;
        let mut store = slot.store.lock().await;
        let checkpoint = self.checkpoint(key, &slot);

        let mut compressor = Compressor::new(&self.config).with_index(self.index.as_ref());
        if let Some(gateway) = self.text.as_deref() {
            compressor = compressor.with_gateway(gateway);
        }
        let report = compressor.run_cycle(&mut store, force, &checkpoint).await;
        self.sync_embeddings(&mut store, &checkpoint).await;
        Ok(report)
    }

    /// Read side of a turn: select memory and render the injection block.
    ///
    /// The selection is recorded in the recall log under `turn`.
    pub async fn recall(
        &self,
        key: &str,
        turn: u64,
        messages: &[ConversationMessage],
    ) -> Result<Recall, ChronicleError> {
        let slot = self.slot(key).await?;
        let store = slot.current();

        let selection = Retriever::new(&self.config)
            .with_gateway(self.text.as_deref())
            .with_index(self.index.as_ref())
            .retrieve(&store, messages)
            .await;
        let injection = render_injection(&store, &selection);
        tracing::debug!(
            key = %key,
            turn,
            tier = ?selection.tier,
            pages = selection.pages.len(),
            "recalled"
        );

        self.log_recall(key, slot, turn, selection.page_ids()).await;
        Ok(Recall {
            selection,
            injection,
        })
    }

    /// Record a recall without waiting behind a running writer.
    async fn log_recall(&self, key: &str, slot: Arc<Slot>, turn: u64, pages: Vec<crate::store::PageId>) {
        let limit = self.config.recall_log_limit;
        if let Ok(mut store) = slot.store.try_lock() {
            store.record_recall(turn, pages, limit);
            self.checkpoint(key, &slot).checkpoint(&store).await;
            return;
        }

        let persistence = self.persistence.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut store = slot.store.lock().await;
            store.record_recall(turn, pages, limit);
            let checkpoint = SlotCheckpoint {
                save: SaveCheckpoint::new(persistence.as_ref(), &key),
                snapshot: &slot.snapshot,
            };
            checkpoint.checkpoint(&store).await;
        });
    }

    /// Replace a key's store with an empty one and drop its persisted document.
    pub async fn reset(&self, key: &str) -> Result<(), ChronicleError> {
        let slot = self.slot(key).await?;
        let mut store = slot.store.lock().await;
        *store = MemoryStore::new();
        self.persistence.delete(key).await?;
        slot.snapshot.send_replace(Arc::new(store.clone()));
        tracing::info!(key = %key, "store reset");
        Ok(())
    }

    /// The store as a JSON document in the persisted layout.
    pub async fn export(&self, key: &str) -> Result<Value, ChronicleError> {
        let store = self.snapshot(key).await?;
        Ok(serde_json::to_value(store.as_ref())?)
    }

    /// Replace a key's store with an external document, migrating it first.
    /// Returns the version the document was written at.
    pub async fn import(&self, key: &str, document: Value) -> Result<u32, ChronicleError> {
        let migrated = migrate(document, &self.config.roster())?;
        let from_version = migrated.from_version;
        let mut imported = migrated.store;
        if imported.processing().in_progress {
            imported.finish_processing(None);
        }

        let slot = self.slot(key).await?;
        let mut store = slot.store.lock().await;
        *store = imported;
        self.persistence.save(key, &store).await?;
        slot.snapshot.send_replace(Arc::new(store.clone()));
        tracing::info!(key = %key, from_version, "store imported");
        Ok(from_version)
    }

    /// Upload the current store to the archive under `slot`.
    pub async fn archive(&self, key: &str, slot: &str) -> Result<Locator, ChronicleError> {
        let archive = self.archive.as_ref().ok_or(ChronicleError::NoArchive)?;
        let document = self.export(key).await?;
        let locator = archive
            .upload(slot, serde_json::to_vec_pretty(&document)?)
            .await?;
        tracing::info!(key = %key, locator = %locator, "store archived");
        Ok(locator)
    }

    /// Replace a key's store with an archived copy. Returns the version the
    /// copy was written at.
    pub async fn restore(&self, key: &str, locator: &Locator) -> Result<u32, ChronicleError> {
        let archive = self.archive.as_ref().ok_or(ChronicleError::NoArchive)?;
        let blob = archive.fetch(locator).await?;
        let document: Value = serde_json::from_slice(&blob)?;
        self.import(key, document).await
    }
}
