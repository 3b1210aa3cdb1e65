//! Bounded, self-compressing memory for long-running conversations.
//!
//! This crate provides:
//! - A versioned, self-migrating memory store per conversation key
//! - Extraction of pages, characters, items and a timeline from new messages
//! - Progressive compression (FRESH → SUMMARY → archived) to keep memory bounded
//! - Tiered retrieval: embedding pre-filter, tool-directed agent, keyword fallback
//! - A text command surface for inspection and manual control
//!
//! # Quick Start
//!
//! ```ignore
//! use chronicle_core::{Chronicle, ChronicleConfig, ConversationMessage, JsonDirPersistence};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChronicleConfig::new()
//!         .with_protagonist("Aria")
//!         .with_known_characters(["Kael"]);
//!     let chronicle = Chronicle::from_env(config, Arc::new(JsonDirPersistence::new("memory")))?;
//!
//!     let history = vec![ConversationMessage::new(0, "User", "We reach the gates of Vell.")];
//!     let recall = chronicle.recall("chat-1", 1, &history).await?;
//!     println!("{}", recall.injection);
//!
//!     chronicle.on_new_turn("chat-1", &history).await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod chronicle;
pub mod commands;
pub mod compress;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod gateway;
pub mod migrate;
pub mod parser;
pub mod persist;
pub mod prompts;
pub mod retrieval;
pub mod store;
pub mod testing;

// Re-export for convenience
pub use chronicle_macros::Tool;

// Primary public API
pub use archive::{ArchiveError, ArchiveTransport, DirArchive, InMemoryArchive, Locator};
pub use chronicle::{Chronicle, ChronicleError, ExtractStatus, Recall, TurnReport};
pub use commands::{execute, Command};
pub use compress::{CompressError, CompressionReport, Compressor};
pub use config::{ChronicleConfig, CHARACTER_CAP};
pub use embedding::{cosine_similarity, EmbeddingIndex};
pub use extract::{
    BackfillReport, ConversationMessage, ExtractError, ExtractOutcome, ExtractReport, Extractor,
    FailureTracker, Notice, ParsedExtraction,
};
pub use gateway::{EmbeddingGateway, GatewayError, TextGateway, ToolCall, ToolTurn};
pub use migrate::{migrate, MigrationError};
pub use parser::ParseFailure;
pub use persist::{
    Checkpoint, InMemoryPersistence, JsonDirPersistence, NoCheckpoint, PersistError, Persistence,
};
pub use retrieval::{render_injection, Retriever, Selection, Tier};
pub use store::{
    Category, CompressionLevel, Item, KnownCharacterAttitude, MemoryStore, NpcDossier, Page,
    PageId, Roster, Significance,
};
pub use testing::{HashEmbedder, ScriptedGateway};
