//! Versioned conversation memory.
//!
//! One [`MemoryStore`] exists per conversation key. It is mutated only by the
//! extraction and compression engines, read through snapshots by the
//! retrieval tiers, and replaced wholesale on reset or import.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MemoryStore                           │
//! │                                                              │
//! │  timeline (line-bounded)     knownCharacterAttitudes         │
//! │  characters (NPC dossiers)   items                           │
//! │                                                              │
//! │  pages: FRESH ──compress──▶ SUMMARY ──archive──▶ (deleted)   │
//! │  embeddings[pageId]          recallLog[turn] → [pageId]      │
//! │  processing {lastExtractedIndex, inProgress}                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod character;
mod memory;
mod page;

pub use character::{name_key, Item, KnownCharacterAttitude, NpcDossier, Roster};
pub use memory::{MemoryStore, ProcessingState, CURRENT_VERSION};
pub use page::{Category, CompressionLevel, Page, PageId, Significance};
