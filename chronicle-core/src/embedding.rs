//! Optional semantic pre-filter over pages.
//!
//! Vectors live in the store's `embeddings` cache, one per retrievable page.
//! The cache is pruned and topped up after every write-side change; the read
//! side never mutates it.

use crate::gateway::{EmbeddingGateway, GatewayError};
use crate::store::{MemoryStore, Page, PageId};
use std::sync::Arc;

/// Cosine similarity. Zero for empty, mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Embedding-backed candidate ranking.
#[derive(Clone)]
pub struct EmbeddingIndex {
    gateway: Arc<dyn EmbeddingGateway>,
}

impl EmbeddingIndex {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>) -> Self {
        Self { gateway }
    }

    pub fn dimension(&self) -> usize {
        self.gateway.dimension()
    }

    /// Drop stale vectors and embed every retrievable page that lacks one.
    /// Returns how many pages were embedded.
    pub async fn sync(&self, store: &mut MemoryStore) -> Result<usize, GatewayError> {
        let pruned = store.prune_embeddings();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale embeddings");
        }

        let missing: Vec<(PageId, String)> = store
            .pages_missing_embeddings()
            .into_iter()
            .map(|p| (p.id.clone(), p.embedding_text()))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = missing.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.gateway.embed(&texts).await?;
        if vectors.len() != missing.len() {
            return Err(GatewayError::Malformed(format!(
                "expected {} vectors, got {}",
                missing.len(),
                vectors.len()
            )));
        }

        let mut stored = 0;
        for ((id, _), vector) in missing.into_iter().zip(vectors) {
            if store.set_embedding(&id, vector) {
                stored += 1;
            }
        }
        tracing::debug!(embedded = stored, "embedding cache updated");
        Ok(stored)
    }

    /// Recompute one page's vector after its text changed.
    pub async fn refresh_page(
        &self,
        store: &mut MemoryStore,
        id: &PageId,
    ) -> Result<bool, GatewayError> {
        let Some(text) = store
            .page(id)
            .filter(|p| p.is_retrievable())
            .map(Page::embedding_text)
        else {
            return Ok(false);
        };
        let vector = self
            .gateway
            .embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Malformed("no vector returned".to_string()))?;
        Ok(store.set_embedding(id, vector))
    }

    /// The `top_k` cached pages most similar to `query`.
    ///
    /// `None` means no pre-filter is available (empty cache, failed call or
    /// nothing scored); callers then use the full catalog.
    pub async fn pre_filter(
        &self,
        store: &MemoryStore,
        query: &str,
        top_k: usize,
    ) -> Option<Vec<Page>> {
        if store.embeddings().is_empty() || query.trim().is_empty() || top_k == 0 {
            return None;
        }

        let query_vector = match self.gateway.embed(&[query.to_string()]).await {
            Ok(vectors) => vectors.into_iter().next()?,
            Err(e) => {
                tracing::warn!(error = %e, "embedding pre-filter unavailable");
                return None;
            }
        };

        let mut scored: Vec<(f32, &Page)> = store
            .retrievable_pages()
            .filter_map(|page| {
                let vector = store.embeddings().get(&page.id)?;
                Some((cosine_similarity(&query_vector, vector), page))
            })
            .collect();
        if scored.is_empty() {
            return None;
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Some(
            scored
                .into_iter()
                .take(top_k)
                .map(|(_, page)| page.clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbedder;
    use chrono::Utc;

    fn page(title: &str, keywords: &[&str], content: &str) -> Page {
        Page::new("Day 1", title, content).with_keywords(keywords.iter().copied())
    }

    fn store_with_pages() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_page(page("Harbor", &["harbor", "ships"], "The harbor burned at night."));
        store.add_page(page("Orchard", &["apples", "orchard"], "Apples rotted in the orchard."));
        store.add_page(page("Forge", &["forge", "sword"], "The smith hammered a sword."));
        store
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_sync_embeds_and_prunes() {
        let embedder = Arc::new(HashEmbedder::new(64));
        let index = EmbeddingIndex::new(embedder.clone());
        let mut store = store_with_pages();

        assert_eq!(index.sync(&mut store).await.unwrap(), 3);
        assert_eq!(store.embeddings().len(), 3);
        assert_eq!(index.sync(&mut store).await.unwrap(), 0);

        let first = store.pages()[0].id.clone();
        store.archive_page(&first, Utc::now());
        assert_eq!(index.sync(&mut store).await.unwrap(), 0);
        assert_eq!(store.embeddings().len(), 2);
    }

    #[tokio::test]
    async fn test_pre_filter_ranks_by_similarity() {
        let index = EmbeddingIndex::new(Arc::new(HashEmbedder::new(128)));
        let mut store = store_with_pages();
        index.sync(&mut store).await.unwrap();

        let top = index
            .pre_filter(&store, "the orchard apples", 1)
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].title, "Orchard");
    }

    #[tokio::test]
    async fn test_pre_filter_is_none_when_unavailable() {
        let embedder = Arc::new(HashEmbedder::new(32));
        let index = EmbeddingIndex::new(embedder.clone());
        let mut store = store_with_pages();

        assert!(index.pre_filter(&store, "harbor", 2).await.is_none());

        index.sync(&mut store).await.unwrap();
        embedder.set_failing(true);
        assert!(index.pre_filter(&store, "harbor", 2).await.is_none());
    }
}
