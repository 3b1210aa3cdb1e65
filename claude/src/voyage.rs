//! Voyage AI embeddings client.

use crate::{env_key, http_client, Error};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

const VOYAGE_API_BASE: &str = "https://api.voyageai.com/v1";

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "voyage-3.5";

/// Output dimensionality requested when none is configured.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;

/// Embeddings client with a fixed model and output dimension.
#[derive(Clone)]
pub struct Voyage {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
}

impl Voyage {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            base_url: VOYAGE_API_BASE.to_string(),
        }
    }

    /// Create a client from the VOYAGE_API_KEY environment variable.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(env_key("VOYAGE_API_KEY")?))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a batch of texts. Vectors come back in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );

        let body = EmbedRequest {
            input: texts,
            model: &self.model,
            output_dimension: self.dimension,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        order_embeddings(parsed, texts.len(), self.dimension)
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
    model: &'a str,
    output_dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
    index: usize,
}

fn order_embeddings(
    response: EmbedResponse,
    expected: usize,
    dimension: usize,
) -> Result<Vec<Vec<f32>>, Error> {
    if response.data.len() != expected {
        return Err(Error::Parse(format!(
            "expected {expected} embeddings, got {}",
            response.data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for datum in response.data {
        if datum.embedding.len() != dimension {
            return Err(Error::Parse(format!(
                "embedding has dimension {}, expected {dimension}",
                datum.embedding.len()
            )));
        }
        match slots.get_mut(datum.index) {
            Some(slot @ None) => *slot = Some(datum.embedding),
            _ => return Err(Error::Parse(format!("bad embedding index {}", datum.index))),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| Error::Parse("missing embedding".to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(data: Vec<(usize, Vec<f32>)>) -> EmbedResponse {
        EmbedResponse {
            data: data
                .into_iter()
                .map(|(index, embedding)| EmbedDatum { embedding, index })
                .collect(),
        }
    }

    #[test]
    fn test_embeddings_are_reordered_by_index() {
        let ordered =
            order_embeddings(response(vec![(1, vec![0.0, 1.0]), (0, vec![1.0, 0.0])]), 2, 2)
                .unwrap();
        assert_eq!(ordered, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_count_and_dimension_mismatches_are_rejected() {
        assert!(order_embeddings(response(vec![(0, vec![1.0, 0.0])]), 2, 2).is_err());
        assert!(order_embeddings(response(vec![(0, vec![1.0])]), 1, 2).is_err());
        assert!(
            order_embeddings(response(vec![(0, vec![1.0, 0.0]), (0, vec![0.0, 1.0])]), 2, 2)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_empty_batch_skips_the_network() {
        let client = Voyage::new("unused").with_base_url("http://127.0.0.1:1");
        assert!(client.embed(&[]).await.unwrap().is_empty());
    }
}
