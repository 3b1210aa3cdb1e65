//! Testing utilities.
//!
//! - [`ScriptedGateway`] replays queued replies instead of calling a model
//! - [`HashEmbedder`] produces deterministic bag-of-words vectors

use crate::gateway::{EmbeddingGateway, GatewayError, TextGateway, ToolCall, ToolTurn};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Tools(ToolTurn),
    Failure(String),
}

/// A prompt the gateway received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrompt {
    pub system: String,
    pub user: String,
}

/// A text gateway that returns queued replies in order.
///
/// Text replies answer `generate`, tool replies answer `generate_with_tools`.
/// An empty queue or a mismatched reply is reported as a gateway error.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<RecordedPrompt>>,
    tool_sets: Mutex<Vec<Vec<claude::Tool>>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        lock(&self.replies).push_back(ScriptedReply::Text(text.into()));
        self
    }

    pub fn push_tools(&self, calls: Vec<ToolCall>) -> &Self {
        lock(&self.replies).push_back(ScriptedReply::Tools(ToolTurn {
            content: String::new(),
            tool_calls: calls,
        }));
        self
    }

    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        lock(&self.replies).push_back(ScriptedReply::Failure(message.into()));
        self
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        lock(&self.prompts).clone()
    }

    /// Tool definitions passed to each tool-enabled call.
    pub fn tool_sets(&self) -> Vec<Vec<claude::Tool>> {
        lock(&self.tool_sets).clone()
    }

    /// Number of calls made.
    pub fn calls(&self) -> usize {
        lock(&self.prompts).len()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    fn next(&self, system: &str, user: &str) -> Option<ScriptedReply> {
        lock(&self.prompts).push(RecordedPrompt {
            system: system.to_string(),
            user: user.to_string(),
        });
        lock(&self.replies).pop_front()
    }
}

#[async_trait]
impl TextGateway for ScriptedGateway {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        _max_tokens: usize,
    ) -> Result<String, GatewayError> {
        match self.next(system, user) {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Failure(message)) => Err(GatewayError::Unavailable(message)),
            Some(ScriptedReply::Tools(_)) => Err(GatewayError::Malformed(
                "scripted tool reply for a text call".to_string(),
            )),
            None => Err(GatewayError::Unavailable("script exhausted".to_string())),
        }
    }

    async fn generate_with_tools(
        &self,
        prompt: &str,
        tools: &[claude::Tool],
        _max_tokens: usize,
    ) -> Result<ToolTurn, GatewayError> {
        lock(&self.tool_sets).push(tools.to_vec());
        match self.next("", prompt) {
            Some(ScriptedReply::Tools(turn)) => Ok(turn),
            Some(ScriptedReply::Text(text)) => Ok(ToolTurn {
                content: text,
                tool_calls: Vec::new(),
            }),
            Some(ScriptedReply::Failure(message)) => Err(GatewayError::Unavailable(message)),
            None => Err(GatewayError::Unavailable("script exhausted".to_string())),
        }
    }
}

/// Deterministic embedder: hashed bag of lowercase words, L2-normalized.
///
/// Texts sharing words score high under cosine similarity.
#[derive(Debug)]
pub struct HashEmbedder {
    dimension: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Make every following call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let slot = (hasher.finish() % self.dimension as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingGateway for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("embedder switched off".to_string()));
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let gateway = ScriptedGateway::new();
        gateway.push_text("one").push_failure("down");

        assert_eq!(gateway.generate("s", "u1", 10).await.unwrap(), "one");
        assert!(gateway.generate("s", "u2", 10).await.is_err());
        assert!(gateway.generate("s", "u3", 10).await.is_err());
        assert_eq!(gateway.calls(), 3);
        assert_eq!(gateway.prompts()[1].user, "u2");
    }

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.vector("the harbor burned");
        assert_eq!(a, embedder.vector("The HARBOR burned"));
        assert!(cosine_similarity(&a, &embedder.vector("harbor burned")) > 0.7);
    }
}
