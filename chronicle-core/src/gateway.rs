//! Seams to the external model services.
//!
//! The engines only see these traits. [`claude::Claude`] and
//! [`claude::Voyage`] implement them for real use; the `testing` module has
//! scripted implementations.

use async_trait::async_trait;
use claude::{Claude, Message, Request, ToolChoice, Voyage};
use serde_json::Value;
use thiserror::Error;

/// A failed call to either gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model service error: {0}")]
    Service(#[from] claude::Error),

    #[error("malformed gateway reply: {0}")]
    Malformed(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// One tool call issued by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Reply to a tool-enabled generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Text generation, with and without tools.
#[async_trait]
pub trait TextGateway: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
    ) -> Result<String, GatewayError>;

    async fn generate_with_tools(
        &self,
        prompt: &str,
        tools: &[claude::Tool],
        max_tokens: usize,
    ) -> Result<ToolTurn, GatewayError>;
}

/// Batch text embeddings of a fixed dimension.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    fn dimension(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

#[async_trait]
impl TextGateway for Claude {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
    ) -> Result<String, GatewayError> {
        let request = Request::new(vec![Message::user(user)])
            .with_system(system)
            .with_max_tokens(max_tokens);
        let response = self.complete(request).await?;
        Ok(response.text())
    }

    async fn generate_with_tools(
        &self,
        prompt: &str,
        tools: &[claude::Tool],
        max_tokens: usize,
    ) -> Result<ToolTurn, GatewayError> {
        let request = Request::new(vec![Message::user(prompt)])
            .with_max_tokens(max_tokens)
            .with_tools(tools.to_vec())
            .with_tool_choice(ToolChoice::Auto);
        let response = self.complete(request).await?;

        Ok(ToolTurn {
            content: response.text(),
            tool_calls: response
                .tool_uses()
                .into_iter()
                .map(|call| ToolCall::new(call.name, call.input))
                .collect(),
        })
    }
}

#[async_trait]
impl EmbeddingGateway for Voyage {
    fn dimension(&self) -> usize {
        Voyage::dimension(self)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        Ok(Voyage::embed(self, texts).await?)
    }
}
