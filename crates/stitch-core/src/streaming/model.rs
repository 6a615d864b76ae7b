//! Streamed model calls
//!
//! Provider adapters implement [`Model`]: they push [`ModelChunk`]s into the
//! given sender while generating and resolve with the full response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

use super::bridge::{ChunkSender, StreamingBridge, StreamingResponse};
use crate::application::context::{FlowContext, FlowResult};
use crate::CoreError;

/// Request to a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    /// Model identifier, if the adapter serves several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// System instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// User prompt
    pub prompt: String,

    /// Output token limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ModelRequest {
    /// Request with just a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the system instructions
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// One increment of generated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChunk {
    /// Text delta
    pub text: String,
}

impl ModelChunk {
    /// Chunk carrying `text`
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Complete model response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    /// Generated text
    pub text: String,

    /// Model that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Structured output, if the adapter parsed any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A chunk-emitting model
#[async_trait]
pub trait Model: Send + Sync {
    /// Adapter name
    fn name(&self) -> &str;

    /// Generate a response, sending chunks to `sink` as they are produced
    async fn generate(
        &self,
        request: ModelRequest,
        sink: ChunkSender<ModelChunk>,
    ) -> Result<ModelResponse, CoreError>;
}

/// Call `model`, forwarding its chunks to `sink`. A response without text
/// gets the concatenated chunk texts.
pub async fn collect_response(
    model: &dyn Model,
    request: ModelRequest,
    sink: ChunkSender<ModelChunk>,
) -> Result<ModelResponse, CoreError> {
    let collected = Arc::new(Mutex::new(String::new()));
    let tee = {
        let collected = collected.clone();
        ChunkSender::new(move |chunk: ModelChunk| {
            collected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(&chunk.text);
            sink.send(chunk)
        })
    };

    let mut response = model.generate(request, tee).await?;
    if response.text.is_empty() {
        response.text = collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
    }
    if response.model.is_none() {
        response.model = Some(model.name().to_string());
    }
    Ok(response)
}

/// Stream a model call: chunks in emission order, then the aggregated
/// response
pub async fn generate_stream(
    model: Arc<dyn Model>,
    request: ModelRequest,
) -> Result<StreamingResponse<ModelChunk, ModelResponse>, CoreError> {
    StreamingBridge::start(move |sink: ChunkSender<ModelChunk>| async move {
        collect_response(model.as_ref(), request, sink).await
    })
    .await
}

impl FlowContext {
    /// Memoized model call. Chunks are forwarded to the run's streaming
    /// reader, if any, as JSON values.
    pub async fn generate(
        &mut self,
        name: &str,
        model: Arc<dyn Model>,
        request: ModelRequest,
    ) -> FlowResult<ModelResponse> {
        let sink = match self.chunk_sender() {
            Some(chunks) => chunks.map(|chunk: ModelChunk| {
                serde_json::to_value(&chunk).unwrap_or(Value::Null)
            }),
            None => ChunkSender::discard(),
        };
        self.run_step(name, move || async move {
            collect_response(model.as_ref(), request, sink).await
        })
        .await
    }
}

/// Deterministic model that streams the prompt back word by word
#[cfg(feature = "testing")]
#[derive(Debug, Default, Clone)]
pub struct EchoModel;

#[cfg(feature = "testing")]
#[async_trait]
impl Model for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        request: ModelRequest,
        sink: ChunkSender<ModelChunk>,
    ) -> Result<ModelResponse, CoreError> {
        if request.prompt.is_empty() {
            return Err(CoreError::ValidationError("prompt is empty".to_string()));
        }
        for (i, word) in request.prompt.split_whitespace().enumerate() {
            let text = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            sink.send(ModelChunk::text(text));
            tokio::task::yield_now().await;
        }
        Ok(ModelResponse {
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        })
    }
}
