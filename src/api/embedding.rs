//! Embedding API

use crate::api::chat::Usage;
use serde::{Deserialize, Serialize};

/// Embedding input: one string or a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,

    pub input: EmbeddingInput,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

impl EmbeddingRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            model: String::new(),
            input: EmbeddingInput::Single(input.into()),
            dimensions: None,
        }
    }

    pub fn batch<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model: String::new(),
            input: EmbeddingInput::Batch(inputs.into_iter().map(Into::into).collect()),
            dimensions: None,
        }
    }

    pub fn for_model(&self, model_id: &str) -> Self {
        let mut request = self.clone();
        request.model = model_id.to_string();
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub index: u32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub data: Vec<Embedding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_response_without_completion_tokens() {
        let json = r#"{
            "object": "list",
            "model": "text-embedding-3-small",
            "data": [{ "object": "embedding", "index": 0, "embedding": [0.1, -0.2] }],
            "usage": { "prompt_tokens": 4, "total_tokens": 4 }
        }"#;

        let response: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.data[0].embedding.len(), 2);
        assert_eq!(response.usage.unwrap().completion_tokens, 0);
    }

    #[test]
    fn test_batch_serializes_as_array() {
        let request = EmbeddingRequest::batch(["a", "b"]).for_model("m");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"], serde_json::json!(["a", "b"]));
        assert_eq!(json["model"], "m");
    }
}
