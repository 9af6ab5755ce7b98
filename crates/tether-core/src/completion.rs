//! OpenAI-compatible request and response shapes.

use serde::{Deserialize, Serialize};

use crate::ids::CorrelationId;
use crate::wire::InboundMessage;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl ChatCompletion {
    /// Build the completion object for a successful unary response.
    /// The upstream only reports burned tokens, counted as completion tokens.
    pub fn from_response(id: &CorrelationId, model: &str, response: &InboundMessage) -> Self {
        let burned = response.tokens_burned.unwrap_or(0);
        Self {
            id: id.to_string(),
            object: "chat.completion".into(),
            created: now_unix(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content: response.payload.clone(),
                },
                finish_reason: None,
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: burned,
                total_tokens: burned,
            },
        }
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    pub content: String,
}

impl ChatCompletionChunk {
    pub fn new(id: &CorrelationId, model: &str, content: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".into(),
            created: now_unix(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    content: content.into(),
                },
                finish_reason: None,
            }],
        }
    }
}

/// Entry in the `/v1/models` listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn new(data: Vec<ModelCard>) -> Self {
        Self {
            object: "list".into(),
            data,
        }
    }
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::InboundKind;

    #[test]
    fn completion_from_response() {
        let id = CorrelationId::from_raw("r1");
        let msg = InboundMessage {
            correlation_id: id.clone(),
            kind: InboundKind::FullResponse,
            status_code: Some(200),
            payload: "hi".into(),
            tokens_burned: Some(3),
        };
        let completion = ChatCompletion::from_response(&id, "gpt-4o", &msg);
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.content(), "hi");
        assert_eq!(completion.choices[0].message.role, "assistant");
        assert_eq!(completion.usage.completion_tokens, 3);
        assert_eq!(completion.usage.total_tokens, 3);
        assert_eq!(completion.usage.prompt_tokens, 0);
    }

    #[test]
    fn chunk_serializes_delta_content() {
        let chunk = ChatCompletionChunk::new(&CorrelationId::from_raw("r2"), "gpt-4o", "Hel");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "Hel");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn request_stream_defaults_false() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hello"}]}"#,
        )
        .unwrap();
        assert!(!req.stream);
        assert_eq!(req.messages.len(), 1);
    }
}
