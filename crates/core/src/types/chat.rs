use serde::{Deserialize, Serialize};

// =============================================================================
// Chat Completions Payload
// =============================================================================

/// Chat Completions request body, as sent by OpenAI-compatible SDKs.
///
/// Only the fields the gateway inspects are typed; the original bytes are what
/// gets forwarded upstream, so unknown fields survive untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    /// Parse and validate a raw request body.
    pub fn from_slice(body: &[u8]) -> crate::Result<Self> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| crate::Error::invalid_request(format!("malformed chat completion body: {}", e)))?;
        if request.model.trim().is_empty() {
            return Err(crate::Error::invalid_request("model must not be empty"));
        }
        if request.messages.is_empty() {
            return Err(crate::Error::invalid_request("messages must not be empty"));
        }
        Ok(request)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Text of every message, one entry per message, in payload order.
    pub fn message_texts(&self) -> Vec<String> {
        self.messages.iter().map(ChatMessage::text).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    /// Inspectable text of this message. Array content joins its text parts.
    pub fn text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Message content is either a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}
