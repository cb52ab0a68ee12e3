//! Wire envelope

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Question,
    Answer,
    Error,
    Broadcast,
}

/// `{identifier, type, content}` envelope carried in each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation token; answers reuse the question's identifier
    pub identifier: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: Value,
}

impl Message {
    /// Create a message with a fresh random identifier
    pub fn new(kind: MessageType, content: Value) -> Self {
        Self::with_identifier(new_identifier(), kind, content)
    }

    pub fn with_identifier(identifier: impl Into<String>, kind: MessageType, content: Value) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            content,
        }
    }

    /// Parse a frame; anything that is not a well-formed envelope is `None`
    pub fn load(frame: &[u8]) -> Option<Self> {
        let message: Message = serde_json::from_slice(frame).ok()?;
        if !message.content.is_object() {
            return None;
        }
        Some(message)
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Random correlation token
pub fn new_identifier() -> String {
    Uuid::new_v4().simple().to_string()
}
