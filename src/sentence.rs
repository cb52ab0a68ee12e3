//! Typed protocol sentences carried in [`Message`] content

use crate::chain::Block;
use crate::network::{Message, MessageType, PeerRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Handshake summary of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub version: String,
    /// Number of peers the node knows about
    pub peers: u64,
    /// chain id → height
    pub chains: BTreeMap<String, u64>,
    pub platform: Value,
    pub full_node: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSentence {
    pub code: u16,
    pub desc: String,
}

impl ErrorSentence {
    pub fn new(code: u16, desc: impl Into<String>) -> Self {
        Self {
            code,
            desc: desc.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantPeers {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    pub peers: Vec<PeerRecord>,
}

/// Request for the inclusive height range `from..=to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantBlocks {
    pub chain_id: String,
    pub from: u64,
    pub to: u64,
}

/// One page of a block transfer; `end` marks the last page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocks {
    pub blocks: Vec<Block>,
    pub end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlock {
    pub chain_id: String,
    pub height: u64,
}

/// Closed set of protocol payloads, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sentence {
    Info(Info),
    Error(ErrorSentence),
    WantPeers(WantPeers),
    Peers(Peers),
    WantBlocks(WantBlocks),
    Blocks(Blocks),
    NewBlock(NewBlock),
}

impl Sentence {
    /// Interpret message content; unknown or malformed content is `None`
    pub fn load(content: &Value) -> Option<Self> {
        Sentence::deserialize(content).ok()
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        Self::load(&message.content)
    }

    pub fn dump(&self) -> Value {
        // Every variant is a plain struct with string keys
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Wire name of the sentence type
    pub fn kind(&self) -> &'static str {
        match self {
            Sentence::Info(_) => "info",
            Sentence::Error(_) => "error",
            Sentence::WantPeers(_) => "want_peers",
            Sentence::Peers(_) => "peers",
            Sentence::WantBlocks(_) => "want_blocks",
            Sentence::Blocks(_) => "blocks",
            Sentence::NewBlock(_) => "new_block",
        }
    }

    /// Wrap as a new question
    pub fn question(&self) -> Message {
        Message::new(MessageType::Question, self.dump())
    }

    /// Wrap as an answer correlated with `question`
    pub fn answer_to(&self, question: &Message) -> Message {
        let kind = match self {
            Sentence::Error(_) => MessageType::Error,
            _ => MessageType::Answer,
        };
        Message::with_identifier(question.identifier.clone(), kind, self.dump())
    }

    /// Wrap as a broadcast with a fresh identifier
    pub fn broadcast(&self) -> Message {
        Message::new(MessageType::Broadcast, self.dump())
    }
}

macro_rules! impl_from_sentence {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Sentence {
                fn from(value: $ty) -> Self {
                    Sentence::$variant(value)
                }
            }
        )*
    };
}

impl_from_sentence! {
    Info => Info,
    Error => ErrorSentence,
    WantPeers => WantPeers,
    Peers => Peers,
    WantBlocks => WantBlocks,
    Blocks => Blocks,
    NewBlock => NewBlock,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let want = Sentence::from(WantBlocks {
            chain_id: "abc".into(),
            from: 0,
            to: 4,
        });
        assert_eq!(
            want.dump(),
            json!({"type": "want_blocks", "chain_id": "abc", "from": 0, "to": 4})
        );

        let info = Sentence::from(Info {
            version: "0.1".into(),
            peers: 2,
            chains: BTreeMap::from([("abc".to_string(), 5)]),
            platform: json!({"os": "linux"}),
            full_node: true,
        });
        assert_eq!(info.dump()["chains"], json!({"abc": 5}));
        assert_eq!(info.kind(), "info");
    }

    #[test]
    fn test_error_answers_use_error_type() {
        let question = Sentence::from(WantPeers { count: 3 }).question();
        let answer = Sentence::from(ErrorSentence::new(404, "unknown chain")).answer_to(&question);

        assert_eq!(answer.identifier, question.identifier);
        assert_eq!(answer.kind, MessageType::Error);
    }

    #[test]
    fn test_load_is_total() {
        assert!(Sentence::load(&json!({})).is_none());
        assert!(Sentence::load(&json!({"type": "transaction"})).is_none());
        assert!(Sentence::load(&json!({"type": "want_blocks", "chain_id": "a", "from": 1})).is_none());
        assert!(Sentence::load(&json!({"type": "new_block", "chain_id": "a", "height": -1})).is_none());
        assert!(Sentence::load(&json!("info")).is_none());
    }
}
