use chainmesh::sentence::{
    Blocks, ErrorSentence, Info, NewBlock, Peers, Sentence, WantBlocks, WantPeers,
};
use chainmesh::{Block, Message, MessageType, PeerRecord};
use serde_json::json;
use std::collections::BTreeMap;

fn block(height: u64) -> Block {
    Block {
        hash: format!("hash{}", height),
        prev_hash: if height == 0 { String::new() } else { format!("hash{}", height - 1) },
        time: 1_700_000_000 + height as i64,
        signature: "sig".to_string(),
        chain_id: "chain".to_string(),
        height,
        payload: vec![0, 159, 146, 150],
    }
}

fn samples() -> Vec<Sentence> {
    vec![
        Info {
            version: "0.1".to_string(),
            peers: 3,
            chains: BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 12)]),
            platform: json!({"os": "linux"}),
            full_node: true,
        }
        .into(),
        Info {
            version: "0.1".to_string(),
            peers: 0,
            chains: BTreeMap::new(),
            platform: json!({}),
            full_node: false,
        }
        .into(),
        ErrorSentence::new(404, "unknown chain").into(),
        WantPeers { count: 10 }.into(),
        Peers {
            peers: vec![PeerRecord::new("10.0.0.1", 32767)],
        }
        .into(),
        Peers { peers: Vec::new() }.into(),
        WantBlocks {
            chain_id: "chain".to_string(),
            from: 2,
            to: 9,
        }
        .into(),
        Blocks {
            blocks: vec![block(0), block(1)],
            end: false,
        }
        .into(),
        Blocks {
            blocks: Vec::new(),
            end: true,
        }
        .into(),
        NewBlock {
            chain_id: "chain".to_string(),
            height: 7,
        }
        .into(),
    ]
}

#[test]
fn test_sentences_survive_the_wire() {
    for sentence in samples() {
        let frame = sentence.question().dump().unwrap();
        let message = Message::load(&frame).unwrap();
        assert_eq!(Sentence::from_message(&message), Some(sentence));
    }
}

#[test]
fn test_type_tags() {
    for sentence in samples() {
        assert_eq!(sentence.dump()["type"], json!(sentence.kind()));
    }
}

#[test]
fn test_missing_or_unknown_fields_yield_none() {
    let cases = [
        json!({"type": "info", "version": "0.1", "peers": 1, "chains": {}, "platform": {}}),
        json!({"type": "error", "code": 500}),
        json!({"type": "want_peers"}),
        json!({"type": "peers", "peers": [{"address": "10.0.0.1"}]}),
        json!({"type": "want_blocks", "chain_id": "c", "from": 0}),
        json!({"type": "blocks", "blocks": []}),
        json!({"type": "blocks", "blocks": [{"hash": "h"}], "end": true}),
        json!({"type": "new_block", "height": 1}),
        json!({"type": "new_block", "chain_id": "c", "height": "one"}),
        json!({"type": "transaction", "payload": "x"}),
        json!({"chain_id": "c", "height": 1}),
    ];
    for content in cases {
        assert!(Sentence::load(&content).is_none(), "accepted {}", content);
    }
}

#[test]
fn test_peer_rank_is_optional_on_the_wire() {
    let content = json!({"type": "peers", "peers": [{"address": "10.0.0.1", "port": 80}]});
    let Some(Sentence::Peers(peers)) = Sentence::load(&content) else {
        panic!("peers sentence expected");
    };
    assert_eq!(peers.peers[0].rank, 100);
}

#[test]
fn test_answers_keep_the_question_identifier() {
    let question = Sentence::from(WantPeers { count: 1 }).question();
    assert_eq!(question.kind, MessageType::Question);

    let answer = Sentence::from(Peers { peers: Vec::new() }).answer_to(&question);
    assert_eq!(answer.identifier, question.identifier);
    assert_eq!(answer.kind, MessageType::Answer);

    let broadcast = Sentence::from(NewBlock {
        chain_id: "c".to_string(),
        height: 1,
    })
    .broadcast();
    assert_eq!(broadcast.kind, MessageType::Broadcast);
    assert_ne!(broadcast.identifier, question.identifier);
}
