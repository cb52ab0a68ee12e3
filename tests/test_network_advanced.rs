use anyhow::Result;
use bytes::Bytes;
use chainmesh::network::peer::{self, PeerEvent};
use chainmesh::sentence::{Info, Sentence, WantBlocks};
use chainmesh::{ChainNode, Message, MessageType, NodeConfig, PeerAddress};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

async fn start_node(seeds: &[SocketAddr]) -> ChainNode {
    let mut builder = ChainNode::builder().host("127.0.0.1").port(0);
    for seed in seeds {
        builder = builder.peer(seed.to_string());
    }
    let mut node = builder.build().unwrap();
    node.start().await.unwrap();
    node
}

fn metadata(name: &str) -> Map<String, Value> {
    json!({ "name": name }).as_object().unwrap().clone()
}

async fn height(node: &ChainNode, chain_id: &str) -> u64 {
    node.ledger()
        .repository()
        .get_height(chain_id)
        .await
        .unwrap()
}

async fn wait_for_height(node: &ChainNode, chain_id: &str, expected: u64) -> bool {
    wait_for_height_within(node, chain_id, expected, Duration::from_secs(10)).await
}

async fn wait_for_height_within(
    node: &ChainNode,
    chain_id: &str,
    expected: u64,
    budget: Duration,
) -> bool {
    let rounds = budget.as_millis() / 100;
    for _ in 0..rounds {
        if height(node, chain_id).await == expected {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn head_hash(node: &ChainNode, chain_id: &str) -> String {
    let chain = node.ledger().load(chain_id).await.unwrap().unwrap();
    let height = chain.height().await.unwrap();
    chain.get_block(height - 1).await.unwrap().unwrap().hash
}

/// Count unsolicited messages until `expected` arrived or the channel ends
async fn count_messages(mut events: mpsc::UnboundedReceiver<PeerEvent>, expected: usize) -> usize {
    let mut count = 0;
    while count < expected {
        match events.recv().await {
            Some(PeerEvent::Message(_, message)) => {
                assert_eq!(message.content["data"].as_str().map(str::len), Some(1024 * 1024));
                count += 1;
            },
            Some(_) => {},
            None => break,
        }
    }
    count
}

async fn wait_for_peers(node: &ChainNode, expected: usize) -> bool {
    for _ in 0..100 {
        if node.list_peers().await.len() == expected {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_handshake_syncs_missing_blocks() -> Result<()> {
    let mut b = start_node(&[]).await;
    let info = b.create_chain(metadata("b")).await?;
    let chain_id = info["chain_id"].as_str().unwrap().to_string();
    b.create_blocks(Some(&chain_id), 4, 64).await?;
    assert_eq!(height(&b, &chain_id).await, 5);

    // A knows only the genesis block
    let mut a = ChainNode::builder()
        .host("127.0.0.1")
        .port(0)
        .peer(b.local_addr().unwrap().to_string())
        .build()?;
    let genesis = b.ledger().load(&chain_id).await?.unwrap().get_block(0).await?.unwrap();
    assert!(a.ledger().accept_block(&genesis).await?);
    a.start().await?;

    assert!(wait_for_height(&a, &chain_id, 5).await);
    let head = |node: &ChainNode| {
        let node_ledger = node.ledger().clone();
        let chain_id = chain_id.clone();
        async move {
            node_ledger
                .load(&chain_id)
                .await
                .unwrap()
                .unwrap()
                .get_block(4)
                .await
                .unwrap()
                .unwrap()
                .hash
        }
    };
    assert_eq!(head(&a).await, head(&b).await);

    let peers = a.list_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].port, b.local_addr().unwrap().port());

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_new_block_floods_the_network() -> Result<()> {
    let mut a = start_node(&[]).await;
    let mut b = start_node(&[a.local_addr().unwrap()]).await;
    let mut c = start_node(&[b.local_addr().unwrap()]).await;

    assert!(wait_for_peers(&a, 1).await);
    assert!(wait_for_peers(&b, 2).await);
    assert!(wait_for_peers(&c, 1).await);

    let info = a.create_chain(metadata("a")).await?;
    let chain_id = info["chain_id"].as_str().unwrap().to_string();
    a.create_block(Some(&chain_id), b"hello".to_vec()).await?;

    assert!(wait_for_height(&b, &chain_id, 2).await);
    assert!(wait_for_height(&c, &chain_id, 2).await);

    // Replicas stay read-only
    let replica = c.ledger().load(&chain_id).await?.unwrap();
    assert!(!replica.is_owner());
    assert_eq!(replica.get_block(1).await?.unwrap().payload, b"hello".to_vec());

    a.create_block(Some(&chain_id), b"again".to_vec()).await?;
    assert!(wait_for_height(&c, &chain_id, 3).await);

    c.stop().await?;
    b.stop().await?;
    a.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_want_blocks_for_missing_chain_gets_error() -> Result<()> {
    let mut node = start_node(&[]).await;
    let (events, mut rx) = mpsc::unbounded_channel();
    let target = PeerAddress::new("127.0.0.1", node.local_addr().unwrap().port());
    let handle = peer::connect(target, 100, events, Duration::from_secs(5));

    match timeout(Duration::from_secs(5), rx.recv()).await? {
        Some(PeerEvent::Connected(_)) => {},
        other => panic!("expected connection, got {:?}", other),
    }

    let question = Sentence::from(WantBlocks {
        chain_id: "missing".to_string(),
        from: 0,
        to: 3,
    })
    .question();
    let mut answers = handle
        .ask(question, |message| message.kind == MessageType::Error || message.content["end"] == json!(true))
        .await?;
    let answer = answers.next_within(Duration::from_secs(5)).await?.unwrap();

    assert_eq!(answer.kind, MessageType::Error);
    match Sentence::from_message(&answer) {
        Some(Sentence::Error(error)) => assert_eq!(error.code, 404),
        other => panic!("expected error sentence, got {:?}", other),
    }

    handle.close();
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_garbage_frames_do_not_close_the_connection() -> Result<()> {
    let mut node = start_node(&[]).await;
    let stream = TcpStream::connect(node.local_addr().unwrap()).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    framed.send(Bytes::from_static(b"\x00\x01garbage")).await?;
    framed
        .send(Bytes::from_static(br#"{"identifier":"x","type":"question","content":{"type":"mystery"}}"#))
        .await?;

    let hello = Sentence::from(Info {
        version: "0.1".to_string(),
        peers: 0,
        chains: BTreeMap::new(),
        platform: json!({}),
        full_node: true,
    })
    .question();
    framed.send(Bytes::from(hello.dump()?)).await?;

    let frame = timeout(Duration::from_secs(5), framed.next()).await?.unwrap()?;
    let answer = Message::load(&frame).unwrap();
    assert_eq!(answer.identifier, hello.identifier);
    assert!(matches!(Sentence::from_message(&answer), Some(Sentence::Info(_))));

    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_seed_is_dropped_after_retries() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let dead = listener.local_addr()?;
    drop(listener);

    let mut node = ChainNode::builder()
        .host("127.0.0.1")
        .port(0)
        .retry(0)
        .peer(dead.to_string())
        .build()?;
    node.start().await?;

    let repository = node.ledger().repository().clone();
    let mut rank = 100;
    for _ in 0..50 {
        rank = repository.get_peer("127.0.0.1").await?.map(|p| p.rank).unwrap_or(100);
        if rank < 100 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(rank, 99);
    assert!(node.list_peers().await.is_empty());

    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_both_sides_streaming_at_once() -> Result<()> {
    // Far more than the kernel buffers hold in each direction
    const MESSAGES: usize = 40;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let target = PeerAddress::new("127.0.0.1", listener.local_addr()?.port());
    let (client_events, client_rx) = mpsc::unbounded_channel();
    let (server_events, server_rx) = mpsc::unbounded_channel();

    let client = peer::connect(target, 100, client_events, Duration::from_secs(5));
    let (stream, remote) = listener.accept().await?;
    let server = peer::accept(stream, remote, server_events);

    let content = json!({"type": "blob", "data": "x".repeat(1024 * 1024)});
    for handle in [&client, &server] {
        for _ in 0..MESSAGES {
            handle
                .send(Message::new(MessageType::Broadcast, content.clone()), None)
                .await?;
        }
    }

    let (at_server, at_client) = timeout(Duration::from_secs(60), async {
        tokio::join!(
            count_messages(server_rx, MESSAGES),
            count_messages(client_rx, MESSAGES)
        )
    })
    .await?;
    assert_eq!(at_server, MESSAGES);
    assert_eq!(at_client, MESSAGES);
    assert!(!client.is_closed() && !server.is_closed());

    client.close();
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_sync_each_other_at_once() -> Result<()> {
    const BLOCKS: usize = 40;
    let config = NodeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        blocks_page_limit: 1024 * 1024,
        ..Default::default()
    };

    let mut a = ChainNode::builder().with_config(config.clone()).build()?;
    a.start().await?;
    let a_info = a.create_chain(metadata("a")).await?;
    let a_chain = a_info["chain_id"].as_str().unwrap().to_string();
    a.create_blocks(Some(&a_chain), BLOCKS, 512 * 1024).await?;

    // B holds its own chain before it dials A, so both ask at handshake
    let mut b = ChainNode::builder()
        .with_config(config)
        .peer(a.local_addr().unwrap().to_string())
        .build()?;
    let b_info = b.create_chain(metadata("b")).await?;
    let b_chain = b_info["chain_id"].as_str().unwrap().to_string();
    b.create_blocks(Some(&b_chain), BLOCKS, 512 * 1024).await?;
    b.start().await?;

    let expected = BLOCKS as u64 + 1;
    let budget = Duration::from_secs(60);
    assert!(wait_for_height_within(&b, &a_chain, expected, budget).await);
    assert!(wait_for_height_within(&a, &b_chain, expected, budget).await);
    assert_eq!(head_hash(&a, &b_chain).await, head_hash(&b, &b_chain).await);
    assert_eq!(head_hash(&b, &a_chain).await, head_hash(&a, &a_chain).await);

    b.stop().await?;
    a.stop().await?;
    Ok(())
}
