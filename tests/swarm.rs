//! Multi-node end-to-end scenarios on loopback UDP.
//!
//! Covers the protocol's load-bearing behaviors: joining through a
//! bootstrapper, routing table convergence between persistent nodes, a
//! key/value protocol layered on application commands with a commit phase,
//! token forgery rejection, and request timeout accounting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kadence::{
    Commit, Error, Message, Node, NodeEvent, NodeId, NodeOptions, Peer, QueryOptions, Request,
    RequestOptions, CMD_APP_BASE, HEARTBEAT_INTERVAL, REQUEST_TIMEOUT, SLEEP_THRESHOLD,
    STATUS_INVALID_TOKEN, STATUS_OK, STATUS_UNKNOWN_COMMAND,
};
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{advance, sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// The application command of the toy key/value protocol.
const CMD_VALUES: u64 = CMD_APP_BASE;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn persistent_node(bootstrap: Vec<SocketAddr>) -> Node {
    let node = Node::new(NodeOptions {
        bind: Some(loopback()),
        bootstrap,
        ephemeral: Some(false),
        firewalled: Some(false),
        ..NodeOptions::default()
    })
    .await
    .expect("node starts");
    timeout(TEST_TIMEOUT, node.ready())
        .await
        .expect("ready in time")
        .expect("ready succeeds");
    node
}

async fn ephemeral_node(bootstrap: Vec<SocketAddr>) -> Node {
    let node = Node::new(NodeOptions {
        bind: Some(loopback()),
        bootstrap,
        ..NodeOptions::default()
    })
    .await
    .expect("node starts");
    timeout(TEST_TIMEOUT, node.ready())
        .await
        .expect("ready in time")
        .expect("ready succeeds");
    node
}

/// Serve the key/value command: lookups return the stored value, commits
/// (valid token) store, forged tokens are rejected.
fn serve_values(node: &Node) -> Arc<Mutex<HashMap<NodeId, Vec<u8>>>> {
    let store: Arc<Mutex<HashMap<NodeId, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut requests = node.requests().expect("requests receiver available");
    let handler_store = store.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            handle_values(request, &handler_store).await;
        }
    });
    store
}

async fn handle_values(request: Request, store: &Arc<Mutex<HashMap<NodeId, Vec<u8>>>>) {
    if request.command != CMD_VALUES {
        request.error(STATUS_UNKNOWN_COMMAND).await;
        return;
    }
    let Some(target) = request.target else {
        request.error(STATUS_UNKNOWN_COMMAND).await;
        return;
    };
    match (request.value.clone(), request.token) {
        // Store attempt with a proven round-trip.
        (Some(value), true) => {
            store.lock().unwrap().insert(target, value);
            request.reply(None).await;
        }
        // Store attempt without endpoint proof.
        (Some(_), false) => {
            request.error(STATUS_INVALID_TOKEN).await;
        }
        // Lookup.
        (None, _) => {
            let found = store.lock().unwrap().get(&target).cloned();
            request.reply(found).await;
        }
    }
}

fn hash_value(value: &[u8]) -> NodeId {
    NodeId::from_bytes(*blake3::hash(value).as_bytes())
}

#[tokio::test]
async fn joining_through_an_ephemeral_bootstrapper_finds_nobody() {
    // The bootstrapper stays ephemeral: it answers but never identifies, so
    // it can never enter anyone's routing table.
    let boot = ephemeral_node(Vec::new()).await;
    let node = ephemeral_node(vec![boot.address()]).await;

    assert!(node.to_array().await.unwrap().is_empty());

    let target = NodeId::from_bytes(rand::random());
    let mut query = node
        .find_node(target, QueryOptions::default())
        .await
        .unwrap();
    let result = timeout(TEST_TIMEOUT, query.finished())
        .await
        .expect("terminates")
        .unwrap();
    assert!(result.closest_nodes.is_empty());

    node.destroy().await;
    boot.destroy().await;
}

#[tokio::test]
async fn three_persistent_nodes_converge() {
    let boot = persistent_node(Vec::new()).await;
    let b = persistent_node(vec![boot.address()]).await;
    let c = persistent_node(vec![boot.address()]).await;

    assert!(!b.ephemeral());
    assert!(!c.ephemeral());
    let b_id = b.id().unwrap();
    let c_id = c.id().unwrap();

    // Let the announce walks land.
    sleep(Duration::from_millis(500)).await;

    // Lookups route through the bootstrapper and touch the other node
    // directly, which also completes the mutual table admission.
    let mut query = b.find_node(c_id, QueryOptions::default()).await.unwrap();
    let result = timeout(TEST_TIMEOUT, query.finished())
        .await
        .expect("terminates")
        .unwrap();
    assert_eq!(
        result.closest_nodes.first().map(|p| p.id),
        Some(c_id),
        "the target itself should rank first"
    );

    let mut query = c.find_node(b_id, QueryOptions::default()).await.unwrap();
    let result = timeout(TEST_TIMEOUT, query.finished())
        .await
        .expect("terminates")
        .unwrap();
    assert_eq!(result.closest_nodes.first().map(|p| p.id), Some(b_id));

    let b_peers = b.to_array().await.unwrap();
    let c_peers = c.to_array().await.unwrap();
    assert!(
        b_peers.iter().any(|p| p.id == c_id),
        "b should hold c in its table"
    );
    assert!(
        c_peers.iter().any(|p| p.id == b_id),
        "c should hold b in its table"
    );

    for node in [b, c, boot] {
        node.destroy().await;
    }
}

#[tokio::test]
async fn committed_values_are_found_by_a_second_client() {
    let boot = persistent_node(Vec::new()).await;
    let _boot_store = serve_values(&boot);

    let mut nodes = Vec::new();
    for _ in 0..20 {
        let node = persistent_node(vec![boot.address()]).await;
        let _ = serve_values(&node);
        nodes.push(node);
    }
    sleep(Duration::from_millis(500)).await;

    let value = b"the quick brown fox".to_vec();
    let target = hash_value(&value);

    // First client stores via query + commit.
    let writer = ephemeral_node(vec![boot.address()]).await;
    let mut write = writer
        .query(
            target,
            CMD_VALUES,
            Some(value.clone()),
            QueryOptions {
                commit: Commit::Auto,
                nodes: None,
            },
        )
        .await
        .unwrap();
    timeout(TEST_TIMEOUT, write.finished())
        .await
        .expect("write query terminates")
        .unwrap();

    // Second client looks it up cold.
    let reader = ephemeral_node(vec![boot.address()]).await;
    let mut read = reader
        .query(target, CMD_VALUES, None, QueryOptions::default())
        .await
        .unwrap();

    let mut found = false;
    while let Some(reply) = timeout(TEST_TIMEOUT, read.next()).await.expect("stream") {
        if let Some(value) = &reply.value {
            if hash_value(value) == target {
                found = true;
                break;
            }
        }
    }
    assert!(found, "at least one reply should return the stored value");

    writer.destroy().await;
    reader.destroy().await;
    for node in nodes {
        node.destroy().await;
    }
    boot.destroy().await;
}

#[tokio::test]
async fn forged_tokens_are_rejected_and_nothing_is_stored() {
    let server = persistent_node(Vec::new()).await;
    let store = serve_values(&server);
    let client = ephemeral_node(vec![server.address()]).await;

    let value = b"sneaky".to_vec();
    let target = hash_value(&value);

    let mut msg = Message::new(CMD_VALUES);
    msg.target = Some(target);
    msg.value = Some(value);
    msg.token = Some([0x42; 32]);
    let reply = timeout(
        TEST_TIMEOUT,
        client.request(msg, server.address(), RequestOptions::default()),
    )
    .await
    .expect("in time")
    .expect("request resolves");

    assert_eq!(reply.status, STATUS_INVALID_TOKEN);
    assert!(store.lock().unwrap().is_empty(), "nothing stored");

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn a_real_round_trip_token_is_accepted() {
    let server = persistent_node(Vec::new()).await;
    let store = serve_values(&server);
    let client = ephemeral_node(vec![server.address()]).await;

    let value = b"legitimate".to_vec();
    let target = hash_value(&value);

    // Lookup first: the reply carries a token bound to our endpoint.
    let mut lookup = Message::new(CMD_VALUES);
    lookup.target = Some(target);
    let reply = client
        .request(lookup, server.address(), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.status, STATUS_OK);
    let token = reply.token.expect("targeted replies carry a token");

    let mut commit = Message::new(CMD_VALUES);
    commit.target = Some(target);
    commit.value = Some(value.clone());
    commit.token = Some(token);
    let reply = client
        .request(commit, server.address(), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.status, STATUS_OK);
    assert_eq!(store.lock().unwrap().get(&target), Some(&value));

    client.destroy().await;
    server.destroy().await;
}

/// Let spawned actors drain whatever the last clock advance made ready.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn sleep_jump_downgrades_a_persistent_node() {
    // A seeded peer gives the routing table content to lose on downgrade;
    // it is never actually contacted under the paused clock.
    let seed_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let node = Node::new(NodeOptions {
        bind: Some(loopback()),
        ephemeral: Some(false),
        firewalled: Some(false),
        nodes: vec![Peer {
            id: NodeId::from_endpoint(seed_addr),
            addr: seed_addr,
        }],
        ..NodeOptions::default()
    })
    .await
    .expect("node starts");
    let mut events = node.subscribe();
    node.ready().await.unwrap();

    assert!(!node.ephemeral());
    assert_eq!(node.to_array().await.unwrap().len(), 1);

    // One regular heartbeat establishes the monotonic baseline.
    advance(HEARTBEAT_INTERVAL).await;
    settle().await;
    assert!(!node.ephemeral(), "a regular heartbeat is not a sleep");

    // The clock jumps across more than interval + threshold in one step,
    // the way a laptop lid does.
    advance(HEARTBEAT_INTERVAL * 2 + SLEEP_THRESHOLD + Duration::from_secs(1)).await;
    settle().await;

    let mut woke = false;
    loop {
        match events.try_recv() {
            Ok(NodeEvent::WakeUp) => woke = true,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert!(woke, "sleep detection should announce a wake-up");
    assert!(node.ephemeral());
    assert_eq!(node.id(), None);
    assert!(
        node.to_array().await.unwrap().is_empty(),
        "downgrade clears the routing table"
    );

    node.destroy().await;
}

#[tokio::test]
async fn black_holed_request_times_out_after_two_deadlines() {
    let node = ephemeral_node(Vec::new()).await;
    let hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = hole.local_addr().unwrap();

    let started = tokio::time::Instant::now();
    let result = node
        .request(
            Message::new(CMD_VALUES),
            dest,
            RequestOptions {
                retry: true,
                via: None,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
    let elapsed = started.elapsed();
    assert!(elapsed >= REQUEST_TIMEOUT * 2, "one retry, two deadlines");
    assert!(elapsed < REQUEST_TIMEOUT * 3);

    node.destroy().await;
}
