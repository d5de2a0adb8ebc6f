//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node
//! facade: construction, readiness, identity properties, queries against an
//! empty world, and teardown semantics.

use std::net::SocketAddr;
use std::time::Duration;

use kadence::{
    Error, Message, Node, NodeId, NodeOptions, QueryOptions, RequestOptions, CMD_APP_BASE,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn ephemeral_node() -> Node {
    Node::new(NodeOptions {
        bind: Some(loopback()),
        ..NodeOptions::default()
    })
    .await
    .expect("node starts")
}

async fn bootstrapper() -> Node {
    Node::new(NodeOptions {
        bind: Some(loopback()),
        ephemeral: Some(false),
        firewalled: Some(false),
        ..NodeOptions::default()
    })
    .await
    .expect("bootstrapper starts")
}

#[tokio::test]
async fn fresh_node_is_ephemeral_with_no_identity() {
    let node = ephemeral_node().await;
    timeout(TEST_TIMEOUT, node.ready())
        .await
        .expect("ready in time")
        .expect("ready succeeds");

    assert!(node.ephemeral());
    assert!(node.firewalled());
    assert_eq!(node.id(), None);
    assert_eq!(node.port(), 0);
    assert!(node.address().port() > 0, "bound to a real port");
    assert!(node.to_array().await.unwrap().is_empty());

    node.destroy().await;
}

#[tokio::test]
async fn forced_bootstrapper_adopts_its_socket_identity() {
    let node = bootstrapper().await;
    timeout(TEST_TIMEOUT, node.ready())
        .await
        .expect("ready in time")
        .expect("ready succeeds");

    assert!(!node.ephemeral());
    assert!(!node.firewalled());
    let id = node.id().expect("persistent nodes have an id");
    assert_eq!(id, NodeId::from_endpoint(node.address()));

    node.destroy().await;
}

#[tokio::test]
async fn lookup_against_an_empty_world_terminates_empty() {
    let node = ephemeral_node().await;
    node.ready().await.unwrap();

    let target = NodeId::from_bytes(rand::random());
    let mut query = node
        .find_node(target, QueryOptions::default())
        .await
        .expect("query starts");

    assert!(query.next().await.is_none(), "no replies from nobody");
    let result = timeout(TEST_TIMEOUT, query.finished())
        .await
        .expect("finishes")
        .expect("no error");
    assert!(result.closest_nodes.is_empty());
    assert!(result.closest_replies.is_empty());

    node.destroy().await;
}

#[tokio::test]
async fn requests_receiver_is_take_once() {
    let node = ephemeral_node().await;
    assert!(node.requests().is_some());
    assert!(node.requests().is_none(), "second take yields nothing");
    node.destroy().await;
}

#[tokio::test]
async fn operations_before_bootstrap_are_rejected() {
    // A bootstrap target that swallows datagrams keeps the node in its
    // pre-ready phase for two ping deadlines.
    let hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead = hole.local_addr().unwrap();
    let node = Node::new(NodeOptions {
        bind: Some(loopback()),
        bootstrap: vec![dead],
        ..NodeOptions::default()
    })
    .await
    .expect("node starts");

    let target = NodeId::from_bytes([3; 32]);
    assert!(matches!(
        node.find_node(target, QueryOptions::default()).await,
        Err(Error::NotBootstrapped)
    ));
    assert!(matches!(
        node.request(Message::new(CMD_APP_BASE), dead, RequestOptions::default())
            .await,
        Err(Error::NotBootstrapped)
    ));
    assert!(matches!(
        node.add_node(dead).await,
        Err(Error::NotBootstrapped)
    ));

    // The failed bootstrap still completes; operations open up afterwards.
    timeout(TEST_TIMEOUT, node.ready())
        .await
        .expect("ready in time")
        .expect("ready succeeds");
    let mut query = node
        .find_node(target, QueryOptions::default())
        .await
        .expect("allowed once bootstrapped");
    let _ = timeout(TEST_TIMEOUT, query.finished()).await.expect("terminates");

    node.destroy().await;
}

#[tokio::test]
async fn destroy_rejects_new_operations() {
    let node = ephemeral_node().await;
    node.ready().await.unwrap();
    node.destroy().await;

    assert!(node.destroyed());
    let target = NodeId::from_bytes([1; 32]);
    let result = node.find_node(target, QueryOptions::default()).await;
    assert!(matches!(result, Err(Error::Destroyed)));
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let node = ephemeral_node().await;
    node.ready().await.unwrap();
    node.destroy().await;
    node.destroy().await;
    assert!(node.destroyed());
}

#[tokio::test]
async fn ping_reports_the_observed_endpoint() {
    let server = bootstrapper().await;
    server.ready().await.unwrap();
    let client = ephemeral_node().await;
    client.ready().await.unwrap();

    let reply = timeout(TEST_TIMEOUT, client.ping(server.address()))
        .await
        .expect("in time")
        .expect("pong");
    assert_eq!(reply.from, server.address());
    // The responder tells us where it saw the ping from: our own socket.
    let observed = reply.value.expect("ping replies carry the observed endpoint");
    assert_eq!(observed.len(), 6);
    let port = u16::from_be_bytes([observed[4], observed[5]]);
    assert_eq!(port, client.address().port());

    client.destroy().await;
    server.destroy().await;
}
