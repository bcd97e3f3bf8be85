// Integration tests for multi-hop message routing
//
// Full nodes run on a simulated medium under paused time, so retry and
// timeout paths complete instantly.

use meshfence_core::radio::{LinkQuality, Radio, SimMedium};
use meshfence_core::routing::{line_routes, Message, RouteMatrix};
use meshfence_core::transport::{Frame, FrameType};
use meshfence_core::{
    MessagePing, MpingError, Node, NodeId, Pong, StackConfig, BROADCAST_NODE_ID, MAX_NODES,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PORT: u8 = 7;

fn spawn(medium: &SimMedium, config: StackConfig) -> Node {
    let radio = Arc::new(medium.attach(config.node_id));
    Node::spawn(config, radio).unwrap()
}

fn spawn_all(medium: &SimMedium, ids: &[NodeId]) -> Vec<Node> {
    ids.iter()
        .map(|&id| spawn(medium, StackConfig::for_node(id)))
        .collect()
}

/// Message ping on `node`, served in the background
fn start_mping(node: &Node) -> (Arc<MessagePing>, JoinHandle<()>) {
    let mping = Arc::new(
        MessagePing::new(
            Arc::clone(node.router()),
            node.config().pong_delay(),
            node.config().ping_period(),
        )
        .unwrap(),
    );
    let server = Arc::clone(&mping);
    (mping, tokio::spawn(async move { server.serve_forever().await }))
}

fn in_secs(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[tokio::test(start_paused = true)]
async fn test_message_delivered_over_direct_link() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[1, 2]);
    nodes[0].router().set_route(2, 2).unwrap();
    let listener = nodes[1].router().register_listener(PORT, 4).unwrap();
    listener.activate();

    nodes[0].router().send(2, PORT, 3, b"hello").unwrap();

    let msg = listener.recv_until(in_secs(10)).await.unwrap();
    assert_eq!(msg.sender, 1);
    assert_eq!(msg.recipient, 2);
    assert_eq!(msg.msg_type, 3);
    assert_eq!(msg.payload.as_slice(), b"hello");

    assert!(listener.recv_until(in_secs(10)).await.is_none());
    assert_eq!(nodes[0].router().queued_messages(), 0);
    println!("✓ Message delivered over a direct link exactly once");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_message_suppressed() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[2]);
    let listener = nodes[0].router().register_listener(PORT, 4).unwrap();
    listener.activate();
    let sender = medium.attach(3);

    // same message in two distinct frames, as a resend after a lost ACK
    let mut msg = Message::new(2, PORT, 0, &[0x42]).unwrap();
    msg.sender = 3;
    msg.seq = 9;
    for frame_seq in [1, 2] {
        let mut frame = Frame::with_payload(FrameType::Msg, 2, &msg.encode()).unwrap();
        frame.seq = frame_seq;
        sender.transmit(&frame.to_wire(3)).await.unwrap();
    }

    let first = listener.recv_until(in_secs(5)).await.unwrap();
    assert_eq!(first.seq, 9);
    assert!(listener.recv_until(in_secs(5)).await.is_none());
    println!("✓ Resent message delivered to the listener once");
}

#[tokio::test(start_paused = true)]
async fn test_next_hop_follows_routing_table() {
    let medium = SimMedium::new();
    let mut tap = medium.tap();
    let nodes = spawn_all(&medium, &[1]);
    let router = nodes[0].router();
    router.set_route(3, 2).unwrap();
    router.set_route(2, 5).unwrap();

    router.send(3, PORT, 0, &[1]).unwrap();

    let sent = tap.recv().await.unwrap();
    assert_eq!(sent.from, 1);
    let frame = Frame::from_bytes(&sent.bytes, 0).unwrap();
    assert_eq!(frame.frame_type, FrameType::Msg);
    assert_eq!(frame.dest, 2);
    let msg = Message::decode(&frame.payload).unwrap();
    assert_eq!(msg.recipient, 3);
    assert_eq!(msg.sender, 1);
    println!("✓ Frame addressed to the next hop, message to the recipient");
}

#[tokio::test(start_paused = true)]
async fn test_message_without_route_is_dropped() {
    let medium = SimMedium::new();
    let mut tap = medium.tap();
    let nodes = spawn_all(&medium, &[1]);

    nodes[0].router().send(4, PORT, 0, &[1]).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(nodes[0].router().queued_messages(), 0);
    assert!(tap.try_recv().is_err());
    println!("✓ Message with no route released without transmitting");
}

#[tokio::test(start_paused = true)]
async fn test_forwarding_along_a_line() {
    let medium = SimMedium::line(&[1, 2, 3]);
    let nodes = spawn_all(&medium, &[1, 2, 3]);
    nodes[0].router().set_route(3, 2).unwrap();
    nodes[1].router().set_route(3, 3).unwrap();
    let listener = nodes[2].router().register_listener(PORT, 4).unwrap();
    listener.activate();

    nodes[0].router().send(3, PORT, 0, b"relay").unwrap();

    let msg = listener.recv_until(in_secs(30)).await.unwrap();
    assert_eq!(msg.sender, 1);
    assert_eq!(msg.payload.as_slice(), b"relay");
    // 1 never hears 3 directly
    assert!(nodes[0].transport().neighbor(3).is_none());
    println!("✓ Message forwarded across an intermediate node");
}

#[tokio::test(start_paused = true)]
async fn test_route_versions_only_move_forward() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[1, 2, 3]);

    let mut matrix: RouteMatrix = [[0; MAX_NODES]; MAX_NODES];
    matrix[2][4] = 3;
    matrix[3][4] = 4;
    nodes[0].router().broadcast_routes(&matrix, 5).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    for node in &nodes[1..] {
        assert_eq!(node.router().routes().version(), 5);
    }
    assert_eq!(nodes[1].router().routes().next_hop(4), Some(3));
    assert_eq!(nodes[2].router().routes().next_hop(4), Some(4));
    // the originator picks the set up from the rebroadcast
    assert_eq!(nodes[0].router().routes().version(), 5);

    // older, equal, and half-space-away versions are ignored
    let mut stale = matrix;
    stale[2][4] = 1;
    for version in [4, 5, 5 + 0x80] {
        nodes[0].router().broadcast_routes(&stale, version).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(nodes[1].router().routes().version(), 5);
        assert_eq!(nodes[1].router().routes().next_hop(4), Some(3));
    }

    nodes[0].router().broadcast_routes(&stale, 6).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(nodes[1].router().routes().version(), 6);
    assert_eq!(nodes[1].router().routes().next_hop(4), Some(1));
    println!("✓ Route sets install only when newer");
}

#[tokio::test(start_paused = true)]
async fn test_failed_hop_heals_to_other_neighbor() {
    let medium = SimMedium::new();
    let mut config = StackConfig::for_node(1);
    config.heal_routes = true;
    let origin = spawn(&medium, config);
    let target = spawn(&medium, StackConfig::for_node(3));
    let listener = target.router().register_listener(PORT, 4).unwrap();
    listener.activate();

    // 2 is not on the air
    origin.router().set_route(3, 2).unwrap();
    origin.transport().add_neighbor(3);

    origin.router().send(3, PORT, 0, b"detour").unwrap();

    let msg = listener.recv_until(in_secs(60)).await.unwrap();
    assert_eq!(msg.payload.as_slice(), b"detour");
    assert_eq!(origin.router().routes().next_hop(3), Some(3));
    println!("✓ Route healed after the next hop stopped answering");
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_message_reaches_all_neighbors() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[1, 2, 3]);
    let listeners: Vec<_> = nodes[1..]
        .iter()
        .map(|node| {
            let listener = node.router().register_listener(PORT, 4).unwrap();
            listener.activate();
            listener
        })
        .collect();

    nodes[0]
        .router()
        .send(BROADCAST_NODE_ID, PORT, 0, b"all")
        .unwrap();

    for listener in &listeners {
        let msg = listener.recv_until(in_secs(5)).await.unwrap();
        assert_eq!(msg.sender, 1);
        assert_eq!(msg.payload.as_slice(), b"all");
    }
    println!("✓ Broadcast message delivered to every neighbor");
}

#[tokio::test(start_paused = true)]
async fn test_mping_reports_link_rssi_both_ways() {
    let medium = SimMedium::new();
    medium.set_link(1, 2, LinkQuality::new(150));
    let nodes = spawn_all(&medium, &[1, 2]);
    nodes[0].router().set_route(2, 2).unwrap();
    nodes[1].router().set_route(1, 1).unwrap();
    let (pinger, pinger_task) = start_mping(&nodes[0]);
    let (_responder, responder_task) = start_mping(&nodes[1]);

    let began = Instant::now();
    pinger.ping(2, 9).unwrap();
    assert_eq!(pinger.ping(2, 10), Err(MpingError::InProgress));
    assert_eq!(pinger.ping(2, 0), Err(MpingError::InvalidToken));

    let pong = pinger.wait_pong(in_secs(10)).await.unwrap();
    assert_eq!(
        pong,
        Pong {
            from: 2,
            token: 9,
            ping_rssi: 150,
            pong_rssi: 150,
        }
    );
    assert!(began.elapsed() >= nodes[1].config().pong_delay());
    assert!(!pinger.in_progress());

    pinger_task.abort();
    responder_task.abort();
    println!("✓ Message ping reports the link RSSI seen at each end");
}

#[tokio::test(start_paused = true)]
async fn test_mping_across_line_has_no_rssi() {
    let ids = [1, 2, 3];
    let medium = SimMedium::line(&ids);
    let nodes = spawn_all(&medium, &ids);
    for node in &nodes {
        node.router().install_routes(&line_routes(&ids), 1);
    }
    let (pinger, pinger_task) = start_mping(&nodes[0]);
    let (_responder, responder_task) = start_mping(&nodes[2]);

    pinger.ping(3, 1).unwrap();
    let pong = pinger.wait_pong(in_secs(30)).await.unwrap();
    assert_eq!(pong.from, 3);
    assert_eq!(pong.token, 1);
    // 1 and 3 are two hops apart
    assert_eq!((pong.ping_rssi, pong.pong_rssi), (0, 0));

    pinger_task.abort();
    responder_task.abort();
    println!("✓ Message ping crosses a relay; RSSI only known one hop out");
}

#[tokio::test(start_paused = true)]
async fn test_periodic_mping_uses_fresh_tokens() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[1, 2]);
    nodes[0].router().set_route(2, 2).unwrap();
    nodes[1].router().set_route(1, 1).unwrap();
    let (pinger, pinger_task) = start_mping(&nodes[0]);
    let (_responder, responder_task) = start_mping(&nodes[1]);

    let periodic = {
        let pinger = Arc::clone(&pinger);
        tokio::spawn(async move { pinger.run_periodic(2).await })
    };

    // pings go out at 0, 5 and 10 seconds
    let deadline = in_secs(14);
    let mut tokens = Vec::new();
    while let Some(pong) = pinger.wait_pong(deadline).await {
        tokens.push(pong.token);
    }
    assert_eq!(tokens, vec![1, 2, 3]);

    periodic.abort();
    pinger_task.abort();
    responder_task.abort();
    println!("✓ Periodic message ping answered every period");
}

#[tokio::test(start_paused = true)]
async fn test_mping_to_absent_node_expires() {
    let medium = SimMedium::new();
    let nodes = spawn_all(&medium, &[1]);
    nodes[0].router().set_route(4, 4).unwrap();
    let (pinger, pinger_task) = start_mping(&nodes[0]);

    pinger.ping(4, 1).unwrap();
    assert!(pinger.wait_pong(in_secs(4)).await.is_none());
    assert!(pinger.in_progress());

    // one ping period after sending
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!pinger.in_progress());
    assert!(pinger.ping(4, 2).is_ok());

    pinger_task.abort();
    println!("✓ Unanswered message ping expires after one period");
}
