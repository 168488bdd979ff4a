use crate::*;

use bonjou_core::Beacon;
use bonjou_services::DepartReason;

/// Two nodes started together list each other within two beacon intervals.
#[tokio::test]
async fn test_two_nodes_converge() {
    let started = tokio::time::Instant::now();
    let (mut a, mut b, dir) = start_pair("converge").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();
    assert!(
        started.elapsed() <= INTERVAL * 2 + Duration::from_millis(150),
        "took {:?}",
        started.elapsed()
    );

    let a_peers = a.node.peers();
    let b_peers = b.node.peers();
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].id, b.node.id());
    assert_eq!(a_peers[0].display_name, "bob");
    // routable address is the beacon source IP plus the advertised TCP port
    assert_eq!(a_peers[0].address, b.node.session_addr());
    assert_eq!(b_peers[0].address, a.node.session_addr());

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A node never lists itself, even when its own beacons loop back.
#[tokio::test]
async fn test_own_beacons_ignored() {
    let dir = temp_dir("self_echo");
    let t = TestNode::start(test_config("echo", dir.clone(), &[])).await.unwrap();
    t.node.add_discovery_target(t.node.discovery_addr());
    tokio::time::sleep(INTERVAL * 2).await;
    assert!(t.node.peers().is_empty());
    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A peer that stops beaconing is evicted after the TTL.
#[tokio::test]
async fn test_silent_peer_expires() {
    let dir = temp_dir("expiry");
    let mut t = TestNode::start(test_config("watcher", dir.clone(), &[])).await.unwrap();

    let ghost = tokio::net::UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let ghost_id = NodeId::generate(&ghost.local_addr().unwrap());
    let beacon = Beacon {
        id: ghost_id,
        display_name: "ghost".into(),
        listen_port: 40000,
        sequence: 1,
        departing: false,
    };
    ghost
        .send_to(&beacon.encode().unwrap(), t.node.discovery_addr())
        .await
        .unwrap();

    t.wait_for(INTERVAL, |e| matches!(e, NodeEvent::PeerJoined { id, .. } if *id == ghost_id))
        .await
        .unwrap();
    assert_eq!(t.node.peers().len(), 1);

    // TTL is three intervals; allow one more for the sweep
    let event = t
        .wait_for(INTERVAL * 4, |e| matches!(e, NodeEvent::PeerDeparted { id, .. } if *id == ghost_id))
        .await
        .unwrap();
    assert!(matches!(
        event,
        NodeEvent::PeerDeparted {
            reason: DepartReason::Expired,
            ..
        }
    ));
    assert!(t.node.peers().is_empty());

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Garbage on the discovery port is dropped without disturbing the listener.
#[tokio::test]
async fn test_malformed_datagrams_ignored() {
    let dir = temp_dir("malformed");
    let mut t = TestNode::start(test_config("sturdy", dir.clone(), &[])).await.unwrap();

    let sender = tokio::net::UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let target = t.node.discovery_addr();
    sender.send_to(b"hello", target).await.unwrap();
    sender.send_to(&[0u8; 98], target).await.unwrap();

    let id = NodeId::generate(&sender.local_addr().unwrap());
    let beacon = Beacon {
        id,
        display_name: "after".into(),
        listen_port: 40001,
        sequence: 1,
        departing: false,
    };
    sender.send_to(&beacon.encode().unwrap(), target).await.unwrap();
    t.wait_for(INTERVAL, |e| matches!(e, NodeEvent::PeerJoined { id: joined, .. } if *joined == id))
        .await
        .unwrap();

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Shutting down sends a departure beacon the other side acts on at once.
#[tokio::test]
async fn test_departure_beacon() {
    let (mut a, mut b, dir) = start_pair("departure").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let b_id = b.node.id();
    b.node.shutdown().await;
    assert_eq!(b.node.discovery_state(), bonjou::DiscoveryState::Stopped);

    // well inside the TTL, so this can only be the announcement
    let event = a
        .wait_for(INTERVAL, |e| matches!(e, NodeEvent::PeerDeparted { id, .. } if *id == b_id))
        .await
        .unwrap();
    assert!(matches!(
        event,
        NodeEvent::PeerDeparted {
            reason: DepartReason::Announced,
            ..
        }
    ));
    assert!(a.node.peers().is_empty());

    a.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
