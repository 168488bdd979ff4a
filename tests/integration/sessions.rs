use crate::*;

use bonjou_core::frame::LEN_SIZE;
use bonjou_services::ChatDirection;
use tokio::io::AsyncWriteExt;

/// Chat addressed by display name dials a session and lands on the other side.
#[tokio::test]
async fn test_chat_between_nodes() {
    let (mut a, mut b, dir) = start_pair("chat").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let session = a.node.send_chat("bob", "hello bob").await.unwrap();
    assert_eq!(session.peer, b.node.id());

    let event = b
        .wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::Chat { .. }))
        .await
        .unwrap();
    match event {
        NodeEvent::Chat { from, name, text } => {
            assert_eq!(from, a.node.id());
            assert_eq!(name, "alice");
            assert_eq!(text, "hello bob");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // the reply rides the same session
    b.node.send_chat("alice", "hi alice").await.unwrap();
    a.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::Chat { text, .. } if text == "hi alice"))
        .await
        .unwrap();
    assert_eq!(a.node.sessions().len(), 1);
    assert_eq!(b.node.sessions().len(), 1);

    let history = a.node.history(Some("bob")).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].1.direction, ChatDirection::Outgoing);
    assert_eq!(history[1].1.text, "hi alice");

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Both ends dialing at once settle on one session each.
#[tokio::test]
async fn test_simultaneous_connect() {
    let (mut a, mut b, dir) = start_pair("simultaneous").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let (ra, rb) = tokio::join!(a.node.connect("bob"), b.node.connect("alice"));
    ra.unwrap();
    rb.unwrap();

    assert!(eventually(Duration::from_secs(2), || a.node.sessions().len() == 1 && b.node.sessions().len() == 1).await);
    a.node.send_chat("bob", "still there?").await.unwrap();
    b.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::Chat { text, .. } if text == "still there?"))
        .await
        .unwrap();

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A frame longer than the limit closes the session before its body is read.
#[tokio::test]
async fn test_oversized_frame_closes_session() {
    let dir = temp_dir("too_large");
    let mut t = TestNode::start(test_config("strict", dir.clone(), &[])).await.unwrap();

    let stream = TcpStream::connect(t.node.session_addr()).await.unwrap();
    let mut raw = RawPeer::handshake(stream, 40002).await.unwrap();
    t.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::SessionOpened { .. }))
        .await
        .unwrap();

    let declared = (TEST_MAX_FRAME + 1) as u32;
    let mut prefix = [0u8; LEN_SIZE];
    prefix.copy_from_slice(&declared.to_be_bytes());
    raw.framed.get_mut().write_all(&prefix).await.unwrap();

    let event = t
        .wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::SessionClosed { .. }))
        .await
        .unwrap();
    match event {
        NodeEvent::SessionClosed { peer, reason, .. } => {
            assert_eq!(peer, raw.id);
            assert!(reason.contains("exceeds maximum"), "reason: {reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(raw.recv(Duration::from_secs(2)).await.unwrap(), None);
    assert!(t.node.sessions().is_empty());

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Reusing a sequence number is a protocol violation.
#[tokio::test]
async fn test_sequence_regression_closes_session() {
    let dir = temp_dir("seq");
    let mut t = TestNode::start(test_config("counter", dir.clone(), &[])).await.unwrap();

    let stream = TcpStream::connect(t.node.session_addr()).await.unwrap();
    let mut raw = RawPeer::handshake(stream, 40003).await.unwrap();

    raw.send(MessageKind::Chat, "first").await.unwrap();
    t.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::Chat { text, .. } if text == "first"))
        .await
        .unwrap();

    raw.seq -= 1;
    raw.send(MessageKind::Chat, "again").await.unwrap();
    let event = t
        .wait_for(Duration::from_secs(2), |e| {
            matches!(e, NodeEvent::SessionClosed { .. } | NodeEvent::Chat { .. })
        })
        .await
        .unwrap();
    assert!(matches!(event, NodeEvent::SessionClosed { .. }), "got {event:?}");

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// An address nobody announced can still be dialed directly.
#[tokio::test]
async fn test_connect_by_address_then_disconnect() {
    let dir = temp_dir("by_addr");
    let mut a = TestNode::start(test_config("alice", dir.join("a"), &[])).await.unwrap();
    let mut b = TestNode::start(test_config("bob", dir.join("b"), &[])).await.unwrap();

    let target = b.node.session_addr().to_string();
    let session = a.node.connect(&target).await.unwrap();
    assert_eq!(session.peer, b.node.id());
    assert_eq!(session.peer_name, "bob");
    b.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::SessionOpened { name, .. } if name == "alice"))
        .await
        .unwrap();

    assert!(a.node.disconnect(&target).await.unwrap());
    b.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::SessionClosed { .. }))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || a.node.sessions().is_empty()).await);
    assert!(!a.node.disconnect(&target).await.unwrap_or(false));

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Dialing a closed port reports the peer as unreachable.
#[tokio::test]
async fn test_unreachable_peer() {
    let dir = temp_dir("unreachable");
    let t = TestNode::start(test_config("lonely", dir.clone(), &[])).await.unwrap();

    let closed = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    match t.node.connect(&addr.to_string()).await {
        Err(bonjou::NodeError::Session(bonjou::SessionError::PeerUnreachable { addr: a, .. })) => {
            assert_eq!(a, addr)
        }
        other => panic!("expected PeerUnreachable, got {other:?}"),
    }
    assert!(matches!(
        t.node.connect("nobody").await,
        Err(bonjou::NodeError::Resolve(_))
    ));

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
