use crate::*;

use bonjou::{CommandDispatcher, Outcome};

fn reply(outcome: Outcome) -> String {
    match outcome {
        Outcome::Reply(text) => text,
        Outcome::Exit => panic!("unexpected exit"),
    }
}

/// Bad input is answered, never fatal.
#[tokio::test]
async fn test_bad_commands_get_replies() {
    let dir = temp_dir("cmd_bad");
    let t = TestNode::start(test_config("typo", dir.clone(), &[])).await.unwrap();
    let dispatcher = CommandDispatcher::new(t.node.clone());

    let unknown = reply(dispatcher.dispatch("@dance").await);
    assert!(unknown.contains("unknown command"), "{unknown}");
    assert!(unknown.contains("@help"), "{unknown}");

    let usage = reply(dispatcher.dispatch("@send bob").await);
    assert_eq!(usage, "usage: @send <peer> <text>");

    let failed = reply(dispatcher.dispatch("@send nobody hello").await);
    assert!(failed.starts_with("error: "), "{failed}");
    assert!(failed.contains("nobody"), "{failed}");

    assert!(reply(dispatcher.dispatch("@help").await).contains("@transfers"));
    assert!(t.node.is_running());

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// `@exit` shuts the node down before the loop is told to stop.
#[tokio::test]
async fn test_exit_command_shuts_down() {
    let dir = temp_dir("cmd_exit");
    let t = TestNode::start(test_config("done", dir.clone(), &[])).await.unwrap();
    let dispatcher = CommandDispatcher::new(t.node.clone());

    assert_eq!(dispatcher.dispatch("@exit").await, Outcome::Exit);
    assert!(!t.node.is_running());
    assert_eq!(t.node.discovery_state(), bonjou::DiscoveryState::Stopped);

    assert_eq!(dispatcher.dispatch("@quit").await, Outcome::Exit);
    let after = reply(dispatcher.dispatch("@send anyone hi").await);
    assert_eq!(after, "error: node is shutting down");

    let _ = std::fs::remove_dir_all(dir);
}

/// Listings reflect discovered peers, offered files and chat.
#[tokio::test]
async fn test_listings() {
    let (mut a, mut b, dir) = start_pair("cmd_listings").await.unwrap();
    let dispatcher = CommandDispatcher::new(a.node.clone());

    assert_eq!(reply(dispatcher.dispatch("@transfers").await), "no transfers");
    assert_eq!(reply(dispatcher.dispatch("@history").await), "no chat history");

    converge(&mut a, &mut b).await.unwrap();
    let peers = reply(dispatcher.dispatch("@users").await);
    let mut lines = peers.lines();
    assert_eq!(lines.next(), Some("1 peer(s):"));
    let bob = lines.next().unwrap();
    assert!(bob.contains(&b.node.id().short()), "{bob}");
    assert!(bob.contains("bob"), "{bob}");
    assert!(bob.contains(&b.node.session_addr().port().to_string()), "{bob}");

    assert_eq!(reply(dispatcher.dispatch("@send bob hello there").await), "-> bob: hello there");
    let history = reply(dispatcher.dispatch("@history bob").await);
    assert_eq!(history, "-> bob: hello there");

    let source = dir.join("notes.txt");
    std::fs::write(&source, b"twelve bytes").unwrap();
    let offered = reply(dispatcher.dispatch(&format!("@file bob {}", source.display())).await);
    assert!(offered.starts_with("offered notes.txt (12 bytes) to bob as job "), "{offered}");

    let transfers = reply(dispatcher.dispatch("@transfers").await);
    let mut lines = transfers.lines();
    assert_eq!(lines.next(), Some("transfers:"));
    let job = lines.next().unwrap();
    assert!(job.contains("-> bob"), "{job}");
    assert!(job.contains("notes.txt"), "{job}");
    assert!(job.contains("offered"), "{job}");
    assert!(job.ends_with("0/1 chunks"), "{job}");

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
