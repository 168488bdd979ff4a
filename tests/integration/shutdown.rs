use crate::*;

use bonjou_core::message::encode_control;
use bonjou_core::{TransferAck, TransferEnd, TransferOffer};
use bonjou_services::TransferState;
use tokio::net::{TcpListener, TcpStream};

/// Exiting with a transfer in progress cancels it and puts
/// TRANSFER_END{cancelled: true} on the wire before the session closes.
#[tokio::test]
async fn test_exit_cancels_in_progress_transfer() {
    let dir = temp_dir("exit_cancel");
    let mut t = TestNode::start(test_config("leaver", dir.join("downloads"), &[])).await.unwrap();

    let source = dir.join("big.bin");
    std::fs::write(&source, vec![0x5a; 4 * 1024 * 1024]).unwrap();

    // a receiver that accepts, reads everything, and never confirms
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let raw_addr = listener.local_addr().unwrap();
    let receiver = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut raw = RawPeer::handshake(stream, raw_addr.port()).await?;

        let offer = raw.recv(Duration::from_secs(5)).await?.context("closed before offer")?;
        let offer: TransferOffer = offer.control()?;
        let ack = TransferAck {
            job_id: offer.job_id,
            accept: true,
            missing: Vec::new(),
        };
        raw.send(MessageKind::TransferAck, encode_control(&ack)?).await?;

        let mut seen = Vec::new();
        while let Some(msg) = raw.recv(Duration::from_secs(10)).await? {
            seen.push(msg);
        }
        Ok::<_, anyhow::Error>((offer, seen))
    });

    let job = t.node.send_file(&raw_addr.to_string(), &source).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = t.node.transfers().await[0].state;
        if state == TransferState::InProgress {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job stuck in {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    t.node.shutdown().await;

    let (offer, seen) = receiver.await.unwrap().unwrap();
    assert_eq!(offer.job_id, job.job_id);
    let cancelled = seen
        .iter()
        .filter(|m| m.kind == MessageKind::TransferEnd)
        .filter_map(|m| m.control::<TransferEnd>().ok())
        .any(|end| end.job_id == job.job_id && end.cancelled);
    assert!(cancelled, "no cancelling END among {} frames", seen.len());

    let jobs = t.node.transfers().await;
    assert_eq!(jobs[0].state, TransferState::Cancelled);
    t.wait_for(Duration::from_secs(1), |e| {
        matches!(e, NodeEvent::TransferCancelled { by_peer: false, .. })
    })
    .await
    .unwrap();

    let _ = std::fs::remove_dir_all(dir);
}

/// Shutdown cancels jobs still waiting for an answer, too.
#[tokio::test]
async fn test_exit_cancels_pending_offer() {
    let (mut a, mut b, dir) = start_pair("exit_offer").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let source = dir.join("later.txt");
    std::fs::write(&source, b"maybe later").unwrap();
    a.node.send_file("bob", &source).await.unwrap();
    b.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::TransferOffered { .. }))
        .await
        .unwrap();

    b.node.shutdown().await;
    assert_eq!(b.node.transfers().await[0].state, TransferState::Cancelled);
    a.wait_for(Duration::from_secs(3), |e| {
        matches!(e, NodeEvent::TransferCancelled { by_peer: true, .. })
    })
    .await
    .unwrap();
    assert_eq!(a.node.transfers().await[0].state, TransferState::Cancelled);

    a.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A receiver that exits while the sender is still streaming reads off
/// what is in flight, so the sender gets the cancelling END and a clean
/// close instead of a reset.
#[tokio::test]
async fn test_exit_as_receiver_reaches_streaming_sender() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let dir = temp_dir("exit_receiver");
    let mut t = TestNode::start(test_config("quitter", dir.join("downloads"), &[])).await.unwrap();
    let stream = TcpStream::connect(t.node.session_addr()).await.unwrap();
    let mut raw = RawPeer::handshake(stream, 40006).await.unwrap();

    const CHUNKS: u32 = 16;
    let offer = TransferOffer {
        job_id: bonjou_core::JobId::random(),
        filename: "endless.bin".into(),
        total_size: CHUNKS as u64 * 65_536,
        chunk_size: 65_536,
    };
    raw.send(MessageKind::TransferOffer, encode_control(&offer).unwrap())
        .await
        .unwrap();
    t.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::TransferOffered { .. }))
        .await
        .unwrap();
    t.node.accept(&offer.job_id.short()).await.unwrap();
    let ack = raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(ack.kind, MessageKind::TransferAck);

    // Chunk 0 never goes out, so the job cannot finish; the rest repeat
    // until the node says stop.
    let (mut writer, mut reader) = raw.split();
    let stop = Arc::new(AtomicBool::new(false));
    let streaming = {
        let stop = stop.clone();
        let job_id = offer.job_id;
        tokio::spawn(async move {
            let data = bytes::Bytes::from(vec![0xc3; 65_536]);
            let mut index = 1;
            while !stop.load(Ordering::SeqCst) {
                let chunk = bonjou_core::TransferChunk {
                    job_id,
                    index,
                    data: data.clone(),
                };
                if writer.send(MessageKind::TransferChunk, chunk.encode()).await.is_err() {
                    return;
                }
                index = index % (CHUNKS - 1) + 1;
            }
            let _ = writer.finish().await;
        })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while t.node.transfers().await[0].state != TransferState::InProgress {
        assert!(tokio::time::Instant::now() < deadline, "no chunk arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let watcher = tokio::spawn(async move {
        let mut cancelled = false;
        loop {
            match reader.recv(Duration::from_secs(10)).await? {
                Some(msg) if msg.kind == MessageKind::TransferEnd => {
                    cancelled |= msg.control::<TransferEnd>()?.cancelled;
                    stop.store(true, Ordering::SeqCst);
                }
                Some(_) => {}
                None => return Ok::<_, anyhow::Error>(cancelled),
            }
        }
    });

    t.node.shutdown().await;

    let cancelled = watcher.await.unwrap().expect("connection reset before a clean close");
    assert!(cancelled, "no cancelling END reached the sender");
    streaming.await.unwrap();
    assert_eq!(t.node.transfers().await[0].state, TransferState::Cancelled);

    let _ = std::fs::remove_dir_all(dir);
}
