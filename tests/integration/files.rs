use crate::*;

use bonjou_core::message::encode_control;
use bonjou_core::{JobId, TransferAck, TransferChunk, TransferEnd, TransferOffer};
use bonjou_services::TransferState;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn offered_job(event: &NodeEvent) -> Option<JobId> {
    match event {
        NodeEvent::TransferOffered { job_id, .. } => Some(*job_id),
        _ => None,
    }
}

/// A file offered, accepted and streamed arrives byte-identical.
#[tokio::test]
async fn test_file_transfer_end_to_end() {
    let (mut a, mut b, dir) = start_pair("file_e2e").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let data = pattern(150_000);
    let source = dir.join("report.bin");
    std::fs::write(&source, &data).unwrap();

    let job = a.node.send_file("bob", &source).await.unwrap();
    assert_eq!(job.chunk_count(), 3);
    assert_eq!(job.state, TransferState::Offered);

    let event = b
        .wait_for(Duration::from_secs(3), |e| offered_job(e).is_some())
        .await
        .unwrap();
    let job_id = offered_job(&event).unwrap();
    assert_eq!(job_id, job.job_id);

    let accepted = b.node.accept(&job_id.short()).await.unwrap();
    assert_eq!(accepted.filename, "report.bin");

    let saved = match b
        .wait_for(Duration::from_secs(5), |e| matches!(e, NodeEvent::TransferCompleted { .. }))
        .await
        .unwrap()
    {
        NodeEvent::TransferCompleted { saved_to, .. } => saved_to.expect("receiver reports the saved path"),
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(saved, dir.join("bob").join("report.bin"));
    assert_eq!(std::fs::read(&saved).unwrap(), data);

    a.wait_for(Duration::from_secs(5), |e| {
        matches!(e, NodeEvent::TransferCompleted { job_id: id, saved_to: None, .. } if *id == job_id)
    })
    .await
    .unwrap();

    let sent = a.node.transfers().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].state, TransferState::Complete);
    assert_eq!(sent[0].progress(), (3, 3));
    let received = b.node.transfers().await;
    assert_eq!(received[0].state, TransferState::Complete);

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A rejected offer ends cancelled on both sides and writes nothing.
#[tokio::test]
async fn test_file_offer_rejected() {
    let (mut a, mut b, dir) = start_pair("file_reject").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let source = dir.join("unwanted.txt");
    std::fs::write(&source, b"no thanks").unwrap();
    let job = a.node.send_file("bob", &source).await.unwrap();

    b.wait_for(Duration::from_secs(3), |e| offered_job(e).is_some())
        .await
        .unwrap();
    let rejected = b.node.reject(&job.job_id.to_string()).await.unwrap();
    assert_eq!(rejected.state, TransferState::Cancelled);

    a.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::TransferRejected { .. }))
        .await
        .unwrap();
    assert_eq!(a.node.transfers().await[0].state, TransferState::Cancelled);
    assert!(!dir.join("bob").join("unwanted.txt").exists());

    // a decided job cannot be accepted afterwards
    assert!(b.node.accept(&job.job_id.short()).await.is_err());

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// The sender withdrawing an offer cancels the receiver's copy.
#[tokio::test]
async fn test_sender_cancels_offer() {
    let (mut a, mut b, dir) = start_pair("file_withdraw").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let source = dir.join("draft.txt");
    std::fs::write(&source, b"changed my mind").unwrap();
    let job = a.node.send_file("bob", &source).await.unwrap();
    b.wait_for(Duration::from_secs(3), |e| offered_job(e).is_some())
        .await
        .unwrap();

    a.node.cancel(&job.job_id.short()).await.unwrap();
    b.wait_for(Duration::from_secs(3), |e| {
        matches!(e, NodeEvent::TransferCancelled { by_peer: true, .. })
    })
    .await
    .unwrap();
    assert_eq!(b.node.transfers().await[0].state, TransferState::Cancelled);

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Losing the session fails unfinished jobs on both ends.
#[tokio::test]
async fn test_session_loss_fails_transfer() {
    let (mut a, mut b, dir) = start_pair("file_lost").await.unwrap();
    converge(&mut a, &mut b).await.unwrap();

    let source = dir.join("pending.bin");
    std::fs::write(&source, pattern(1000)).unwrap();
    a.node.send_file("bob", &source).await.unwrap();
    b.wait_for(Duration::from_secs(3), |e| offered_job(e).is_some())
        .await
        .unwrap();

    assert!(b.node.disconnect("alice").await.unwrap());
    a.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::TransferFailed { .. }))
        .await
        .unwrap();
    b.wait_for(Duration::from_secs(3), |e| matches!(e, NodeEvent::TransferFailed { .. }))
        .await
        .unwrap();
    assert_eq!(a.node.transfers().await[0].state, TransferState::Failed);
    assert_eq!(b.node.transfers().await[0].state, TransferState::Failed);

    a.node.shutdown().await;
    b.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// Chunks arriving out of order, with one held back until the receiver
/// asks for it, still reassemble into the original file.
#[tokio::test]
async fn test_out_of_order_chunks_and_rerequest() {
    let dir = temp_dir("file_reorder");
    let mut t = TestNode::start(test_config("sink", dir.clone(), &[])).await.unwrap();
    let stream = TcpStream::connect(t.node.session_addr()).await.unwrap();
    let mut raw = RawPeer::handshake(stream, 40004).await.unwrap();

    let data = pattern(150_000);
    let offer = TransferOffer {
        job_id: JobId::random(),
        filename: "shuffled.bin".into(),
        total_size: data.len() as u64,
        chunk_size: 65_536,
    };
    assert_eq!(offer.chunk_count(), 3);
    assert_eq!(offer.chunk_len(2), 18_928);
    raw.send(MessageKind::TransferOffer, encode_control(&offer).unwrap())
        .await
        .unwrap();

    t.wait_for(Duration::from_secs(2), |e| offered_job(e) == Some(offer.job_id))
        .await
        .unwrap();
    t.node.accept(&offer.job_id.short()).await.unwrap();

    let ack = raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(ack.kind, MessageKind::TransferAck);
    let ack: TransferAck = ack.control().unwrap();
    assert!(ack.accept);

    let chunk = |index: u32| {
        let start = index as usize * 65_536;
        let end = (start + 65_536).min(data.len());
        TransferChunk {
            job_id: offer.job_id,
            index,
            data: bytes::Bytes::copy_from_slice(&data[start..end]),
        }
        .encode()
    };
    raw.send(MessageKind::TransferChunk, chunk(2)).await.unwrap();
    raw.send(MessageKind::TransferChunk, chunk(0)).await.unwrap();
    let end = TransferEnd {
        job_id: offer.job_id,
        cancelled: false,
    };
    raw.send(MessageKind::TransferEnd, encode_control(&end).unwrap())
        .await
        .unwrap();

    let rerequest = raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(rerequest.kind, MessageKind::TransferAck);
    let rerequest: TransferAck = rerequest.control().unwrap();
    assert_eq!(rerequest.missing, vec![1]);

    raw.send(MessageKind::TransferChunk, chunk(1)).await.unwrap();
    let done = raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(done.kind, MessageKind::TransferEnd);
    let done: TransferEnd = done.control().unwrap();
    assert!(!done.cancelled);

    let saved = match t
        .wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::TransferCompleted { .. }))
        .await
        .unwrap()
    {
        NodeEvent::TransferCompleted { saved_to, .. } => saved_to.unwrap(),
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(std::fs::read(saved).unwrap(), data);

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A chunk of the wrong size fails the job and tells the sender.
#[tokio::test]
async fn test_mismatched_chunk_fails_job() {
    let dir = temp_dir("file_mismatch");
    let mut t = TestNode::start(test_config("picky", dir.clone(), &[])).await.unwrap();
    let stream = TcpStream::connect(t.node.session_addr()).await.unwrap();
    let mut raw = RawPeer::handshake(stream, 40005).await.unwrap();

    let offer = TransferOffer {
        job_id: JobId::random(),
        filename: "short.bin".into(),
        total_size: 100,
        chunk_size: 65_536,
    };
    raw.send(MessageKind::TransferOffer, encode_control(&offer).unwrap())
        .await
        .unwrap();
    t.wait_for(Duration::from_secs(2), |e| offered_job(e).is_some())
        .await
        .unwrap();
    t.node.accept(&offer.job_id.short()).await.unwrap();
    raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();

    let bad = TransferChunk {
        job_id: offer.job_id,
        index: 0,
        data: bytes::Bytes::from_static(&[1, 2, 3]),
    };
    raw.send(MessageKind::TransferChunk, bad.encode()).await.unwrap();

    t.wait_for(Duration::from_secs(2), |e| matches!(e, NodeEvent::TransferFailed { .. }))
        .await
        .unwrap();
    let end = raw.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(end.kind, MessageKind::TransferEnd);
    assert!(end.control::<TransferEnd>().unwrap().cancelled);
    assert_eq!(t.node.transfers().await[0].state, TransferState::Failed);

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

/// A receiver that asks for chunks again gets exactly those, then END.
#[tokio::test]
async fn test_sender_resends_requested_chunks() {
    let dir = temp_dir("file_resend");
    let mut t = TestNode::start(test_config("source", dir.join("downloads"), &[])).await.unwrap();

    let data = pattern(150_000);
    let source = dir.join("again.bin");
    std::fs::write(&source, &data).unwrap();

    let listener = tokio::net::TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let raw_addr = listener.local_addr().unwrap();
    let receiver = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut raw = RawPeer::handshake(stream, raw_addr.port()).await?;

        let offer: TransferOffer = raw
            .recv(Duration::from_secs(5))
            .await?
            .context("closed before offer")?
            .control()?;
        let mut ack = TransferAck {
            job_id: offer.job_id,
            accept: true,
            missing: Vec::new(),
        };
        raw.send(MessageKind::TransferAck, encode_control(&ack)?).await?;

        // Chunks up to the sender's END, as (index, data).
        async fn until_end(raw: &mut RawPeer) -> Result<Vec<(u32, bytes::Bytes)>> {
            let mut chunks = Vec::new();
            loop {
                let msg = raw.recv(Duration::from_secs(5)).await?.context("closed mid-transfer")?;
                match msg.kind {
                    MessageKind::TransferChunk => {
                        let chunk = TransferChunk::decode(&msg.payload)?;
                        chunks.push((chunk.index, chunk.data));
                    }
                    MessageKind::TransferEnd => {
                        let end: TransferEnd = msg.control()?;
                        anyhow::ensure!(!end.cancelled, "sender cancelled");
                        return Ok(chunks);
                    }
                    other => bail!("unexpected {other:?}"),
                }
            }
        }

        let first = until_end(&mut raw).await?;
        ack.missing = vec![1];
        raw.send(MessageKind::TransferAck, encode_control(&ack)?).await?;
        let second = until_end(&mut raw).await?;

        let end = TransferEnd {
            job_id: offer.job_id,
            cancelled: false,
        };
        raw.send(MessageKind::TransferEnd, encode_control(&end)?).await?;
        Ok::<_, anyhow::Error>((raw, first, second))
    });

    let job = t.node.send_file(&raw_addr.to_string(), &source).await.unwrap();
    let (_raw, first, second) = receiver.await.unwrap().unwrap();

    let indices = |chunks: &[(u32, bytes::Bytes)]| chunks.iter().map(|(i, _)| *i).collect::<Vec<_>>();
    assert_eq!(indices(&first), vec![0, 1, 2]);
    assert_eq!(indices(&second), vec![1]);
    assert_eq!(&second[0].1[..], &data[65_536..131_072]);

    t.wait_for(Duration::from_secs(3), |e| {
        matches!(e, NodeEvent::TransferCompleted { job_id, saved_to: None, .. } if *job_id == job.job_id)
    })
    .await
    .unwrap();
    assert_eq!(t.node.transfers().await[0].state, TransferState::Complete);

    t.node.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
