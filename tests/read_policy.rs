//! Read policy, closure detection and send exclusion over in-memory streams.
mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use tagtrack::config::LinkSettings;
use tagtrack::link::ConnectionState;
use tagtrack::protocol::frame::{encode_frame, read_frame};
use tagtrack::protocol::{Command, Frame, LinkError, Role, DATA_FRAME};

use common::{attached_pair, channel, fast_settings};

#[tokio::test]
async fn polling_reports_no_data_until_the_watermark_expires() {
    let (controller, board) = attached_pair(fast_settings(0)).await;

    assert!(controller.read_sensor(false).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.read_sensor(false).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        controller.read_sensor(false).await,
        Err(LinkError::ReadTimeout)
    ));
    // a timeout is not a disconnect
    assert!(controller.is_connected());

    // a frame resets the watermark
    board.send_sensor(DATA_FRAME, &1u8).await.unwrap();
    let frame = controller.read_sensor(false).await.unwrap().unwrap();
    assert_eq!(frame.name, DATA_FRAME);
    assert!(controller.read_sensor(false).await.unwrap().is_none());
}

#[tokio::test]
async fn blocking_read_times_out_without_tearing_down() {
    let (controller, board) = attached_pair(fast_settings(0)).await;
    assert!(matches!(
        board.read_command().await,
        Err(LinkError::ReadTimeout)
    ));
    assert!(board.is_connected());

    controller.send_command(&Command::Read).await.unwrap();
    assert_eq!(board.read_command().await.unwrap(), Some(Command::Read));
}

#[tokio::test]
async fn peer_closing_is_a_disconnect() {
    let board = channel(Role::Board, fast_settings(0));
    let (ours, theirs) = tokio::io::duplex(64);
    board.attach(ours).await.unwrap();
    drop(theirs);

    assert!(matches!(
        board.read_command().await,
        Err(LinkError::ConnectionAborted)
    ));
    assert_eq!(board.state(), ConnectionState::Disconnected);
    assert!(board.is_closed());
    // further reads are quiet no-ops
    assert!(board.read_command().await.unwrap().is_none());
}

#[tokio::test]
async fn short_frame_is_truncated() {
    let board = channel(Role::Board, fast_settings(0));
    let (ours, mut theirs) = tokio::io::duplex(64);
    board.attach(ours).await.unwrap();

    // declared payload is three bytes longer than what arrives
    let bytes = encode_frame("write", b"abcdef").unwrap();
    theirs.write_all(&bytes[..bytes.len() - 3]).await.unwrap();
    drop(theirs);

    let err = board.read_command().await.unwrap_err();
    assert!(matches!(err, LinkError::FrameTruncated { .. }), "{err}");
    assert!(board.is_closed());
}

#[tokio::test]
async fn stalled_frame_tears_the_connection_down() {
    let board = channel(Role::Board, fast_settings(0));
    let (ours, mut theirs) = tokio::io::duplex(64);
    board.attach(ours).await.unwrap();

    // half a frame, then silence with the stream still open
    let bytes = encode_frame("read", &[0u8]).unwrap();
    theirs.write_all(&bytes[..4]).await.unwrap();

    assert!(matches!(
        board.read_command().await,
        Err(LinkError::FrameStalled)
    ));
    assert!(board.is_closed());
    drop(theirs);
}

#[tokio::test]
async fn unknown_commands_are_skipped() {
    let board = channel(Role::Board, fast_settings(0));
    let (ours, mut theirs) = tokio::io::duplex(256);
    board.attach(ours).await.unwrap();

    let dance = Frame::with_payload("dance", &None::<String>).unwrap();
    theirs.write_all(&dance.encode().unwrap()).await.unwrap();
    let read = Command::Read.to_frame().unwrap();
    theirs.write_all(&read.encode().unwrap()).await.unwrap();

    assert_eq!(board.read_command().await.unwrap(), None);
    assert_eq!(board.read_command().await.unwrap(), Some(Command::Read));
    assert!(board.is_connected());
}

#[tokio::test]
async fn send_to_a_vanished_peer_is_swallowed_or_reported_closed() {
    let (controller, board) = attached_pair(fast_settings(0)).await;
    board.close().await;
    // fire-and-forget: the caller never sees a reset
    let result = controller.send_command(&Command::Read).await;
    assert!(
        result.is_ok() || matches!(result, Err(LinkError::Io(_))),
        "{result:?}"
    );

    controller.cleanup().await;
    assert!(matches!(
        controller.send_command(&Command::Read).await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn peer_that_stops_reading_cannot_wedge_a_send() {
    let board = channel(Role::Board, fast_settings(0));
    // the far end stays open but nobody ever reads it
    let (ours, _theirs) = tokio::io::duplex(16);
    board.attach(ours).await.unwrap();

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        board.send_sensor(DATA_FRAME, &vec![0u8; 1024]),
    )
    .await
    .expect("send never gave up on the stalled peer");
    assert!(matches!(result, Err(LinkError::WriteStalled)), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // the stalled connection is already gone and cleanup no longer blocks
    assert!(board.is_closed());
    assert_eq!(board.state(), ConnectionState::Disconnected);
    tokio::time::timeout(Duration::from_secs(2), board.cleanup())
        .await
        .expect("cleanup blocked behind the stalled writer");
}

#[tokio::test]
async fn cleanup_interrupts_a_blocking_read() {
    let settings = LinkSettings {
        read_timeout: Duration::from_secs(5),
        ..fast_settings(0)
    };
    let (_controller, board) = attached_pair(settings).await;

    let reading = Arc::clone(&board);
    let read = tokio::spawn(async move { reading.read_command().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    board.cleanup().await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "cleanup took {:?}",
        started.elapsed()
    );
    assert!(board.is_closed());

    let read = tokio::time::timeout(Duration::from_secs(1), read)
        .await
        .expect("read kept running after cleanup")
        .unwrap();
    assert!(matches!(read, Ok(None)), "{read:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_never_interleave() {
    let controller = channel(Role::Controller, fast_settings(0));
    // tiny buffer so every frame needs several writes
    let (ours, mut theirs) = tokio::io::duplex(16);
    controller.attach(ours).await.unwrap();

    const SENDERS: usize = 16;
    let reader = tokio::spawn(async move {
        let mut labels = BTreeSet::new();
        for _ in 0..SENDERS {
            let frame = read_frame(&mut theirs).await.unwrap();
            match Command::from_frame(&frame).unwrap() {
                Command::Write(label) => {
                    labels.insert(label);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        labels
    });

    let mut senders = Vec::new();
    for i in 0..SENDERS {
        let controller = Arc::clone(&controller);
        senders.push(tokio::spawn(async move {
            let label = format!("{:02}", i).repeat(200);
            controller.send_command(&Command::Write(label)).await.unwrap();
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let labels = reader.await.unwrap();
    assert_eq!(labels.len(), SENDERS);
    for (i, label) in labels.iter().enumerate() {
        assert_eq!(*label, format!("{:02}", i).repeat(200));
    }
}
