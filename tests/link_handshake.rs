//! Handshake asymmetry over loopback TCP: the board listens, the controller dials.
mod common;

use std::sync::Arc;
use std::time::Duration;

use tagtrack::link::{Channel, ConnectionState};
use tagtrack::protocol::{local_handshake_info, Command, LinkError, Role, DATA_FRAME};

use common::{channel, fast_settings, free_port};

async fn dial_until_connected(controller: &Arc<Channel>) {
    for _ in 0..50 {
        match controller.handshake().await {
            Ok(()) => return,
            Err(LinkError::ConnectionRefused(_)) => {
                tokio::time::sleep(Duration::from_millis(20)).await
            }
            Err(e) => panic!("unexpected handshake error: {}", e),
        }
    }
    panic!("board never started listening");
}

#[tokio::test]
async fn both_sides_connect_and_exchange_info_once() {
    let settings = fast_settings(free_port());
    let board = channel(Role::Board, settings.clone());
    let controller = channel(Role::Controller, settings);

    let listening = Arc::clone(&board);
    let board_side = tokio::spawn(async move { listening.handshake().await });
    dial_until_connected(&controller).await;
    board_side.await.unwrap().unwrap();

    assert_eq!(board.state(), ConnectionState::Connected);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(controller.peer_info(), Some(local_handshake_info()));
    assert!(board.peer_info().is_none());

    // the info frame was consumed by the handshake; the next frame is ordinary traffic
    controller.send_command(&Command::Send).await.unwrap();
    assert_eq!(board.read_command().await.unwrap(), Some(Command::Send));

    board.send_sensor(DATA_FRAME, &7u32).await.unwrap();
    let frame = controller.read_sensor(true).await.unwrap().unwrap();
    assert_eq!(frame.name, DATA_FRAME);
    assert_eq!(frame.decode_payload::<u32>().unwrap(), 7);
}

#[tokio::test]
async fn dialing_nobody_is_refused_and_stays_disconnected() {
    let controller = channel(Role::Controller, fast_settings(free_port()));
    let err = controller.handshake().await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionRefused(_)), "{err}");
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(controller.is_closed());
}

#[tokio::test]
async fn unknown_device_is_a_refused_dial() {
    let mut settings = fast_settings(free_port());
    settings.device_name = "somebody-else".into();
    let controller = channel(Role::Controller, settings);
    let err = controller.handshake().await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionRefused(_)), "{err}");
    assert!(err.to_string().contains("somebody-else"), "{err}");
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn second_handshake_while_listening_is_busy() {
    let settings = fast_settings(free_port());
    let board = channel(Role::Board, settings.clone());

    let listening = Arc::clone(&board);
    let first = tokio::spawn(async move { listening.handshake().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(board.state(), ConnectionState::Handshaking);
    assert!(matches!(board.handshake().await, Err(LinkError::Busy)));

    // the first attempt is unaffected and still completes
    let controller = channel(Role::Controller, settings);
    dial_until_connected(&controller).await;
    first.await.unwrap().unwrap();
    assert!(board.is_connected());
}

#[tokio::test]
async fn board_can_accept_again_after_a_session_ends() {
    let settings = fast_settings(free_port());
    let board = channel(Role::Board, settings.clone());

    for _ in 0..2 {
        let controller = channel(Role::Controller, settings.clone());
        let listening = Arc::clone(&board);
        let accept = tokio::spawn(async move { listening.handshake().await });
        dial_until_connected(&controller).await;
        accept.await.unwrap().unwrap();

        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(board.read_command().await.unwrap(), Some(Command::Disconnect));
        board.cleanup().await;
        assert!(board.is_closed());
    }
}
