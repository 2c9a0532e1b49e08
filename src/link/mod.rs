//! # Link Channel
//!
//! [`Channel`] owns the stream between the board and the controller and turns it
//! into role-gated send/receive operations over [`Frame`]s.
//!
//! ## Lifecycle
//!
//! ```text
//!  Disconnected ──handshake()──▶ Handshaking ──ok──▶ Connected
//!       ▲                             │                 │
//!       └────────── failure ──────────┘                 │
//!       └──── cleanup() / disconnect() / stream error ──┘
//! ```
//!
//! The controller dials the board (address from an [`AddressResolver`]) and reads one
//! info frame; the board listens, accepts exactly one connection and sends that
//! info frame. Both control frames go over the halves held by the handshake guard.
//!
//! ## Read policy
//!
//! Blocking reads wait up to `read_timeout` for a frame. Polling reads give the first
//! prefix bytes only `poll_timeout`; silence is reported as "no data yet" (`Ok(None)`)
//! until more than `read_timeout` has passed since the first silent poll, after which
//! the same silence is reported as [`LinkError::ReadTimeout`]. The watermark is reset
//! by every received frame and by every new connection.
//!
//! ## Delivery
//!
//! Sends are best-effort: a reset stream during a write is logged and swallowed, so a
//! caller never learns that a fire-and-forget frame was lost. A peer that stops
//! reading is different: a write that cannot finish within `read_timeout` fails with
//! [`LinkError::WriteStalled`] and the connection is torn down.
//!
//! [`Channel::cleanup`] and [`Channel::handshake`] interrupt in-flight reads and
//! sends rather than waiting for them to time out.

pub mod guard;
pub mod resolver;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{sleep, timeout, Instant};

use crate::config::LinkSettings;
use crate::logutil::{escape_log, hex_preview};
use crate::protocol::frame::{self, Frame};
use crate::protocol::{
    local_handshake_info, Command, HandshakeInfo, LinkError, Role, HANDSHAKE_FRAME,
};

use guard::{HandshakeGuard, ReadHalf, StreamGuard, WriteHalf};
pub use resolver::{AddressResolver, StaticResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    /// Released for good by [`Channel::close`].
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Blocking,
    Poll,
}

enum ReadFailure {
    NoData,
    Link(LinkError),
}

impl From<LinkError> for ReadFailure {
    fn from(err: LinkError) -> Self {
        ReadFailure::Link(err)
    }
}

pub struct Channel {
    role: Role,
    settings: LinkSettings,
    resolver: Arc<dyn AddressResolver>,
    guard: StreamGuard,
    state: Mutex<ConnectionState>,
    open: AtomicBool,
    no_data_since: Mutex<Option<Instant>>,
    peer_info: Mutex<Option<HandshakeInfo>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Channel {
    pub fn new(role: Role, settings: LinkSettings, resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            role,
            settings,
            resolver,
            guard: StreamGuard::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            open: AtomicBool::new(false),
            no_data_since: Mutex::new(None),
            peer_info: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True when no stream is attached (never connected, or torn down).
    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    /// Info map received from the board during the last handshake (controller side).
    pub fn peer_info(&self) -> Option<HandshakeInfo> {
        lock(&self.peer_info).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("channel state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<(), LinkError> {
        if self.role == role {
            Ok(())
        } else {
            Err(LinkError::RoleViolation {
                role: self.role,
                operation,
            })
        }
    }

    fn reset_watermark(&self) {
        *lock(&self.no_data_since) = None;
    }

    /* -------------------- connection lifecycle -------------------- */

    /// Establish the connection: dial on the controller side, listen+accept on the board.
    pub async fn handshake(&self) -> Result<(), LinkError> {
        let mut hs = self.guard.begin_handshake().await?;
        self.set_state(ConnectionState::Handshaking);
        info!("Hand checking ({} side)...", self.role);

        let result = match self.role {
            Role::Controller => self.dial(&mut hs).await,
            Role::Board => self.accept(&mut hs).await,
        };
        drop(hs);

        match result {
            Ok(()) => {
                self.open.store(true, Ordering::Release);
                self.reset_watermark();
                self.set_state(ConnectionState::Connected);
                info!(" [done]");
                Ok(())
            }
            Err(e) => {
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn dial(&self, hs: &mut HandshakeGuard<'_>) -> Result<(), LinkError> {
        let address = self
            .resolver
            .resolve_peer(&self.settings.device_name)
            .map_err(|e| {
                warn!(" [failed] {}", e);
                LinkError::ConnectionRefused(e.to_string())
            })?;
        let target = format!("{}:{}", address, self.settings.service_port);

        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => {
                info!(" [connected to {}]", target);
                stream
            }
            Ok(Err(e)) => {
                warn!(" [failed] {}: {}", target, e);
                return Err(LinkError::ConnectionRefused(format!("{}: {}", target, e)));
            }
            Err(_) => {
                warn!(" [failed] {}: connect timed out", target);
                return Err(LinkError::ConnectionRefused(format!(
                    "{}: connect timed out",
                    target
                )));
            }
        };
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        hs.install(Box::new(r), Box::new(w));

        // give the board time to finish accepting before its info frame is expected
        sleep(self.settings.settle_delay).await;

        let reader = hs.reader.as_mut().ok_or(LinkError::NotConnected)?;
        let info_frame = match timeout(self.settings.read_timeout, frame::read_frame(reader)).await {
            Ok(result) => result?,
            Err(_) => return Err(LinkError::ReadTimeout),
        };
        if info_frame.name != HANDSHAKE_FRAME {
            return Err(LinkError::UnexpectedFrame(info_frame.name));
        }
        let info: HandshakeInfo = info_frame.decode_payload()?;
        info!(" [received handshake info {:?}]", info);
        *lock(&self.peer_info) = Some(info);
        Ok(())
    }

    async fn accept(&self, hs: &mut HandshakeGuard<'_>) -> Result<(), LinkError> {
        let address = self.resolver.local_address()?;
        let bind: SocketAddr = format!("{}:{}", address, self.settings.service_port)
            .parse()
            .map_err(|e| LinkError::Resolve(format!("bad listen address {}: {}", address, e)))?;

        let socket = if bind.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind)?;
        let listener = socket.listen(1)?;
        debug!("listening on {}", bind);

        let (stream, peer) = listener.accept().await?;
        // one peer per connection; stop listening as soon as it is in
        drop(listener);
        info!(" [accepted connection from {}]", peer);
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        hs.install(Box::new(r), Box::new(w));

        let info = Frame::with_payload(HANDSHAKE_FRAME, &local_handshake_info())?;
        let writer = hs.writer.as_mut().ok_or(LinkError::NotConnected)?;
        write_frame(writer, &info).await?;
        info!(" [sent handshake info]");
        Ok(())
    }

    /// Adopt an already-connected stream, skipping dial/accept and the info exchange.
    pub async fn attach<S>(&self, stream: S) -> Result<(), LinkError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut hs = self.guard.begin_handshake().await?;
        let (r, w) = tokio::io::split(stream);
        hs.install(Box::new(r) as ReadHalf, Box::new(w) as WriteHalf);
        drop(hs);
        self.open.store(true, Ordering::Release);
        self.reset_watermark();
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Tell the board we are leaving (controller side), then tear down.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            info!("Channel already disconnected");
            return;
        }
        if self.role == Role::Controller {
            if let Err(e) = self.send_command(&Command::Disconnect).await {
                warn!("failed to send disconnect: {}", e);
            }
        }
        self.cleanup().await;
    }

    /// Release the stream. Idempotent; close-time errors are logged, never returned.
    pub async fn cleanup(&self) {
        info!("Cleaning up communication channel ({} side)", self.role);
        self.guard.interrupt();
        {
            let mut writer = self.guard.lock_writer().await;
            if let Some(mut w) = writer.take() {
                match timeout(self.settings.read_timeout, w.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("error while closing stream: {}", e),
                    Err(_) => debug!("peer did not take the final flush; dropping stream"),
                }
            }
        }
        self.guard.lock_reader().await.take();
        self.open.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Final teardown; the channel reports [`ConnectionState::Closed`] afterwards.
    pub async fn close(&self) {
        self.cleanup().await;
        self.set_state(ConnectionState::Closed);
    }

    /* -------------------- sending -------------------- */

    /// Send a command to the board (controller only). Best-effort, see module docs.
    pub async fn send_command(&self, command: &Command) -> Result<(), LinkError> {
        self.require(Role::Controller, "send commands")?;
        let frame = command.to_frame()?;
        if *command == Command::Disconnect {
            self.set_state(ConnectionState::Disconnected);
        }
        self.send_frame(&frame).await
    }

    /// Send a named sensor value to the controller (board only). Best-effort.
    pub async fn send_sensor<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), LinkError> {
        self.require(Role::Board, "send sensor data")?;
        let frame = Frame::with_payload(name, value)?;
        self.send_frame(&frame).await
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        let mut interrupted = self.guard.subscribe();
        let mut slot = tokio::select! {
            slot = self.guard.lock_writer() => slot,
            _ = interrupted.changed() => {
                warn!("Channel torn down before '{}' was sent", escape_log(&frame.name));
                return Ok(());
            }
        };
        debug!("channel - send lock ({})", frame.name);
        let writer = slot.as_mut().ok_or(LinkError::NotConnected)?;
        trace!("-> {} {}", frame.name, hex_preview(&frame.payload));

        let written = tokio::select! {
            biased;
            _ = interrupted.changed() => {
                warn!("Channel torn down while sending '{}'", escape_log(&frame.name));
                return Ok(());
            }
            written = timeout(self.settings.read_timeout, write_frame(writer, frame)) => {
                written.unwrap_or(Err(LinkError::WriteStalled))
            }
        };
        match written {
            Ok(()) => Ok(()),
            Err(LinkError::ConnectionReset) => {
                warn!("Connection lost while sending '{}'", escape_log(&frame.name));
                Ok(())
            }
            Err(LinkError::WriteStalled) => {
                warn!(
                    "Peer stopped reading; '{}' not delivered within {:?}",
                    escape_log(&frame.name),
                    self.settings.read_timeout
                );
                // a half-written frame leaves the writer unusable
                slot.take();
                drop(slot);
                self.cleanup().await;
                Err(LinkError::WriteStalled)
            }
            Err(e) => Err(e),
        }
    }

    /* -------------------- receiving -------------------- */

    /// Blocking read of the next command (board only).
    ///
    /// Frames outside the command vocabulary are logged and skipped (`Ok(None)`).
    pub async fn read_command(&self) -> Result<Option<Command>, LinkError> {
        self.require(Role::Board, "read commands")?;
        let Some(frame) = self.read_frame(ReadMode::Blocking).await? else {
            return Ok(None);
        };
        match Command::from_frame(&frame) {
            Ok(cmd) => Ok(Some(cmd)),
            Err(LinkError::UnexpectedFrame(_)) | Err(LinkError::Payload(_)) => {
                warn!("ignoring unknown command '{}'", escape_log(&frame.name));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the next sensor frame (controller only); `wait = false` polls.
    pub async fn read_sensor(&self, wait: bool) -> Result<Option<Frame>, LinkError> {
        self.require(Role::Controller, "read sensor data")?;
        let mode = if wait { ReadMode::Blocking } else { ReadMode::Poll };
        self.read_frame(mode).await
    }

    async fn read_frame(&self, mode: ReadMode) -> Result<Option<Frame>, LinkError> {
        if !self.is_connected() {
            debug!("attempted to read while not being connected, return None");
            return Ok(None);
        }

        let mut interrupted = self.guard.subscribe();
        let outcome = {
            let mut slot = tokio::select! {
                slot = self.guard.lock_reader() => slot,
                _ = interrupted.changed() => return Ok(None),
            };
            debug!("channel - read lock");
            let Some(reader) = slot.as_mut() else {
                return Ok(None);
            };
            tokio::select! {
                biased;
                _ = interrupted.changed() => {
                    debug!("read interrupted by teardown");
                    return Ok(None);
                }
                outcome = read_with_policy(reader, mode, &self.settings) => outcome,
            }
        };

        match outcome {
            Ok(frame) => {
                self.reset_watermark();
                trace!("<- {} {}", frame.name, hex_preview(&frame.payload));
                Ok(Some(frame))
            }
            Err(ReadFailure::NoData) => self.no_data_yet(),
            Err(ReadFailure::Link(LinkError::ConnectionReset)) => {
                warn!("Connection lost while reading object");
                self.cleanup().await;
                Ok(None)
            }
            Err(ReadFailure::Link(e)) if e.is_disconnect() => {
                info!("peer went away: {}", e);
                self.cleanup().await;
                Err(e)
            }
            Err(ReadFailure::Link(e)) => Err(e),
        }
    }

    fn no_data_yet(&self) -> Result<Option<Frame>, LinkError> {
        let mut since = lock(&self.no_data_since);
        let first = *since.get_or_insert_with(Instant::now);
        if first.elapsed() < self.settings.read_timeout {
            Ok(None)
        } else {
            warn!(
                "no data from peer for {:.1}s",
                first.elapsed().as_secs_f64()
            );
            Err(LinkError::ReadTimeout)
        }
    }
}

async fn write_frame(writer: &mut BufWriter<WriteHalf>, frame: &Frame) -> Result<(), LinkError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_with_policy(
    reader: &mut BufReader<ReadHalf>,
    mode: ReadMode,
    settings: &LinkSettings,
) -> Result<Frame, ReadFailure> {
    let first_wait = match mode {
        ReadMode::Blocking => settings.read_timeout,
        ReadMode::Poll => settings.poll_timeout,
    };
    let mut prefix = [0u8; 2];
    let have = match timeout(first_wait, reader.read(&mut prefix)).await {
        Ok(result) => result.map_err(LinkError::from)?,
        Err(_) if mode == ReadMode::Poll => return Err(ReadFailure::NoData),
        Err(_) => return Err(LinkError::ReadTimeout.into()),
    };
    // bytes are flowing; the rest of the frame gets the full timeout
    match timeout(settings.read_timeout, frame::finish_frame(reader, prefix, have)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(LinkError::FrameStalled.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(300),
            poll_timeout: Duration::from_millis(1),
            ..LinkSettings::default()
        }
    }

    fn channel(role: Role) -> Channel {
        Channel::new(role, settings(), Arc::new(StaticResolver::new("127.0.0.1")))
    }

    #[tokio::test]
    async fn operations_outside_the_role_are_rejected() {
        let board = channel(Role::Board);
        assert!(matches!(
            board.send_command(&Command::Read).await,
            Err(LinkError::RoleViolation { role: Role::Board, .. })
        ));
        assert!(matches!(
            board.read_sensor(false).await,
            Err(LinkError::RoleViolation { .. })
        ));
        let controller = channel(Role::Controller);
        assert!(matches!(
            controller.read_command().await,
            Err(LinkError::RoleViolation { role: Role::Controller, .. })
        ));
        assert!(matches!(
            controller.send_sensor("data", &1u8).await,
            Err(LinkError::RoleViolation { .. })
        ));
    }

    #[tokio::test]
    async fn reads_before_connecting_return_nothing() {
        let board = channel(Role::Board);
        assert!(board.is_closed());
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(board.read_command().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let board = channel(Role::Board);
        let (ours, _theirs) = tokio::io::duplex(64);
        board.attach(ours).await.unwrap();
        assert!(!board.is_closed());
        board.cleanup().await;
        board.cleanup().await;
        assert!(board.is_closed());
        assert_eq!(board.state(), ConnectionState::Disconnected);
        board.close().await;
        assert_eq!(board.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn disconnect_command_flips_state_before_the_write() {
        let controller = channel(Role::Controller);
        let (ours, mut theirs) = tokio::io::duplex(256);
        controller.attach(ours).await.unwrap();
        controller.send_command(&Command::Disconnect).await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        let frame = frame::read_frame(&mut theirs).await.unwrap();
        assert_eq!(frame.name, "disconnect");
    }
}
