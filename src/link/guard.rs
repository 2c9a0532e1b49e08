//! Exclusive access to the shared stream.
//!
//! The stream is split into a read half and a write half, each parked in its own
//! async mutex. Holding the writer slot is the `sending` guard, holding the reader
//! slot is the `reading` guard. A frame is written start to finish while the writer
//! slot is held, so two senders can never interleave bytes on the wire.
//!
//! A handshake takes both slots for its whole duration through [`HandshakeGuard`]
//! and performs its control frames directly on the halves it holds; ordinary sends
//! and reads queue behind it. A second handshake attempt fails fast with
//! [`LinkError::Busy`] instead of queuing.
//!
//! Teardown and handshake never wait out an in-flight read or send: they bump an
//! interrupt counter first, and every holder of a slot watches that counter and
//! lets go as soon as it moves.
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::protocol::LinkError;

pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

pub type ReaderSlot = Option<BufReader<ReadHalf>>;
pub type WriterSlot = Option<BufWriter<WriteHalf>>;

pub struct StreamGuard {
    reader: Mutex<ReaderSlot>,
    writer: Mutex<WriterSlot>,
    handshaking: AtomicBool,
    interrupts: watch::Sender<u64>,
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamGuard {
    pub fn new() -> Self {
        let (interrupts, _) = watch::channel(0);
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            handshaking: AtomicBool::new(false),
            interrupts,
        }
    }

    /// Watch for [`interrupt`](Self::interrupt) calls made after this point.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.interrupts.subscribe()
    }

    /// Ask every current slot holder to give its slot up.
    pub fn interrupt(&self) {
        self.interrupts.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Take the `sending` guard, waiting behind any in-flight send or handshake.
    pub async fn lock_writer(&self) -> MutexGuard<'_, WriterSlot> {
        match self.writer.try_lock() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("channel already busy sending data, wait");
                self.writer.lock().await
            }
        }
    }

    /// Take the `reading` guard, waiting behind any in-flight read or handshake.
    pub async fn lock_reader(&self) -> MutexGuard<'_, ReaderSlot> {
        match self.reader.try_lock() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("channel already busy reading, wait");
                self.reader.lock().await
            }
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshaking.load(Ordering::Acquire)
    }

    /// Claim the handshake phase and both stream slots.
    pub async fn begin_handshake(&self) -> Result<HandshakeGuard<'_>, LinkError> {
        if self
            .handshaking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LinkError::Busy);
        }
        debug!("channel - handshake lock");
        // The flag is reset by HandshakeGuard::drop, so build it before awaiting.
        let flag = HandshakeFlag(&self.handshaking);
        self.interrupt();
        let writer = self.writer.lock().await;
        let reader = self.reader.lock().await;
        Ok(HandshakeGuard {
            reader,
            writer,
            _flag: flag,
        })
    }
}

struct HandshakeFlag<'a>(&'a AtomicBool);

impl Drop for HandshakeFlag<'_> {
    fn drop(&mut self) {
        debug!("channel - handshake unlock");
        self.0.store(false, Ordering::Release);
    }
}

/// Both stream slots, held for the duration of a handshake.
pub struct HandshakeGuard<'a> {
    pub reader: MutexGuard<'a, ReaderSlot>,
    pub writer: MutexGuard<'a, WriterSlot>,
    _flag: HandshakeFlag<'a>,
}

impl HandshakeGuard<'_> {
    /// Park freshly connected halves in the slots.
    pub fn install(&mut self, reader: ReadHalf, writer: WriteHalf) {
        *self.reader = Some(BufReader::new(reader));
        *self.writer = Some(BufWriter::new(writer));
    }
}
