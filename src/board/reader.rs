//! Tag reader hardware and the background task that polls it.
//!
//! [`TagReader::wait_for_tag`] is a blocking call bounded by a timeout; the reader task
//! runs it on the blocking pool, forwards every tag to the recorder, and re-checks its
//! stop flag between waits so [`ReaderTask::stop`] returns within one poll window.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::recorder::{RecorderHandle, TagOutcome};
use crate::config::ReaderConfig;
use crate::tag::TagId;

/// Hardware (or stand-in) that reports tag UIDs.
pub trait TagReader: Send + Sync + 'static {
    /// Block for at most `timeout` waiting for a tag. `Ok(None)` means none was presented.
    fn wait_for_tag(&self, timeout: Duration) -> Result<Option<TagId>>;
}

/// Timing of the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Bound on a single hardware wait; also bounds how long a stop request can take.
    pub poll_timeout: Duration,
    /// Pause after each accepted read.
    pub read_interval: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            read_interval: Duration::from_secs(1),
        }
    }
}

impl From<&ReaderConfig> for ReaderSettings {
    fn from(cfg: &ReaderConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(cfg.poll_timeout_ms),
            read_interval: Duration::from_millis(cfg.read_interval_ms),
        }
    }
}

/// Handle on a running reader task.
pub struct ReaderTask {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaderTask {
    pub fn spawn(
        reader: Arc<dyn TagReader>,
        recorder: RecorderHandle,
        settings: ReaderSettings,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(read_loop(reader, recorder, settings, stop_rx));
        info!("Reader started");
        Self { stop_tx, join }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Ask the task to stop and wait for it; bounded by one poll window.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!("reader task ended abnormally: {}", e);
        }
        info!("Reader stopped");
    }
}

async fn read_loop(
    reader: Arc<dyn TagReader>,
    recorder: RecorderHandle,
    settings: ReaderSettings,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!("> Waiting to read new tag");
    while !*stop_rx.borrow() {
        let hw = Arc::clone(&reader);
        let poll = settings.poll_timeout;
        let result = tokio::task::spawn_blocking(move || hw.wait_for_tag(poll)).await;
        if *stop_rx.borrow() {
            break;
        }

        match result {
            Ok(Ok(Some(tag))) => {
                debug!("Tag read: {}", tag);
                match recorder.present(tag).await {
                    Ok(TagOutcome::Started(_)) => debug!("> Waiting to read new tag"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("{}; reader exiting", e);
                        break;
                    }
                }
            }
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => warn!("tag reader error: {:#}", e),
            Err(e) => {
                error!("tag reader wait panicked: {}", e);
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.read_interval) => {}
            _ = stop_rx.changed() => {}
        }
    }
}

/// Tag reader fed from an in-process channel; used for keyboard input and tests.
pub struct ChannelTagReader {
    rx: Mutex<std_mpsc::Receiver<TagId>>,
}

/// Sending side of a [`ChannelTagReader`].
#[derive(Clone)]
pub struct TagFeeder {
    tx: std_mpsc::Sender<TagId>,
}

impl TagFeeder {
    /// Present a tag. Returns false once the reader is gone.
    pub fn present(&self, tag: TagId) -> bool {
        self.tx.send(tag).is_ok()
    }
}

impl ChannelTagReader {
    pub fn new() -> (Self, TagFeeder) {
        let (tx, rx) = std_mpsc::channel();
        (Self { rx: Mutex::new(rx) }, TagFeeder { tx })
    }
}

impl TagReader for ChannelTagReader {
    fn wait_for_tag(&self, timeout: Duration) -> Result<Option<TagId>> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| anyhow!("tag channel lock poisoned"))?;
        match rx.recv_timeout(timeout) {
            Ok(tag) => Ok(Some(tag)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                // No feeder left; behave like an idle reader.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialTagReader;

#[cfg(feature = "serial")]
mod serial {
    use std::io::{BufRead, BufReader, ErrorKind};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use log::{debug, info};
    use serialport::SerialPort;

    use super::TagReader;
    use crate::logutil::escape_log;
    use crate::tag::TagId;

    struct SerialState {
        port: BufReader<Box<dyn SerialPort>>,
        pending: String,
    }

    /// Reader module on a serial line that prints one UID per line.
    pub struct SerialTagReader {
        path: String,
        state: Mutex<SerialState>,
    }

    impl SerialTagReader {
        pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
            let port = serialport::new(path, baud_rate)
                .timeout(Duration::from_millis(100))
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
                .with_context(|| format!("opening tag reader on {}", path))?;
            info!("Tag reader opened on {} @ {} baud", path, baud_rate);
            Ok(Self {
                path: path.to_string(),
                state: Mutex::new(SerialState {
                    port: BufReader::new(port),
                    pending: String::new(),
                }),
            })
        }
    }

    impl TagReader for SerialTagReader {
        fn wait_for_tag(&self, timeout: Duration) -> Result<Option<TagId>> {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("serial reader lock poisoned"))?;
            let SerialState { port, pending } = &mut *state;
            port.get_mut().set_timeout(timeout)?;
            // A partial line stays in `pending` across timeouts.
            match port.read_line(pending) {
                Ok(0) => Ok(None),
                Ok(_) => {
                    let line = std::mem::take(pending);
                    match TagId::parse(&line) {
                        Some(tag) => Ok(Some(tag)),
                        None => {
                            debug!("{}: ignoring line {}", self.path, escape_log(line.trim()));
                            Ok(None)
                        }
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    Ok(None)
                }
                Err(e) => Err(e).with_context(|| format!("reading tag reader on {}", self.path)),
            }
        }
    }
}
