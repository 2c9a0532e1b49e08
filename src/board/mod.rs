//! # Board Service
//!
//! The board owns the tag reader and the activity record and serves one controller
//! at a time:
//!
//! ```text
//! loop {
//!     handshake (retry until a controller connects)
//!     while channel open {
//!         read_command → dispatch
//!     }
//!     cleanup
//! }
//! ```
//!
//! Transport errors end the current session and fall back to the handshake loop;
//! they never end the process. Only `stop <other>` (or the shutdown future passed
//! to [`Board::run_until`]) does.
//!
//! ## Command dispatch
//!
//! | command        | effect                                                     |
//! |----------------|------------------------------------------------------------|
//! | `read`         | start the reader task if it is not running                 |
//! | `write <label>`| stop timer and reader, bind the next tag to `label`        |
//! | `send`         | send the activity record as a `data` frame                 |
//! | `stop update`  | stop the timer, restart the reader                         |
//! | `stop read`    | stop the reader                                            |
//! | `stop <other>` | shut the board down                                        |
//! | `disconnect`   | drop the connection, wait for the next controller          |
//! | `set_time <ts>`| set the system clock                                       |

pub mod clock;
pub mod reader;
pub mod recorder;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::config::Config;
use crate::link::Channel;
use crate::logutil::escape_log;
use crate::protocol::{Command, LinkError, StopTarget, DATA_FRAME};

use clock::SystemClock;
use reader::{ReaderSettings, ReaderTask, TagReader};
use recorder::RecorderHandle;

/// Why [`Board::run_until`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardExit {
    /// The shutdown future completed (Ctrl-C).
    Interrupted,
    /// The controller sent `stop` with a value other than `update`/`read`.
    Shutdown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardSettings {
    pub reader: ReaderSettings,
    /// Pause between failed handshake attempts.
    pub handshake_retry: Duration,
    /// How long `write` waits for the tag to bind.
    pub write_timeout: Duration,
    pub allow_set_time: bool,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            reader: ReaderSettings::default(),
            handshake_retry: Duration::from_secs(1),
            write_timeout: Duration::from_secs(60),
            allow_set_time: false,
        }
    }
}

impl From<&Config> for BoardSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            reader: ReaderSettings::from(&cfg.reader),
            handshake_retry: Duration::from_millis(cfg.link.handshake_retry_ms),
            write_timeout: Duration::from_secs(cfg.reader.write_timeout_secs),
            allow_set_time: cfg.board.allow_set_time,
        }
    }
}

enum Flow {
    Continue,
    Exit(String),
}

pub struct Board {
    channel: Arc<Channel>,
    recorder: RecorderHandle,
    tag_reader: Arc<dyn TagReader>,
    clock: Arc<dyn SystemClock>,
    settings: BoardSettings,
    reader_task: Option<ReaderTask>,
}

impl Board {
    pub fn new(
        channel: Arc<Channel>,
        recorder: RecorderHandle,
        tag_reader: Arc<dyn TagReader>,
        clock: Arc<dyn SystemClock>,
        settings: BoardSettings,
    ) -> Self {
        Self {
            channel,
            recorder,
            tag_reader,
            clock,
            settings,
            reader_task: None,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reader_task.as_ref().is_some_and(ReaderTask::is_running)
    }

    /// Serve controllers until Ctrl-C or a `stop <other>` command.
    pub async fn run(&mut self) -> Result<BoardExit> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve controllers until `shutdown` completes or a `stop <other>` command arrives.
    ///
    /// The reader starts before the first handshake. On the way out the reader is
    /// stopped, the recorder freezes and persists, and the channel is closed.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<BoardExit>
    where
        F: Future<Output = ()>,
    {
        self.start_reading();
        tokio::pin!(shutdown);

        let exit = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                BoardExit::Interrupted
            }
            reason = self.serve() => BoardExit::Shutdown(reason),
        };

        self.stop_reading().await;
        if let Err(e) = self.recorder.shutdown().await {
            warn!("recorder shutdown: {}", e);
        }
        self.channel.close().await;
        info!("Board stopped ({:?})", exit);
        Ok(exit)
    }

    async fn serve(&mut self) -> String {
        loop {
            self.wait_for_controller().await;
            let flow = self.session().await;
            self.channel.cleanup().await;
            if let Flow::Exit(reason) = flow {
                return reason;
            }
        }
    }

    async fn wait_for_controller(&self) {
        // an attached stream counts as an established session
        while !self.channel.is_connected() {
            info!("> Checking hand");
            match self.channel.handshake().await {
                Ok(()) => info!("> Connected"),
                Err(e) => {
                    warn!("handshake failed: {}", e);
                    sleep(self.settings.handshake_retry).await;
                }
            }
        }
    }

    async fn session(&mut self) -> Flow {
        while !self.channel.is_closed() {
            debug!("> Waiting for command");
            let command = match self.channel.read_command().await {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(LinkError::ReadTimeout) => {
                    debug!("no command within the read timeout");
                    continue;
                }
                Err(e) => {
                    warn!("session ended: {}", e);
                    return Flow::Continue;
                }
            };
            info!(
                "Received command: {} {}",
                command.name(),
                command.value().map(escape_log).unwrap_or_default()
            );
            match self.dispatch(command).await {
                Ok(Flow::Continue) => {}
                Ok(exit) => return exit,
                Err(e) => {
                    error!("command failed: {:#}", e);
                    return Flow::Continue;
                }
            }
        }
        Flow::Continue
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Read => {
                if self.is_reading() {
                    debug!("reader already running");
                } else {
                    self.start_reading();
                }
            }
            Command::Write(label) => self.bind_next_tag(label).await?,
            Command::Send => {
                let record = self.recorder.snapshot().await?;
                self.channel.send_sensor(DATA_FRAME, &record).await?;
                info!("Sent activity record ({} entries)", record.len());
            }
            Command::Stop(StopTarget::Update) => {
                self.recorder.stop_timer().await?;
                self.restart_reading().await;
            }
            Command::Stop(StopTarget::Read) => self.stop_reading().await,
            Command::Stop(StopTarget::Other(value)) => {
                info!("Stop requested ({}), shutting down", escape_log(&value));
                return Ok(Flow::Exit(value));
            }
            Command::Disconnect => self.channel.cleanup().await,
            Command::SetTime(timestamp) => self.set_time(timestamp).await,
        }
        Ok(Flow::Continue)
    }

    fn start_reading(&mut self) {
        let task = ReaderTask::spawn(
            Arc::clone(&self.tag_reader),
            self.recorder.clone(),
            self.settings.reader,
        );
        self.reader_task = Some(task);
    }

    async fn stop_reading(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.stop().await;
        }
    }

    async fn restart_reading(&mut self) {
        self.stop_reading().await;
        self.start_reading();
    }

    async fn bind_next_tag(&mut self, label: String) -> Result<()> {
        self.recorder.stop_timer().await?;
        self.stop_reading().await;

        info!("> Present the tag for {}", escape_log(&label));
        let reader = Arc::clone(&self.tag_reader);
        let wait = self.settings.write_timeout;
        match tokio::task::spawn_blocking(move || reader.wait_for_tag(wait)).await?? {
            Some(tag) => self.recorder.bind(tag, label).await?,
            None => warn!(
                "no tag presented within {}s; {} not registered",
                wait.as_secs(),
                escape_log(&label)
            ),
        }
        Ok(())
    }

    async fn set_time(&self, timestamp: String) {
        if !self.settings.allow_set_time {
            info!(
                "Ignoring set_time {} (allow_set_time is off)",
                escape_log(&timestamp)
            );
            return;
        }
        let clock = Arc::clone(&self.clock);
        match tokio::task::spawn_blocking(move || clock.set(&timestamp)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("set_time failed: {:#}", e),
            Err(e) => warn!("set_time task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::config::{LinkSettings, StorageConfig};
    use crate::link::StaticResolver;
    use crate::protocol::Role;
    use crate::storage::Storage;
    use crate::tag::TagId;
    use recorder::start_recorder;

    /// Idle reader that tracks how many waits overlap.
    #[derive(Default)]
    struct CountingReader {
        waiting: AtomicUsize,
        most: AtomicUsize,
    }

    impl TagReader for CountingReader {
        fn wait_for_tag(&self, timeout: Duration) -> Result<Option<TagId>> {
            let now = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
            self.most.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(timeout);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct NoClock;

    impl SystemClock for NoClock {
        fn set(&self, _timestamp: &str) -> Result<()> {
            Ok(())
        }
    }

    fn board(dir: &TempDir, reader: Arc<CountingReader>) -> Board {
        let storage = Storage::open(&StorageConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            lookup_file: "lookup_table.json".into(),
            activity_file: "activity_table.json".into(),
        })
        .unwrap();
        let (recorder, _join) = start_recorder(storage.lookup, storage.activity, storage.record);
        let channel = Arc::new(Channel::new(
            Role::Board,
            LinkSettings::default(),
            Arc::new(StaticResolver::new("127.0.0.1")),
        ));
        let settings = BoardSettings {
            reader: ReaderSettings {
                poll_timeout: Duration::from_millis(20),
                read_interval: Duration::from_millis(20),
            },
            ..BoardSettings::default()
        };
        Board::new(channel, recorder, reader, Arc::new(NoClock), settings)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_keeps_the_running_reader() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(CountingReader::default());
        let mut board = board(&dir, Arc::clone(&reader));

        board.dispatch(Command::Read).await.unwrap();
        assert!(board.is_reading());
        board.dispatch(Command::Read).await.unwrap();
        board.dispatch(Command::Read).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(board.is_reading());
        assert_eq!(reader.most.load(Ordering::SeqCst), 1);
        board.stop_reading().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_read_stops_and_read_restarts() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(CountingReader::default());
        let mut board = board(&dir, Arc::clone(&reader));

        board.dispatch(Command::Read).await.unwrap();
        board
            .dispatch(Command::Stop(StopTarget::Read))
            .await
            .unwrap();
        assert!(!board.is_reading());
        // the stopped task has returned from its last wait
        assert_eq!(reader.waiting.load(Ordering::SeqCst), 0);

        board.dispatch(Command::Read).await.unwrap();
        assert!(board.is_reading());
        board.stop_reading().await;
    }

    #[tokio::test]
    async fn disconnect_releases_the_stream_and_keeps_serving() {
        let dir = TempDir::new().unwrap();
        let mut board = board(&dir, Arc::new(CountingReader::default()));
        let (ours, _theirs) = tokio::io::duplex(64);
        board.channel.attach(ours).await.unwrap();

        let flow = board.dispatch(Command::Disconnect).await.unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert!(board.channel.is_closed());
        assert!(!board.channel.is_connected());
    }
}
