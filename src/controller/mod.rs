//! Controller side: dial the board, issue commands, fetch the activity record.
pub mod shell;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{debug, info};

use crate::activity::ActivityRecord;
use crate::link::Channel;
use crate::logutil::escape_log;
use crate::protocol::{Command, StopTarget, DATA_FRAME};

/// Default file name for [`export_csv`].
pub const DEFAULT_EXPORT: &str = "timetable.csv";

const CSV_HEADER: &str = "task,date,duration\n";

pub struct Controller {
    channel: Arc<Channel>,
}

impl Controller {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Handshake with the board, sync its clock to ours and start its reader.
    pub async fn connect(&self) -> Result<()> {
        self.channel
            .handshake()
            .await
            .context("could not connect to the board")?;
        if let Some(info) = self.channel.peer_info() {
            debug!("board info: {:?}", info);
        }
        self.set_time(None).await?;
        self.start_reading().await
    }

    pub async fn start_reading(&self) -> Result<()> {
        self.send(Command::Read).await
    }

    /// Bind the next tag presented to the board to `label`.
    ///
    /// A `read` is queued behind the `write`, so reading resumes once the board has
    /// finished waiting for the tag.
    pub async fn register(&self, label: &str) -> Result<()> {
        info!("Registering task {}", escape_log(label));
        self.send(Command::Write(label.to_string())).await?;
        self.start_reading().await
    }

    /// Ask for the activity record and wait for it.
    pub async fn download(&self) -> Result<ActivityRecord> {
        self.send(Command::Send).await?;
        loop {
            match self.channel.read_sensor(true).await? {
                Some(frame) if frame.name == DATA_FRAME => {
                    let record: ActivityRecord = frame.decode_payload()?;
                    info!("Received activity record ({} entries)", record.len());
                    return Ok(record);
                }
                Some(frame) => debug!("skipping '{}' frame", escape_log(&frame.name)),
                None => bail!("connection lost before the activity record arrived"),
            }
        }
    }

    pub async fn stop(&self, target: StopTarget) -> Result<()> {
        self.send(Command::Stop(target)).await
    }

    /// Set the board clock; `None` sends our local time.
    pub async fn set_time(&self, timestamp: Option<String>) -> Result<()> {
        let timestamp =
            timestamp.unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        self.send(Command::SetTime(timestamp)).await
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
        self.channel.close().await;
    }

    async fn send(&self, command: Command) -> Result<()> {
        if !self.channel.is_connected() {
            bail!("not connected to the board");
        }
        self.channel.send_command(&command).await?;
        debug!("sent {}", command.name());
        Ok(())
    }
}

/// Write `record` as `task,date,duration` CSV.
pub async fn export_csv(record: &ActivityRecord, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut content = String::from(CSV_HEADER);
    content.push_str(&record.to_csv());
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Exported {} rows to {}", record.len(), path.display());
    Ok(())
}
