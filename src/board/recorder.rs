//! Activity recorder task.
//!
//! A single task owns the [`ActivityRecord`], the tag lookup table and the per-second
//! timer. The reader task and the dispatcher talk to it through a [`RecorderHandle`];
//! nothing else touches the record, so there is exactly one writer by construction.
//!
//! The timer is an optional interval inside the task. Starting a new activity disarms
//! the old one (after a final update, which freezes the previous entry) and arms a
//! fresh one, so at most one task ever accumulates time and it is always the last
//! entry. Every tick writes `now - start` into the last entry and persists the record.

use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::activity::ActivityRecord;
use crate::logutil::escape_log;
use crate::storage::{ActivityStore, LookupStore, StoreError};
use crate::tag::TagId;

const TICK: Duration = Duration::from_secs(1);

/// What happened to a presented tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    /// A new activity with this label is now running.
    Started(String),
    /// Same tag as the running activity; nothing changed.
    AlreadyActive,
    /// No label is bound to the tag; nothing changed.
    Unknown,
}

/// Point-in-time view of the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderStatus {
    pub active: Option<String>,
    pub timer_running: bool,
    pub last_seen: Option<TagId>,
    pub entries: usize,
}

enum RecorderCommand {
    Present(TagId, oneshot::Sender<TagOutcome>),
    Bind(TagId, String, oneshot::Sender<Result<(), StoreError>>),
    StopTimer(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<ActivityRecord>),
    Status(oneshot::Sender<RecorderStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<RecorderCommand>,
}

impl RecorderHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| anyhow!("activity recorder has stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("activity recorder dropped the request"))
    }

    /// Report a tag read; starts a new activity if the tag is new and known.
    pub async fn present(&self, tag: TagId) -> Result<TagOutcome> {
        self.request(|reply| RecorderCommand::Present(tag, reply)).await
    }

    /// Bind `tag` to `label`, persist the lookup table and forget the last-seen tag.
    pub async fn bind(&self, tag: TagId, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        self.request(|reply| RecorderCommand::Bind(tag, label, reply))
            .await?
            .map_err(Into::into)
    }

    /// Freeze the running activity; a no-op when no timer is armed.
    pub async fn stop_timer(&self) -> Result<()> {
        self.request(RecorderCommand::StopTimer).await
    }

    pub async fn snapshot(&self) -> Result<ActivityRecord> {
        self.request(RecorderCommand::Snapshot).await
    }

    pub async fn status(&self) -> Result<RecorderStatus> {
        self.request(RecorderCommand::Status).await
    }

    /// Freeze, persist and end the recorder task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(RecorderCommand::Shutdown).await
    }
}

struct ActiveTimer {
    started: Instant,
    interval: Interval,
}

impl ActiveTimer {
    fn arm() -> Self {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            started: Instant::now(),
            interval,
        }
    }
}

struct Recorder {
    lookup: LookupStore,
    store: ActivityStore,
    record: ActivityRecord,
    last_seen: Option<TagId>,
    timer: Option<ActiveTimer>,
}

enum Event {
    Command(Option<RecorderCommand>),
    Tick,
}

/// Spawn the recorder task over already-loaded stores.
pub fn start_recorder(
    lookup: LookupStore,
    store: ActivityStore,
    record: ActivityRecord,
) -> (RecorderHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RecorderCommand>();
    let mut recorder = Recorder {
        lookup,
        store,
        record,
        last_seen: None,
        timer: None,
    };

    let join = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                cmd = rx.recv() => Event::Command(cmd),
                _ = next_tick(&mut recorder.timer) => Event::Tick,
            };
            match event {
                Event::Tick => recorder.update_elapsed(),
                Event::Command(None) => {
                    recorder.disarm();
                    break;
                }
                Event::Command(Some(cmd)) => {
                    if recorder.handle(cmd).is_break() {
                        break;
                    }
                }
            }
        }
        info!("Activity recorder stopped");
    });

    (RecorderHandle { tx }, join)
}

async fn next_tick(timer: &mut Option<ActiveTimer>) {
    match timer {
        Some(t) => {
            t.interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Recorder {
    fn handle(&mut self, cmd: RecorderCommand) -> ControlFlow<()> {
        match cmd {
            RecorderCommand::Present(tag, reply) => {
                let outcome = self.record_new_activity(tag);
                let _ = reply.send(outcome);
            }
            RecorderCommand::Bind(tag, label, reply) => {
                let _ = reply.send(self.bind(tag, label));
            }
            RecorderCommand::StopTimer(reply) => {
                self.disarm();
                let _ = reply.send(());
            }
            RecorderCommand::Snapshot(reply) => {
                let _ = reply.send(self.record.clone());
            }
            RecorderCommand::Status(reply) => {
                let _ = reply.send(RecorderStatus {
                    active: self
                        .timer
                        .as_ref()
                        .and_then(|_| self.record.names.last().cloned()),
                    timer_running: self.timer.is_some(),
                    last_seen: self.last_seen.clone(),
                    entries: self.record.len(),
                });
            }
            RecorderCommand::Shutdown(done) => {
                self.disarm();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn record_new_activity(&mut self, tag: TagId) -> TagOutcome {
        if self.last_seen.as_ref() == Some(&tag) {
            trace!("tag {} is already the active one", tag);
            return TagOutcome::AlreadyActive;
        }
        let Some(label) = self.lookup.get(&tag).map(str::to_owned) else {
            warn!("No task registered for tag {}", tag);
            return TagOutcome::Unknown;
        };
        info!("Starting task {}", escape_log(&label));
        self.disarm();
        self.record.start(label.clone(), Utc::now());
        self.last_seen = Some(tag);
        self.timer = Some(ActiveTimer::arm());
        self.persist();
        TagOutcome::Started(label)
    }

    fn bind(&mut self, tag: TagId, label: String) -> Result<(), StoreError> {
        let previous = self.lookup.set(tag.clone(), label.clone());
        self.lookup.persist()?;
        match previous {
            Some(old) => info!(
                "Tag {} re-registered: {} -> {}",
                tag,
                escape_log(&old),
                escape_log(&label)
            ),
            None => info!("New task registered: {} ({})", escape_log(&label), tag),
        }
        self.last_seen = None;
        Ok(())
    }

    fn update_elapsed(&mut self) {
        let Some(timer) = self.timer.as_ref() else {
            return;
        };
        let secs = timer.started.elapsed().as_secs();
        self.record.set_last_elapsed(secs);
        debug!(
            "update time of {}: {}s",
            self.record.names.last().map(|s| escape_log(s)).unwrap_or_default(),
            secs
        );
        self.persist();
    }

    fn disarm(&mut self) {
        if self.timer.is_some() {
            self.update_elapsed();
            self.timer = None;
            info!("Updating stopped");
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.persist(&self.record) {
            warn!("failed to persist activity record: {}", e);
        }
    }
}
