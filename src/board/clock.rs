//! Setting the board's wall clock on request from the controller.
use std::process::Command as Process;

use anyhow::{bail, Context, Result};
use log::info;

use crate::config::BoardConfig;
use crate::logutil::escape_log;

pub trait SystemClock: Send + Sync + 'static {
    /// Set the wall clock from a `date -s` compatible timestamp. Blocking.
    fn set(&self, timestamp: &str) -> Result<()>;
}

/// Runs an external command with the timestamp appended, `sudo date -s <ts>` by default.
#[derive(Debug, Clone)]
pub struct CommandClock {
    argv: Vec<String>,
}

impl CommandClock {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            bail!("set-time command must not be empty");
        }
        Ok(Self { argv })
    }

    pub fn from_config(cfg: &BoardConfig) -> Result<Self> {
        Self::new(cfg.set_time_command.clone())
    }
}

impl SystemClock for CommandClock {
    fn set(&self, timestamp: &str) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .context("set-time command must not be empty")?;
        let status = Process::new(program)
            .args(args)
            .arg(timestamp)
            .status()
            .with_context(|| format!("running {}", program))?;
        if !status.success() {
            bail!("{} exited with {}", program, status);
        }
        info!("System time set to {}", escape_log(timestamp));
        Ok(())
    }
}
