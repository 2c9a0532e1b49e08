//! Line-oriented operator shell over an open [`Controller`] session.
use std::path::PathBuf;

use anyhow::Result;
use log::warn;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{export_csv, Controller, DEFAULT_EXPORT};
use crate::protocol::StopTarget;

const HELP: &str = "\
commands:
  read                 start reading tags
  write <label>        bind the next tag to <label>
  download [file]      fetch the record and export it as CSV
  show                 fetch the record and print totals
  stop [update|read|<other>]
  time [timestamp]     set the board clock (default: now)
  help
  quit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellAction {
    Read,
    Write(String),
    Download(PathBuf),
    Show,
    Stop(StopTarget),
    SetTime(Option<String>),
    Help,
    Quit,
}

/// Parse one shell line. `Ok(None)` for a blank line, `Err` with a message otherwise.
pub fn parse_line(line: &str) -> Result<Option<ShellAction>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());
    let action = match verb.to_ascii_lowercase().as_str() {
        "read" | "r" => ShellAction::Read,
        "write" | "w" => match arg {
            Some(label) => ShellAction::Write(label),
            None => return Err("write needs a task label".into()),
        },
        "download" | "d" => {
            ShellAction::Download(PathBuf::from(arg.as_deref().unwrap_or(DEFAULT_EXPORT)))
        }
        "show" | "s" => ShellAction::Show,
        "stop" => ShellAction::Stop(StopTarget::parse(arg.as_deref().unwrap_or("update"))),
        "time" | "t" => ShellAction::SetTime(arg),
        "help" | "h" | "?" => ShellAction::Help,
        "quit" | "q" | "exit" => ShellAction::Quit,
        other => return Err(format!("unknown command '{}'; try help", other)),
    };
    Ok(Some(action))
}

/// Run the shell until `quit`, end of input or a lost connection.
pub async fn run<R, W>(controller: &Controller, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(HELP.as_bytes()).await?;
    loop {
        output.write_all(b"> ").await?;
        output.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let action = match parse_line(&line) {
            Ok(Some(action)) => action,
            Ok(None) => continue,
            Err(msg) => {
                output.write_all(format!("{}\n", msg).as_bytes()).await?;
                continue;
            }
        };
        let result = match action {
            ShellAction::Quit => break,
            ShellAction::Help => {
                output.write_all(HELP.as_bytes()).await?;
                Ok(())
            }
            ShellAction::Read => controller.start_reading().await,
            ShellAction::Write(label) => controller.register(&label).await,
            ShellAction::Download(path) => match controller.download().await {
                Ok(record) => export_csv(&record, &path).await,
                Err(e) => Err(e),
            },
            ShellAction::Show => match controller.download().await {
                Ok(record) => {
                    let mut text = String::new();
                    for (task, secs) in record.totals() {
                        text.push_str(&format!(
                            "{:<20} {:>3}h {:02}m {:02}s\n",
                            task,
                            secs / 3600,
                            secs / 60 % 60,
                            secs % 60
                        ));
                    }
                    output.write_all(text.as_bytes()).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ShellAction::Stop(target) => controller.stop(target).await,
            ShellAction::SetTime(ts) => controller.set_time(ts).await,
        };
        if let Err(e) = result {
            warn!("{:#}", e);
            output.write_all(format!("error: {:#}\n", e).as_bytes()).await?;
            if !controller.channel().is_connected() {
                break;
            }
        }
    }
    Ok(())
}
