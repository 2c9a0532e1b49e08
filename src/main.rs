//! Binary entrypoint for the tagtrack CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the data stores
//! - `board [--reader-port <path>]` - run the board service
//! - `controller <action>` - connect to the board and run one action
//!   (`read`, `write <label>`, `download [--out <file>]`, `stop [<value>]`,
//!   `set-time [<timestamp>]`, `shell`)
//!
//! See the library crate docs for module-level details: `tagtrack::`.
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use tagtrack::board::clock::CommandClock;
use tagtrack::board::reader::{ChannelTagReader, TagFeeder, TagReader};
use tagtrack::board::recorder::start_recorder;
use tagtrack::board::{Board, BoardExit, BoardSettings};
use tagtrack::config::Config;
use tagtrack::controller::{export_csv, shell, Controller, DEFAULT_EXPORT};
use tagtrack::link::{Channel, StaticResolver};
use tagtrack::protocol::{Role, StopTarget};
use tagtrack::storage::Storage;
use tagtrack::tag::TagId;

#[derive(Parser)]
#[command(name = "tagtrack")]
#[command(about = "RFID task-time tracker: board service and controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the data stores
    Init,
    /// Run the board service
    Board {
        /// Serial port of the tag reader (e.g., /dev/ttyUSB0); tags are read from stdin when unset
        #[arg(short, long)]
        reader_port: Option<String>,
    },
    /// Connect to the board and run one action
    Controller {
        #[command(subcommand)]
        action: ControllerAction,
    },
}

#[derive(Subcommand)]
enum ControllerAction {
    /// Start reading tags (also sent on every connect)
    Read,
    /// Bind the next presented tag to a task label
    Write { label: String },
    /// Fetch the activity record and export it as CSV
    Download {
        #[arg(short, long, default_value = DEFAULT_EXPORT)]
        out: String,
    },
    /// Stop updating (`update`), stop reading (`read`), or anything else to shut the board down
    Stop {
        #[arg(default_value = "update")]
        value: String,
    },
    /// Set the board clock (defaults to the local time, which connect already sends)
    SetTime { timestamp: Option<String> },
    /// Interactive shell
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new tagtrack configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let config = Config::load(&cli.config).await?;
            let storage = Storage::open(&config.storage)?;
            info!(
                "Stores ready: {} and {}",
                storage.lookup.path().display(),
                storage.activity.path().display()
            );
        }
        Commands::Board { reader_port } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting tagtrack board v{}", env!("CARGO_PKG_VERSION"));
            run_board(config, reader_port).await?;
        }
        Commands::Controller { action } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            run_controller(config, action).await?;
        }
    }
    Ok(())
}

async fn run_board(config: Config, reader_port: Option<String>) -> Result<()> {
    let storage = Storage::open(&config.storage)?;
    let (recorder, recorder_task) = start_recorder(storage.lookup, storage.activity, storage.record);

    // CLI overrides config; fall back to keyboard entry when neither names a port
    let port = reader_port.unwrap_or_else(|| config.reader.port.clone());
    let tag_reader = open_tag_reader(&port, config.reader.baud_rate)?;

    let resolver = Arc::new(StaticResolver::from_config(&config.link));
    let channel = Arc::new(Channel::new(Role::Board, config.link.settings(), resolver));
    let clock = Arc::new(CommandClock::from_config(&config.board)?);
    let mut board = Board::new(
        channel,
        recorder,
        tag_reader,
        clock,
        BoardSettings::from(&config),
    );

    match board.run().await? {
        BoardExit::Interrupted => info!("Interrupted"),
        BoardExit::Shutdown(value) => info!("Shut down by controller (stop {})", value),
    }
    if let Err(e) = recorder_task.await {
        warn!("recorder task: {}", e);
    }
    Ok(())
}

#[cfg(feature = "serial")]
fn open_tag_reader(port: &str, baud_rate: u32) -> Result<Arc<dyn TagReader>> {
    if port.is_empty() {
        return Ok(keyboard_reader());
    }
    let reader = tagtrack::board::reader::SerialTagReader::open(port, baud_rate)?;
    Ok(Arc::new(reader))
}

#[cfg(not(feature = "serial"))]
fn open_tag_reader(port: &str, _baud_rate: u32) -> Result<Arc<dyn TagReader>> {
    if !port.is_empty() {
        warn!(
            "Serial tag readers need the 'serial' feature; ignoring {} and reading tags from stdin",
            port
        );
    }
    Ok(keyboard_reader())
}

fn keyboard_reader() -> Arc<dyn TagReader> {
    let (reader, feeder) = ChannelTagReader::new();
    info!("No tag reader port configured; type tag UIDs on stdin");
    std::thread::spawn(move || feed_from_stdin(feeder));
    Arc::new(reader)
}

fn feed_from_stdin(feeder: TagFeeder) {
    use std::io::BufRead;
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        match TagId::parse(&line) {
            Some(tag) => {
                if !feeder.present(tag) {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => warn!("not a tag UID: {}", tagtrack::logutil::escape_log(line.trim())),
        }
    }
}

async fn run_controller(config: Config, action: ControllerAction) -> Result<()> {
    let resolver = Arc::new(StaticResolver::from_config(&config.link));
    let channel = Arc::new(Channel::new(
        Role::Controller,
        config.link.settings(),
        resolver,
    ));
    let controller = Controller::new(channel);
    controller.connect().await?;
    info!("Connected to {}", config.link.device_name);

    let result = match action {
        ControllerAction::Read => Ok(()),
        ControllerAction::Write { label } => controller.register(&label).await,
        ControllerAction::Download { out } => match controller.download().await {
            Ok(record) => export_csv(&record, &out).await,
            Err(e) => Err(e),
        },
        ControllerAction::Stop { value } => controller.stop(StopTarget::parse(&value)).await,
        ControllerAction::SetTime { timestamp: Some(ts) } => controller.set_time(Some(ts)).await,
        ControllerAction::SetTime { timestamp: None } => Ok(()),
        ControllerAction::Shell => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            shell::run(&controller, stdin, tokio::io::stdout()).await
        }
    };
    controller.disconnect().await;
    result
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let config_level = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => config_level,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // When stdout is not a terminal only the file gets the line
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
