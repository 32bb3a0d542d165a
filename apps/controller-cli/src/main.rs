//! `astropi`: command-line controller for an AstroPi board.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use astropi_config_store::ConfigStore;
use astropi_controller::{ConnectionState, ControllerEvent, ControllerSession};
use astropi_protocol::constants::{KEY_EXPOSURE_TIME, KEY_IMAGE_COUNT, KEY_INTERVAL};
use astropi_protocol::{ConfigValue, SessionState, SystemKind};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

/// Quiet period after a session ends, for trailing file transfers.
const SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(version, about = "Control an AstroPi board")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "ASTROPI_CONFIG")]
    config: Option<PathBuf>,

    /// Board host, overriding the configuration file.
    #[arg(long)]
    host: Option<String>,

    /// Where received captures are written.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Connect and print board events until Ctrl-C.
    Monitor,
    /// Run an imaging session and download its frames.
    Start {
        /// Number of frames.
        #[arg(long)]
        frames: Option<i64>,
        /// Exposure time per frame, microseconds.
        #[arg(long)]
        exposure: Option<i64>,
        /// Delay between frames, microseconds.
        #[arg(long)]
        interval: Option<i64>,
    },
    /// Abort the running session.
    Abort,
    /// Capture a single frame outside a session.
    Preview,
    /// Read one setting from the board.
    Get { key: String },
    /// Read all settings from the board.
    Getall,
    /// Change a setting on the board and remember it locally.
    Set { key: String, value: String },
    /// Run a maintenance action on the board.
    System {
        #[arg(value_enum)]
        action: Maintenance,
    },
    /// Print the predicted duration of a session with the local settings.
    Eta,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Maintenance {
    Pull,
    Update,
}

impl From<Maintenance> for SystemKind {
    fn from(action: Maintenance) -> Self {
        match action {
            Maintenance::Pull => SystemKind::Pull,
            Maintenance::Update => SystemKind::Update,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config::default_path);
    let mut config = config::Config::load(&path)?;
    if let Some(host) = cli.host.clone() {
        config.host = host;
    }
    if let Some(dir) = cli.download_dir.clone() {
        config.download_dir = dir;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config, &path))
}

async fn run(
    command: Cmd,
    mut config: config::Config,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let store = ConfigStore::with_config(config.settings.clone());
    let session = ControllerSession::new(config.controller(), store.clone());
    let mut events = session
        .take_events()
        .context("controller events already taken")?;

    if let Cmd::Eta = command {
        println!("{}", format_duration(session.eta()));
        return Ok(());
    }
    if let Cmd::Start { frames, exposure, interval } = &command {
        for (key, value) in [
            (KEY_IMAGE_COUNT, frames),
            (KEY_EXPOSURE_TIME, exposure),
            (KEY_INTERVAL, interval),
        ] {
            if let Some(v) = value {
                store.set(key, ConfigValue::Int(*v));
            }
        }
    }

    session
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.host))?;

    let result = match command {
        Cmd::Monitor => {
            monitor(&mut events).await;
            Ok(())
        }
        Cmd::Start { .. } => {
            session.start().await?;
            println!("session started, ETA {}", format_duration(session.eta()));
            follow_session(&mut events).await
        }
        Cmd::Abort => {
            session.abort().await?;
            settle(&mut events).await;
            Ok(())
        }
        Cmd::Preview => {
            session.preview().await?;
            wait_for(&mut events, |event| {
                matches!(event, ControllerEvent::FileReceived { .. })
            })
            .await
        }
        Cmd::Get { key } => {
            let value = session.get(&key).await?;
            println!("{key} = {value}");
            Ok(())
        }
        Cmd::Getall => {
            for (key, value) in session.get_all().await? {
                println!("{key} = {value}");
            }
            Ok(())
        }
        Cmd::Set { key, value } => {
            let value = ConfigValue::parse_literal(&value);
            session.set(key.clone(), value.clone()).await?;
            config.settings.insert(key, value);
            config.save(path)?;
            settle(&mut events).await;
            Ok(())
        }
        Cmd::System { action } => {
            session.system(action.into()).await?;
            wait_for(&mut events, |event| {
                matches!(event, ControllerEvent::SystemDone(_))
            })
            .await
        }
        Cmd::Eta => Ok(()),
    };

    session.disconnect().await;
    result
}

/// Prints events until Ctrl-C or the board goes away.
async fn monitor(events: &mut UnboundedReceiver<ControllerEvent>) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if event == ControllerEvent::StateChanged(ConnectionState::Disconnected) {
                    break;
                }
            }
        }
    }
}

/// Prints events until the session started by this command returns to idle.
/// Ctrl-C aborts the session.
async fn follow_session(events: &mut UnboundedReceiver<ControllerEvent>) -> anyhow::Result<()> {
    let mut running = false;
    let mut received = 0u64;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            bail!("controller stopped");
        };
        print_event(&event);
        match event {
            ControllerEvent::Status { state, .. } if !state.is_idle() => running = true,
            ControllerEvent::Status { state: SessionState::Idle, .. } if running => break,
            ControllerEvent::FileReceived { .. } => received += 1,
            ControllerEvent::StateChanged(ConnectionState::Disconnected) => {
                bail!("board disconnected during the session")
            }
            _ => {}
        }
    }
    received += settle(events).await;
    println!("session finished, {received} file(s) received");
    Ok(())
}

/// Prints events until `done` matches.
async fn wait_for(
    events: &mut UnboundedReceiver<ControllerEvent>,
    done: impl Fn(&ControllerEvent) -> bool,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        print_event(&event);
        if done(&event) {
            return Ok(());
        }
        if event == ControllerEvent::StateChanged(ConnectionState::Disconnected) {
            bail!("board disconnected");
        }
    }
    bail!("controller stopped")
}

/// Prints events until none arrive for [`SETTLE`]. Returns the number of
/// files received meanwhile.
async fn settle(events: &mut UnboundedReceiver<ControllerEvent>) -> u64 {
    let mut received = 0;
    while let Ok(Some(event)) = tokio::time::timeout(SETTLE, events.recv()).await {
        print_event(&event);
        if matches!(event, ControllerEvent::FileReceived { .. }) {
            received += 1;
        }
    }
    received
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::StateChanged(state) => println!("[link] {state:?}"),
        ControllerEvent::Log { timestamp, level, text } => {
            println!("{} [{level}] {text}", timestamp.format("%H:%M:%S"));
        }
        ControllerEvent::CamDetails(details) => println!(
            "[camera] {} on {} ({}x{})",
            details.model, details.board, details.resolution.0, details.resolution.1
        ),
        ControllerEvent::Status { state, queued, eta, .. } => println!(
            "[status] {state}, {queued} queued, ETA {}",
            format_duration(*eta)
        ),
        ControllerEvent::FileReceived { index, path, bytes } => {
            println!("[file] #{index} {} ({bytes} bytes)", path.display());
        }
        ControllerEvent::TransferClosed { error: Some(error) } => {
            println!("[file] transfer channel closed: {error}");
        }
        ControllerEvent::TransferClosed { error: None } => {}
        ControllerEvent::SystemDone(done) => match done.code {
            Some(code) => println!("[system] {} finished, exit code {code}", done.kind),
            None => println!("[system] {} finished, success: {}", done.kind, done.success),
        },
        ControllerEvent::Config(_) => {}
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
