//! Parley command-line host.
//!
//! Runs one conversation session against an agent reached through a
//! JSON-lines bridge on stdin/stdout, or against a local loopback agent.

mod bridge;
mod loopback;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use parley_core::audio::device::{list_input_devices, list_output_devices, DeviceInfo};
use parley_core::{ChannelSink, ConversationEngine, SessionStatus};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Parley - real-time voice conversation with a remote agent
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Settings file (defaults to the platform data directory)
    #[arg(long, env = "PARLEY_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a conversation session (default)
    Run(RunArgs),
    /// List audio input and output devices
    Devices,
    /// Print the effective settings as JSON
    Settings {
        /// Write the normalized settings back to the settings file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Echo the microphone back through the speaker instead of using stdin/stdout
    #[arg(long)]
    loopback: bool,

    /// Microphone to open by name
    #[arg(long)]
    input_device: Option<String>,

    /// Speaker to open by name
    #[arg(long)]
    output_device: Option<String>,

    /// Render ticks per second
    #[arg(long)]
    fps: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_session(settings, args).await,
        Command::Devices => {
            print_devices("input", &list_input_devices());
            print_devices("output", &list_output_devices());
            Ok(())
        }
        Command::Settings { write } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if write {
                save_settings(&settings_path, &settings)?;
                info!(path = %settings_path.display(), "settings written");
            }
            Ok(())
        }
    }
}

fn print_devices(direction: &str, devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("{direction}: (none)");
        return;
    }
    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        println!("{direction} {marker} {}", device.name);
    }
}

async fn run_session(mut settings: AppSettings, args: RunArgs) -> anyhow::Result<()> {
    if args.input_device.is_some() {
        settings.preferred_input_device = args.input_device;
    }
    if args.output_device.is_some() {
        settings.preferred_output_device = args.output_device;
    }
    if let Some(fps) = args.fps {
        settings.render_fps = fps;
    }
    settings.normalize();

    let config = settings.engine_config();
    let (sink, outbound) = ChannelSink::channel(config.outbound_queue_capacity);
    let engine = Arc::new(ConversationEngine::new(config));

    // Device open blocks until both streams are confirmed.
    let starting = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || starting.start(sink)).await??;

    spawn_message_printer(&engine);

    if args.loopback {
        loopback::spawn(Arc::clone(&engine), outbound)?;
    } else {
        bridge::spawn_writer(outbound);
        bridge::spawn_reader(Arc::clone(&engine))?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        1.0 / f64::from(settings.render_fps),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted by user, ending session");
                break;
            }
            _ = ticker.tick() => {
                if engine.status() != SessionStatus::Connected {
                    break;
                }
                let frame = engine.render_tick();
                if frame.speaking {
                    debug!(
                        scale = frame.avatar_scale(),
                        energy = frame.features.energy,
                        brightness = frame.features.brightness,
                        "render tick"
                    );
                }
            }
        }
    }

    let ending = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || ending.end_session()).await?;

    info!(
        diagnostics = ?engine.diagnostics_snapshot(),
        messages = engine.conversation_log().len(),
        "session summary"
    );
    Ok(())
}

fn spawn_message_printer(engine: &ConversationEngine) {
    let mut messages = engine.subscribe_messages();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    info!(sender = ?message.sender, id = %message.id, "{}", message.text);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "message printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
