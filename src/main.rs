//! bpod - host driver for the bpod state machine controller
//!
//! Compiles program definitions and runs trials on a device or the emulator.

use bpod_client::{Bpod, ClientError, Command, Config, RunHooks, Session};
use bpod_core::{ChannelMap, DeviceLink, ProgramDefinition, StateMachine};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpod")]
#[command(about = "Host driver for the bpod state machine controller")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "BPOD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the event and output names of the configured hardware profile
    Channels,

    /// Compile a program definition and print the upload tables
    Compile {
        /// Program definition (.json, .yaml or .yml)
        program: PathBuf,
    },

    /// Run a program for a number of trials
    Run {
        /// Program definition (.json, .yaml or .yml)
        program: PathBuf,

        /// Number of trials
        #[arg(short = 'n', long, default_value_t = 1)]
        trials: usize,

        /// Use the software emulator
        #[arg(short, long)]
        emulator: bool,

        /// Serial port of the device
        #[arg(short, long, env = "BPOD_SERIAL_PORT")]
        port: Option<String>,

        /// Write the session record as JSON to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Logs soft codes emitted by the running program.
struct LogSoftCodes;

impl RunHooks for LogSoftCodes {
    fn on_soft_code(&mut self, code: u8) {
        tracing::info!("Soft code {}", code);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Channels => {
            let channels = ChannelMap::new(config.emulator.hardware.clone());
            println!("Events:");
            for (code, name) in channels.event_names().iter().enumerate() {
                println!("  {:>3}  {}", code, name);
            }
            println!("Outputs:");
            for code in 0..channels.n_output_channels() {
                if let Some(name) = channels.output_name(code) {
                    println!("  {:>3}  {}", code, name);
                }
            }
        }

        Commands::Compile { program } => {
            let definition = load_program(&program)?;
            let channels = Arc::new(ChannelMap::new(config.emulator.hardware.clone()));
            let mut sma = StateMachine::from_definition(channels, &definition)?;
            let compiled = sma.compile()?;
            let report = serde_json::json!({
                "states": sma.state_names(),
                "checksum": format!("{:08x}", compiled.checksum()),
                "table8": compiled.table8,
                "table32": compiled.table32,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Run {
            program,
            trials,
            emulator,
            port,
            output,
        } => {
            if emulator {
                config.emulator.enabled = true;
            }
            if port.is_some() {
                config.serial.port = port;
            }
            config.validate()?;
            let definition = load_program(&program)?;

            let (tx, rx) = mpsc::unbounded_channel();
            spawn_command_sources(tx);

            let session = tokio::task::spawn_blocking(move || {
                if config.emulator.enabled {
                    run_session(Bpod::emulated(&config), rx, &definition, trials)
                } else {
                    run_serial(&config, rx, &definition, trials)
                }
            })
            .await??;

            let json = session.to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    tracing::info!("Wrote session to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}

/// Forwards Ctrl-C and stdin lines into the command channel.
fn spawn_command_sources(tx: mpsc::UnboundedSender<Command>) {
    let kill = tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received interrupt, ending session...");
        let _ = kill.send(Command::Kill);
    });

    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("{}", e),
            }
        }
    });
}

fn load_program(path: &Path) -> Result<ProgramDefinition, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => ProgramDefinition::from_json_str(&content)?,
        _ => ProgramDefinition::from_yaml_str(&content)?,
    };
    Ok(definition)
}

#[cfg(feature = "serial")]
fn run_serial(
    config: &Config,
    rx: mpsc::UnboundedReceiver<Command>,
    definition: &ProgramDefinition,
    trials: usize,
) -> Result<Session, ClientError> {
    run_session(Bpod::open_serial(config)?, rx, definition, trials)
}

#[cfg(not(feature = "serial"))]
fn run_serial(
    _config: &Config,
    _rx: mpsc::UnboundedReceiver<Command>,
    _definition: &ProgramDefinition,
    _trials: usize,
) -> Result<Session, ClientError> {
    Err(ClientError::InvalidState(
        "built without serial support; rebuild with --features serial or use --emulator",
    ))
}

fn run_session<L>(
    bpod: Bpod<L>,
    rx: mpsc::UnboundedReceiver<Command>,
    definition: &ProgramDefinition,
    trials: usize,
) -> Result<Session, ClientError>
where
    L: DeviceLink,
    ClientError: From<L::Error>,
{
    let mut bpod = bpod.with_commands(rx);
    let mut sma = StateMachine::from_definition(bpod.channels().clone(), definition)?;
    bpod.send_state_machine(&mut sma)?;

    for _ in 0..trials {
        let trial = bpod.run_state_machine_with(&sma, &mut LogSoftCodes)?;
        tracing::info!(
            "Trial {} finished: {} events, {} states",
            trial.index + 1,
            trial.events.len(),
            trial.states.len()
        );
        if !bpod.is_connected() {
            break;
        }
    }

    bpod.disconnect()?;
    Ok(bpod.session().clone())
}
