//! Media session monitor CLI
//!
//! Thin front end over the library: read projections as JSON, or stream
//! bridge events line by line until interrupted.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use mediabridge::{platform_source, EventKind, SessionEventBridge};

#[derive(Parser)]
#[command(name = "mediabridge", version, about = "Monitor OS media-playback sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all active media sessions
    List,
    /// Show the session the OS considers current
    Current,
    /// Show one session by identity
    Get { identity: String },
    /// Stream session events until interrupted
    Watch {
        /// Event kinds to watch; defaults to all of them
        kinds: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let source = platform_source()?;
    let bridge = SessionEventBridge::new(source);

    match cli.command {
        Command::List => {
            let records = bridge.list_sessions()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Current => match bridge.current_session()? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("null"),
        },
        Command::Get { identity } => match bridge.session_by_id(&identity)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("no session with identity {identity}"),
        },
        Command::Watch { kinds } => {
            let kinds: Vec<EventKind> = if kinds.is_empty() {
                EventKind::ALL.to_vec()
            } else {
                kinds
                    .iter()
                    .map(|raw| raw.parse())
                    .collect::<Result<_, _>>()?
            };

            for kind in &kinds {
                bridge.on(*kind, |event| {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                })?;
            }
            info!("watching {} event kind(s), ctrl-c to stop", kinds.len());

            tokio::signal::ctrl_c().await?;
            bridge.shutdown();
        }
    }

    Ok(())
}
