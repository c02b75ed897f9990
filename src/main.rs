use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use futures_util::StreamExt;
use sandboxed_rpa::demux::{Demuxer, LogFraming};
use sandboxed_rpa::docker::DockerRuntime;
use sandboxed_rpa::events::EventReader;
use sandboxed_rpa::{HostConfig, JobAction, JobDescriptor, JobEvent, SandboxManager, Teardown};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Run browser-automation jobs in single-use Docker sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the web UI and the job event feed over HTTP
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,
    },
    /// Run one job and print its events
    Run {
        /// scrape, describe or agent_act
        #[arg(long)]
        action: JobAction,
        #[arg(long)]
        url: String,
        /// Instruction for describe / agent_act
        #[arg(long)]
        target: Option<String>,
    },
    /// Remove sandboxes left behind by an earlier host process
    Prune,
    /// Parse a captured container log dump
    Replay {
        path: PathBuf,
        /// The dump still carries the 8-byte frame headers
        #[arg(long)]
        framed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    sandboxed_rpa::init_logging(true);

    let cli = Cli::parse();
    let config = HostConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Command::Serve { addr } => {
            let manager = Arc::new(connect(config)?);
            let shutdown = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));
            sandboxed_rpa::server::serve(addr, manager, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            action,
            url,
            target,
        } => {
            let manager = connect(config)?;
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

            let descriptor = JobDescriptor::new(action, url, target);
            let mut feed = manager.launch_job(&descriptor, cancel).await?;
            info!(sandbox = %feed.sandbox_id(), "job launched");

            let supervisor = feed.take_supervisor();
            let mut succeeded = false;
            while let Some(event) = feed.next().await {
                if let JobEvent::Result(result) = &event {
                    succeeded = result.success;
                }
                print_event(&event)?;
            }
            drop(feed);

            if let Some(supervisor) = supervisor {
                match supervisor.await? {
                    Teardown::Exited => {}
                    Teardown::ForceRemoved { reason } => warn!(%reason, "sandbox was force-removed"),
                    Teardown::RemoveFailed { reason, error } => {
                        warn!(%reason, %error, "sandbox removal failed")
                    }
                }
            }
            Ok(if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Prune => {
            let removed = connect(config)?.prune().await?;
            info!(count = removed.len(), "prune finished");
            for id in removed {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Replay { path, framed } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            let framing = if framed {
                LogFraming::Multiplexed
            } else {
                LogFraming::Raw
            };
            let mut reader = EventReader::new(Demuxer::new(file, framing), config.max_line_bytes);
            while let Some(event) = reader.next_event().await {
                print_event(&event)?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn connect(config: HostConfig) -> Result<SandboxManager> {
    let runtime = DockerRuntime::connect()?;
    Ok(SandboxManager::new(Arc::new(runtime), config))
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl-C received, cancelling");
        token.cancel();
    }
}

fn print_event(event: &JobEvent) -> Result<()> {
    match event {
        JobEvent::Log(line) => println!("LOG: {line}"),
        JobEvent::Progress(update) => println!("IMG: <{} base64 chars>", update.image.len()),
        JobEvent::Result(result) => println!("END: {}", serde_json::to_string_pretty(result)?),
        JobEvent::StreamError(message) => println!("ERR: {message}"),
    }
    Ok(())
}
