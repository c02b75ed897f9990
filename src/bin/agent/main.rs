//! The program that runs inside each sandbox.
//!
//! It reads its job from `JOB_PAYLOAD`, drives a headless Chrome, and reports
//! back over stdout: `JOB_UPDATE:` lines while working, then exactly one
//! `JOB_RESULT:` line. Everything else it prints, logs included, reaches the
//! caller as plain log lines.

mod agent_loop;
mod brain;
mod dom;
mod handlers;
mod hands;
#[cfg(test)]
mod testing;
mod types;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sandboxed_rpa::job::JOB_PAYLOAD_ENV;
use sandboxed_rpa::{AgentConfig, JobDescriptor, JobResult, ProgressUpdate};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenv().ok();
    // stderr is forwarded to the caller verbatim, colors would only add noise.
    sandboxed_rpa::init_logging(false);

    let result = match run().await {
        Ok(result) => result,
        Err(e) => {
            error!("job aborted: {e:#}");
            JobResult::failure(format!("{e:#}"))
        }
    };

    match result.to_line() {
        // Start on a fresh line in case the browser left a partial one.
        Ok(line) => println!("\n{line}"),
        Err(e) => {
            error!(error = %e, "could not encode the job result");
            return ExitCode::FAILURE;
        }
    }

    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run() -> Result<JobResult> {
    let payload = std::env::var(JOB_PAYLOAD_ENV)
        .with_context(|| format!("{JOB_PAYLOAD_ENV} is not set"))?;
    let descriptor = JobDescriptor::from_payload(&payload).context("invalid job payload")?;
    let config = AgentConfig::from_env().context("invalid configuration")?;
    info!(action = %descriptor.action, url = %descriptor.url, "job received");

    let brain = brain::Brain::new(config.inference.clone())?;

    let launch_config = config.clone();
    let mut session =
        tokio::task::spawn_blocking(move || hands::BrowserSession::launch(&launch_config))
            .await
            .context("browser launch panicked")??;

    Ok(handlers::run_job(&mut session, &brain, &descriptor, &config, emit_progress).await)
}

fn emit_progress(update: ProgressUpdate) {
    match update.to_line() {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "could not encode progress update"),
    }
}
