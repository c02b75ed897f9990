//! Browser-automation jobs run in single-use Docker sandboxes.
//!
//! The host side lives here: the job contract shared with the `agent` binary
//! that runs inside each sandbox, the lifecycle manager that launches and
//! tears down sandboxes, and the pipeline that turns a sandbox's raw output
//! into [`JobEvent`]s for the caller.

pub mod config;
pub mod demux;
pub mod docker;
pub mod error;
pub mod events;
pub mod job;
pub mod sandbox;
pub mod server;

pub use config::{AgentConfig, HostConfig, InferenceConfig};
pub use error::{ConfigError, Result, SandboxError};
pub use events::JobEvent;
pub use job::{JobAction, JobDescriptor, JobResult, ProgressUpdate, defang_markers};
pub use sandbox::{JobFeed, SandboxManager, Teardown};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(ansi: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();
}
