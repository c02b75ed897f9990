//! One sandbox per job: launch, live output, and guaranteed teardown.
//!
//! [`SandboxManager::launch`] creates and starts a container with the job
//! payload injected, attaches to its output, and spawns a supervisor task that
//! is the only code allowed to force-remove the container. The supervisor runs
//! detached from the caller, so it still tears down after the caller's request
//! is gone. It stands down only when the output ran to its natural end, in
//! which case the runtime's auto-removal has already reclaimed the container.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::Stream;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::demux::{Demuxer, LogFraming};
use crate::error::{Result, SandboxError};
use crate::events::{EventReader, JobEvent};
use crate::job::{JOB_PAYLOAD_ENV, JobDescriptor};

/// Label put on every sandbox this crate creates.
pub const MANAGED_LABEL: &str = "sandboxed-rpa.managed";
/// Label carrying the job's action.
pub const ACTION_LABEL: &str = "sandboxed-rpa.action";

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Let the runtime delete the container as soon as it exits.
    pub auto_remove: bool,
}

/// The attached combined output of a running sandbox.
pub struct SandboxOutput {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub framing: LogFraming,
}

/// The container runtime operations the manager depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime answers.
    async fn ping(&self) -> Result<()>;

    /// Create a sandbox and return its id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Follow the combined stdout/stderr until the sandbox exits.
    async fn attach_output(&self, id: &str) -> Result<SandboxOutput>;

    /// Kill and delete the sandbox. A sandbox that is already gone is not an error.
    async fn force_remove(&self, id: &str) -> Result<()>;

    /// Ids of the sandboxes carrying [`MANAGED_LABEL`].
    async fn list_sandboxes(&self) -> Result<Vec<String>>;
}

/// How a sandbox's life ended, as seen by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// Output ran to the end; the runtime auto-removed the sandbox.
    Exited,
    /// The supervisor removed the sandbox.
    ForceRemoved { reason: String },
    /// The supervisor tried and failed; the error has been logged.
    RemoveFailed { reason: String, error: String },
}

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: HostConfig,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: HostConfig) -> Self {
        Self { runtime, config }
    }

    /// Serialize `descriptor` and launch it.
    pub async fn launch_job(
        &self,
        descriptor: &JobDescriptor,
        cancel: CancellationToken,
    ) -> Result<JobFeed> {
        let payload = descriptor.to_payload()?;
        let mut labels = HashMap::new();
        labels.insert(ACTION_LABEL.to_string(), descriptor.action.to_string());
        self.launch(&payload, labels, cancel).await
    }

    /// Force-remove every managed sandbox the runtime still lists, e.g. ones
    /// orphaned by a host crash. Returns the ids removed.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let ids = self.runtime.list_sandboxes().await?;
        for id in &ids {
            info!(sandbox = %id, "pruning sandbox");
            self.runtime.force_remove(id).await?;
        }
        Ok(ids)
    }

    /// Launch one sandbox running `payload` and return its live event feed.
    ///
    /// Errors here are launch errors: nothing has been streamed yet and no
    /// retry is attempted. Once this returns `Ok`, the sandbox is owned by its
    /// supervisor, which force-removes it when `cancel` fires, when the job
    /// timeout elapses, or when the feed is dropped before the output ended.
    pub async fn launch(
        &self,
        payload: &str,
        mut labels: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<JobFeed> {
        self.runtime.ping().await.map_err(|e| match e {
            SandboxError::RuntimeUnavailable(_) => e,
            other => SandboxError::RuntimeUnavailable(other.to_string()),
        })?;

        let mut env = vec![format!("{JOB_PAYLOAD_ENV}={payload}")];
        env.extend(self.config.overrides.env_pairs());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let spec = SandboxSpec {
            image: self.config.worker_image.clone(),
            env,
            labels,
            auto_remove: true,
        };

        let id = self.runtime.create(&spec).await?;
        debug!(sandbox = %id, image = %spec.image, "sandbox created");

        self.runtime.start(&id).await?;
        info!(sandbox = %id, "sandbox started");

        let output = match self.runtime.attach_output(&id).await {
            Ok(output) => output,
            Err(e) => {
                error!(sandbox = %id, error = %e, "attach failed, removing sandbox");
                if let Err(remove_err) = self.runtime.force_remove(&id).await {
                    error!(sandbox = %id, error = %remove_err, "removal after failed attach failed");
                }
                return Err(e);
            }
        };

        let (exited_tx, exited_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.runtime),
            id.clone(),
            cancel,
            exited_rx,
            self.config.job_timeout,
            self.config.teardown_grace,
        ));

        let events = job_events(
            id.clone(),
            output,
            self.config.max_line_bytes,
            self.config.job_timeout,
            exited_tx,
        );

        Ok(JobFeed {
            sandbox_id: id,
            events: Box::pin(events),
            supervisor: Some(supervisor),
        })
    }
}

/// The ordered event feed of one running job.
///
/// Ends after the sandbox's output ends or after a [`JobEvent::StreamError`].
/// Nothing is delivered after the [`JobEvent::Result`]. Dropping the feed
/// early counts as the caller going away.
pub struct JobFeed {
    sandbox_id: String,
    events: Pin<Box<dyn Stream<Item = JobEvent> + Send>>,
    supervisor: Option<JoinHandle<Teardown>>,
}

impl JobFeed {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Take the supervisor's handle, to wait for teardown.
    ///
    /// The supervisor keeps running when the handle is dropped.
    pub fn take_supervisor(&mut self) -> Option<JoinHandle<Teardown>> {
        self.supervisor.take()
    }
}

impl Stream for JobFeed {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        self.events.as_mut().poll_next(cx)
    }
}

const TIMEOUT_REASON: &str = "job timeout elapsed";

fn job_events(
    sandbox_id: String,
    output: SandboxOutput,
    max_line_bytes: usize,
    job_timeout: Duration,
    exited: oneshot::Sender<()>,
) -> impl Stream<Item = JobEvent> + Send {
    let demuxer = Demuxer::new(output.reader, output.framing);
    let mut reader = EventReader::new(demuxer, max_line_bytes);
    let deadline = Instant::now() + job_timeout;
    stream! {
        let mut delivered_result = false;
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);
        loop {
            let next = tokio::select! {
                biased;
                event = reader.next_event() => event,
                _ = &mut timer => Some(JobEvent::StreamError(TIMEOUT_REASON.to_string())),
            };
            let Some(event) = next else { break };
            if let JobEvent::StreamError(reason) = &event {
                // Leaving `exited` unsent hands the sandbox to the supervisor.
                warn!(sandbox = %sandbox_id, %reason, "event feed failed");
                if !delivered_result {
                    yield event;
                }
                return;
            }
            if delivered_result {
                debug!(sandbox = %sandbox_id, ?event, "dropping output after the job result");
                continue;
            }
            delivered_result = matches!(event, JobEvent::Result(_));
            yield event;
        }
        if !delivered_result && Instant::now() >= deadline {
            // The supervisor's removal closed the output.
            warn!(sandbox = %sandbox_id, "job timed out without a result");
            yield JobEvent::StreamError(TIMEOUT_REASON.to_string());
            return;
        }
        debug!(sandbox = %sandbox_id, "sandbox output ended");
        let _ = exited.send(());
    }
}

async fn supervise(
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    cancel: CancellationToken,
    exited: oneshot::Receiver<()>,
    job_timeout: Duration,
    grace: Duration,
) -> Teardown {
    let reason = tokio::select! {
        biased;
        outcome = exited => match outcome {
            Ok(()) => {
                debug!(sandbox = %id, "sandbox exited on its own");
                return Teardown::Exited;
            }
            Err(_) => "event feed dropped before the sandbox exited",
        },
        _ = cancel.cancelled() => "caller cancelled",
        _ = tokio::time::sleep(job_timeout) => TIMEOUT_REASON,
    };

    warn!(sandbox = %id, reason, "force-removing sandbox");
    let reason = reason.to_string();
    let error = match tokio::time::timeout(grace, runtime.force_remove(&id)).await {
        Ok(Ok(())) => {
            info!(sandbox = %id, "sandbox removed");
            return Teardown::ForceRemoved { reason };
        }
        Ok(Err(e)) => e,
        Err(_) => SandboxError::RemoveTimedOut {
            id: id.clone(),
            seconds: grace.as_secs(),
        },
    };
    error!(sandbox = %id, error = %error, "sandbox removal failed");
    Teardown::RemoveFailed {
        reason,
        error: error.to_string(),
    }
}
