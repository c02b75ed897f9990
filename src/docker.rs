//! [`ContainerRuntime`] backed by the local Docker daemon through bollard.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    models::HostConfig,
};
use futures_util::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use crate::demux::LogFraming;
use crate::error::{Result, SandboxError};
use crate::sandbox::{ContainerRuntime, MANAGED_LABEL, SandboxOutput, SandboxSpec};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(|e| {
            error!("Failed to reach Docker daemon: {}", e);
            SandboxError::RuntimeUnavailable(e.to_string())
        })?;
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let host_config = HostConfig {
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        for warning in &response.warnings {
            debug!(sandbox = %response.id, %warning, "create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn attach_output(&self, id: &str) -> Result<SandboxOutput> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        // bollard already splits the frames into `LogOutput` values, so the
        // reader sees clean bytes and the demuxer runs in pass-through mode.
        let chunks = self
            .client
            .logs(id, Some(options))
            .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(io::Error::other));

        Ok(SandboxOutput {
            reader: Box::new(StreamReader::new(Box::pin(chunks))),
            framing: LogFraming::Raw,
        })
    }

    async fn force_remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!(sandbox = %id, "removed container");
                Ok(())
            }
            // Gone already, or auto-removal is in progress.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(sandbox = %id, "container already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
