//! An in-memory container runtime for exercising the sandbox manager.

#![allow(dead_code)]

use async_trait::async_trait;
use sandboxed_rpa::demux::LogFraming;
use sandboxed_rpa::sandbox::{ContainerRuntime, MANAGED_LABEL, SandboxOutput, SandboxSpec};
use sandboxed_rpa::{Result, SandboxError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};

#[derive(Default)]
pub struct State {
    next_id: usize,
    /// What the runtime would list: created and not yet removed.
    live: BTreeMap<String, SandboxSpec>,
    readers: HashMap<String, DuplexStream>,
    writers: HashMap<String, DuplexStream>,
    created: Vec<SandboxSpec>,
    removed: Vec<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    pub state: Mutex<State>,
    pub fail_ping: bool,
    pub fail_start: bool,
    pub fail_attach: bool,
    pub framing: Option<LogFraming>,
    /// When set, every sandbox plays this output and exits on its own.
    pub script: Option<Vec<u8>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(output: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            script: Some(output.into()),
            ..Default::default()
        })
    }

    /// Write `output` as the sandbox's last words, then let it exit.
    pub async fn finish(&self, id: &str, output: &[u8]) {
        let writer = self.state.lock().unwrap().writers.remove(id);
        if let Some(mut writer) = writer {
            writer.write_all(output).await.unwrap();
        }
        self.state.lock().unwrap().live.remove(id);
    }

    /// Write without exiting.
    pub async fn emit(&self, id: &str, output: &[u8]) {
        let mut writer = self.state.lock().unwrap().writers.remove(id).unwrap();
        writer.write_all(output).await.unwrap();
        self.state.lock().unwrap().writers.insert(id.to_string(), writer);
    }

    pub fn created(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        self.record("ping".into());
        if self.fail_ping {
            return Err(SandboxError::RuntimeUnavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("sbx-{}", state.next_id);
        let (reader, writer) = tokio::io::duplex(1024 * 1024);
        state.live.insert(id.clone(), spec.clone());
        state.readers.insert(id.clone(), reader);
        state.writers.insert(id.clone(), writer);
        state.created.push(spec.clone());
        state.calls.push(format!("create {id}"));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {id}"));
        if self.fail_start {
            return Err(SandboxError::StartFailed {
                id: id.to_string(),
                reason: "image has no entrypoint".into(),
            });
        }
        Ok(())
    }

    async fn attach_output(&self, id: &str) -> Result<SandboxOutput> {
        self.record(format!("attach {id}"));
        if self.fail_attach {
            return Err(SandboxError::AttachFailed {
                id: id.to_string(),
                reason: "hijack failed".into(),
            });
        }
        let reader = self
            .state
            .lock()
            .unwrap()
            .readers
            .remove(id)
            .ok_or_else(|| SandboxError::AttachFailed {
                id: id.to_string(),
                reason: "no such sandbox".into(),
            })?;

        if let Some(script) = self.script.clone() {
            let writer = self.state.lock().unwrap().writers.remove(id);
            self.state.lock().unwrap().live.remove(id);
            if let Some(mut writer) = writer {
                tokio::spawn(async move {
                    let _ = writer.write_all(&script).await;
                });
            }
        }

        Ok(SandboxOutput {
            reader: Box::new(reader),
            framing: self.framing.unwrap_or(LogFraming::Raw),
        })
    }

    async fn force_remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove {id}"));
        if state.live.remove(id).is_some() {
            // Killing the sandbox closes its output.
            state.writers.remove(id);
            state.removed.push(id.to_string());
        }
        Ok(())
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .live
            .iter()
            .filter(|(_, spec)| spec.labels.get(MANAGED_LABEL).is_some_and(|v| v == "true"))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
