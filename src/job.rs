use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable carrying the JSON-encoded [`JobDescriptor`] into the sandbox.
pub const JOB_PAYLOAD_ENV: &str = "JOB_PAYLOAD";

/// Marker preceding a [`ProgressUpdate`] on a sandbox output line.
pub const UPDATE_MARKER: &str = "JOB_UPDATE:";

/// Marker preceding the terminal [`JobResult`] on a sandbox output line.
pub const RESULT_MARKER: &str = "JOB_RESULT:";

/// Break up any marker inside `text`, so a line carrying it can only classify
/// as a log line.
///
/// Model replies and page-derived text go through this before the sandbox
/// prints or logs them; only [`JobResult::to_line`] and
/// [`ProgressUpdate::to_line`] may emit a marker.
pub fn defang_markers(text: &str) -> String {
    text.replace(RESULT_MARKER, "JOB_RESULT :")
        .replace(UPDATE_MARKER, "JOB_UPDATE :")
}

/// What the sandbox should do with the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum JobAction {
    /// Return the raw page markup.
    Scrape,
    /// Screenshot the page and ask the model to describe it.
    Describe,
    /// Run the observe/think/act loop against the page.
    AgentAct,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Scrape => "scrape",
            JobAction::Describe => "describe",
            JobAction::AgentAct => "agent_act",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(JobAction::Scrape),
            "describe" => Ok(JobAction::Describe),
            "agent_act" | "ai_action" => Ok(JobAction::AgentAct),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

impl TryFrom<String> for JobAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One job, as handed across the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub action: JobAction,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl JobDescriptor {
    pub fn new(action: JobAction, url: impl Into<String>, target: Option<String>) -> Self {
        Self {
            action,
            url: url.into(),
            target,
        }
    }

    /// The caller's instruction, if one was given. Blank targets count as absent.
    pub fn instruction(&self) -> Option<&str> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Serialize into the opaque payload injected as [`JOB_PAYLOAD_ENV`].
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// The single, final outcome of a job.
///
/// `success` is false exactly when `error` is set; build values through
/// [`JobResult::success`] and [`JobResult::failure`] to keep that true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Render as a `JOB_RESULT:` output line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(format!("{RESULT_MARKER}{}", serde_json::to_string(self)?))
    }
}

/// A live screenshot pushed while the job is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub image: String,
}

impl ProgressUpdate {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    /// Render as a `JOB_UPDATE:` output line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(format!("{UPDATE_MARKER}{}", serde_json::to_string(self)?))
    }
}
