//! Configuration for both sides of the sandbox boundary.
//!
//! Everything is resolved once at startup from the process environment (after
//! `.env` has been loaded) and then passed around explicitly. Resolvers take a
//! lookup function so tests can supply their own variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_WORKER_IMAGE: &str = "sandboxed-rpa-worker:latest";
pub const DEFAULT_INFERENCE_ENDPOINT: &str = "http://host.docker.internal:11434/api/generate";
pub const DEFAULT_MODEL: &str = "gemma3:4b";
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub const WORKER_IMAGE_ENV: &str = "WORKER_IMAGE";
pub const INFERENCE_ENDPOINT_ENV: &str = "OLLAMA_ENDPOINT";
pub const INFERENCE_MODEL_ENV: &str = "OLLAMA_MODEL";
pub const INFERENCE_TIMEOUT_ENV: &str = "INFERENCE_TIMEOUT_SECS";
pub const MAX_ITERATIONS_ENV: &str = "AGENT_MAX_ITERATIONS";
pub const JOB_TIMEOUT_ENV: &str = "JOB_TIMEOUT_SECS";
pub const TEARDOWN_GRACE_ENV: &str = "TEARDOWN_GRACE_SECS";
pub const MAX_LINE_BYTES_ENV: &str = "MAX_LINE_BYTES";
pub const NAVIGATION_TIMEOUT_ENV: &str = "NAVIGATION_TIMEOUT_SECS";
pub const ELEMENT_TIMEOUT_ENV: &str = "ELEMENT_TIMEOUT_MS";
pub const CHROME_PATH_ENV: &str = "CHROME_PATH";

/// Values the host forwards into the sandbox, only when they were set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOverrides {
    pub inference_endpoint: Option<String>,
    pub inference_model: Option<String>,
    pub max_iterations: Option<usize>,
}

impl WorkerOverrides {
    fn resolve(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            inference_endpoint: non_empty(lookup, INFERENCE_ENDPOINT_ENV),
            inference_model: non_empty(lookup, INFERENCE_MODEL_ENV),
            max_iterations: parse_optional(lookup, MAX_ITERATIONS_ENV)?,
        })
    }

    /// `KEY=value` pairs for the sandbox environment.
    pub fn env_pairs(&self) -> Vec<String> {
        let mut env = Vec::new();
        if let Some(endpoint) = &self.inference_endpoint {
            env.push(format!("{INFERENCE_ENDPOINT_ENV}={endpoint}"));
        }
        if let Some(model) = &self.inference_model {
            env.push(format!("{INFERENCE_MODEL_ENV}={model}"));
        }
        if let Some(max) = self.max_iterations {
            env.push(format!("{MAX_ITERATIONS_ENV}={max}"));
        }
        env
    }
}

/// Host-side settings for the sandbox lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub worker_image: String,
    pub overrides: WorkerOverrides,
    /// A sandbox still running after this long is force-removed.
    pub job_timeout: Duration,
    /// Upper bound on a single forced removal call.
    pub teardown_grace: Duration,
    pub max_line_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            overrides: WorkerOverrides::default(),
            job_timeout: Duration::from_secs(900),
            teardown_grace: Duration::from_secs(10),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            worker_image: non_empty(&lookup, WORKER_IMAGE_ENV).unwrap_or(defaults.worker_image),
            overrides: WorkerOverrides::resolve(&lookup)?,
            job_timeout: parse_secs(&lookup, JOB_TIMEOUT_ENV, defaults.job_timeout)?,
            teardown_grace: parse_secs(&lookup, TEARDOWN_GRACE_ENV, defaults.teardown_grace)?,
            max_line_bytes: parse_optional(&lookup, MAX_LINE_BYTES_ENV)?
                .unwrap_or(defaults.max_line_bytes),
        })
    }
}

/// How the sandbox reaches the language model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_INFERENCE_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Sandbox-side settings for the job handlers and the agent loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub inference: InferenceConfig,
    pub max_iterations: usize,
    pub navigation_timeout: Duration,
    pub element_timeout: Duration,
    /// Pause after each successful action so the page can react.
    pub settle_delay: Duration,
    /// Pause before the closing screenshot.
    pub final_settle: Duration,
    pub chrome_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            navigation_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(500),
            final_settle: Duration::from_millis(2000),
            chrome_path: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_iterations =
            parse_optional(&lookup, MAX_ITERATIONS_ENV)?.unwrap_or(defaults.max_iterations);
        if max_iterations == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_ITERATIONS_ENV.to_string(),
                value: "0".to_string(),
                reason: "at least one iteration is required".to_string(),
            });
        }

        Ok(Self {
            inference: InferenceConfig {
                endpoint: non_empty(&lookup, INFERENCE_ENDPOINT_ENV)
                    .unwrap_or(defaults.inference.endpoint),
                model: non_empty(&lookup, INFERENCE_MODEL_ENV).unwrap_or(defaults.inference.model),
                timeout: parse_secs(&lookup, INFERENCE_TIMEOUT_ENV, defaults.inference.timeout)?,
            },
            max_iterations,
            navigation_timeout: parse_secs(
                &lookup,
                NAVIGATION_TIMEOUT_ENV,
                defaults.navigation_timeout,
            )?,
            element_timeout: parse_optional(&lookup, ELEMENT_TIMEOUT_ENV)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.element_timeout),
            chrome_path: non_empty(&lookup, CHROME_PATH_ENV),
            ..defaults
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    non_empty(lookup, key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse_optional::<u64>(lookup, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn host_defaults_when_nothing_is_set() {
        let config = HostConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
        assert!(config.overrides.env_pairs().is_empty());
    }

    #[test]
    fn default_job_timeout_outlasts_a_full_agent_run() {
        let agent = AgentConfig::default();
        let per_round = agent.inference.timeout + agent.settle_delay;
        let worst = agent.navigation_timeout
            + per_round * agent.max_iterations as u32
            + agent.final_settle;
        assert!(HostConfig::default().job_timeout > worst);
    }

    #[test]
    fn host_forwards_only_set_overrides() {
        let config = HostConfig::from_lookup(vars(&[
            (WORKER_IMAGE_ENV, "worker:dev"),
            (INFERENCE_MODEL_ENV, "llava:7b"),
            (INFERENCE_ENDPOINT_ENV, "   "),
        ]))
        .unwrap();
        assert_eq!(config.worker_image, "worker:dev");
        assert_eq!(config.overrides.env_pairs(), vec!["OLLAMA_MODEL=llava:7b"]);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = HostConfig::from_lookup(vars(&[(JOB_TIMEOUT_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == JOB_TIMEOUT_ENV));
    }

    #[test]
    fn agent_reads_inference_settings() {
        let config = AgentConfig::from_lookup(vars(&[
            (INFERENCE_ENDPOINT_ENV, "http://10.0.0.2:11434/api/generate"),
            (MAX_ITERATIONS_ENV, "8"),
            (ELEMENT_TIMEOUT_ENV, "750"),
        ]))
        .unwrap();
        assert_eq!(config.inference.endpoint, "http://10.0.0.2:11434/api/generate");
        assert_eq!(config.inference.model, DEFAULT_MODEL);
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.element_timeout, Duration::from_millis(750));
        assert_eq!(config.settle_delay, Duration::from_millis(500));
    }

    #[test]
    fn agent_rejects_zero_iterations() {
        assert!(AgentConfig::from_lookup(vars(&[(MAX_ITERATIONS_ENV, "0")])).is_err());
    }
}
