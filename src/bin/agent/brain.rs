use anyhow::Result;
use reqwest::{Client, StatusCode};
use sandboxed_rpa::InferenceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::agent_loop::Model;
use crate::types::{AgentHistory, Observation};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("inference call timed out")]
    Timeout,
    #[error("inference endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("inference response has no `response` field")]
    MissingResponse,
    #[error("inference call failed: {0}")]
    Transport(String),
}

impl InferenceError {
    /// A dead endpoint ends the agent loop; everything else is worth another round.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InferenceError::Unreachable(_))
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InferenceError::Timeout
        } else if e.is_connect() {
            InferenceError::Unreachable(e.to_string())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: [&'a str; 1],
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Client for an Ollama-style `/api/generate` endpoint.
pub struct Brain {
    client: Client,
    config: InferenceConfig,
}

impl Brain {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

impl Model for Brain {
    async fn generate(&self, prompt: &str, image: &str) -> Result<String, InferenceError> {
        debug!(model = %self.config.model, prompt_len = prompt.len(), "calling inference endpoint");
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&GenerateRequest {
                model: &self.config.model,
                prompt,
                images: [image],
                stream: false,
                options: GenerateOptions { temperature: 0.2 },
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let body: GenerateResponse = response.json().await?;
        body.response.ok_or(InferenceError::MissingResponse)
    }
}

/// Prompt for one agent iteration. Instructions go both before and after the
/// page context so small models keep the output format in view.
pub fn agent_prompt(
    goal: &str,
    iteration: usize,
    max_iterations: usize,
    history: &AgentHistory,
    observation: &Observation,
) -> String {
    let history = if history.is_empty() {
        "(nothing yet)".to_string()
    } else {
        history.to_string()
    };
    let elements = if observation.elements.is_empty() {
        "(no interactive elements found)".to_string()
    } else {
        observation.elements.join("\n")
    };

    format!(
        r#"*** SYSTEM INSTRUCTIONS ***
You are a Browser Automation Agent working towards the user's goal, one round at a time.
This is round {iteration} of {max_iterations}.
Reply with ONLY a JSON array of actions. Do not write explanations.
Supported actions:
1. {{"action": "fill", "id": 3, "value": "text to type"}}
2. {{"action": "click", "id": 5}}
3. {{"action": "press", "key": "Enter"}}
4. {{"action": "finish", "result": "what was achieved or found"}}
Element ids are only valid for this round.

*** PREVIOUS ROUNDS ***
{history}

*** INTERACTIVE ELEMENTS ***
{elements}

*** PAGE TEXT ***
{text}

*** USER GOAL ***
{goal}

*** FINAL COMMAND ***
Use the screenshot and the element list to choose the next actions.
Use "finish" as soon as the goal is met.
Output JSON ONLY.
Response:"#,
        text = observation.text,
    )
}

/// Prompt for a describe job.
pub fn describe_prompt(text: &str, request: &str) -> String {
    format!(
        r#"*** SYSTEM INSTRUCTIONS ***
You are a generic web analyst AI.
1. MANDATORY: You must ALWAYS respond in ENGLISH.
2. Ignore the language of the webpage content for your response language.
3. Be concise and professional.
4. Do NOT hallucinate HTML tags.

*** WEBPAGE TEXT CONTENT ***
{text}

*** USER REQUEST ***
{request}

*** FINAL COMMAND ***
Based on the image and text above, answer the user's request.
Ensure your entire response is in English.
Response:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, SelectorIndex};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn brain_for(endpoint: String) -> Brain {
        Brain::new(InferenceConfig {
            endpoint,
            model: "llava:7b".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn sends_prompt_and_image_and_returns_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({
                "model": "llava:7b",
                "prompt": "what is this?",
                "images": ["aW1n"],
                "stream": false,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "a login form", "done": true })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let brain = brain_for(format!("{}/api/generate", server.uri()));
        let reply = brain.generate("what is this?", "aW1n").await.unwrap();
        assert_eq!(reply, "a login form");
    }

    #[tokio::test]
    async fn non_200_is_a_recoverable_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = brain_for(format!("{}/api/generate", server.uri()))
            .generate("p", "i")
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Status { ref body, .. } if body == "model not loaded"));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn missing_response_field_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "done": true })))
            .mount(&server)
            .await;

        let err = brain_for(format!("{}/api/generate", server.uri()))
            .generate("p", "i")
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::MissingResponse));
    }

    #[tokio::test]
    async fn closed_port_is_fatal() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = brain_for(format!("http://127.0.0.1:{port}/api/generate"))
            .generate("p", "i")
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "got {err:?}");
    }

    #[test]
    fn agent_prompt_carries_history_and_elements() {
        let mut history = AgentHistory::default();
        history.record(1, Outcome::Failure, "click element 9: element 9 is not in the current index");
        let observation = Observation {
            index: SelectorIndex::new(2),
            elements: vec!["[0] input#q type=search".to_string()],
            text: "Search the docs".to_string(),
            screenshot: String::new(),
        };

        let prompt = agent_prompt("find the install guide", 2, 5, &history, &observation);
        assert!(prompt.contains("This is round 2 of 5."));
        assert!(prompt.contains("[round 1] failure: click element 9"));
        assert!(prompt.contains("[0] input#q type=search"));
        assert!(prompt.contains("*** USER GOAL ***\nfind the install guide"));
    }
}
