//! The observe, think, act cycle behind `agent_act` jobs.
//!
//! Each iteration indexes the page afresh, asks the model for a batch of
//! commands and runs them in order. The loop ends when the model sends
//! `finish`, when the iteration budget runs out, or when the page can no
//! longer be analyzed or the model can no longer be reached.

use anyhow::{Context, Result};
use sandboxed_rpa::{AgentConfig, JobResult, ProgressUpdate, defang_markers};
use std::time::Duration;
use tracing::{info, warn};

use crate::brain::{InferenceError, agent_prompt};
use crate::dom::PageSnapshot;
use crate::types::{
    AGENT_TEXT_LIMIT, AgentCommand, AgentHistory, Observation, Outcome, parse_commands,
};

/// Browser operations the job handlers need.
pub trait Page {
    async fn navigate(&mut self, url: &str) -> Result<()>;
    /// Full page markup.
    async fn content(&mut self) -> Result<String>;
    /// Condensed visible text.
    async fn page_text(&mut self) -> Result<String>;
    /// Index the interactive elements, tagging them for `generation`.
    async fn observe(&mut self, generation: usize) -> Result<PageSnapshot>;
    /// Base64 JPEG of the viewport.
    async fn screenshot(&mut self) -> Result<String>;
    async fn fill(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn click(&mut self, selector: &str) -> Result<()>;
    async fn press(&mut self, key: &str) -> Result<()>;
}

/// A vision-capable language model.
pub trait Model {
    async fn generate(&self, prompt: &str, image: &str) -> Result<String, InferenceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub settle_delay: Duration,
    pub final_settle: Duration,
}

impl From<&AgentConfig> for LoopSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            settle_delay: config.settle_delay,
            final_settle: config.final_settle,
        }
    }
}

#[derive(Debug)]
pub enum Terminal {
    Finished { result: String },
    Exhausted,
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub struct LoopReport {
    pub terminal: Terminal,
    pub iterations: usize,
    pub history: AgentHistory,
    pub screenshot: Option<String>,
}

impl LoopReport {
    pub fn into_job_result(self) -> JobResult {
        let result = match self.terminal {
            Terminal::Finished { result } => {
                JobResult::success(format!("{result}\n\nLog:\n{}", self.history))
            }
            Terminal::Exhausted => JobResult::success(format!(
                "Stopped after {} rounds and {} commands without an explicit finish.\n\nLog:\n{}",
                self.iterations,
                self.history.entries().len(),
                self.history
            )),
            Terminal::Failed(e) => JobResult::failure(format!("{e:#}")),
        };
        match self.screenshot {
            Some(image) => result.with_image(image),
            None => result,
        }
    }
}

pub struct AgentLoop {
    settings: LoopSettings,
}

impl AgentLoop {
    pub fn new(settings: LoopSettings) -> Self {
        Self { settings }
    }

    pub async fn run<P, M>(
        &self,
        page: &mut P,
        model: &M,
        goal: &str,
        mut progress: impl FnMut(ProgressUpdate),
    ) -> LoopReport
    where
        P: Page,
        M: Model,
    {
        let max = self.settings.max_iterations;
        let mut history = AgentHistory::default();
        let mut screenshot = None;

        for iteration in 1..=max {
            info!(iteration, max, "observing page");
            let observation = match observe(page, iteration).await {
                Ok(observation) => observation,
                Err(e) => {
                    return LoopReport {
                        terminal: Terminal::Failed(e),
                        iterations: iteration,
                        history,
                        screenshot,
                    };
                }
            };
            info!(
                generation = observation.index.generation(),
                elements = observation.index.len(),
                "page indexed"
            );
            progress(ProgressUpdate::new(observation.screenshot.clone()));
            screenshot = Some(observation.screenshot.clone());

            let prompt = agent_prompt(goal, iteration, max, &history, &observation);
            let response = match model.generate(&prompt, &observation.screenshot).await {
                Ok(response) => response,
                Err(e) if e.is_fatal() => {
                    return LoopReport {
                        terminal: Terminal::Failed(e.into()),
                        iterations: iteration,
                        history,
                        screenshot,
                    };
                }
                Err(e) => {
                    warn!(iteration, error = %e, "inference failed");
                    history.record(iteration, Outcome::Error, format!("{e}, retry"));
                    continue;
                }
            };
            println!("{}", raw_response_line(&response));

            let commands = match parse_commands(&response) {
                Ok(commands) if !commands.is_empty() => commands,
                Ok(_) => {
                    history.record(iteration, Outcome::Error, "no commands, retry");
                    continue;
                }
                Err(e) => {
                    history.record(iteration, Outcome::Error, format!("invalid JSON, retry ({e})"));
                    continue;
                }
            };

            for command in commands {
                let command = match command {
                    Ok(AgentCommand::Finish { result }) => {
                        history.record(iteration, Outcome::Success, "finish");
                        tokio::time::sleep(self.settings.final_settle).await;
                        let latest = page.screenshot().await.ok().or(screenshot);
                        return LoopReport {
                            terminal: Terminal::Finished { result },
                            iterations: iteration,
                            history,
                            screenshot: latest,
                        };
                    }
                    Ok(command) => command,
                    Err(raw) => {
                        history.record(iteration, Outcome::Failure, format!("unusable command {raw}"));
                        continue;
                    }
                };

                match self.act(page, &observation, &command).await {
                    Ok(()) => {
                        history.record(iteration, Outcome::Success, command.to_string());
                        tokio::time::sleep(self.settings.settle_delay).await;
                    }
                    Err(e) => {
                        history.record(iteration, Outcome::Failure, format!("{command}: {e:#}"));
                    }
                }
            }
        }

        info!(max, "iteration budget spent");
        tokio::time::sleep(self.settings.final_settle).await;
        let latest = page.screenshot().await.ok().or(screenshot);
        LoopReport {
            terminal: Terminal::Exhausted,
            iterations: max,
            history,
            screenshot: latest,
        }
    }

    async fn act<P: Page>(
        &self,
        page: &mut P,
        observation: &Observation,
        command: &AgentCommand,
    ) -> Result<()> {
        match command {
            AgentCommand::Fill { id, value } => {
                let selector = observation.index.resolve(*id)?;
                page.fill(selector, value).await
            }
            AgentCommand::Click { id } => {
                let selector = observation.index.resolve(*id)?;
                page.click(selector).await
            }
            AgentCommand::Press { key } => page.press(key.as_deref().unwrap_or("Enter")).await,
            AgentCommand::Finish { .. } => Ok(()),
        }
    }
}

/// Echo of the model's reply for the caller's log.
fn raw_response_line(response: &str) -> String {
    format!("AI RAW RESPONSE: {}", defang_markers(response))
}

async fn observe<P: Page>(page: &mut P, generation: usize) -> Result<Observation> {
    let snapshot = page
        .observe(generation)
        .await
        .context("could not analyze page")?;
    let screenshot = page
        .screenshot()
        .await
        .context("could not take screenshot")?;
    Ok(snapshot.into_observation(generation, AGENT_TEXT_LIMIT, screenshot))
}
