//! In-memory stand-ins for the browser and the model.

use anyhow::{Result, bail};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::agent_loop::{Model, Page};
use crate::brain::InferenceError;
use crate::dom::{ElementInfo, PageSnapshot};

#[derive(Default)]
pub struct FakePage {
    pub elements: Vec<ElementInfo>,
    pub text: String,
    pub html: String,
    pub fail_navigation: Option<String>,
    pub fail_observe: bool,
    pub fail_text: bool,
    pub visited: Vec<String>,
    /// `fill <selector> <value>`, `click <selector>`, `press <key>`
    pub actions: Vec<String>,
    pub shots: usize,
}

impl FakePage {
    pub fn with_elements(elements: Vec<ElementInfo>) -> Self {
        Self {
            elements,
            text: "Example page".to_string(),
            html: "<html><body>Example page</body></html>".to_string(),
            ..Default::default()
        }
    }
}

impl Page for FakePage {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        if let Some(reason) = &self.fail_navigation {
            bail!("{reason}");
        }
        self.visited.push(url.to_string());
        Ok(())
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.html.clone())
    }

    async fn page_text(&mut self) -> Result<String> {
        if self.fail_text {
            bail!("evaluation failed");
        }
        Ok(self.text.clone())
    }

    async fn observe(&mut self, _generation: usize) -> Result<PageSnapshot> {
        if self.fail_observe {
            bail!("script threw");
        }
        Ok(PageSnapshot {
            elements: self.elements.clone(),
            text: self.text.clone(),
        })
    }

    async fn screenshot(&mut self) -> Result<String> {
        self.shots += 1;
        Ok(format!("shot-{}", self.shots))
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        self.actions.push(format!("fill {selector} {value}"));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.actions.push(format!("click {selector}"));
        Ok(())
    }

    async fn press(&mut self, key: &str) -> Result<()> {
        self.actions.push(format!("press {key}"));
        Ok(())
    }
}

/// Replies in order, then repeats `fallback`.
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, InferenceError>>>,
    fallback: String,
    prompts: RefCell<Vec<String>>,
    calls: Cell<usize>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, InferenceError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            fallback: "[]".to_string(),
            prompts: RefCell::default(),
            calls: Cell::new(0),
        }
    }

    pub fn repeating(reply: &str) -> Self {
        Self {
            fallback: reply.to_string(),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Model for ScriptedModel {
    async fn generate(&self, prompt: &str, _image: &str) -> Result<String, InferenceError> {
        self.calls.set(self.calls.get() + 1);
        self.prompts.borrow_mut().push(prompt.to_string());
        let next = self.replies.borrow_mut().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
