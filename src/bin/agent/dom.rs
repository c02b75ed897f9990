use anyhow::{Context, Result, anyhow};
use headless_chrome::Tab;
use serde::Deserialize;

use crate::types::{Observation, SelectorIndex};

/// JavaScript injected into the page to index its interactive elements.
///
/// The script:
///   1. Drops the `data-agent-ref` markers left by the previous observation.
///   2. Tags every visible input, textarea, select, button, link and
///      button-like element with `data-agent-ref="<generation>-<id>"`.
///   3. Returns a JSON string holding one record per tagged element plus the
///      page text with noise elements removed and whitespace collapsed.
///
/// The generation is part of the marker, so a selector from an older
/// observation can never match an element tagged by a newer one.
const OBSERVE_JS: &str = r#"
(() => {
  const GENERATION = __GENERATION__;
  document.querySelectorAll('[data-agent-ref]').forEach(el => el.removeAttribute('data-agent-ref'));

  const INTERACTIVE = 'input:not([type=hidden]), textarea, select, button, a[href], [role=button], [role=link], [contenteditable=""], [contenteditable=true]';
  const NOISE = ['script', 'style', 'svg', 'noscript', 'iframe', 'link', 'meta'];

  function isVisible(el) {
    const rect = el.getBoundingClientRect();
    if (rect.width === 0 || rect.height === 0) return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function labelOf(el) {
    if (el.labels && el.labels.length) return el.labels[0].innerText || '';
    return el.getAttribute('aria-label') || el.getAttribute('placeholder') ||
      el.getAttribute('title') || el.getAttribute('alt') || el.innerText || '';
  }

  const elements = [];
  let id = 0;
  for (const el of document.querySelectorAll(INTERACTIVE)) {
    if (!isVisible(el)) continue;
    el.setAttribute('data-agent-ref', GENERATION + '-' + id);
    let ident = '';
    if (el.id) ident += '#' + el.id;
    if (el.name) ident += '[name="' + el.name + '"]';
    elements.push({
      id: id,
      tag: el.tagName.toLowerCase(),
      kind: el.getAttribute('type') || el.getAttribute('role') || '',
      ident: ident,
      label: labelOf(el).replace(/\s+/g, ' ').trim().slice(0, 60),
      value: (typeof el.value === 'string' ? el.value : '').slice(0, 40),
    });
    id++;
  }

  let text = '';
  if (document.body) {
    const clone = document.body.cloneNode(true);
    NOISE.forEach(s => clone.querySelectorAll(s).forEach(e => e.remove()));
    text = (clone.innerText || clone.textContent || '').replace(/\s+/g, ' ').trim();
  }
  return JSON.stringify({ elements: elements, text: text });
})()
"#;

/// Page text only, for describe jobs.
const CLEAN_TEXT_JS: &str = r#"
(() => {
  if (!document.body) return '';
  const clone = document.body.cloneNode(true);
  ['script', 'style', 'svg', 'noscript', 'iframe', 'link', 'meta'].forEach(s => {
    clone.querySelectorAll(s).forEach(e => e.remove());
  });
  return (clone.innerText || clone.textContent || '').replace(/\s+/g, ' ').trim();
})()
"#;

/// One indexed element as reported by [`OBSERVE_JS`]. Every field but the id
/// may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ElementInfo {
    pub id: u32,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value: String,
}

impl ElementInfo {
    /// e.g. `[2] input#q[name="q"] type=search label="Search" value="rust"`
    pub fn describe(&self) -> String {
        let tag = if self.tag.is_empty() { "element" } else { &self.tag };
        let mut line = format!("[{}] {tag}{}", self.id, self.ident);
        if !self.kind.is_empty() {
            line.push_str(&format!(" type={}", self.kind));
        }
        if !self.label.is_empty() {
            line.push_str(&format!(" label=\"{}\"", self.label));
        }
        if !self.value.is_empty() {
            line.push_str(&format!(" value=\"{}\"", self.value));
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageSnapshot {
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
    #[serde(default)]
    pub text: String,
}

impl PageSnapshot {
    /// Build the iteration's index and element descriptions.
    pub fn into_observation(
        self,
        generation: usize,
        text_limit: usize,
        screenshot: String,
    ) -> Observation {
        let mut index = SelectorIndex::new(generation);
        let mut elements = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            index.insert(element.id, selector_for(generation, element.id));
            elements.push(element.describe());
        }
        Observation {
            index,
            elements,
            text: truncate_text(&self.text, text_limit),
            screenshot,
        }
    }
}

pub fn selector_for(generation: usize, id: u32) -> String {
    format!("[data-agent-ref=\"{generation}-{id}\"]")
}

/// Cut `text` to at most `limit` characters, marking the cut.
pub fn truncate_text(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

/// Index the current page.
pub fn capture_snapshot(tab: &Tab, generation: usize) -> Result<PageSnapshot> {
    let script = OBSERVE_JS.replace("__GENERATION__", &generation.to_string());
    let result = tab.evaluate(&script, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| anyhow!("page analysis returned nothing"))?;
    serde_json::from_str(&raw).context("page analysis returned malformed data")
}

/// Get the page's condensed text.
pub fn capture_text(tab: &Tab) -> Result<String> {
    let result = tab.evaluate(CLEAN_TEXT_JS, false)?;
    result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| anyhow!("page text is not a string"))
}
