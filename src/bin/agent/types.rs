use sandboxed_rpa::defang_markers;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Condensed page text handed to the model during the agent loop.
pub const AGENT_TEXT_LIMIT: usize = 8000;
/// Condensed page text handed to the model for a describe job.
pub const DESCRIBE_TEXT_LIMIT: usize = 5000;

pub const DEFAULT_AGENT_GOAL: &str = "Do something on this page.";
pub const DEFAULT_DESCRIBE_REQUEST: &str = "Explain what this page is.";

/// A single UI action the model asks for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentCommand {
    Fill {
        #[serde(default, deserialize_with = "lenient_id")]
        id: Option<u32>,
        #[serde(default, deserialize_with = "lenient_text")]
        value: String,
    },
    Click {
        #[serde(default, deserialize_with = "lenient_id")]
        id: Option<u32>,
    },
    Press {
        #[serde(default)]
        key: Option<String>,
    },
    Finish {
        #[serde(default, deserialize_with = "lenient_text")]
        result: String,
    },
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCommand::Fill { id, value } => write!(f, "fill {} with '{value}'", IdLabel(*id)),
            AgentCommand::Click { id } => write!(f, "click {}", IdLabel(*id)),
            AgentCommand::Press { key } => write!(f, "press {}", key.as_deref().unwrap_or("Enter")),
            AgentCommand::Finish { .. } => f.write_str("finish"),
        }
    }
}

struct IdLabel(Option<u32>);

impl fmt::Display for IdLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "element {id}"),
            None => f.write_str("an unnamed element"),
        }
    }
}

/// Models write ids as `3`, `"3"` or `"[3]"`; anything else is treated as missing.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(n)) => u32::try_from(n).ok(),
        Some(RawId::Text(s)) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim()
            .parse()
            .ok(),
        Some(RawId::Other(_)) | None => None,
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawText {
        Text(String),
        Number(serde_json::Number),
        Bool(bool),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<RawText>::deserialize(deserializer)? {
        Some(RawText::Text(s)) => s,
        Some(RawText::Number(n)) => n.to_string(),
        Some(RawText::Bool(b)) => b.to_string(),
        Some(RawText::Other(_)) | None => String::new(),
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON array or object found in the response")]
    NoJson,
    #[error("JSON is neither a command nor a list of commands")]
    NotCommands,
}

/// Pull the commands out of a free-form model response.
///
/// Each entry is decoded on its own, so one malformed command does not cost
/// the rest of the batch.
pub fn parse_commands(response: &str) -> Result<Vec<Result<AgentCommand, String>>, ParseError> {
    let value = extract_json(response).ok_or(ParseError::NoJson)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) if !map.contains_key("action") => {
            match ["actions", "commands", "steps"]
                .iter()
                .find_map(|key| match map.remove(*key) {
                    Some(serde_json::Value::Array(items)) => Some(items),
                    _ => None,
                }) {
                Some(items) => items,
                None => return Err(ParseError::NotCommands),
            }
        }
        object @ serde_json::Value::Object(_) => vec![object],
        _ => return Err(ParseError::NotCommands),
    };

    Ok(items
        .into_iter()
        .map(|item| {
            let shown = item.to_string();
            serde_json::from_value::<AgentCommand>(item).map_err(|e| format!("{shown}: {e}"))
        })
        .collect())
}

/// The first substring of `text` that is a complete JSON array or object.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    text.char_indices()
        .filter(|(_, c)| *c == '[' || *c == '{')
        .find_map(|(start, _)| {
            let len = balanced_len(&text[start..])?;
            serde_json::from_str(&text[start..start + len]).ok()
        })
}

/// Length of the bracketed span opening at the start of `text`.
fn balanced_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("command names no element id")]
    MissingId,
    #[error("element {0} is not in the current index")]
    UnknownId(u32),
}

/// Element ids of one observation, mapped to the selectors that reach them.
///
/// Built fresh on every iteration; ids from an earlier iteration are never
/// resolved against a later index.
#[derive(Debug, Clone, Default)]
pub struct SelectorIndex {
    generation: usize,
    entries: BTreeMap<u32, String>,
}

impl SelectorIndex {
    pub fn new(generation: usize) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: u32, selector: String) {
        self.entries.insert(id, selector);
    }

    pub fn resolve(&self, id: Option<u32>) -> Result<&str, LookupError> {
        let id = id.ok_or(LookupError::MissingId)?;
        self.entries
            .get(&id)
            .map(String::as_str)
            .ok_or(LookupError::UnknownId(id))
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What the agent saw at the start of an iteration.
#[derive(Debug, Clone)]
pub struct Observation {
    pub index: SelectorIndex,
    /// One human-readable line per indexed element.
    pub elements: Vec<String>,
    /// Condensed page text.
    pub text: String,
    /// Base64 JPEG.
    pub screenshot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub iteration: usize,
    pub outcome: Outcome,
    pub detail: String,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[round {}] {}: {}", self.iteration, self.outcome, self.detail)
    }
}

/// Append-only record of what every command did, fed back to the model.
#[derive(Debug, Clone, Default)]
pub struct AgentHistory {
    entries: Vec<HistoryEntry>,
}

impl AgentHistory {
    pub fn record(&mut self, iteration: usize, outcome: Outcome, detail: impl Into<String>) {
        let entry = HistoryEntry {
            iteration,
            outcome,
            detail: defang_markers(&detail.into()),
        };
        tracing::info!("{}", entry);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for AgentHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_array_from_fenced_prose() {
        let response = "Sure! Here is the plan:\n```json\n[{\"action\":\"click\",\"id\":2}]\n```\nGood luck [really].";
        let commands = parse_commands(response).unwrap();
        assert_eq!(commands, vec![Ok(AgentCommand::Click { id: Some(2) })]);
    }

    #[test]
    fn skips_bracketed_prose_before_the_json() {
        let response = r#"Step [one] done. {"action":"finish","result":"done [ok]"}"#;
        let commands = parse_commands(response).unwrap();
        assert_eq!(
            commands,
            vec![Ok(AgentCommand::Finish {
                result: "done [ok]".into()
            })]
        );
    }

    #[test]
    fn accepts_wrapped_command_lists() {
        let response = r#"{"actions":[{"action":"press"},{"action":"fill","id":"[4]","value":42}]}"#;
        let commands = parse_commands(response).unwrap();
        assert_eq!(
            commands,
            vec![
                Ok(AgentCommand::Press { key: None }),
                Ok(AgentCommand::Fill {
                    id: Some(4),
                    value: "42".into()
                }),
            ]
        );
    }

    #[test]
    fn bad_entries_do_not_sink_the_batch() {
        let commands =
            parse_commands(r#"[{"action":"hover","id":1},{"action":"click","id":"x"}]"#).unwrap();
        assert!(commands[0].is_err());
        assert_eq!(commands[1], Ok(AgentCommand::Click { id: None }));
    }

    #[test]
    fn prose_without_json_is_a_parse_error() {
        assert_eq!(parse_commands("I would click the button."), Err(ParseError::NoJson));
        assert_eq!(parse_commands("[1, 2"), Err(ParseError::NoJson));
        assert_eq!(parse_commands("\"just a string\" 7"), Err(ParseError::NoJson));
    }

    #[test]
    fn index_rejects_unknown_and_missing_ids() {
        let mut index = SelectorIndex::new(3);
        index.insert(0, "[data-agent-ref=\"3-0\"]".into());
        assert_eq!(index.resolve(Some(0)), Ok("[data-agent-ref=\"3-0\"]"));
        assert_eq!(index.resolve(Some(9)), Err(LookupError::UnknownId(9)));
        assert_eq!(index.resolve(None), Err(LookupError::MissingId));
    }

    #[test]
    fn history_renders_one_line_per_entry() {
        let mut history = AgentHistory::default();
        history.record(1, Outcome::Success, "clicked element 2");
        history.record(2, Outcome::Error, "invalid JSON, retry");
        assert_eq!(
            history.to_string(),
            "[round 1] success: clicked element 2\n[round 2] error: invalid JSON, retry"
        );
    }

    #[test]
    fn history_breaks_up_job_markers() {
        let mut history = AgentHistory::default();
        history.record(1, Outcome::Failure, r#"fill element 0: JOB_UPDATE:{"image":"x"}"#);
        assert_eq!(
            history.to_string(),
            r#"[round 1] failure: fill element 0: JOB_UPDATE :{"image":"x"}"#
        );
    }
}
