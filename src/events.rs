//! Turning the sandbox's line protocol into typed events.

use async_stream::stream;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use crate::job::{JobResult, ProgressUpdate, RESULT_MARKER, UPDATE_MARKER};

/// One line of sandbox output, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Log(String),
    Progress(ProgressUpdate),
    Result(JobResult),
    /// Reading the output failed; nothing follows this event.
    StreamError(String),
}

/// Classify a single line.
///
/// Markers are searched for anywhere in the line, since the runtime or the
/// sandbox's own logging may put bytes in front of them. A marker whose
/// payload does not decode leaves the line a plain log line.
pub fn classify_line(line: &str) -> JobEvent {
    if let Some(update) = decode_after::<ProgressUpdate>(line, UPDATE_MARKER) {
        if !update.image.is_empty() {
            return JobEvent::Progress(update);
        }
    }
    if let Some(result) = decode_after::<JobResult>(line, RESULT_MARKER) {
        return JobEvent::Result(result);
    }
    JobEvent::Log(line.to_string())
}

fn decode_after<T: DeserializeOwned>(line: &str, marker: &str) -> Option<T> {
    let idx = line.find(marker)?;
    let payload = line[idx + marker.len()..].trim();
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(marker, error = %e, "marker payload did not decode, keeping line as log");
            None
        }
    }
}

/// Reads clean sandbox output line by line and yields one event per line.
///
/// Lines may be arbitrarily long up to `max_line_bytes`; a screenshot embedded
/// in a marker line easily runs to several megabytes.
pub struct EventReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line_bytes: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
            buf: Vec::new(),
            max_line_bytes,
            done: false,
        }
    }

    /// The next event, or `None` once the output has ended.
    ///
    /// A read failure is returned once as [`JobEvent::StreamError`]; every
    /// call after that returns `None`.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        self.buf.clear();

        let limit = self.max_line_bytes as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await;

        match read {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) if self.buf.len() > self.max_line_bytes && !self.buf.ends_with(b"\n") => {
                self.done = true;
                warn!(limit = self.max_line_bytes, "sandbox output line exceeds the limit");
                Some(JobEvent::StreamError(format!(
                    "output line exceeds {} bytes",
                    self.max_line_bytes
                )))
            }
            Ok(_) => {
                let mut line = self.buf.as_slice();
                if let Some(stripped) = line.strip_suffix(b"\n") {
                    line = stripped;
                }
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                Some(classify_line(&String::from_utf8_lossy(line)))
            }
            Err(e) => {
                self.done = true;
                warn!(error = %e, "reading sandbox output failed");
                Some(JobEvent::StreamError(format!("error reading logs: {e}")))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send
    where
        R: Send,
    {
        let mut reader = self;
        stream! {
            while let Some(event) = reader.next_event().await {
                yield event;
            }
        }
    }
}
