//! Server-sent-event parsing for streamed chat completions.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Content(String),
    Done,
}

/// Interpret one SSE line. Blank lines, comments and chunks without
/// content yield `None`.
pub(crate) fn parse_sse_line(line: &str) -> Result<Option<SseEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(None);
    };
    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
        .map(SseEvent::Content))
}

/// Accumulates raw bytes and hands back complete lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            lines.push(self.buffer[..pos].to_string());
            self.buffer.drain(..=pos);
        }
        lines
    }

    pub fn finish(self) -> Option<String> {
        (!self.buffer.trim().is_empty()).then_some(self.buffer)
    }
}
