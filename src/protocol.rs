//! Recording line codec for the asciinema v2 convention.
//!
//! A recording is UTF-8 text, one JSON value per LF-terminated line. The
//! first line is a header object carrying `version`, `width`, and `height`;
//! every later line is an event array: `[t, "o", payload]` for output,
//! `[t, "i", payload]` for input, `[t, "r", "COLSxROWS"]` for resizes, and
//! the synthesized `["exit", code, sessionId]` sentinel on PTY termination.

use serde_json::{json, Map, Value};
use tracing::debug;

/// ANSI "erase saved lines" sequence. An output payload containing it marks a
/// point after which earlier history is invisible, so late joiners can skip
/// everything before it.
pub const CLEAR_SEQUENCE: &str = "\x1b[3J";

/// One classified recording line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Header(RecordingHeader),
    Event(StreamEvent),
}

/// The header object of a recording. Fields beyond `width`/`height` are kept
/// verbatim so re-emission never drops writer-supplied keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingHeader {
    fields: Map<String, Value>,
}

impl RecordingHeader {
    pub fn width(&self) -> Option<u64> {
        self.fields.get("width").and_then(Value::as_u64)
    }

    pub fn height(&self) -> Option<u64> {
        self.fields.get("height").and_then(Value::as_u64)
    }

    /// Copy of this header with `width`/`height` replaced, used when a resize
    /// preceding the last clear supersedes the recorded dimensions.
    pub fn with_dimensions(&self, cols: u32, rows: u32) -> RecordingHeader {
        let mut fields = self.fields.clone();
        fields.insert("width".to_string(), Value::from(cols));
        fields.insert("height".to_string(), Value::from(rows));
        RecordingHeader { fields }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// A recording event. Resize payloads keep their raw `"COLSxROWS"` text so
/// forwarding never reformats what the writer produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Output { time: f64, data: String },
    Input { time: f64, data: String },
    Resize { time: f64, raw: String },
    Exit { code: i64, session_id: String },
}

impl StreamEvent {
    /// Wire form with the timestamp replaced. Exit events keep their sentinel
    /// shape regardless of the requested timestamp.
    pub fn to_wire(&self, time: f64) -> Value {
        match self {
            StreamEvent::Output { data, .. } => json!([time, "o", data]),
            StreamEvent::Input { data, .. } => json!([time, "i", data]),
            StreamEvent::Resize { raw, .. } => json!([time, "r", raw]),
            StreamEvent::Exit { code, session_id } => json!(["exit", code, session_id]),
        }
    }
}

/// True iff the event is an output whose payload carries the clear sequence.
/// A plain substring scan; no terminal emulation, and sequences split across
/// two output events are not recognized.
pub fn contains_clear(event: &StreamEvent) -> bool {
    matches!(event, StreamEvent::Output { data, .. } if data.contains(CLEAR_SEQUENCE))
}

/// Classify one recording line. Lines that fail JSON parsing or don't match
/// any known shape yield `None`; the caller decides whether to skip them
/// (replay) or forward them raw (live fan-out).
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "recording line is not valid json");
            return None;
        }
    };
    classify(value)
}

fn classify(value: Value) -> Option<ParsedLine> {
    match value {
        Value::Object(map) => {
            if map.contains_key("version") && map.contains_key("width") && map.contains_key("height")
            {
                Some(ParsedLine::Header(RecordingHeader { fields: map }))
            } else {
                None
            }
        }
        Value::Array(items) if items.len() >= 3 => classify_event(items),
        _ => None,
    }
}

fn classify_event(items: Vec<Value>) -> Option<ParsedLine> {
    if items[0].as_str() == Some("exit") {
        let code = items[1].as_i64()?;
        let session_id = items[2].as_str()?.to_string();
        return Some(ParsedLine::Event(StreamEvent::Exit { code, session_id }));
    }
    let time = items[0].as_f64()?;
    let kind = items[1].as_str()?;
    let payload = items[2].as_str()?;
    let event = match kind {
        "o" => StreamEvent::Output {
            time,
            data: payload.to_string(),
        },
        "i" => StreamEvent::Input {
            time,
            data: payload.to_string(),
        },
        "r" => StreamEvent::Resize {
            time,
            raw: payload.to_string(),
        },
        _ => return None,
    };
    Some(ParsedLine::Event(event))
}

/// Parse a `"COLSxROWS"` resize payload. Malformed payloads are still
/// forwarded verbatim; they just can't drive a header rewrite.
pub fn parse_dimensions(raw: &str) -> Option<(u32, u32)> {
    let (cols, rows) = raw.split_once('x')?;
    Some((cols.trim().parse().ok()?, rows.trim().parse().ok()?))
}
