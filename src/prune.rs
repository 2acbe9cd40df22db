//! Backlog replay with visible-frame pruning.
//!
//! A late joiner doesn't need the whole recording: anything before the most
//! recent clear sequence is invisible. The replay pass walks the file once
//! from the last known clear offset, finds the final clear-bearing event and
//! the last resize preceding it, then emits a header carrying the effective
//! dimensions followed by every later output/resize/exit event with its
//! timestamp zeroed so the viewer renders the backlog instantly.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::protocol::{self, ParsedLine, RecordingHeader, StreamEvent};
use crate::sse::{sse_frame, SseSink};
use crate::tail;

/// Longest header line the probe will read before giving up on it.
const MAX_HEADER_BYTES: u64 = 64 * 1024;

/// What one replay pass produced.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayOutcome {
    /// Byte offset just past the newline of the last clear-bearing event, set
    /// when the pass observed a clear. The caller persists it (only for
    /// sessions that already have a metadata record).
    pub last_clear_offset: Option<u64>,
    /// An exit event was replayed; the sink has been closed.
    pub saw_exit: bool,
    /// The header frame was delivered to the sink.
    pub header_sent: bool,
}

struct ReplayWindow {
    header: Option<RecordingHeader>,
    events: Vec<StreamEvent>,
    rewrite: Option<(u32, u32)>,
    last_clear_offset: Option<u64>,
}

/// Replay the recording at `path` to a freshly attached subscriber. On any
/// failure of the pruning pass the replay falls back to an unpruned pass from
/// offset 0; if even that can't read the file (typically: not created yet),
/// the subscriber starts with the live stream only.
pub async fn replay(path: &Path, start_offset: u64, sink: &dyn SseSink) -> ReplayOutcome {
    match scan_file(path, start_offset, true).await {
        Ok(window) => emit(window, sink),
        Err(err) => {
            debug!(path = %path.display(), %err, "pruned replay failed, retrying without pruning");
            match scan_file(path, 0, false).await {
                Ok(window) => emit(window, sink),
                Err(err) => {
                    debug!(
                        path = %path.display(),
                        %err,
                        "no backlog available, subscriber starts live"
                    );
                    ReplayOutcome::default()
                }
            }
        }
    }
}

async fn scan_file(path: &Path, start_offset: u64, prune: bool) -> std::io::Result<ReplayWindow> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || scan(&path, start_offset, prune))
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?
}

/// One forward pass over `start_offset..EOF`. Offsets are bytes; only
/// newline-terminated lines participate (a partial trailing line belongs to
/// the tail reader). When `prune` is false, clears are ignored and the whole
/// window is kept.
fn scan(path: &Path, start_offset: u64, prune: bool) -> std::io::Result<ReplayWindow> {
    let stat = tail::stat_file(path)?;
    if start_offset > stat.size {
        debug!(
            path = %path.display(),
            start_offset,
            file_size = stat.size,
            "clamping stale lastClearOffset to file size"
        );
    }
    let start = start_offset.min(stat.size);

    let header = read_header(path)?;
    let bytes = tail::read_span(path, start, stat.size - start)?;

    let mut events: Vec<StreamEvent> = Vec::new();
    let mut file_offset = start;
    let mut last_clear_index: Option<usize> = None;
    let mut current_resize: Option<(u32, u32)> = None;
    let mut resize_before_clear: Option<(u32, u32)> = None;
    let mut last_clear_offset = start;

    for chunk in bytes.split_inclusive(|&b| b == b'\n') {
        if !chunk.ends_with(b"\n") {
            break;
        }
        let offset_after = file_offset + chunk.len() as u64;
        let line = String::from_utf8_lossy(&chunk[..chunk.len() - 1]);
        match protocol::parse_line(&line) {
            Some(ParsedLine::Header(_)) => {}
            Some(ParsedLine::Event(StreamEvent::Input { .. })) => {}
            Some(ParsedLine::Event(event)) => {
                if let StreamEvent::Resize { raw, .. } = &event {
                    if let Some(dims) = protocol::parse_dimensions(raw) {
                        current_resize = Some(dims);
                    }
                }
                let is_clear = prune && protocol::contains_clear(&event);
                events.push(event);
                if is_clear {
                    last_clear_index = Some(events.len() - 1);
                    resize_before_clear = current_resize;
                    last_clear_offset = offset_after;
                }
            }
            None => {}
        }
        file_offset = offset_after;
    }

    let events = match last_clear_index {
        Some(index) => events.split_off(index + 1),
        None => events,
    };

    Ok(ReplayWindow {
        header,
        events,
        rewrite: last_clear_index.and(resize_before_clear),
        last_clear_offset: last_clear_index.map(|_| last_clear_offset),
    })
}

/// Probe the first line of the recording for the header, independent of the
/// replay window's start offset. An unreadable or unparseable header is
/// skipped; the subscriber can still pick dimensions up from a later resize.
fn read_header(path: &Path) -> std::io::Result<Option<RecordingHeader>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file).take(MAX_HEADER_BYTES);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if !line.ends_with(b"\n") {
        debug!(path = %path.display(), "recording has no complete header line yet");
        return Ok(None);
    }
    match protocol::parse_line(&String::from_utf8_lossy(&line)) {
        Some(ParsedLine::Header(header)) => Ok(Some(header)),
        _ => {
            debug!(path = %path.display(), "first recording line is not a header");
            Ok(None)
        }
    }
}

fn emit(window: ReplayWindow, sink: &dyn SseSink) -> ReplayOutcome {
    let mut outcome = ReplayOutcome {
        last_clear_offset: window.last_clear_offset,
        ..ReplayOutcome::default()
    };

    if let Some(header) = &window.header {
        let value = match window.rewrite {
            Some((cols, rows)) => header.with_dimensions(cols, rows).to_value(),
            None => header.to_value(),
        };
        if sink.write(&sse_frame(&value)).is_err() {
            debug!("subscriber went away during replay");
            return outcome;
        }
        outcome.header_sent = true;
    }

    for event in &window.events {
        if sink.write(&sse_frame(&event.to_wire(0.0))).is_err() {
            debug!("subscriber went away during replay");
            return outcome;
        }
        if matches!(event, StreamEvent::Exit { .. }) {
            sink.close();
            outcome.saw_exit = true;
            return outcome;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::SinkError;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct TestSink {
        frames: Mutex<Vec<Value>>,
        closed: AtomicBool,
    }

    impl SseSink for TestSink {
        fn write(&self, frame: &[u8]) -> Result<(), SinkError> {
            let text = std::str::from_utf8(frame).unwrap();
            let payload = text
                .strip_prefix("data: ")
                .and_then(|rest| rest.strip_suffix("\n\n"))
                .unwrap();
            self.frames
                .lock()
                .unwrap()
                .push(serde_json::from_str(payload).unwrap());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl TestSink {
        fn frames(&self) -> Vec<Value> {
            self.frames.lock().unwrap().clone()
        }
    }

    fn write_recording(lines: &[&str]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.cast");
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn prunes_to_events_after_the_last_clear() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","old"]"#,
            r#"[0.2,"r","100x30"]"#,
            r#"[0.3,"o","\u001b[3J"]"#,
            r#"[0.4,"o","new"]"#,
        ]);
        let sink = TestSink::default();

        let outcome = replay(&path, 0, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["width"], 100);
        assert_eq!(frames[0]["height"], 30);
        assert_eq!(frames[1][0].as_f64(), Some(0.0));
        assert_eq!(frames[1][2], "new");
        assert!(outcome.header_sent);
        assert!(!outcome.saw_exit);

        // Offset lands just past the newline of the clear-bearing event.
        let expected: u64 = [
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","old"]"#,
            r#"[0.2,"r","100x30"]"#,
            r#"[0.3,"o","\u001b[3J"]"#,
        ]
        .iter()
        .map(|line| line.len() as u64 + 1)
        .sum();
        assert_eq!(outcome.last_clear_offset, Some(expected));
    }

    #[tokio::test]
    async fn resize_between_clears_drives_the_rewrite() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","one"]"#,
            r#"[0.2,"r","90x20"]"#,
            r#"[0.3,"o","\u001b[3J"]"#,
            r#"[0.4,"r","120x40"]"#,
            r#"[0.5,"o","\u001b[3J"]"#,
            r#"[0.6,"o","tail"]"#,
        ]);
        let sink = TestSink::default();

        replay(&path, 0, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["width"], 120);
        assert_eq!(frames[0]["height"], 40);
        assert_eq!(frames[1][2], "tail");
    }

    #[tokio::test]
    async fn without_a_clear_everything_replays_and_input_is_dropped() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","a"]"#,
            r#"[0.2,"i","typed"]"#,
            r#"[0.3,"r","90x20"]"#,
        ]);
        let sink = TestSink::default();

        let outcome = replay(&path, 0, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["width"], 80);
        assert_eq!(frames[1][1], "o");
        assert_eq!(frames[2][1], "r");
        assert_eq!(frames[2][2], "90x20");
        assert_eq!(outcome.last_clear_offset, None);
    }

    #[tokio::test]
    async fn exit_in_the_window_closes_the_sink() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","x"]"#,
            r#"["exit",0,"sess-1"]"#,
        ]);
        let sink = TestSink::default();

        let outcome = replay(&path, 0, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2][0], "exit");
        assert_eq!(frames[2][1], 0);
        assert!(outcome.saw_exit);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_offset_beyond_eof_clamps_to_header_only() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","a"]"#,
        ]);
        let sink = TestSink::default();

        let outcome = replay(&path, 1_000_000, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["version"], 2);
        assert!(outcome.header_sent);
    }

    #[tokio::test]
    async fn replay_from_stored_offset_skips_earlier_events() {
        let lines = [
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","before"]"#,
            r#"[0.2,"o","after"]"#,
        ];
        let (_dir, path) = write_recording(&lines);
        let offset: u64 = (lines[0].len() + 1 + lines[1].len() + 1) as u64;
        let sink = TestSink::default();

        replay(&path, offset, &sink).await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["version"], 2);
        assert_eq!(frames[1][2], "after");
    }

    #[tokio::test]
    async fn missing_file_yields_an_empty_outcome() {
        let dir = TempDir::new().unwrap();
        let sink = TestSink::default();

        let outcome = replay(&dir.path().join("absent.cast"), 0, &sink).await;

        assert!(sink.frames().is_empty());
        assert!(!outcome.header_sent);
        assert!(!outcome.saw_exit);
        assert_eq!(outcome.last_clear_offset, None);
    }

    #[tokio::test]
    async fn garbage_header_still_replays_events() {
        let (_dir, path) = write_recording(&["not json at all", r#"[0.1,"o","a"]"#]);
        let sink = TestSink::default();

        let outcome = replay(&path, 0, &sink).await;

        let frames = sink.frames();
        assert!(!outcome.header_sent);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], "a");
    }

    #[tokio::test]
    async fn unpruned_scan_keeps_clear_bearing_events() {
        let (_dir, path) = write_recording(&[
            r#"{"version":2,"width":80,"height":24}"#,
            r#"[0.1,"o","old"]"#,
            r#"[0.2,"o","\u001b[3J"]"#,
            r#"[0.3,"o","new"]"#,
        ]);

        let window = scan_file(&path, 0, false).await.unwrap();
        assert_eq!(window.events.len(), 3);
        assert_eq!(window.last_clear_offset, None);
        assert_eq!(window.rewrite, None);
    }
}
