//! Session stream registry: one shared tail task per watched session, any
//! number of SSE subscribers fanned out behind it.
//!
//! The first `attach` for a session creates the watcher entry and spawns its
//! tail task; later attaches only register another subscriber. Every new
//! subscriber gets a pruned backlog replay first, with live events queued
//! until the replay lands, so backlog and live frames never interleave. The
//! last `detach` stops the tail task and releases the OS watch handle.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::protocol::{self, ParsedLine, StreamEvent};
use crate::prune;
use crate::session_info::SessionInfoStore;
use crate::sse::{sse_frame, SseSink};
use crate::tail::{self, LineBuffer};

/// Delay after a burst of change notifications before reading, so rapid
/// writes coalesce into one read cycle.
const COALESCE_DELAY: Duration = Duration::from_millis(40);

/// Poll period covering filesystems that coalesce away or drop change
/// notifications entirely.
const FALLBACK_POLL: Duration = Duration::from_millis(1_000);

enum FrameKind {
    Header,
    Event,
    Exit,
}

struct QueuedFrame {
    frame: Vec<u8>,
    kind: FrameKind,
}

enum ReplayPhase {
    /// Backlog replay still in flight; live frames queue until it lands.
    Replaying { queued: Vec<QueuedFrame> },
    Live,
}

struct Subscriber {
    id: u64,
    sink: Arc<dyn SseSink>,
    started: Instant,
    header_sent: bool,
    dead: bool,
    phase: ReplayPhase,
}

impl Subscriber {
    fn write(&mut self, frame: &[u8]) {
        if self.dead {
            return;
        }
        if let Err(err) = self.sink.write(frame) {
            debug!(subscriber = self.id, %err, "subscriber sink unwritable, skipping it");
            self.dead = true;
        }
    }
}

struct WatchState {
    subscribers: Vec<Subscriber>,
    last_offset: u64,
    last_size: u64,
    last_mtime: Option<SystemTime>,
    line_buffer: LineBuffer,
}

struct SessionStream {
    session_id: String,
    stream_path: PathBuf,
    /// Per-session serialization point: attach, detach, tail reads, and
    /// replay completion all run under this lock.
    state: Mutex<WatchState>,
    stop: watch::Sender<bool>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Arc<SessionStream>>>,
    info_store: SessionInfoStore,
    next_subscriber: AtomicU64,
}

/// Registry of watched session streams. Cheap to clone; all clones share the
/// same sessions.
#[derive(Clone)]
pub struct StreamWatcher {
    inner: Arc<Inner>,
}

impl StreamWatcher {
    pub fn new(info_store: SessionInfoStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                info_store,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber for a session, creating the shared tail watcher
    /// on first attach. The subscriber's backlog replay runs asynchronously;
    /// live events queue behind it until it completes.
    pub async fn attach(&self, session_id: &str, stream_path: &Path, sink: Arc<dyn SseSink>) {
        let stream = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(session_id) {
                Some(stream) => stream.clone(),
                None => {
                    let stream = spawn_session(session_id, stream_path);
                    sessions.insert(session_id.to_string(), stream.clone());
                    stream
                }
            }
        };

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = stream.state.lock().await;
            state.subscribers.push(Subscriber {
                id,
                sink: sink.clone(),
                started: Instant::now(),
                header_sent: false,
                dead: false,
                phase: ReplayPhase::Replaying { queued: Vec::new() },
            });
        }
        debug!(session = session_id, subscriber = id, "subscriber attached");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_replay(stream, id, sink).await;
        });
    }

    /// Deregister a subscriber. Removing the last subscriber stops the tail
    /// task and releases the watcher. Safe to call for unknown sessions and
    /// sinks; repeat calls are no-ops.
    pub async fn detach(&self, session_id: &str, sink: &Arc<dyn SseSink>) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(stream) = sessions.get(session_id).cloned() else {
            return;
        };
        let mut state = stream.state.lock().await;
        let before = state.subscribers.len();
        state.subscribers.retain(|sub| !same_sink(&sub.sink, sink));
        if state.subscribers.len() == before {
            return;
        }
        debug!(session = session_id, "subscriber detached");
        if state.subscribers.is_empty() {
            let _ = stream.stop.send(true);
            sessions.remove(session_id);
            debug!(session = session_id, "last subscriber gone, watcher released");
        }
    }

    /// Stop every tail task and clear the registry. Sinks are left to the
    /// HTTP layer to terminate.
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        for (session_id, stream) in sessions.drain() {
            let _ = stream.stop.send(true);
            debug!(session = %session_id, "watcher closed at shutdown");
        }
        info!("stream watcher shut down");
    }

    /// Number of sessions currently holding a watcher.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Number of subscribers attached to a session (0 when unwatched).
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let stream = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        match stream {
            Some(stream) => stream.state.lock().await.subscribers.len(),
            None => 0,
        }
    }

    /// Backlog replay for one subscriber, then the queued-live drain that
    /// flips it into the live phase.
    async fn run_replay(&self, stream: Arc<SessionStream>, subscriber_id: u64, sink: Arc<dyn SseSink>) {
        let start_offset = self
            .inner
            .info_store
            .load(&stream.session_id)
            .map(|info| info.last_clear_offset)
            .unwrap_or(0);

        let outcome = prune::replay(&stream.stream_path, start_offset, sink.as_ref()).await;

        let mut state = stream.state.lock().await;
        if let Some(offset) = outcome.last_clear_offset {
            // Updates only sessions the spawner has already recorded.
            if let Err(err) = self
                .inner
                .info_store
                .advance_last_clear_offset(&stream.session_id, offset)
            {
                warn!(session = %stream.session_id, %err, "failed to persist clear offset");
            }
        }

        let Some(sub) = state
            .subscribers
            .iter_mut()
            .find(|sub| sub.id == subscriber_id)
        else {
            // Detached while the replay was in flight.
            return;
        };
        sub.header_sent = outcome.header_sent;
        if outcome.saw_exit {
            sub.dead = true;
        }

        let queued = match std::mem::replace(&mut sub.phase, ReplayPhase::Live) {
            ReplayPhase::Replaying { queued } => queued,
            ReplayPhase::Live => Vec::new(),
        };
        for item in queued {
            match item.kind {
                FrameKind::Header => {
                    if sub.header_sent {
                        continue;
                    }
                    sub.write(&item.frame);
                    if !sub.dead {
                        sub.header_sent = true;
                    }
                }
                FrameKind::Event => sub.write(&item.frame),
                FrameKind::Exit => {
                    sub.write(&item.frame);
                    sub.sink.close();
                    sub.dead = true;
                }
            }
        }
    }
}

fn same_sink(a: &Arc<dyn SseSink>, b: &Arc<dyn SseSink>) -> bool {
    // Compare data addresses only; vtable pointers for the same sink can
    // differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Create the per-session stream entry and spawn its tail task. A missing
/// stream file is fine; the watcher picks the file up when the spawner
/// creates it.
fn spawn_session(session_id: &str, stream_path: &Path) -> Arc<SessionStream> {
    let (size, mtime) = match tail::stat_file(stream_path) {
        Ok(stat) => (stat.size, stat.mtime),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(
                session = session_id,
                "stream file not present yet, waiting for creation"
            );
            (0, None)
        }
        Err(err) => {
            error!(session = session_id, %err, "stat failed at watcher creation");
            (0, None)
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let stream = Arc::new(SessionStream {
        session_id: session_id.to_string(),
        stream_path: stream_path.to_path_buf(),
        state: Mutex::new(WatchState {
            subscribers: Vec::new(),
            last_offset: size,
            last_size: size,
            last_mtime: mtime,
            line_buffer: LineBuffer::new(),
        }),
        stop: stop_tx,
    });

    let task_stream = stream.clone();
    tokio::spawn(async move {
        run_tail(task_stream, stop_rx).await;
    });
    stream
}

/// Tail loop: wake on filesystem notifications (coalesced) or the fallback
/// poll tick, read newly appended bytes, and broadcast complete lines.
async fn run_tail(stream: Arc<SessionStream>, mut stop: watch::Receiver<bool>) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
    // Hold a sender for the lifetime of the loop so `recv` pends instead of
    // resolving `None` when the watcher (and its sender clone) is gone.
    let _notify_tx = notify_tx.clone();
    let _watcher = match spawn_fs_watcher(&stream.stream_path, notify_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(
                session = %stream.session_id,
                %err,
                "file watcher unavailable, relying on polling"
            );
            None
        }
    };

    loop {
        tokio::select! {
            _ = notify_rx.recv() => {
                tokio::time::sleep(COALESCE_DELAY).await;
                while notify_rx.try_recv().is_ok() {}
                poll_stream(&stream).await;
            }
            _ = tokio::time::sleep(FALLBACK_POLL) => {
                poll_stream(&stream).await;
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(session = %stream.session_id, "tail task stopping");
                    break;
                }
            }
        }
    }
}

fn spawn_fs_watcher(
    path: &Path,
    tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher, notify::Error> {
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.try_send(());
                }
            }
        })?;
    // Watch the parent directory so creation of a not-yet-written stream
    // file is observed too.
    let target = path.parent().unwrap_or(path);
    watcher.watch(target, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// One read cycle: stat, bail unless the file grew or was touched, read the
/// appended span at the stored byte offset, split lines, broadcast.
async fn poll_stream(stream: &SessionStream) {
    let mut state = stream.state.lock().await;

    let stat = match tail::stat_file(&stream.stream_path) {
        Ok(stat) => stat,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            error!(session = %stream.session_id, %err, "stat failed, skipping read cycle");
            return;
        }
    };

    let grown = stat.size > state.last_size;
    let touched = match (stat.mtime, state.last_mtime) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    };
    if !grown && !touched {
        return;
    }

    // Offsets never shrink; truncation reads as "no new data".
    let span = stat.size.saturating_sub(state.last_offset);
    if span == 0 {
        state.last_size = stat.size;
        state.last_mtime = stat.mtime;
        return;
    }

    let path = stream.stream_path.clone();
    let offset = state.last_offset;
    let read = tokio::task::spawn_blocking(move || tail::read_span(&path, offset, span)).await;
    let bytes = match read {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            error!(session = %stream.session_id, %err, "tail read failed, retrying on next change");
            return;
        }
        Err(err) => {
            error!(session = %stream.session_id, %err, "tail read task failed");
            return;
        }
    };

    let short_read = (bytes.len() as u64) < span;
    state.last_offset = offset + bytes.len() as u64;
    if short_read {
        // The file shrank between stat and read. Keep the bookkeeping at the
        // consumed offset instead of the stat snapshot so the next
        // notification retries the unread gap.
        state.last_size = state.last_offset;
    } else {
        state.last_size = stat.size;
        state.last_mtime = stat.mtime;
    }

    let lines = state.line_buffer.push(&bytes);
    for line in &lines {
        broadcast_line(&mut state, &stream.session_id, line);
    }
}

/// Fan one complete recording line out to every subscriber.
fn broadcast_line(state: &mut WatchState, session_id: &str, line: &str) {
    match protocol::parse_line(line) {
        Some(ParsedLine::Header(header)) => {
            // Only subscribers that attached before the recording had a
            // header are still waiting for one.
            let frame = sse_frame(&header.to_value());
            for sub in state.subscribers.iter_mut() {
                match &mut sub.phase {
                    ReplayPhase::Replaying { queued } => queued.push(QueuedFrame {
                        frame: frame.clone(),
                        kind: FrameKind::Header,
                    }),
                    ReplayPhase::Live => {
                        if sub.header_sent {
                            continue;
                        }
                        sub.write(&frame);
                        if !sub.dead {
                            sub.header_sent = true;
                        }
                    }
                }
            }
        }
        Some(ParsedLine::Event(StreamEvent::Input { .. })) => {}
        Some(ParsedLine::Event(event @ StreamEvent::Exit { .. })) => {
            info!(session = session_id, "session exited, closing subscribers");
            let frame = sse_frame(&event.to_wire(0.0));
            for sub in state.subscribers.iter_mut() {
                match &mut sub.phase {
                    ReplayPhase::Replaying { queued } => queued.push(QueuedFrame {
                        frame: frame.clone(),
                        kind: FrameKind::Exit,
                    }),
                    ReplayPhase::Live => {
                        sub.write(&frame);
                        sub.sink.close();
                        sub.dead = true;
                    }
                }
            }
        }
        Some(ParsedLine::Event(event)) => {
            for sub in state.subscribers.iter_mut() {
                let elapsed = sub.started.elapsed().as_secs_f64();
                let frame = sse_frame(&event.to_wire(elapsed));
                match &mut sub.phase {
                    ReplayPhase::Replaying { queued } => queued.push(QueuedFrame {
                        frame,
                        kind: FrameKind::Event,
                    }),
                    ReplayPhase::Live => sub.write(&frame),
                }
            }
        }
        None => {
            // Raw writer output that isn't a JSON record; forward it as a
            // synthetic output event so nothing the writer said is lost.
            for sub in state.subscribers.iter_mut() {
                let elapsed = sub.started.elapsed().as_secs_f64();
                let frame = sse_frame(&json!([elapsed, "o", line]));
                match &mut sub.phase {
                    ReplayPhase::Replaying { queued } => queued.push(QueuedFrame {
                        frame,
                        kind: FrameKind::Event,
                    }),
                    ReplayPhase::Live => sub.write(&frame),
                }
            }
        }
    }
}
