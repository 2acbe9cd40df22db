//! VibeTunnel stream server: watches per-session asciinema recording files,
//! replays a pruned backlog to newly connected viewers, and tails live
//! appends out to any number of SSE subscribers.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod prune;
pub mod session_info;
pub mod sse;
pub mod stream_watcher;
pub mod tail;

pub use config::Config;
pub use handlers::{build_router, AppState};
pub use session_info::{SessionInfo, SessionInfoStore};
pub use sse::{ChannelSink, SseSink};
pub use stream_watcher::StreamWatcher;
