use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vibetunnel")]
#[command(about = "VibeTunnel session stream server")]
pub struct Cli {
    /// Port to listen on (overrides VIBETUNNEL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (overrides VIBETUNNEL_BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding per-session control data (overrides VIBETUNNEL_CONTROL_DIR)
    #[arg(long)]
    pub control_dir: Option<PathBuf>,
}
