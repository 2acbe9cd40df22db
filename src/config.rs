use std::env;
use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub control_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("VIBETUNNEL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4020),
            bind: env::var("VIBETUNNEL_BIND").unwrap_or_else(|_| "127.0.0.1".to_string()),
            control_dir: env::var("VIBETUNNEL_CONTROL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_control_dir()),
        }
    }

    /// CLI flags win over environment values.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(bind) = &cli.bind {
            self.bind = bind.clone();
        }
        if let Some(control_dir) = &cli.control_dir {
            self.control_dir = control_dir.clone();
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4020,
            bind: "127.0.0.1".to_string(),
            control_dir: default_control_dir(),
        }
    }
}

fn default_control_dir() -> PathBuf {
    env::var("HOME")
        .map(|home| PathBuf::from(home).join(".vibetunnel").join("control"))
        .unwrap_or_else(|_| PathBuf::from(".vibetunnel/control"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win() {
        let cli = Cli {
            port: Some(9000),
            bind: None,
            control_dir: Some(PathBuf::from("/tmp/vt")),
        };
        let config = Config::default().apply_cli(&cli);
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.control_dir, PathBuf::from("/tmp/vt"));
    }
}
