//! CLI configuration, parsed with `clap`'s derive API.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_MAX_PEERS: usize = 30;
pub const RECOMMENDED_MAX_PEERS: usize = 50;
const DEFAULT_PORT: u16 = 6881;

/// A leech-only BitTorrent client.
#[derive(Debug, Parser)]
#[command(name = "rstc", version, about)]
pub struct AppConfig {
    /// Path to the .torrent metainfo file.
    pub torrent: PathBuf,

    /// Directory to write downloaded files into.
    #[arg(long, default_value = ".")]
    pub output: PathBuf,

    /// Port advertised to the tracker.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of simultaneous peer connections. Recommended upper
    /// bound is 50; higher values are accepted but not recommended.
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    pub max_peers: usize,

    /// Increase log verbosity; may be repeated (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Maps `-v` counts onto a `tracing_subscriber::EnvFilter` directive,
    /// falling back to `RUST_LOG` when set.
    pub fn log_filter(&self) -> String {
        if let Ok(from_env) = std::env::var("RUST_LOG") {
            return from_env;
        }
        match self.verbose {
            0 => "rstc=info".to_string(),
            1 => "rstc=debug".to_string(),
            _ => "rstc=trace".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_only_torrent_path() {
        let config = AppConfig::parse_from(["rstc", "some.torrent"]);
        assert_eq!(config.torrent, PathBuf::from("some.torrent"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
        assert_eq!(config.verbose, 0);
    }

    #[test]
    fn overrides_port_and_max_peers() {
        let config = AppConfig::parse_from([
            "rstc",
            "some.torrent",
            "--port",
            "7000",
            "--max-peers",
            "10",
        ]);
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_peers, 10);
    }

    #[test]
    fn repeated_verbose_flags_accumulate() {
        let config = AppConfig::parse_from(["rstc", "some.torrent", "-vv"]);
        assert_eq!(config.verbose, 2);
    }
}
