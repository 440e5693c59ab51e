//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments and environment variables via clap
//! - TOML configuration file (`config.toml` in the working directory)
//! - Merging CLI with file config (CLI and environment take precedence)

use crate::core::config::{
    chunk_size_from_kib, DeploymentMode, RelayConfig, DEFAULT_CHUNK_SIZE_KIB, DEFAULT_HOST,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, DEFAULT_SECRET_KEY,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/ws";
const CONFIG_FILE: &str = "config.toml";

/// LanShare - discover devices on your network and send them files directly.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Relay WebSocket URL.
    #[clap(long, env = "LANSHARE_RELAY", global = true)]
    pub relay: Option<String>,

    /// Name shown to other devices.
    #[clap(long, global = true)]
    pub nickname: Option<String>,

    /// Directory for persisted transfer sessions. Defaults to ~/.lanshare/
    #[clap(long, env = "LANSHARE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Chunk size in KiB (16..=16384).
    #[clap(long, env = "TRANSFER_CHUNK_SIZE", global = true)]
    pub chunk_size_kib: Option<usize>,

    /// Do not persist progress or resume interrupted transfers.
    #[clap(long, global = true)]
    pub no_resume: bool,

    /// Relay settings from the `[serve]` table of the config file.
    #[clap(skip)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Serve(ServeArgs),
    /// Send files to a device.
    Send(SendArgs),
    /// Wait for incoming files.
    Receive(ReceiveArgs),
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ServeArgs {
    /// Address to bind.
    #[clap(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to bind.
    #[clap(long, env = "PORT")]
    pub port: Option<u16>,

    /// Maximum simultaneous connections.
    #[clap(long, env = "MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Allowed Origin values, comma separated. Empty allows any.
    #[clap(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Placeholder secret; not used for signing.
    #[clap(long, env = "SECRET_KEY")]
    pub secret_key: Option<String>,

    /// `production` or `development`.
    #[clap(long = "mode", env = "NODE_ENV")]
    pub mode: Option<String>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct SendArgs {
    /// Files to send, in order.
    #[clap(required = true)]
    pub files: Vec<PathBuf>,

    /// Target device id or name.
    #[clap(long)]
    pub to: String,

    /// Seconds to wait for the target to appear.
    #[clap(long, default_value_t = 30)]
    pub wait_secs: u64,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ReceiveArgs {
    /// Where received files are written.
    #[clap(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Accept every request without asking.
    #[clap(long)]
    pub auto_accept: bool,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.data_dir = cli_args.data_dir.map(Self::resolve_path);

        if let Some(file_args) = Self::from_file(Path::new(CONFIG_FILE)) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                eprintln!("ignoring {}: {e}", path.display());
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.relay.is_some() {
            file.relay = cli.relay;
        }
        if cli.nickname.is_some() {
            file.nickname = cli.nickname;
        }
        if cli.data_dir.is_some() {
            file.data_dir = cli.data_dir;
        }
        if cli.chunk_size_kib.is_some() {
            file.chunk_size_kib = cli.chunk_size_kib;
        }
        if cli.no_resume {
            file.no_resume = true;
        }
        file.command = cli.command.map(|command| match command {
            Command::Serve(serve) => Command::Serve(file.serve.clone().merge(serve)),
            other => other,
        });
        file
    }

    pub fn relay_url(&self) -> &str {
        self.relay.as_deref().unwrap_or(DEFAULT_RELAY_URL)
    }

    pub fn nickname(&self) -> String {
        self.nickname
            .clone()
            .unwrap_or_else(|| format!("lanshare-{:04x}", rand::random::<u16>()))
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        chunk_size_from_kib(self.chunk_size_kib.unwrap_or(DEFAULT_CHUNK_SIZE_KIB))
    }
}

impl ServeArgs {
    fn merge(mut self, cli: ServeArgs) -> ServeArgs {
        if cli.host.is_some() {
            self.host = cli.host;
        }
        if cli.port.is_some() {
            self.port = cli.port;
        }
        if cli.max_connections.is_some() {
            self.max_connections = cli.max_connections;
        }
        if !cli.cors_origins.is_empty() {
            self.cors_origins = cli.cors_origins;
        }
        if cli.secret_key.is_some() {
            self.secret_key = cli.secret_key;
        }
        if cli.mode.is_some() {
            self.mode = cli.mode;
        }
        self
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        let mode = match self.mode.as_deref() {
            Some(m) => m.parse::<DeploymentMode>().context("invalid NODE_ENV")?,
            None => DeploymentMode::default(),
        };
        Ok(RelayConfig {
            host: self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            max_connections: self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            cors_origins: self
                .cors_origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            secret_key: self
                .secret_key
                .clone()
                .unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string()),
            mode,
            ..RelayConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MIN_CHUNK_SIZE;

    #[test]
    fn send_subcommand_parses_globals_after_it() {
        let args = Args::try_parse_from([
            "lanshare", "send", "a.txt", "b.txt", "--to", "Laptop", "-vv", "--chunk-size-kib", "4",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.chunk_size(), MIN_CHUNK_SIZE);
        match args.command {
            Some(Command::Send(send)) => {
                assert_eq!(send.files.len(), 2);
                assert_eq!(send.to, "Laptop");
                assert_eq!(send.wait_secs, 30);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_config_fills_gaps_and_cli_wins() {
        let file: Args = toml::from_str(
            r#"
            relay = "ws://10.0.0.2:5000/ws"
            nickname = "from-file"
            chunk_size_kib = 64

            [serve]
            port = 6000
            cors_origins = ["http://a.lan"]
            mode = "production"
            "#,
        )
        .unwrap();
        let cli = Args::try_parse_from(["lanshare", "--nickname", "cli", "serve", "--host", "127.0.0.1"])
            .unwrap();
        let merged = Args::merge(file, cli);

        assert_eq!(merged.nickname.as_deref(), Some("cli"));
        assert_eq!(merged.relay_url(), "ws://10.0.0.2:5000/ws");
        assert_eq!(merged.chunk_size(), 64 * 1024);
        let Some(Command::Serve(serve)) = merged.command else {
            panic!("expected serve");
        };
        let config = serve.relay_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6000);
        assert_eq!(config.cors_origins, vec!["http://a.lan".to_string()]);
        assert_eq!(config.mode, DeploymentMode::Production);
    }

    #[test]
    fn serve_defaults_match_relay_defaults() {
        let config = ServeArgs::default().relay_config().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.mode, DeploymentMode::Development);
        assert!(ServeArgs {
            mode: Some("staging".into()),
            ..ServeArgs::default()
        }
        .relay_config()
        .is_err());
    }
}
