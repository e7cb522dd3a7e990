//! Configuration
//!
//! `EngineConfig` carries the exchange engine's tunables with their protocol
//! defaults; tests shrink the intervals. `Config` is the demo node's CLI and
//! file configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Environment variable overriding the task worker count.
pub const TASK_WORKERS_ENV: &str = "BLOCKSWAP_TASK_WORKERS";

const DEFAULT_TASK_WORKERS: usize = 8;
const DEFAULT_PROVIDE_WORKERS: usize = 4;
const DEFAULT_MAX_PROVIDERS: usize = 3;
const DEFAULT_BATCH_BUFFER: usize = 32;
const DEFAULT_NEW_BLOCKS_BUFFER: usize = 256;
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HAS_BLOCK_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_PROVIDE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Tunables of the exchange engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workers draining the decision engine's outbox.
    pub task_workers: usize,
    /// Workers announcing new blocks to the router.
    pub provide_workers: usize,
    /// Providers requested per routing lookup.
    pub max_providers: usize,
    /// Bound on each provider lookup.
    pub provider_timeout: Duration,
    /// Bound on storing an incoming block.
    pub has_block_timeout: Duration,
    /// Bound on each provide announcement.
    pub provide_timeout: Duration,
    /// Capacity of the batch request queue.
    pub batch_buffer: usize,
    /// Capacity of the new-blocks channel feeding the provide pipeline.
    pub new_blocks_buffer: usize,
    /// How often the outstanding wantlist is re-sent to providers.
    pub rebroadcast_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_workers: task_workers_from_env(),
            provide_workers: DEFAULT_PROVIDE_WORKERS,
            max_providers: DEFAULT_MAX_PROVIDERS,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            has_block_timeout: DEFAULT_HAS_BLOCK_TIMEOUT,
            provide_timeout: DEFAULT_PROVIDE_TIMEOUT,
            batch_buffer: DEFAULT_BATCH_BUFFER,
            new_blocks_buffer: DEFAULT_NEW_BLOCKS_BUFFER,
            rebroadcast_interval: DEFAULT_REBROADCAST_INTERVAL,
        }
    }
}

fn task_workers_from_env() -> usize {
    parse_task_workers(std::env::var(TASK_WORKERS_ENV).ok().as_deref())
}

fn parse_task_workers(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_TASK_WORKERS;
    };
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n as usize,
        Ok(n) => {
            warn!("ignoring invalid value {n} for {TASK_WORKERS_ENV}");
            DEFAULT_TASK_WORKERS
        }
        Err(err) => {
            warn!("ignoring unparsable {TASK_WORKERS_ENV}: {err}");
            DEFAULT_TASK_WORKERS
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "blockswap")]
#[command(about = "Content-addressed block exchange engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a local in-process swarm and distribute generated blocks
    Demo(DemoCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct DemoCommand {
    /// Number of nodes in the swarm
    #[arg(long, default_value_t = 8)]
    pub nodes: usize,

    /// Number of blocks seeded on the first node
    #[arg(long, default_value_t = 64)]
    pub blocks: usize,

    /// Size of each generated block in bytes
    #[arg(long, default_value_t = 1024)]
    pub block_size: usize,

    /// Simulated per-message delivery delay in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Demo node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub nodes: usize,
    pub blocks: usize,
    pub block_size: usize,
    pub delay_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Create config from CLI arguments
    pub fn from_cli() -> Self {
        let cli = Cli::parse();
        match cli.command {
            Commands::Demo(cmd) => cmd.into(),
        }
    }

    /// Load config from a TOML file
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nodes: 8,
            blocks: 64,
            block_size: 1024,
            delay_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl From<DemoCommand> for Config {
    fn from(cmd: DemoCommand) -> Self {
        Config {
            nodes: cmd.nodes,
            blocks: cmd.blocks,
            block_size: cmd.block_size,
            delay_ms: cmd.delay_ms,
            log_level: cmd.log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.provide_workers, DEFAULT_PROVIDE_WORKERS);
        assert_eq!(config.max_providers, DEFAULT_MAX_PROVIDERS);
        assert_eq!(config.batch_buffer, DEFAULT_BATCH_BUFFER);
        assert_eq!(config.new_blocks_buffer, DEFAULT_NEW_BLOCKS_BUFFER);
        assert_eq!(config.rebroadcast_interval, DEFAULT_REBROADCAST_INTERVAL);
    }

    #[test]
    fn test_task_workers_override() {
        assert_eq!(parse_task_workers(Some("3")), 3);
        assert_eq!(parse_task_workers(None), DEFAULT_TASK_WORKERS);

        // Zero, negative and garbage values fall back to the default
        assert_eq!(parse_task_workers(Some("0")), DEFAULT_TASK_WORKERS);
        assert_eq!(parse_task_workers(Some("-2")), DEFAULT_TASK_WORKERS);
        assert_eq!(parse_task_workers(Some("not-a-number")), DEFAULT_TASK_WORKERS);
    }

    #[test]
    fn test_config_from_demo_command() {
        let cmd = DemoCommand {
            nodes: 3,
            blocks: 10,
            block_size: 256,
            delay_ms: 5,
            log_level: "debug".to_string(),
        };

        let config: Config = cmd.into();
        assert_eq!(config.nodes, 3);
        assert_eq!(config.blocks, 10);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.delay_ms, 5);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            nodes = 4
            blocks = 16
            block_size = 512
            delay_ms = 2
            log_level = "warn"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.nodes, 4);
        assert_eq!(config.block_size, 512);
    }
}
