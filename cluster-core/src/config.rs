//! Configuration management for Cluster
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use crate::accounting::{AccountingConfig, DEFAULT_PAYMENT_THRESHOLD, DEFAULT_REFRESH_RATE, LIGHT_FACTOR};
use crate::hive::HiveConfig;
use crate::kademlia::KademliaConfig;
use crate::pricer::BASE_PRICE;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "cluster")]
#[command(about = "Incentivised storage overlay node in Rust", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the Cluster node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for node keys and persistent state
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// TCP port for P2P transport
    #[arg(long, default_value_t = 1634)]
    pub p2p_port: u16,

    /// HTTP port for the local API
    #[arg(long, default_value_t = 1633)]
    pub api_port: u16,

    /// Network identifier baked into overlay addresses
    #[arg(long, default_value_t = 1)]
    pub network_id: u64,

    /// Run as a bootnode (relaxed per-bin connection caps)
    #[arg(long, default_value_t = false)]
    pub bootnode: bool,

    /// Run as a full node (light nodes account at a fraction of the rates)
    #[arg(long, default_value_t = true)]
    pub full_node: bool,

    /// Debt a peer may accumulate before settlement is expected
    #[arg(long, default_value_t = DEFAULT_PAYMENT_THRESHOLD)]
    pub payment_threshold: u64,

    /// Tolerated overshoot of the threshold, percent
    #[arg(long, default_value_t = 25)]
    pub payment_tolerance_pct: u64,

    /// Headroom before the threshold at which settlement starts, percent
    #[arg(long, default_value_t = 50)]
    pub payment_early_pct: u64,

    /// Time-based settlement allowance, units per second
    #[arg(long, default_value_t = DEFAULT_REFRESH_RATE)]
    pub refresh_rate: u64,

    /// Base per-chunk price at maximum proximity
    #[arg(long, default_value_t = BASE_PRICE)]
    pub base_price: u64,

    /// Accept and advertise private-range underlay addresses (test networks)
    #[arg(long, default_value_t = false)]
    pub allow_private_cidrs: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Bootnode multiaddr (can be specified multiple times)
    #[arg(long)]
    pub bootnode_addr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub p2p_port: u16,
    pub api_port: u16,
    pub network_id: u64,
    pub bootnode: bool,
    pub full_node: bool,
    pub payment_threshold: u64,
    pub payment_tolerance_pct: u64,
    pub payment_early_pct: u64,
    pub refresh_rate: u64,
    pub base_price: u64,
    pub allow_private_cidrs: bool,
    pub log_level: String,
    #[serde(default)]
    pub bootnodes: Vec<String>,
}

impl Config {
    /// Create config from CLI arguments
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => {
                let config: Config = cmd.into();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load config from a TOML file
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.payment_threshold == 0 {
            return Err(ConfigError::Invalid(
                "payment-threshold must be positive".to_string(),
            ));
        }
        if self.refresh_rate == 0 {
            return Err(ConfigError::Invalid(
                "refresh-rate must be positive".to_string(),
            ));
        }
        if self.payment_early_pct >= 100 {
            return Err(ConfigError::Invalid(
                "payment-early-pct must be below 100".to_string(),
            ));
        }
        Ok(())
    }

    pub fn accounting(&self) -> AccountingConfig {
        AccountingConfig {
            payment_threshold: self.payment_threshold,
            payment_tolerance_pct: self.payment_tolerance_pct,
            payment_early_pct: self.payment_early_pct,
            min_payment_threshold: self.payment_threshold / (2 * LIGHT_FACTOR),
            refresh_rate: self.refresh_rate,
        }
    }

    pub fn kademlia(&self) -> KademliaConfig {
        KademliaConfig {
            bootnode: self.bootnode,
            ..KademliaConfig::default()
        }
    }

    pub fn hive(&self) -> HiveConfig {
        HiveConfig {
            network_id: self.network_id,
            allow_private_cidrs: self.allow_private_cidrs,
            ..HiveConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            p2p_port: 1634,
            api_port: 1633,
            network_id: 1,
            bootnode: false,
            full_node: true,
            payment_threshold: DEFAULT_PAYMENT_THRESHOLD,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            refresh_rate: DEFAULT_REFRESH_RATE,
            base_price: BASE_PRICE,
            allow_private_cidrs: false,
            log_level: "info".to_string(),
            bootnodes: Vec::new(),
        }
    }
}

impl From<StartCommand> for Config {
    fn from(cmd: StartCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            p2p_port: cmd.p2p_port,
            api_port: cmd.api_port,
            network_id: cmd.network_id,
            bootnode: cmd.bootnode,
            full_node: cmd.full_node,
            payment_threshold: cmd.payment_threshold,
            payment_tolerance_pct: cmd.payment_tolerance_pct,
            payment_early_pct: cmd.payment_early_pct,
            refresh_rate: cmd.refresh_rate,
            base_price: cmd.base_price,
            allow_private_cidrs: cmd.allow_private_cidrs,
            log_level: cmd.log_level,
            bootnodes: cmd.bootnode_addr,
        }
    }
}
