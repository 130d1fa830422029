//! Configuration for epidemicd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// epidemicd - CloudGossip epidemic dissemination daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "epidemicd")]
#[command(about = "CloudGossip anti-entropy and rumor-mongering daemon")]
pub struct Config {
    /// Listen address shared by both protocols (TCP and UDP)
    #[arg(short, long, default_value = "0.0.0.0:9530")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/epidemicd")]
    pub data_dir: PathBuf,

    /// Known peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',', env = "CLOUDGOSSIP_PEERS")]
    pub peers: Vec<SocketAddr>,

    /// Cloud endpoint reference (e.g. "memory:shared" or "sled:./data/cloud")
    #[arg(long)]
    pub cloud: Option<String>,

    /// Persistence provider name
    #[arg(long, default_value = "sled")]
    pub provider: String,

    /// Anti-entropy cycle period in seconds
    #[arg(long, default_value = "30")]
    pub antientropy_period_secs: u64,

    /// Rumor-mongering cycle period in seconds
    #[arg(long, default_value = "5")]
    pub rumor_period_secs: u64,

    /// Rumor persistence threshold (redundant pushes before a rumor dies)
    #[arg(long, default_value = "3")]
    pub rumor_threshold: u32,

    /// Entry listing window in hours (0 lists everything)
    #[arg(long, default_value = "24")]
    pub list_window_hours: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.antientropy_period_secs == 0 || self.rumor_period_secs == 0 {
            anyhow::bail!("cycle periods must be at least one second");
        }
        if self.rumor_threshold == 0 {
            anyhow::bail!("rumor threshold must be at least 1");
        }
        if self.peers.is_empty() && self.cloud.is_none() {
            anyhow::bail!("need at least one peer or a cloud endpoint to gossip with");
        }
        if let Some(cloud) = &self.cloud {
            if !cloud.contains(':') {
                anyhow::bail!("cloud reference must be <provider>:<location>, got {cloud}");
            }
        }
        Ok(())
    }

    pub fn antientropy_period(&self) -> Duration {
        Duration::from_secs(self.antientropy_period_secs)
    }

    pub fn rumor_period(&self) -> Duration {
        Duration::from_secs(self.rumor_period_secs)
    }

    pub fn list_window(&self) -> Duration {
        Duration::from_secs(self.list_window_hours * 3600)
    }
}
