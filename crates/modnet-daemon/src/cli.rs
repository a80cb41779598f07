//! Command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use modnet_core::MulticastGroup;
use modnet_server::ServerConfig;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "modnet", version, about = "Run a modnet module")]
pub struct Cli {
    /// TOML config file.
    #[arg(long, env = "MODNET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Listen address, replacing the configured ones. Repeatable.
    #[arg(long, global = true)]
    pub listen: Vec<SocketAddr>,

    /// Multicast group to announce on, replacing the configured ones. Repeatable.
    #[arg(long, global = true)]
    pub multicast: Vec<SocketAddrV4>,

    /// Module name reported to other modules.
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Log filter, e.g. `modnet=debug`. Defaults to `RUST_LOG` plus `modnet=info`.
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the module until interrupted (default).
    Run,
    /// Print the effective configuration as TOML.
    ShowConfig,
}

impl Cli {
    /// The config file, if any, with command line overrides applied.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if !self.listen.is_empty() {
            config.listen = self.listen.clone();
        }
        if !self.multicast.is_empty() {
            config.multicast = self
                .multicast
                .iter()
                .copied()
                .map(MulticastGroup::any_interface)
                .collect();
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        config.validate()?;
        Ok(config)
    }
}
