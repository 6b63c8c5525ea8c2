use clap::{Args, Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "m4t", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Relay chat between every peer that contacts this hub.
    Hub(HubArgs),
    /// Chat with a single peer.
    Peer(PeerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// UDP port to listen on. Use 0 for an ephemeral port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Number of worker tasks handling datagrams.
    #[arg(long)]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// Local UDP port. Prompted for when absent.
    #[arg(long)]
    pub port: Option<u16>,

    /// Peer as host:port. Prompted for when absent.
    #[arg(long)]
    pub target: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Datagram budget in bytes, header included.
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Use the 2-byte header without a session discriminator.
    #[arg(long)]
    pub legacy_header: bool,
}

impl CommonArgs {
    /// Flags win over file and environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if self.legacy_header {
            config.legacy_header = true;
        }
    }
}

impl HubArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.hub_port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        self.common.apply(config);
    }
}
