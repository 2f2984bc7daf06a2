use std::net::SocketAddr;

use clap::Parser;

use crate::hub::{HubConfig, OverflowPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: SocketAddr,

    /// Messages buffered per connected client before the overflow policy
    /// applies.
    #[arg(long, default_value_t = 64)]
    pub outbound_buffer: usize,

    /// What to do with a client whose outbound buffer is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropNewest)]
    pub overflow: OverflowPolicy,
}

impl Cli {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.outbound_buffer,
            overflow: self.overflow,
        }
    }
}
