use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SEND_QUEUE: usize = 256;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Outbound events buffered per connection before new ones are dropped.
    pub send_queue: usize,
    pub heartbeat: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            send_queue: DEFAULT_SEND_QUEUE,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let addr = lookup("RELAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.into());
        let addr = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("RELAY_ADDR is not a socket address: {addr}"))?;

        let send_queue = match lookup("RELAY_SEND_QUEUE") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("RELAY_SEND_QUEUE is not a number: {raw}"))?,
            None => DEFAULT_SEND_QUEUE,
        };
        anyhow::ensure!(send_queue > 0, "RELAY_SEND_QUEUE must be at least 1");

        let heartbeat_secs = match lookup("RELAY_HEARTBEAT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("RELAY_HEARTBEAT_SECS is not a number: {raw}"))?,
            None => DEFAULT_HEARTBEAT_SECS,
        };
        anyhow::ensure!(heartbeat_secs > 0, "RELAY_HEARTBEAT_SECS must be at least 1");

        Ok(Self {
            addr,
            send_queue,
            heartbeat: Duration::from_secs(heartbeat_secs),
        })
    }
}
