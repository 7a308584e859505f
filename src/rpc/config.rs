use std::net::Ipv4Addr;
use std::time::Duration;

use crate::common::{Id, DEFAULT_BUCKET_SIZE};

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Dht node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// An explicit node Id, for example one restored from a previous run.
    ///
    /// Defaults to None, where a random Id (or one derived from
    /// [Config::public_ip]) is used.
    pub id: Option<Id>,
    /// Bootstrap nodes, as `address:port` strings.
    ///
    /// Defaults to [super::DEFAULT_BOOTSTRAP_NODES].
    pub bootstrap: Vec<String>,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`.
    pub host: Option<Ipv4Addr>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the canonical port 6881 is attempted
    /// before falling back to a random port.
    pub port: Option<u16>,
    /// UDP socket request timeout duration.
    ///
    /// The longer this duration, the longer queries take to be deemed "done".
    /// The shorter it is, the more responses from busy nodes are missed.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]. Zero disables timeouts.
    pub request_timeout: Duration,
    /// Maximum nodes per routing table bucket (K).
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE].
    pub bucket_size: usize,
    /// Whether to mark outgoing messages read-only (BEP_0043), telling
    /// other nodes not to add us to their routing tables.
    ///
    /// Defaults to false.
    pub read_only: bool,
    /// A known public IPv4 address to derive a secure node Id from,
    /// according to [BEP_0042](https://www.bittorrent.org/beps/bep_0042.html).
    ///
    /// Defaults to None, where a random Id is used.
    pub public_ip: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            bootstrap: super::DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            host: None,
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            read_only: false,
            public_ip: None,
        }
    }
}
