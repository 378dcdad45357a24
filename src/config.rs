//! Plain-value configuration consumed by the driver.
//!
//! Parsing of connection strings or CLI flags belongs to the caller; this
//! module only defines the value types the core consumes.

use std::time::Duration;

/// Wire protocol generation to negotiate at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    /// Negotiated with `HELLO 3` during connection setup.
    Resp3,
}

/// Where read-only commands may be routed in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaReads {
    /// Reads always go to the slot master.
    #[default]
    Never,
    /// Reads always go to a replica when the slot has one.
    Always,
    /// Reads are spread uniformly over the master and its replicas.
    Share,
}

/// A reachable server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    Tcp(String, u16),
    Unix(std::path::PathBuf),
}

impl ServerAddr {
    pub const DEFAULT_PORT: u16 = 6379;

    /// Parses `host` or `host:port` into a TCP address.
    pub fn parse_tcp(addr: &str) -> Option<Self> {
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().ok()?;
                Some(ServerAddr::Tcp(host.to_string(), port))
            }
            None => Some(ServerAddr::Tcp(addr.to_string(), Self::DEFAULT_PORT)),
        }
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddr::Tcp(host, port) => write!(f, "{}:{}", host, port),
            ServerAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Per-connection settings, shared by every deployment mode.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub addr: ServerAddr,
    pub protocol: ProtocolVersion,
    /// Credentials sent via `AUTH` during setup, when present.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database selected via `SELECT` during setup, when nonzero.
    pub database: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            addr: ServerAddr::Tcp("127.0.0.1".to_string(), ServerAddr::DEFAULT_PORT),
            protocol: ProtocolVersion::default(),
            username: None,
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn new(addr: ServerAddr) -> Self {
        ConnectionConfig {
            addr,
            ..Default::default()
        }
    }

    /// Same settings pointed at a different address. Topology resolvers use
    /// this to dial discovered nodes with the caller's credentials.
    pub fn with_addr(&self, addr: ServerAddr) -> Self {
        ConnectionConfig {
            addr,
            ..self.clone()
        }
    }
}

/// Pool sizing and recycling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (idle + checked out).
    pub max_size: usize,
    /// Maximum callers allowed to wait for a free connection; one more
    /// fails immediately with a pool-full error.
    pub max_waiting: usize,
    /// Idle connections older than this are closed by the sweep.
    pub idle_timeout: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 8,
            max_waiting: 32,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Cluster client settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed addresses tried in order at `open()`.
    pub seeds: Vec<ServerAddr>,
    pub connection: ConnectionConfig,
    pub replica_reads: ReplicaReads,
    /// Total attempts for one logical request across redirects and retries.
    pub retry_budget: u32,
    /// Base unit of the TRYAGAIN/CLUSTERDOWN backoff.
    pub backoff_base: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            seeds: Vec::new(),
            connection: ConnectionConfig::default(),
            replica_reads: ReplicaReads::default(),
            retry_budget: 16,
            backoff_base: Duration::from_millis(1),
        }
    }
}

/// Which node role a sentinel-backed client should connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    #[default]
    Master,
    Replica,
    Sentinel,
}

/// Sentinel discovery settings.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Sentinel addresses, reordered at runtime so the most recently
    /// responsive one is tried first.
    pub sentinels: Vec<ServerAddr>,
    /// The monitored master name, e.g. "mymaster".
    pub service_name: String,
    pub role: NodeRole,
    /// Budget for one discovery query against one sentinel.
    pub attempt_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl SentinelConfig {
    pub fn new(sentinels: Vec<ServerAddr>, service_name: impl Into<String>) -> Self {
        SentinelConfig {
            sentinels,
            service_name: service_name.into(),
            role: NodeRole::default(),
            attempt_timeout: Duration::from_secs(2),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Replication (non-sentinel) resolver settings.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Candidate nodes whose roles are probed directly.
    pub nodes: Vec<ServerAddr>,
    /// Resolved topology is trusted for this long before re-probing.
    pub cache_ttl: Duration,
    pub attempt_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl ReplicationConfig {
    pub fn new(nodes: Vec<ServerAddr>) -> Self {
        ReplicationConfig {
            nodes,
            cache_ttl: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(2),
            connection: ConnectionConfig::default(),
        }
    }
}
