//! Sentinel and replication topology resolvers.
//!
//! Sentinel discovery queries the configured sentinels in priority order
//! with a bounded per-attempt timeout, promotes the first responsive one to
//! the front of the list, and resolves an address for the requested role.
//! A dedicated pub/sub connection watches the `+switch-master` channel; a
//! failover notification tears down every connection opened through the
//! resolver and discovery re-runs lazily on next use, trading reconnect
//! cost for stale-master avoidance.
//!
//! The replication resolver is the simpler sibling: it reads each node's
//! `ROLE` reply directly and trusts the result for a cache TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::{ConnectionConfig, NodeRole, ReplicationConfig, SentinelConfig, ServerAddr};
use crate::connection::Connection;
use crate::error::DriverError;
use crate::resp::RespValue;

struct SentinelInner {
    config: SentinelConfig,
    /// Current priority order; the most recently responsive sentinel sits
    /// at the front.
    sentinels: Mutex<Vec<ServerAddr>>,
    /// Address resolved for the configured role, trusted until a failover
    /// notification clears it.
    resolved: Mutex<Option<ServerAddr>>,
    /// Connections opened through the resolver, torn down on failover.
    tracked: Mutex<Vec<Connection>>,
    watcher_running: AtomicBool,
}

/// Resolves node addresses through a sentinel deployment.
#[derive(Clone)]
pub struct SentinelResolver {
    inner: Arc<SentinelInner>,
}

impl SentinelResolver {
    pub fn new(config: SentinelConfig) -> SentinelResolver {
        let sentinels = config.sentinels.clone();
        SentinelResolver {
            inner: Arc::new(SentinelInner {
                config,
                sentinels: Mutex::new(sentinels),
                resolved: Mutex::new(None),
                tracked: Mutex::new(Vec::new()),
                watcher_running: AtomicBool::new(false),
            }),
        }
    }

    /// Resolves the address for the configured role, using the cached
    /// answer when one is still trusted.
    pub async fn resolve(&self) -> Result<ServerAddr, DriverError> {
        if let Some(addr) = self.inner.resolved.lock().expect("resolver lock poisoned").clone() {
            return Ok(addr);
        }
        let addr = self.resolve_role(self.inner.config.role).await?;
        *self.inner.resolved.lock().expect("resolver lock poisoned") = Some(addr.clone());
        Ok(addr)
    }

    /// Queries each sentinel in current priority order until one answers
    /// within the attempt timeout. The responsive sentinel moves to the
    /// front of the list; exhausting the list fails discovery.
    pub async fn resolve_role(&self, role: NodeRole) -> Result<ServerAddr, DriverError> {
        let candidates = self
            .inner
            .sentinels
            .lock()
            .expect("resolver lock poisoned")
            .clone();
        if candidates.is_empty() {
            return Err(DriverError::DiscoveryFailed(
                "no sentinels configured".to_string(),
            ));
        }

        let mut failures = Vec::new();
        for sentinel in candidates {
            let attempt = timeout(
                self.inner.config.attempt_timeout,
                self.query_sentinel(&sentinel, role),
            )
            .await;
            match attempt {
                Ok(Ok(addr)) => {
                    self.promote(&sentinel);
                    debug!(sentinel = %sentinel, resolved = %addr, "discovery succeeded");
                    return Ok(addr);
                }
                Ok(Err(err)) => {
                    warn!(sentinel = %sentinel, error = %err, "sentinel query failed");
                    failures.push(format!("{}: {}", sentinel, err));
                }
                Err(_) => {
                    warn!(sentinel = %sentinel, "sentinel query timed out");
                    failures.push(format!("{}: timed out", sentinel));
                }
            }
        }
        Err(DriverError::DiscoveryFailed(format!(
            "all sentinels exhausted [{}]",
            failures.join("; ")
        )))
    }

    /// Opens a connection to the resolved address and tracks it for
    /// failover teardown. The failover watcher starts with the first call.
    pub async fn connect(&self) -> Result<Connection, DriverError> {
        self.ensure_failover_watch();
        let addr = self.resolve().await?;
        let conn = Connection::connect(self.inner.config.connection.with_addr(addr)).await?;
        self.inner
            .tracked
            .lock()
            .expect("resolver lock poisoned")
            .push(conn.clone());
        Ok(conn)
    }

    async fn query_sentinel(
        &self,
        sentinel: &ServerAddr,
        role: NodeRole,
    ) -> Result<ServerAddr, DriverError> {
        if role == NodeRole::Sentinel {
            // The caller wants a sentinel itself; reachability is the test.
            let conn = self.dial_sentinel(sentinel).await?;
            conn.close().await;
            return Ok(sentinel.clone());
        }

        let conn = self.dial_sentinel(sentinel).await?;
        let result = match role {
            NodeRole::Master => self.query_master_addr(&conn).await,
            NodeRole::Replica => self.query_replica_addr(&conn).await,
            NodeRole::Sentinel => unreachable!("handled above"),
        };
        conn.close().await;
        result
    }

    async fn dial_sentinel(&self, sentinel: &ServerAddr) -> Result<Connection, DriverError> {
        // Sentinels speak plain RESP2 and have no databases; strip the
        // parts of the config that only apply to data nodes.
        let mut config = self.inner.config.connection.with_addr(sentinel.clone());
        config.database = 0;
        Connection::connect(config).await
    }

    async fn query_master_addr(&self, conn: &Connection) -> Result<ServerAddr, DriverError> {
        let reply = conn
            .send(
                Command::new("SENTINEL get-master-addr-by-name")
                    .arg(self.inner.config.service_name.clone()),
            )
            .await?;

        let items = reply
            .as_array()
            .ok_or_else(|| discovery_error("master address reply is not an array"))?;
        let host = items
            .first()
            .and_then(|host| host.as_str())
            .ok_or_else(|| discovery_error("master host missing"))?;
        let port = items
            .get(1)
            .and_then(|port| port.as_int())
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| discovery_error("master port missing"))?;
        Ok(ServerAddr::Tcp(host.to_string(), port))
    }

    async fn query_replica_addr(&self, conn: &Connection) -> Result<ServerAddr, DriverError> {
        let reply = conn
            .send(Command::new("SENTINEL slaves").arg(self.inner.config.service_name.clone()))
            .await?;

        let entries = reply
            .as_array()
            .ok_or_else(|| discovery_error("replica list reply is not an array"))?;

        let mut healthy = Vec::new();
        for entry in entries {
            let fields = instance_fields(entry);
            let down = fields
                .get("flags")
                .map(|flags| flags.contains("down"))
                .unwrap_or(false);
            if down {
                continue;
            }
            if let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) {
                if let Ok(port) = port.parse::<u16>() {
                    healthy.push(ServerAddr::Tcp(ip.clone(), port));
                }
            }
        }

        healthy
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| discovery_error("no healthy replica reported"))
    }

    fn promote(&self, sentinel: &ServerAddr) {
        let mut sentinels = self.inner.sentinels.lock().expect("resolver lock poisoned");
        if let Some(index) = sentinels.iter().position(|addr| addr == sentinel) {
            if index > 0 {
                let addr = sentinels.remove(index);
                sentinels.insert(0, addr);
            }
        }
    }

    /// Spawns the `+switch-master` watcher once per resolver.
    pub fn ensure_failover_watch(&self) {
        if self.inner.watcher_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let resolver = self.clone();
        tokio::spawn(async move {
            resolver.failover_watch_loop().await;
        });
    }

    async fn failover_watch_loop(&self) {
        loop {
            match self.watch_once().await {
                Ok(()) => {}
                Err(err) => {
                    debug!(error = %err, "failover watch interrupted");
                }
            }
            if Arc::strong_count(&self.inner) == 1 {
                // Only the watcher itself still holds the resolver.
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Subscribes to `+switch-master` on one sentinel and processes
    /// notifications until that subscription dies.
    async fn watch_once(&self) -> Result<(), DriverError> {
        let sentinel = self.resolve_role(NodeRole::Sentinel).await?;
        let conn = self.dial_sentinel(&sentinel).await?;
        let mut pushes = conn.subscribe(vec!["+switch-master".to_string()]).await?;
        info!(sentinel = %sentinel, "watching for master switches");

        while let Some(message) = pushes.recv().await {
            let payload = message
                .payload()
                .and_then(|payload| payload.as_str())
                .unwrap_or("");
            // Payload: "<master-name> <old-ip> <old-port> <new-ip> <new-port>".
            let mut parts = payload.split_whitespace();
            if parts.next() != Some(self.inner.config.service_name.as_str()) {
                continue;
            }
            info!(payload = %payload, "master switched; tearing down connections");
            self.teardown().await;
        }
        conn.close().await;
        Ok(())
    }

    /// Fails over: every tracked connection is closed (pending requests
    /// fail with the disconnect error) and the cached address is dropped,
    /// so the next use re-runs discovery.
    async fn teardown(&self) {
        *self.inner.resolved.lock().expect("resolver lock poisoned") = None;
        let tracked: Vec<Connection> = {
            let mut tracked = self.inner.tracked.lock().expect("resolver lock poisoned");
            tracked.drain(..).collect()
        };
        for conn in tracked {
            conn.close().await;
        }
    }

    /// Current sentinel priority order; exposed for observability.
    pub fn sentinel_order(&self) -> Vec<ServerAddr> {
        self.inner.sentinels.lock().expect("resolver lock poisoned").clone()
    }
}

/// Field map of one `SENTINEL slaves` entry. RESP2 renders an entry as a
/// flat array of key/value bulks, RESP3 as a map.
fn instance_fields(entry: &RespValue) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    match entry {
        RespValue::Array(items) => {
            for pair in items.chunks(2) {
                if let [key, value] = pair {
                    if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                        fields.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        RespValue::Map(pairs) => {
            for (key, value) in pairs {
                if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                    fields.insert(key.to_string(), value.to_string());
                }
            }
        }
        _ => {}
    }
    fields
}

fn discovery_error(reason: &str) -> DriverError {
    DriverError::DiscoveryFailed(reason.to_string())
}

struct CachedTopology {
    master: Option<ServerAddr>,
    replicas: Vec<ServerAddr>,
    resolved_at: Instant,
}

/// Resolves roles in a plain replicated deployment by asking each node
/// directly. No change subscription: the answer is trusted for the cache
/// TTL and re-probed afterwards or on explicit invalidation.
pub struct ReplicationResolver {
    config: ReplicationConfig,
    cache: tokio::sync::Mutex<Option<CachedTopology>>,
}

impl ReplicationResolver {
    pub fn new(config: ReplicationConfig) -> ReplicationResolver {
        ReplicationResolver {
            config,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Address of the current master, or of a random replica.
    pub async fn resolve(&self, role: NodeRole) -> Result<ServerAddr, DriverError> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .as_ref()
            .map(|cached| cached.resolved_at.elapsed() < self.config.cache_ttl)
            .unwrap_or(false);
        if !fresh {
            *cache = Some(self.probe().await?);
        }
        let topology = cache.as_ref().expect("topology just cached");

        match role {
            NodeRole::Master | NodeRole::Sentinel => topology
                .master
                .clone()
                .ok_or_else(|| discovery_error("no node reported the master role")),
            NodeRole::Replica => topology
                .replicas
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| discovery_error("no node reported the replica role")),
        }
    }

    /// Drops the cached topology so the next resolve re-probes.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn probe(&self) -> Result<CachedTopology, DriverError> {
        let mut master = None;
        let mut replicas = Vec::new();
        let mut failures = Vec::new();

        for node in &self.config.nodes {
            let role = timeout(self.config.attempt_timeout, self.query_role(node)).await;
            match role {
                Ok(Ok(ReportedRole::Master)) => {
                    if master.is_none() {
                        master = Some(node.clone());
                    }
                }
                Ok(Ok(ReportedRole::Replica { master_addr })) => {
                    replicas.push(node.clone());
                    // A replica names its master; trust it when no probed
                    // node claimed the role itself.
                    if master.is_none() {
                        master = Some(master_addr);
                    }
                }
                Ok(Err(err)) => failures.push(format!("{}: {}", node, err)),
                Err(_) => failures.push(format!("{}: timed out", node)),
            }
        }

        if master.is_none() && replicas.is_empty() {
            return Err(DriverError::DiscoveryFailed(format!(
                "no node answered a role probe [{}]",
                failures.join("; ")
            )));
        }

        Ok(CachedTopology {
            master,
            replicas,
            resolved_at: Instant::now(),
        })
    }

    async fn query_role(&self, node: &ServerAddr) -> Result<ReportedRole, DriverError> {
        let conn = Connection::connect(self.connection_config(node)).await?;
        let reply = conn.send(Command::new("ROLE")).await?;
        conn.close().await;

        let items = reply
            .as_array()
            .ok_or_else(|| discovery_error("ROLE reply is not an array"))?;
        match items.first().and_then(|head| head.as_str()) {
            Some("master") => Ok(ReportedRole::Master),
            Some("slave") | Some("replica") => {
                let host = items
                    .get(1)
                    .and_then(|host| host.as_str())
                    .ok_or_else(|| discovery_error("replica ROLE reply missing master host"))?;
                let port = items
                    .get(2)
                    .and_then(|port| port.as_int())
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| discovery_error("replica ROLE reply missing master port"))?;
                Ok(ReportedRole::Replica {
                    master_addr: ServerAddr::Tcp(host.to_string(), port),
                })
            }
            _ => Err(discovery_error("unrecognized ROLE reply")),
        }
    }

    fn connection_config(&self, node: &ServerAddr) -> ConnectionConfig {
        self.config.connection.with_addr(node.clone())
    }
}

enum ReportedRole {
    Master,
    Replica { master_addr: ServerAddr },
}
