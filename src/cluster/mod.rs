//! Cluster client: slot-based routing with redirection handling.
//!
//! One logical client owns a slot map snapshot, a per-address connection
//! cache and a refresh loop. Requests are routed by key slot; `MOVED`,
//! `ASK`, `TRYAGAIN` and `CLUSTERDOWN` replies drive bounded redirection
//! retries, and an unexpected node disconnect evicts the node and triggers
//! a slot-map refresh, since slot ownership may have changed with it.

pub mod slots;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::{ClusterConfig, ReplicaReads, ServerAddr};
use crate::connection::{ConnState, Connection};
use crate::error::{DriverError, ServerError};
use crate::resp::RespValue;

use slots::{key_hash_slot, same_slot, SlotMap};

struct ClusterInner {
    config: ClusterConfig,
    slots: RwLock<Arc<SlotMap>>,
    conns: Mutex<HashMap<String, Connection>>,
    /// Serializes refreshes; the generation counter lets a caller that
    /// queued behind an in-flight refresh skip a redundant one.
    refresh_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    /// Explicitly closed by the caller; refreshes stop re-dialing.
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// A cluster-aware client handle.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    /// Connects to the first reachable seed, discovers the slot map and
    /// returns a ready client. Failure of every seed fails the open.
    pub async fn open(config: ClusterConfig) -> Result<ClusterClient, DriverError> {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ClusterInner {
            config,
            slots: RwLock::new(Arc::new(SlotMap::default())),
            conns: Mutex::new(HashMap::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        let client = ClusterClient { inner };

        let mut failures = Vec::new();
        for seed in client.inner.config.seeds.clone() {
            let addr = seed.to_string();
            match client.connection_to(&addr).await {
                Ok(conn) => match client.discover_via(&conn).await {
                    Ok(()) => {
                        info!(seed = %addr, "cluster topology discovered");
                        return Ok(client);
                    }
                    Err(err) => failures.push(format!("{}: {}", addr, err)),
                },
                Err(err) => failures.push(format!("{}: {}", addr, err)),
            }
        }
        Err(DriverError::DiscoveryFailed(format!(
            "no seed produced a slot map [{}]",
            failures.join("; ")
        )))
    }

    /// Sends one command, transparently following redirections within the
    /// configured retry budget. Store errors that are not redirections are
    /// surfaced as [`DriverError::Server`] without retry.
    pub async fn send(&self, command: Command) -> Result<RespValue, DriverError> {
        same_slot(std::slice::from_ref(&command))?;
        self.send_routed(command).await
    }

    async fn send_routed(&self, command: Command) -> Result<RespValue, DriverError> {
        let mut retries_left = self.inner.config.retry_budget;
        let mut target: Option<Redirect> = None;
        let mut last_err = DriverError::DiscoveryFailed("retry budget was zero".to_string());

        while retries_left > 0 {
            retries_left -= 1;

            let (addr, asking) = match target.take() {
                Some(Redirect::Moved(addr)) | Some(Redirect::Retry(addr)) => (addr, false),
                Some(Redirect::Ask(addr)) => (addr, true),
                None => (self.route(&command)?, false),
            };

            let conn = match self.connection_to(&addr).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(addr = %addr, error = %err, "cluster node unreachable");
                    last_err = err;
                    let _ = self.refresh().await;
                    continue;
                }
            };

            let result = if asking {
                self.send_asking(&conn, command.clone()).await
            } else {
                conn.send(command.clone()).await
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(err) => {
                    self.forget(&addr, &conn);
                    last_err = err;
                    let _ = self.refresh().await;
                    continue;
                }
            };

            let kind = reply.error_kind().map(str::to_string);
            match kind.as_deref() {
                Some("MOVED") => {
                    let (slot, to) = parse_redirect(&reply)?;
                    info!(slot, to = %to, "slot moved");
                    // Ownership changed for good: refresh the whole map,
                    // then chase the new owner.
                    let _ = self.refresh().await;
                    last_err = server_error(reply);
                    target = Some(Redirect::Moved(to));
                }
                Some("ASK") => {
                    let (_slot, to) = parse_redirect(&reply)?;
                    // One-shot redirect; ownership has not changed, so no
                    // refresh.
                    last_err = server_error(reply);
                    target = Some(Redirect::Ask(to));
                }
                Some("TRYAGAIN") | Some("CLUSTERDOWN") => {
                    let delay = self.inner.config.backoff_base * backoff_factor(retries_left);
                    debug!(addr = %addr, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                    last_err = server_error(reply);
                    target = Some(Redirect::Retry(addr));
                }
                Some(_) => return Err(server_error(reply)),
                None => return Ok(reply),
            }
        }

        Err(last_err)
    }

    /// Pipelines `ASKING` ahead of the redirected command on the target
    /// connection.
    async fn send_asking(
        &self,
        conn: &Connection,
        command: Command,
    ) -> Result<RespValue, DriverError> {
        let asking = conn.dispatch(Command::new("ASKING"))?;
        let pending = conn.dispatch(command)?;
        let _ = asking.wait().await?;
        pending.wait().await
    }

    /// Sends a batch whose keys must all live in one slot, pipelined on
    /// the owning node's connection. Cross-slot batches fail locally.
    pub async fn batch(&self, commands: Vec<Command>) -> Result<Vec<RespValue>, DriverError> {
        let slot = same_slot(&commands)?;
        let addr = match slot {
            Some(slot) => self.master_addr(slot)?,
            None => self.any_node_addr()?,
        };
        let conn = self.connection_to(&addr).await?;

        let mut pending = Vec::with_capacity(commands.len());
        for command in commands {
            pending.push(conn.dispatch(command)?);
        }
        let mut replies = Vec::with_capacity(pending.len());
        for response in pending {
            replies.push(response.wait().await?);
        }
        Ok(replies)
    }

    /// Partitions keyed commands by owning master, for caller-driven
    /// fan-out.
    pub fn group_by_node(
        &self,
        commands: Vec<Command>,
    ) -> Result<HashMap<String, Vec<Command>>, DriverError> {
        self.slot_map().group_by_node(commands)
    }

    /// Observer that flips to `true` when the client has lost every node
    /// connection.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    pub fn slot_map(&self) -> Arc<SlotMap> {
        self.inner.slots.read().expect("slot map lock poisoned").clone()
    }

    /// Closes every cached connection and signals end-of-life.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.closed_tx.send(true);
        let conns: Vec<Connection> = {
            let mut cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            cache.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.close().await;
        }
    }

    fn route(&self, command: &Command) -> Result<String, DriverError> {
        match command.key() {
            Some(key) => {
                let slot = key_hash_slot(key);
                if command.is_read_only() {
                    self.read_addr(slot)
                } else {
                    self.master_addr(slot)
                }
            }
            None => self.any_node_addr(),
        }
    }

    fn master_addr(&self, slot: u16) -> Result<String, DriverError> {
        self.slot_map()
            .master_for_slot(slot)
            .map(str::to_string)
            .ok_or(DriverError::UnroutableSlot(slot))
    }

    fn read_addr(&self, slot: u16) -> Result<String, DriverError> {
        let map = self.slot_map();
        let shard = map
            .shard_for_slot(slot)
            .ok_or(DriverError::UnroutableSlot(slot))?;

        let addr = match self.inner.config.replica_reads {
            ReplicaReads::Never => shard.master.as_str(),
            ReplicaReads::Always => shard
                .replicas
                .choose(&mut rand::thread_rng())
                .map(String::as_str)
                .unwrap_or(shard.master.as_str()),
            ReplicaReads::Share => {
                let nodes: Vec<&str> = shard.nodes().collect();
                nodes
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .unwrap_or(shard.master.as_str())
            }
        };
        Ok(addr.to_string())
    }

    /// Any connected node, preferring live cached connections.
    fn any_node_addr(&self) -> Result<String, DriverError> {
        let cached: Vec<String> = {
            let cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            cache
                .iter()
                .filter(|(_, conn)| conn.state() == ConnState::Connected)
                .map(|(addr, _)| addr.clone())
                .collect()
        };
        if let Some(addr) = cached.choose(&mut rand::thread_rng()) {
            return Ok(addr.clone());
        }

        let map = self.slot_map();
        let masters: Vec<&str> = map.shards().iter().map(|shard| shard.master.as_str()).collect();
        masters
            .choose(&mut rand::thread_rng())
            .map(|addr| addr.to_string())
            .ok_or_else(|| DriverError::DiscoveryFailed("no known cluster nodes".to_string()))
    }

    /// Cached connection to `addr`, dialing on miss. A watcher task evicts
    /// the address when the connection dies and kicks off a refresh.
    async fn connection_to(&self, addr: &str) -> Result<Connection, DriverError> {
        {
            let cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            if let Some(conn) = cache.get(addr) {
                if conn.state() != ConnState::Disconnected {
                    return Ok(conn.clone());
                }
            }
        }

        let server = ServerAddr::parse_tcp(addr)
            .ok_or_else(|| DriverError::DiscoveryFailed(format!("bad node address {}", addr)))?;
        let conn =
            Connection::connect(self.inner.config.connection.with_addr(server)).await?;

        let conn = {
            let mut cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            match cache.get(addr) {
                // Lost a dial race; keep the existing connection.
                Some(existing) if existing.state() != ConnState::Disconnected => existing.clone(),
                _ => {
                    cache.insert(addr.to_string(), conn.clone());
                    self.spawn_disconnect_watch(addr.to_string(), conn.clone());
                    conn
                }
            }
        };
        Ok(conn)
    }

    fn spawn_disconnect_watch(&self, addr: String, conn: Connection) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            conn.closed().await;
            let Some(inner) = weak.upgrade() else { return };
            let client = ClusterClient { inner };
            client.forget(&addr, &conn);
            warn!(addr = %addr, "cluster node disconnected");
            // Ownership may have moved with the node.
            let _ = client.refresh().await;
        });
    }

    /// Evicts `conn` from the cache (only if it is still the cached entry)
    /// and signals end-of-life when no connections remain.
    fn forget(&self, addr: &str, conn: &Connection) {
        let emptied = {
            let mut cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            if let Some(cached) = cache.get(addr) {
                if cached.same_task(conn) {
                    cache.remove(addr);
                }
            }
            cache.is_empty()
        };
        if emptied {
            let _ = self.inner.closed_tx.send(true);
        }
    }

    /// Rebuilds the slot map from any reachable node. Concurrent callers
    /// serialize on the gate; whoever queued behind a refresh that already
    /// finished skips the redundant rebuild.
    pub async fn refresh(&self) -> Result<(), DriverError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DriverError::ConnectionClosed);
        }
        let generation = self.inner.generation.load(Ordering::Acquire);
        let _gate = self.inner.refresh_gate.lock().await;
        if self.inner.generation.load(Ordering::Acquire) != generation {
            return Ok(());
        }

        let mut candidates: Vec<String> = {
            let cache = self.inner.conns.lock().expect("conn cache lock poisoned");
            cache.keys().cloned().collect()
        };
        for seed in &self.inner.config.seeds {
            let addr = seed.to_string();
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }

        let mut failures = Vec::new();
        for addr in candidates {
            let conn = match self.connection_to(&addr).await {
                Ok(conn) => conn,
                Err(err) => {
                    failures.push(format!("{}: {}", addr, err));
                    continue;
                }
            };
            match self.discover_via(&conn).await {
                Ok(()) => {
                    debug!(via = %addr, "slot map refreshed");
                    return Ok(());
                }
                Err(err) => failures.push(format!("{}: {}", addr, err)),
            }
        }
        Err(DriverError::DiscoveryFailed(format!(
            "slot map refresh failed [{}]",
            failures.join("; ")
        )))
    }

    /// Fetches `CLUSTER SLOTS` over `conn` and atomically publishes the
    /// rebuilt map.
    async fn discover_via(&self, conn: &Connection) -> Result<(), DriverError> {
        let reply = conn.send(Command::new("CLUSTER SLOTS")).await?;
        if let RespValue::Error(line) = &reply {
            return Err(DriverError::Server(ServerError::from_line(line)));
        }
        let map = SlotMap::from_cluster_slots(&reply)?;
        *self.inner.slots.write().expect("slot map lock poisoned") = Arc::new(map);
        self.inner.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

enum Redirect {
    Moved(String),
    Ask(String),
    Retry(String),
}

/// `2^(16 - max(retries_left, 9))`: early retries wait a couple of base
/// units, the tail is capped at 128 of them.
fn backoff_factor(retries_left: u32) -> u32 {
    2u32.pow(16 - retries_left.max(9).min(16))
}

/// Parses the `<slot> <host:port>` payload of a MOVED/ASK error.
fn parse_redirect(reply: &RespValue) -> Result<(u16, String), DriverError> {
    let RespValue::Error(line) = reply else {
        return Err(DriverError::UnexpectedResponse);
    };
    let mut parts = line.split_whitespace();
    let _kind = parts.next();
    let slot = parts
        .next()
        .and_then(|slot| slot.parse::<u16>().ok())
        .ok_or(DriverError::UnexpectedResponse)?;
    let addr = parts.next().ok_or(DriverError::UnexpectedResponse)?;
    Ok((slot, addr.to_string()))
}

fn server_error(reply: RespValue) -> DriverError {
    match reply {
        RespValue::Error(line) => DriverError::Server(ServerError::from_line(&line)),
        _ => DriverError::UnexpectedResponse,
    }
}
