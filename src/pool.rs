//! Bounded connection pool.
//!
//! The pool keeps at most `max_size` live connections and a FIFO of at most
//! `max_waiting` suspended callers; one caller more than that fails
//! immediately with a pool-full error instead of queuing unboundedly. A
//! connection that ran a session-mutating command (`SELECT`, `AUTH`, ...)
//! is tainted: it is closed on release rather than handed to an unrelated
//! caller. Idle connections are recycled by a periodic sweep, not checked
//! on every operation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{ConnectionConfig, PoolConfig};
use crate::connection::{ConnState, Connection};
use crate::error::DriverError;
use crate::resp::RespValue;

struct IdleConn {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    /// Connections alive or being dialed (idle + checked out + dialing).
    live: usize,
    waiters: VecDeque<oneshot::Sender<Result<Connection, DriverError>>>,
    closed: bool,
}

struct PoolInner {
    connection: ConnectionConfig,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Shared pool handle.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(connection: ConnectionConfig, config: PoolConfig) -> Pool {
        let inner = Arc::new(PoolInner {
            connection,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        });

        tokio::spawn(sweep_idle(Arc::downgrade(&inner)));

        Pool { inner }
    }

    /// Checks out a connection: an idle one, a freshly dialed one while
    /// below `max_size`, or, once the waiter queue is also full, fails
    /// with [`DriverError::PoolFull`] without queuing.
    pub async fn acquire(&self) -> Result<PooledConnection, DriverError> {
        enum Plan {
            Ready(Connection),
            Dial,
            Wait(oneshot::Receiver<Result<Connection, DriverError>>),
        }

        let plan = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.closed {
                return Err(DriverError::ConnectionClosed);
            }

            let mut plan = None;
            while let Some(idle) = state.idle.pop_front() {
                if idle.conn.state() == ConnState::Connected {
                    plan = Some(Plan::Ready(idle.conn));
                    break;
                }
                // Died while idle; its slot frees up.
                state.live -= 1;
            }

            match plan {
                Some(ready) => ready,
                None if state.live < self.inner.config.max_size => {
                    state.live += 1;
                    Plan::Dial
                }
                None if state.waiters.len() < self.inner.config.max_waiting => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
                None => return Err(DriverError::PoolFull),
            }
        };

        match plan {
            Plan::Ready(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Plan::Dial => match Connection::connect(self.inner.connection.clone()).await {
                Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
                Err(err) => {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.live -= 1;
                    Err(err)
                }
            },
            Plan::Wait(rx) => match rx.await {
                Ok(Ok(conn)) => Ok(PooledConnection::new(self.inner.clone(), conn)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(DriverError::ConnectionClosed),
            },
        }
    }

    /// Closes the pool: idle connections are dropped, queued waiters fail,
    /// later `acquire` calls fail.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.closed = true;
            state.live -= state.idle.len();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(Err(DriverError::ConnectionClosed));
        }
        drop(idle);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").idle.len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").live
    }
}

impl PoolInner {
    /// Returns a healthy connection to the pool: oldest waiter first,
    /// otherwise onto the idle list.
    fn release(self: &Arc<Self>, conn: Connection) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.closed {
            state.live -= 1;
            return;
        }
        let mut conn = Some(conn);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Ok(conn.take().expect("connection present"))) {
                Ok(()) => return,
                // Waiter gave up (dropped its acquire future); try the next.
                Err(Ok(returned)) => conn = Some(returned),
                Err(Err(_)) => unreachable!("release only sends Ok"),
            }
        }
        state.idle.push_back(IdleConn {
            conn: conn.expect("connection present"),
            since: Instant::now(),
        });
    }

    /// Drops a tainted or dead connection. Its slot is re-used for the
    /// oldest waiter, if any, by dialing a replacement.
    fn discard(self: &Arc<Self>, conn: Connection) {
        drop(conn);
        let replace = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            state.live -= 1;
            if state.closed || state.waiters.is_empty() {
                None
            } else {
                state.live += 1;
                state.waiters.pop_front()
            }
        };

        let Some(waiter) = replace else { return };
        let inner = self.clone();
        let spawned = tokio::runtime::Handle::try_current().map(|handle| {
            handle.spawn(async move {
                let result = Connection::connect(inner.connection.clone()).await;
                if result.is_err() {
                    let mut state = inner.state.lock().expect("pool mutex poisoned");
                    state.live -= 1;
                }
                let _ = waiter.send(result);
            })
        });
        if spawned.is_err() {
            warn!("pool dropped outside a runtime; failing waiter");
        }
    }
}

/// A checked-out connection. Returning it to the pool happens on drop;
/// tainted or dead connections are discarded instead of reused.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    tainted: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            tainted: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }

    /// Sends one command. Session-mutating commands taint the connection
    /// so it will not be returned to the general pool.
    pub async fn send(&mut self, command: Command) -> Result<RespValue, DriverError> {
        if command.is_session_mutating() {
            self.tainted = true;
        }
        self.connection().send(command).await
    }

    /// Marks the connection as carrying caller-specific session state.
    pub fn mark_tainted(&mut self) {
        self.tainted = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        if self.tainted || conn.state() != ConnState::Connected {
            debug!(addr = %conn.addr(), tainted = self.tainted, "discarding pooled connection");
            self.pool.discard(conn);
        } else {
            self.pool.release(conn);
        }
    }
}

/// Periodic sweep closing idle connections past the idle timeout. Holds
/// only a weak reference so an abandoned pool shuts the sweep down.
async fn sweep_idle(inner: Weak<PoolInner>) {
    let interval = match inner.upgrade() {
        Some(strong) => strong.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(strong) = inner.upgrade() else { return };

        let expired: Vec<IdleConn> = {
            let mut state = strong.state.lock().expect("pool mutex poisoned");
            if state.closed {
                return;
            }
            let idle_timeout = strong.config.idle_timeout;
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            let drained: Vec<IdleConn> = state.idle.drain(..).collect();
            for idle in drained {
                let dead = idle.conn.state() != ConnState::Connected;
                if dead || idle.since.elapsed() >= idle_timeout {
                    state.live -= 1;
                    expired.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            expired
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "recycled idle connections");
        }
        // Dropping the handles lets each connection task shut down.
        drop(expired);
    }
}
