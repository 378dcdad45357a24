#![allow(dead_code)]

//! Test support: a scripted in-process store node.
//!
//! `MockNode` speaks enough RESP to exercise the driver end to end: basic
//! data commands, pub/sub fan-out across connections, and a programmable
//! handler that tests install to script redirections, topology replies and
//! failure injection. Replies produced for one batch of pipelined commands
//! are coalesced into a single socket write, which is exactly the reply
//! batching the FIFO-correlation tests need.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use redrive::resp::{decode, RespValue};
use redrive::ServerAddr;

/// Scripted reply source: return `Some(frames)` to answer a command, or
/// `None` to fall through to the built-in behavior.
pub type Handler = dyn Fn(&[String]) -> Option<Vec<RespValue>> + Send + Sync;

#[derive(Default)]
struct NodeState {
    data: Mutex<HashMap<String, Vec<u8>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    log: Mutex<Vec<String>>,
    handler: Mutex<Option<Arc<Handler>>>,
}

pub struct MockNode {
    addr: String,
    state: Arc<NodeState>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        // Closes the listener so a dropped node refuses new connections.
        self.accept_task.abort();
    }
}

impl MockNode {
    pub async fn start() -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(NodeState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_conn(stream, accept_state.clone()));
            }
        });

        MockNode {
            addr,
            state,
            accept_task,
        }
    }

    /// Installs (or replaces) the scripted handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&[String]) -> Option<Vec<RespValue>> + Send + Sync + 'static,
    {
        *self.state.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn server_addr(&self) -> ServerAddr {
        ServerAddr::parse_tcp(&self.addr).unwrap()
    }

    /// Every command received so far, rendered as space-joined arguments.
    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    /// How many received commands start with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Seeds a key directly into the node's store.
    pub fn put(&self, key: &str, value: &str) {
        self.state
            .data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.as_bytes().to_vec());
    }
}

/// Opt-in log output for debugging a test run (`RUST_LOG=redrive=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// An address nothing listens on: bound, observed, then released.
pub fn unreachable_addr() -> ServerAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    ServerAddr::parse_tcp(&addr).unwrap()
}

/// Builds a `CLUSTER SLOTS` reply from `(start, end, master_addr)` ranges.
pub fn cluster_slots_reply(ranges: &[(i64, i64, &str)]) -> RespValue {
    let entries = ranges
        .iter()
        .map(|(start, end, addr)| {
            let (host, port) = addr.rsplit_once(':').unwrap();
            RespValue::Array(vec![
                RespValue::Integer(*start),
                RespValue::Integer(*end),
                RespValue::Array(vec![
                    RespValue::bulk(host.as_bytes().to_vec()),
                    RespValue::Integer(port.parse().unwrap()),
                    RespValue::bulk(&b"mock-node-id"[..]),
                ]),
            ])
        })
        .collect();
    RespValue::Array(entries)
}

pub fn bulk(text: &str) -> RespValue {
    RespValue::bulk(text.as_bytes().to_vec())
}

async fn serve_conn(stream: TcpStream, state: Arc<NodeState>) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut subscriptions: HashSet<String> = HashSet::new();

    'conn: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        // Answer every fully buffered command, then flush the replies in
        // one write so pipelined requests see batched replies.
        let mut out = BytesMut::new();
        loop {
            let frame = match decode(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    frame
                }
                Ok(None) => break,
                Err(_) => break 'conn,
            };
            let Some(args) = command_args(&frame) else {
                break 'conn;
            };
            state.log.lock().unwrap().push(args.join(" "));

            let scripted = {
                let handler = state.handler.lock().unwrap().clone();
                handler.and_then(|handler| handler(&args))
            };
            if let Some(replies) = scripted {
                for reply in replies {
                    reply.encode(&mut out);
                }
                continue;
            }

            match builtin(&args, &state, &out_tx, &mut subscriptions, &mut out) {
                Flow::Continue => {}
                Flow::Close => {
                    if !out.is_empty() {
                        let _ = out_tx.send(out.to_vec());
                    }
                    break 'conn;
                }
            }
        }
        if !out.is_empty() && out_tx.send(out.to_vec()).is_err() {
            break;
        }
    }

    // Unregister our writer so every clone of `out_tx` is gone and the
    // writer task can drain and exit.
    {
        let mut subscribers = state.subscribers.lock().unwrap();
        for channel in &subscriptions {
            if let Some(listeners) = subscribers.get_mut(channel) {
                listeners.retain(|listener| !listener.same_channel(&out_tx));
            }
        }
    }
    drop(out_tx);
    let _ = writer_task.await;
}

fn command_args(frame: &RespValue) -> Option<Vec<String>> {
    let items = frame.as_array()?;
    Some(
        items
            .iter()
            .map(|item| String::from_utf8_lossy(item.as_bytes().unwrap_or_default()).into_owned())
            .collect(),
    )
}

enum Flow {
    Continue,
    Close,
}

fn builtin(
    args: &[String],
    state: &Arc<NodeState>,
    out_tx: &mpsc::UnboundedSender<Vec<u8>>,
    subscriptions: &mut HashSet<String>,
    out: &mut BytesMut,
) -> Flow {
    let name = args.first().map(|name| name.to_uppercase()).unwrap_or_default();
    match name.as_str() {
        "PING" => RespValue::Simple("PONG".to_string()).encode(out),
        "ECHO" => bulk(args.get(1).map(String::as_str).unwrap_or("")).encode(out),
        "SET" => {
            if let (Some(key), Some(value)) = (args.get(1), args.get(2)) {
                state
                    .data
                    .lock()
                    .unwrap()
                    .insert(key.clone(), value.as_bytes().to_vec());
            }
            RespValue::Simple("OK".to_string()).encode(out);
        }
        "GET" => {
            let value = args
                .get(1)
                .and_then(|key| state.data.lock().unwrap().get(key).cloned());
            match value {
                Some(value) => RespValue::bulk(value).encode(out),
                None => RespValue::Null.encode(out),
            }
        }
        "SUBSCRIBE" => {
            for channel in &args[1..] {
                subscriptions.insert(channel.clone());
                state
                    .subscribers
                    .lock()
                    .unwrap()
                    .entry(channel.clone())
                    .or_default()
                    .push(out_tx.clone());
                RespValue::Array(vec![
                    bulk("subscribe"),
                    bulk(channel),
                    RespValue::Integer(subscriptions.len() as i64),
                ])
                .encode(out);
            }
        }
        "UNSUBSCRIBE" => {
            let named: Vec<String> = if args.len() > 1 {
                args[1..].to_vec()
            } else {
                subscriptions.iter().cloned().collect()
            };
            if named.is_empty() {
                RespValue::Array(vec![bulk("unsubscribe"), RespValue::Null, RespValue::Integer(0)])
                    .encode(out);
            }
            for channel in named {
                subscriptions.remove(&channel);
                let mut subscribers = state.subscribers.lock().unwrap();
                if let Some(listeners) = subscribers.get_mut(&channel) {
                    listeners.retain(|listener| !listener.same_channel(out_tx));
                }
                RespValue::Array(vec![
                    bulk("unsubscribe"),
                    bulk(&channel),
                    RespValue::Integer(subscriptions.len() as i64),
                ])
                .encode(out);
            }
        }
        "PUBLISH" => {
            let (channel, payload) = (
                args.get(1).cloned().unwrap_or_default(),
                args.get(2).cloned().unwrap_or_default(),
            );
            let mut message = BytesMut::new();
            RespValue::Array(vec![bulk("message"), bulk(&channel), bulk(&payload)])
                .encode(&mut message);

            let mut delivered = 0;
            let mut subscribers = state.subscribers.lock().unwrap();
            if let Some(listeners) = subscribers.get_mut(&channel) {
                listeners.retain(|listener| listener.send(message.to_vec()).is_ok());
                delivered = listeners.len() as i64;
            }
            RespValue::Integer(delivered).encode(out);
        }
        "SELECT" | "AUTH" | "ASKING" => RespValue::Simple("OK".to_string()).encode(out),
        "QUIT" => {
            RespValue::Simple("OK".to_string()).encode(out);
            return Flow::Close;
        }
        // Test hook: drop the connection without replying.
        "CRASH" => return Flow::Close,
        other => {
            RespValue::Error(format!("ERR unknown command '{}'", other)).encode(out);
        }
    }
    Flow::Continue
}
