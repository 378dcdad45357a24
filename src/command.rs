//! Request model.
//!
//! A [`Command`] is an ordered list of binary-safe arguments, immutable once
//! built. The driver core is command-agnostic: it never validates arity or
//! argument shape, it only frames arguments and ships them. The few
//! classification tables below exist for routing (read-only commands may go
//! to replicas, keyless commands go to any node) and for connection
//! bookkeeping (subscribe-family reply counting, session-mutating taint).

use bytes::{Bytes, BytesMut};

use crate::resp::encode_command;

/// Commands that only read data and may be served by a replica.
const READ_ONLY_COMMANDS: &[&str] = &[
    "GET", "MGET", "EXISTS", "TYPE", "TTL", "PTTL", "STRLEN", "GETRANGE", "LRANGE", "LLEN",
    "LINDEX", "SMEMBERS", "SCARD", "SISMEMBER", "SRANDMEMBER", "HGET", "HMGET", "HGETALL", "HLEN",
    "HKEYS", "HVALS", "ZRANGE", "ZSCORE", "ZCARD", "ZRANK", "XRANGE", "XLEN", "SCAN", "KEYS",
    "RANDOMKEY", "DBSIZE", "DUMP", "BITCOUNT", "GETBIT",
];

/// Commands that take no key; the cluster router sends them to any node.
const KEYLESS_COMMANDS: &[&str] = &[
    "PING", "ECHO", "HELLO", "AUTH", "SELECT", "QUIT", "RESET", "INFO", "CLUSTER", "CLIENT",
    "CONFIG", "COMMAND", "DBSIZE", "FLUSHALL", "FLUSHDB", "SCAN", "KEYS", "RANDOMKEY", "SENTINEL",
    "ROLE", "SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE", "PUBLISH", "SHUTDOWN",
    "WAIT", "ASKING", "TIME", "SLOWLOG", "MEMORY", "SCRIPT",
];

/// Commands that mutate connection-local session state. A pooled connection
/// that ran one of these must not be reused by unrelated callers.
const SESSION_MUTATING_COMMANDS: &[&str] = &["SELECT", "AUTH", "HELLO", "RESET"];

const SUBSCRIBE_COMMANDS: &[&str] = &["SUBSCRIBE", "PSUBSCRIBE"];
const UNSUBSCRIBE_COMMANDS: &[&str] = &["UNSUBSCRIBE", "PUNSUBSCRIBE"];

/// An ordered, binary-safe argument list; the first argument (or two, for
/// names like "CLUSTER SLOTS") is the command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
    name: String,
}

impl Command {
    /// Starts a command. A multi-word name is split into separate
    /// arguments, so `Command::new("CLUSTER SLOTS")` frames two bulks.
    pub fn new(name: &str) -> Self {
        let args = name
            .split_whitespace()
            .map(|word| Bytes::copy_from_slice(word.as_bytes()))
            .collect();
        Command {
            args,
            name: name.to_uppercase(),
        }
    }

    /// Appends one binary-safe argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument from an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Uppercased command name, including the second word of two-word names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First word of the command name.
    pub fn base_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    pub fn arg_slices(&self) -> &[Bytes] {
        &self.args
    }

    /// The routing key, when the command has one. By convention the key is
    /// the first argument after the name; keyless commands return `None`.
    pub fn key(&self) -> Option<&[u8]> {
        if KEYLESS_COMMANDS.contains(&self.base_name()) {
            return None;
        }
        let name_words = self.name.split_whitespace().count();
        self.args.get(name_words).map(|arg| arg.as_ref())
    }

    /// Every routing key the command carries. Multi-key commands with a
    /// well-known shape report all of their keys so cross-slot validation
    /// can fail fast; anything else reports at most the conventional first
    /// key.
    pub fn keys(&self) -> Vec<&[u8]> {
        let name_words = self.name.split_whitespace().count();
        let tail = &self.args[self.args.len().min(name_words)..];
        match self.base_name() {
            "MGET" | "DEL" | "UNLINK" | "EXISTS" | "WATCH" | "TOUCH" => {
                tail.iter().map(|arg| arg.as_ref()).collect()
            }
            "MSET" | "MSETNX" => tail.iter().step_by(2).map(|arg| arg.as_ref()).collect(),
            _ => self.key().into_iter().collect(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        READ_ONLY_COMMANDS.contains(&self.base_name())
    }

    pub fn is_session_mutating(&self) -> bool {
        SESSION_MUTATING_COMMANDS.contains(&self.base_name())
    }

    pub fn is_subscribe(&self) -> bool {
        SUBSCRIBE_COMMANDS.contains(&self.base_name())
    }

    pub fn is_unsubscribe(&self) -> bool {
        UNSUBSCRIBE_COMMANDS.contains(&self.base_name())
    }

    /// Number of wire replies this command produces.
    ///
    /// Subscribe-family commands are confirmed once per channel argument.
    /// An unsubscribe with no arguments clears every registered
    /// subscription and is confirmed once per registration. The server still
    /// sends exactly one confirmation when nothing is registered, hence
    /// the floor of 1. `registered` is the registry size
    /// at the moment the connection task processes the command.
    pub fn expected_replies(&self, registered: usize) -> usize {
        let name_words = self.name.split_whitespace().count();
        let channel_args = self.args.len().saturating_sub(name_words);

        if self.is_subscribe() {
            channel_args.max(1)
        } else if self.is_unsubscribe() {
            if channel_args == 0 {
                registered.max(1)
            } else {
                channel_args
            }
        } else {
            1
        }
    }

    /// Renders the command as a RESP array of bulk strings.
    pub fn encode(&self, dst: &mut BytesMut) {
        encode_command(&self.args, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_word_name_splits_into_arguments() {
        let cmd = Command::new("CLUSTER SLOTS");
        assert_eq!(cmd.arg_slices().len(), 2);
        assert_eq!(cmd.name(), "CLUSTER SLOTS");
        assert_eq!(cmd.base_name(), "CLUSTER");

        let mut dst = BytesMut::new();
        cmd.encode(&mut dst);
        assert_eq!(&dst[..], b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n");
    }

    #[test]
    fn test_key_extraction() {
        let test_cases = vec![
            (Command::new("GET").arg("k"), Some(&b"k"[..])),
            (Command::new("SET").arg("k").arg("v"), Some(&b"k"[..])),
            (Command::new("PING"), None),
            (Command::new("CLUSTER SLOTS"), None),
            (Command::new("SUBSCRIBE").arg("news"), None),
            (
                Command::new("SENTINEL get-master-addr-by-name").arg("main"),
                None,
            ),
        ];

        for (cmd, expected) in test_cases {
            assert_eq!(cmd.key(), expected, "key of {}", cmd.name());
        }
    }

    #[test]
    fn test_classification() {
        assert!(Command::new("GET").arg("k").is_read_only());
        assert!(!Command::new("SET").arg("k").arg("v").is_read_only());
        assert!(Command::new("SELECT").arg("2").is_session_mutating());
        assert!(!Command::new("GET").arg("k").is_session_mutating());
        assert!(Command::new("PSUBSCRIBE").arg("news.*").is_subscribe());
        assert!(Command::new("PUNSUBSCRIBE").is_unsubscribe());
    }

    #[test]
    fn test_expected_replies() {
        let test_cases = vec![
            (Command::new("GET").arg("k"), 0, 1, "plain command"),
            (
                Command::new("SUBSCRIBE").arg("a").arg("b").arg("c"),
                0,
                3,
                "one confirmation per channel",
            ),
            (
                Command::new("UNSUBSCRIBE").arg("a"),
                5,
                1,
                "explicit channel list wins over registry size",
            ),
            (
                Command::new("UNSUBSCRIBE"),
                3,
                3,
                "bare unsubscribe confirms every registration",
            ),
            (
                Command::new("UNSUBSCRIBE"),
                0,
                1,
                "server replies once even with nothing registered",
            ),
        ];

        for (cmd, registered, expected, description) in test_cases {
            assert_eq!(cmd.expected_replies(registered), expected, "{}", description);
        }
    }

    #[test]
    fn test_binary_arguments_survive() {
        let cmd = Command::new("SET").arg(&b"k\x00ey"[..]).arg(&b"\xff\xfe"[..]);
        let mut dst = BytesMut::new();
        cmd.encode(&mut dst);
        assert_eq!(
            &dst[..],
            b"*3\r\n$3\r\nSET\r\n$4\r\nk\x00ey\r\n$2\r\n\xff\xfe\r\n"
        );
    }
}
