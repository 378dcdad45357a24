//! Slot map: which node owns which of the 16384 hash slots.
//!
//! The map is rebuilt wholesale from a `CLUSTER SLOTS` reply and published
//! as an immutable snapshot; it is never mutated in place, so concurrent
//! readers can never observe a partially updated table.

use std::collections::HashMap;

use crate::command::Command;
use crate::error::DriverError;
use crate::resp::RespValue;

pub const SLOT_COUNT: usize = 16384;

/// Hash slot for a key: CRC16/XMODEM over the key's hash tag, modulo the
/// slot count. When the key contains a non-empty `{...}` section, only the
/// bytes between the first such brace pair participate, so callers can pin
/// related keys to one slot.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT as u16
}

fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    match key[open + 1..].iter().position(|&b| b == b'}') {
        // An empty tag (`{}`) hashes the whole key.
        Some(0) | None => key,
        Some(close) => &key[open + 1..open + 1 + close],
    }
}

/// Checks that every key of every command hashes to one slot and returns
/// it, or `None` when the batch is keyless. Fails before any network I/O.
pub fn same_slot(commands: &[Command]) -> Result<Option<u16>, DriverError> {
    let mut slot = None;
    for command in commands {
        for key in command.keys() {
            let this = key_hash_slot(key);
            match slot {
                None => slot = Some(this),
                Some(previous) if previous != this => return Err(DriverError::CrossSlot),
                Some(_) => {}
            }
        }
    }
    Ok(slot)
}

/// One master and its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub master: String,
    pub replicas: Vec<String>,
}

impl Shard {
    /// Master first, replicas after; the order the routing policy indexes.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.master.as_str()).chain(self.replicas.iter().map(String::as_str))
    }
}

/// Immutable slot→shard table.
#[derive(Debug, Default)]
pub struct SlotMap {
    shards: Vec<Shard>,
    slots: Vec<Option<u16>>,
}

impl SlotMap {
    /// Builds a map from a `CLUSTER SLOTS` reply: an array of
    /// `[start, end, [host, port, id?], replica...]` tuples. Slot ranges
    /// are inclusive on both ends.
    pub fn from_cluster_slots(reply: &RespValue) -> Result<SlotMap, DriverError> {
        let entries = reply
            .as_array()
            .ok_or_else(|| malformed("reply is not an array"))?;

        let mut shards: Vec<Shard> = Vec::new();
        let mut by_master: HashMap<String, u16> = HashMap::new();
        let mut slots = vec![None; SLOT_COUNT];

        for entry in entries {
            let fields = entry
                .as_array()
                .ok_or_else(|| malformed("range entry is not an array"))?;
            if fields.len() < 3 {
                return Err(malformed("range entry too short"));
            }

            let start = slot_index(&fields[0])?;
            let end = slot_index(&fields[1])?;
            if start > end {
                return Err(malformed("range start past range end"));
            }

            let master = node_addr(&fields[2])?;
            let replicas = fields[3..]
                .iter()
                .map(node_addr)
                .collect::<Result<Vec<_>, _>>()?;

            let index = match by_master.get(&master) {
                Some(&index) => index,
                None => {
                    let index = shards.len() as u16;
                    by_master.insert(master.clone(), index);
                    shards.push(Shard { master, replicas });
                    index
                }
            };

            for slot in start..=end {
                slots[slot] = Some(index);
            }
        }

        Ok(SlotMap { shards, slots })
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        let index = (*self.slots.get(slot as usize)?)?;
        self.shards.get(index as usize)
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<&str> {
        self.shard_for_slot(slot).map(|shard| shard.master.as_str())
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Partitions keyed commands by owning master for fan-out. Keyless
    /// commands are spread over the masters.
    pub fn group_by_node(
        &self,
        commands: Vec<Command>,
    ) -> Result<HashMap<String, Vec<Command>>, DriverError> {
        use rand::seq::SliceRandom;

        if self.shards.is_empty() {
            return Err(malformed("empty slot map"));
        }

        let mut groups: HashMap<String, Vec<Command>> = HashMap::new();
        let mut rng = rand::thread_rng();

        for command in commands {
            let addr = match command.key() {
                Some(key) => {
                    let slot = key_hash_slot(key);
                    self.master_for_slot(slot)
                        .ok_or(DriverError::UnroutableSlot(slot))?
                        .to_string()
                }
                None => {
                    let shard = self.shards.choose(&mut rng).expect("shards not empty");
                    shard.master.clone()
                }
            };
            groups.entry(addr).or_default().push(command);
        }
        Ok(groups)
    }
}

fn malformed(reason: &str) -> DriverError {
    DriverError::DiscoveryFailed(format!("malformed CLUSTER SLOTS reply: {}", reason))
}

fn slot_index(value: &RespValue) -> Result<usize, DriverError> {
    let index = value
        .as_int()
        .ok_or_else(|| malformed("slot bound is not an integer"))?;
    usize::try_from(index)
        .ok()
        .filter(|&index| index < SLOT_COUNT)
        .ok_or_else(|| malformed("slot bound out of range"))
}

/// Parses a `[host, port, ...]` node entry into `host:port`.
fn node_addr(value: &RespValue) -> Result<String, DriverError> {
    let fields = value
        .as_array()
        .ok_or_else(|| malformed("node entry is not an array"))?;
    let host = fields
        .first()
        .and_then(|host| host.as_str())
        .ok_or_else(|| malformed("node host missing"))?;
    let port = fields
        .get(1)
        .and_then(|port| port.as_int())
        .ok_or_else(|| malformed("node port missing"))?;
    Ok(format!("{}:{}", host, port))
}
