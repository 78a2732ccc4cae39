//! Slot ownership snapshots and the hash slot function.

use std::collections::HashSet;

use crate::address::NodeAddress;

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// A contiguous slot interval owned by one master.
///
/// Two ranges are equal when bounds and master port match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub from: u16,
    pub to: u16,
    pub master: NodeAddress,
}

impl SlotRange {
    pub fn new(from: u16, to: u16, master: NodeAddress) -> Self {
        Self { from, to, master }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.from && slot <= self.to
    }
}

/// Slot ownership at a point in time. Replaced wholesale, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    ranges: Vec<SlotRange>,
}

impl TopologySnapshot {
    pub fn new(mut ranges: Vec<SlotRange>) -> Self {
        ranges.sort_by_key(|r| (r.from, r.to));
        Self { ranges }
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Distinct masters in slot order.
    pub fn nodes(&self) -> Vec<NodeAddress> {
        let mut seen = HashSet::new();
        self.ranges
            .iter()
            .filter(|r| seen.insert(r.master.port))
            .map(|r| r.master.clone())
            .collect()
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<&NodeAddress> {
        self.ranges
            .iter()
            .find(|r| r.contains(slot))
            .map(|r| &r.master)
    }

    pub fn node_for_key(&self, key: &[u8]) -> Option<&NodeAddress> {
        self.node_for_slot(key_slot(key))
    }

    /// Rewrite every master address, e.g. through a node address map.
    pub fn map_nodes(&self, f: impl Fn(&NodeAddress) -> NodeAddress) -> Self {
        Self {
            ranges: self
                .ranges
                .iter()
                .map(|r| SlotRange::new(r.from, r.to, f(&r.master)))
                .collect(),
        }
    }
}

/// Node-level difference between two snapshots, compared by port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added: Vec<NodeAddress>,
    pub removed: Vec<NodeAddress>,
}

impl TopologyDiff {
    pub fn between(previous: &TopologySnapshot, current: &TopologySnapshot) -> Self {
        let before = previous.nodes();
        let after = current.nodes();
        let before_ports: HashSet<u16> = before.iter().map(|n| n.port).collect();
        let after_ports: HashSet<u16> = after.iter().map(|n| n.port).collect();

        Self {
            added: after
                .into_iter()
                .filter(|n| !before_ports.contains(&n.port))
                .collect(),
            removed: before
                .into_iter()
                .filter(|n| !after_ports.contains(&n.port))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Slot of a key, honouring `{hash tags}` the way the server does.
pub fn key_slot(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return crc16(&key[start + 1..start + 1 + end]) % SLOT_COUNT;
            }
        }
    }
    crc16(key) % SLOT_COUNT
}

/// CRC16/XMODEM as used for cluster slot assignment.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
