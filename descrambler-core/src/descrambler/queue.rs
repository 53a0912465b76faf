use std::collections::VecDeque;

use tokio::time::Instant;

use crate::cipher::CipherType;
use crate::ts::{self, Parity};

/// Key change that must only take effect once every packet queued before it
/// has been processed.
#[derive(Debug, Clone)]
pub(crate) struct KeyUpdate {
    pub slot_pid: u16,
    pub kind: CipherType,
    pub parity: Parity,
    pub key: Vec<u8>,
    pub received: Instant,
}

#[derive(Debug)]
pub(crate) enum BufferedUnit {
    /// Consecutive packets of one PID.
    Packets {
        pid: u16,
        packets: VecDeque<Vec<u8>>,
        bytes: usize,
    },
    KeyUpdate(KeyUpdate),
}

/// What was thrown away to bring the queue back under its budget.
#[derive(Debug, Default)]
pub(crate) struct Overflow {
    pub packets: usize,
    pub bytes: usize,
    /// Markers that reached the head while dropping; the caller applies them.
    pub updates: Vec<KeyUpdate>,
}

/// Result of looking ahead for a parity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowScan {
    Corroborated,
    Contradicted,
    Inconclusive,
}

/// FIFO of packets held back while no usable key exists, interleaved with
/// deferred key updates. Only packet bytes count towards the budget.
#[derive(Debug)]
pub(crate) struct PacketQueue {
    units: VecDeque<BufferedUnit>,
    bytes: usize,
    max_bytes: usize,
}

impl PacketQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            units: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn push_packet(&mut self, pid: u16, packet: Vec<u8>) -> Overflow {
        let len = packet.len();
        match self.units.back_mut() {
            Some(BufferedUnit::Packets {
                pid: last,
                packets,
                bytes,
            }) if *last == pid => {
                packets.push_back(packet);
                *bytes += len;
            }
            _ => self.units.push_back(BufferedUnit::Packets {
                pid,
                packets: VecDeque::from([packet]),
                bytes: len,
            }),
        }
        self.bytes += len;
        self.trim()
    }

    pub fn push_update(&mut self, update: KeyUpdate) {
        self.units.push_back(BufferedUnit::KeyUpdate(update));
    }

    /// Drops the oldest packets until the budget holds again.
    fn trim(&mut self) -> Overflow {
        let mut overflow = Overflow::default();
        while self.bytes > self.max_bytes {
            if let Some(update) = self.front_update() {
                overflow.updates.push(update);
                continue;
            }
            match self.pop_packet() {
                Some((_, packet)) => {
                    overflow.packets += 1;
                    overflow.bytes += packet.len();
                }
                None => break,
            }
        }
        // markers now at the head no longer have packets to wait for
        while let Some(BufferedUnit::KeyUpdate(_)) = self.units.front() {
            if let Some(BufferedUnit::KeyUpdate(update)) = self.units.pop_front() {
                overflow.updates.push(update);
            }
        }
        overflow
    }

    pub fn front_update(&mut self) -> Option<KeyUpdate> {
        if matches!(self.units.front(), Some(BufferedUnit::KeyUpdate(_))) {
            if let Some(BufferedUnit::KeyUpdate(update)) = self.units.pop_front() {
                return Some(update);
            }
        }
        None
    }

    pub fn front_packet(&self) -> Option<(u16, &[u8])> {
        match self.units.front()? {
            BufferedUnit::Packets { pid, packets, .. } => packets.front().map(|p| (*pid, p.as_slice())),
            BufferedUnit::KeyUpdate(_) => None,
        }
    }

    pub fn pop_packet(&mut self) -> Option<(u16, Vec<u8>)> {
        let BufferedUnit::Packets { pid, packets, bytes } = self.units.front_mut()? else {
            return None;
        };
        let pid = *pid;
        let packet = packets.pop_front()?;
        *bytes -= packet.len();
        self.bytes -= packet.len();
        if packets.is_empty() {
            self.units.pop_front();
        }
        Some((pid, packet))
    }

    /// Looks from the head for `threshold` bytes of `parity` packets on the
    /// PIDs accepted by `owns`, stopping at the first packet carrying the
    /// other parity.
    pub fn scan_parity(&self, owns: impl Fn(u16) -> bool, parity: Parity, threshold: usize) -> WindowScan {
        let mut seen = 0usize;
        for unit in &self.units {
            let BufferedUnit::Packets { pid, packets, .. } = unit else {
                continue;
            };
            if !owns(*pid) {
                continue;
            }
            for packet in packets {
                match ts::parity(packet) {
                    Some(p) if p == parity => {
                        seen += packet.len();
                        if seen >= threshold {
                            return WindowScan::Corroborated;
                        }
                    }
                    Some(_) => return WindowScan::Contradicted,
                    None => {}
                }
            }
        }
        WindowScan::Inconclusive
    }

    /// Empties the queue, returning buffered packets in order and the
    /// updates encountered on the way.
    pub fn drain(&mut self) -> (Vec<(u16, Vec<u8>)>, Vec<KeyUpdate>) {
        let mut packets_out = Vec::new();
        let mut updates = Vec::new();
        for unit in self.units.drain(..) {
            match unit {
                BufferedUnit::Packets { pid, packets, .. } => {
                    packets_out.extend(packets.into_iter().map(|p| (pid, p)));
                }
                BufferedUnit::KeyUpdate(update) => updates.push(update),
            }
        }
        self.bytes = 0;
        (packets_out, updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::{set_scrambling, test_packet, TS_PACKET_SIZE};

    fn scrambled(pid: u16, parity: Parity) -> Vec<u8> {
        let mut pkt = test_packet(pid, 0);
        set_scrambling(&mut pkt, parity);
        pkt
    }

    fn update(parity: Parity) -> KeyUpdate {
        KeyUpdate {
            slot_pid: 0,
            kind: CipherType::Csa,
            parity,
            key: vec![1; 8],
            received: Instant::now(),
        }
    }

    #[test]
    fn test_runs_group_by_pid() {
        let mut queue = PacketQueue::new(TS_PACKET_SIZE * 10);
        queue.push_packet(0x100, test_packet(0x100, 0));
        queue.push_packet(0x100, test_packet(0x100, 1));
        queue.push_packet(0x101, test_packet(0x101, 2));
        assert_eq!(queue.units.len(), 2);
        assert_eq!(queue.bytes(), TS_PACKET_SIZE * 3);

        let (pid, pkt) = queue.pop_packet().unwrap();
        assert_eq!((pid, pkt[3] & 0x0f), (0x100, 0));
        queue.pop_packet();
        assert_eq!(queue.front_packet().map(|(pid, _)| pid), Some(0x101));
    }

    #[test]
    fn test_overflow_drops_oldest_and_releases_markers() {
        let mut queue = PacketQueue::new(TS_PACKET_SIZE * 3);
        queue.push_packet(0x100, test_packet(0x100, 0));
        queue.push_packet(0x100, test_packet(0x100, 1));
        queue.push_update(update(Parity::Odd));
        queue.push_packet(0x101, test_packet(0x101, 2));

        let overflow = queue.push_packet(0x101, test_packet(0x101, 3));
        assert_eq!(overflow.packets, 1);
        assert!(overflow.updates.is_empty());
        assert_eq!(queue.bytes(), TS_PACKET_SIZE * 3);

        // the run ahead of the marker empties, so the marker is handed back
        let overflow = queue.push_packet(0x101, test_packet(0x101, 4));
        assert_eq!(overflow.packets, 1);
        assert_eq!(overflow.updates.len(), 1);
        assert!(queue.bytes() <= TS_PACKET_SIZE * 3);
        assert_eq!(queue.front_packet().map(|(pid, p)| (pid, p[3] & 0x0f)), Some((0x101, 2)));
    }

    #[test]
    fn test_scan_parity() {
        let mut queue = PacketQueue::new(TS_PACKET_SIZE * 100);
        for _ in 0..3 {
            queue.push_packet(0x100, scrambled(0x100, Parity::Odd));
        }
        let owns = |pid| pid == 0x100;
        assert_eq!(queue.scan_parity(owns, Parity::Odd, TS_PACKET_SIZE * 3), WindowScan::Corroborated);
        assert_eq!(queue.scan_parity(owns, Parity::Odd, TS_PACKET_SIZE * 4), WindowScan::Inconclusive);

        queue.push_packet(0x100, scrambled(0x100, Parity::Even));
        assert_eq!(queue.scan_parity(owns, Parity::Odd, TS_PACKET_SIZE * 4), WindowScan::Contradicted);
        // other PIDs do not count either way
        assert_eq!(
            queue.scan_parity(|pid| pid == 0x200, Parity::Odd, TS_PACKET_SIZE),
            WindowScan::Inconclusive
        );
    }

    #[test]
    fn test_front_update_only_at_head() {
        let mut queue = PacketQueue::new(TS_PACKET_SIZE * 10);
        queue.push_packet(0x100, test_packet(0x100, 0));
        queue.push_update(update(Parity::Even));
        assert!(queue.front_update().is_none());
        queue.pop_packet();
        assert!(queue.front_update().is_some());
        assert!(queue.is_empty());
    }
}
