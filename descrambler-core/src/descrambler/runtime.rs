use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::key::{is_zero_key, KeySlot};
use super::queue::{KeyUpdate, Overflow, PacketQueue, WindowScan};
use super::Outcome;
use crate::cipher::{CipherError, CipherType};
use crate::config::{DescramblerConfig, SkipPolicy};
use crate::ts::{self, Parity};

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub queue_max_bytes: usize,
    pub parity_check_bytes: usize,
    pub key_margin: Duration,
    pub default_interval: Duration,
    pub no_key_timeout: Duration,
    pub skip_policy: SkipPolicy,
}

impl From<&DescramblerConfig> for RuntimeSettings {
    fn from(config: &DescramblerConfig) -> Self {
        Self {
            queue_max_bytes: config.queue_max_bytes,
            parity_check_bytes: config.parity_check_bytes,
            key_margin: config.key_margin(),
            default_interval: config.default_key_interval(),
            no_key_timeout: config.no_key_timeout(),
            skip_policy: config.skip_policy,
        }
    }
}

/// Counters exposed per service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub key_changes: u64,
    pub decrypted: u64,
    pub passed: u64,
    pub dropped: u64,
    pub buffered_bytes: usize,
    /// Time between the last two committed parity switches.
    pub key_interval: Option<Duration>,
}

fn slot_index(slots: &[KeySlot], pid: u16) -> Option<usize> {
    slots
        .iter()
        .position(|s| s.pid == pid)
        .or_else(|| slots.iter().position(|s| s.pid == 0))
}

/// A key half is late when an ECM for its parity changed after it was
/// installed and no answer arrived within the margin, or when its sibling was
/// refreshed well after it without such a request being seen.
fn key_late(slot: &KeySlot, parity: Parity, ecm_start: Option<Instant>, now: Instant, margin: Duration) -> bool {
    if !slot.is_valid(parity) {
        return false;
    }
    let Some(installed) = slot.timestamp[parity.index()] else {
        return false;
    };
    if let Some(start) = ecm_start.filter(|start| *start > installed) {
        return now.saturating_duration_since(start) > margin;
    }
    match slot.timestamp[parity.other().index()] {
        Some(sibling) if slot.is_valid(parity.other()) => sibling > installed + margin,
        _ => false,
    }
}

/// Key slots, the packet queue and timing state for one service. All methods
/// take the current time so the state machine stays deterministic.
pub(crate) struct Runtime {
    settings: RuntimeSettings,
    slots: Vec<KeySlot>,
    queue: PacketQueue,
    external: bool,
    last_progress: Instant,
    ecm_start: [Option<Instant>; 2],
    reset_pending: bool,
    stats: Stats,
    overflow_warnings: DefaultDirectRateLimiter,
}

impl Runtime {
    pub fn new(settings: RuntimeSettings, now: Instant) -> Self {
        let quota = Quota::per_minute(nonzero!(6u32)).allow_burst(nonzero!(1u32));
        Self {
            queue: PacketQueue::new(settings.queue_max_bytes),
            settings,
            slots: Vec::new(),
            external: false,
            last_progress: now,
            ecm_start: [None; 2],
            reset_pending: false,
            stats: Stats::default(),
            overflow_warnings: RateLimiter::direct(quota),
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            buffered_bytes: self.queue.bytes(),
            ..self.stats
        }
    }

    pub fn set_external(&mut self, external: bool) {
        self.external = external;
    }

    pub fn has_key(&self) -> bool {
        self.slots.iter().any(KeySlot::any_valid)
    }

    /// Returns and clears the request to reset every handle's ECM state.
    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_pending)
    }

    /// A new ECM for `parity` was seen; its key is due soon.
    pub fn ecm_started(&mut self, parity: Parity, now: Instant) {
        self.ecm_start[parity.index()] = Some(now);
    }

    /// Installs a key pair. A valid half that changes while packets are still
    /// buffered is queued behind them instead.
    pub fn install(
        &mut self,
        pid: u16,
        kind: CipherType,
        even: Option<&[u8]>,
        odd: Option<&[u8]>,
        constant: bool,
        now: Instant,
    ) -> Result<usize, CipherError> {
        for key in [even, odd].into_iter().flatten() {
            if key.len() != kind.key_size() {
                return Err(CipherError::KeyLength {
                    expected: kind.key_size(),
                    actual: key.len(),
                });
            }
        }

        let idx = match self.slots.iter().position(|s| s.pid == pid) {
            Some(idx) => idx,
            None => {
                self.slots.push(KeySlot::new(pid, kind, self.settings.default_interval));
                self.slots.len() - 1
            }
        };
        if self.slots[idx].kind() != kind {
            debug!(pid, from = %self.slots[idx].kind(), to = %kind, "cipher type changed");
            self.slots[idx].reset_kind(kind);
        }
        self.slots[idx].constant = constant;

        let mut changed = 0;
        for (parity, key) in [(Parity::Even, even), (Parity::Odd, odd)] {
            let Some(key) = key.filter(|k| !is_zero_key(k)) else {
                continue;
            };
            let slot = &mut self.slots[idx];
            if slot.is_valid(parity) && slot.same_key(parity, key) {
                continue;
            }
            if slot.is_valid(parity) && !self.queue.is_empty() {
                trace!(pid, ?parity, "key update queued behind buffered packets");
                self.queue.push_update(KeyUpdate {
                    slot_pid: pid,
                    kind,
                    parity,
                    key: key.to_vec(),
                    received: now,
                });
            } else {
                slot.install(parity, key, now)?;
            }
            changed += 1;
        }
        self.stats.key_changes += changed as u64;
        self.last_progress = now;
        Ok(changed)
    }

    fn apply_update(&mut self, update: KeyUpdate) {
        let Some(slot) = self.slots.iter_mut().find(|s| s.pid == update.slot_pid) else {
            return;
        };
        if slot.kind() != update.kind {
            slot.reset_kind(update.kind);
        }
        if let Err(e) = slot.install(update.parity, &update.key, update.received) {
            warn!(pid = update.slot_pid, error = %e, "dropping queued key update");
        }
    }

    fn handle_overflow(&mut self, overflow: Overflow) {
        if overflow.packets > 0 {
            self.stats.dropped += overflow.packets as u64;
            if self.overflow_warnings.check().is_ok() {
                warn!(
                    dropped_packets = overflow.packets,
                    dropped_bytes = overflow.bytes,
                    budget = self.settings.queue_max_bytes,
                    "descrambler queue full, dropped oldest buffered packets"
                );
            }
        }
        for update in overflow.updates {
            self.apply_update(update);
        }
    }

    pub fn descramble(
        &mut self,
        pid: u16,
        packet: &[u8],
        now: Instant,
        no_access: bool,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Outcome {
        if self.external {
            self.stats.passed += 1;
            sink(packet);
            return Outcome::Consumed;
        }
        if no_access {
            self.release_queue(sink);
            return self.skip(packet, sink);
        }
        if self.queue.is_empty() {
            if let Some(outcome) = self.decrypt_direct(pid, packet, now, sink) {
                return outcome;
            }
        }

        let overflow = self.queue.push_packet(pid, packet.to_vec());
        self.handle_overflow(overflow);
        self.flush(now, sink);

        if self.queue.is_empty() {
            return Outcome::Consumed;
        }
        if now.saturating_duration_since(self.last_progress) > self.settings.no_key_timeout {
            warn!(
                buffered_bytes = self.queue.bytes(),
                "no usable key for too long, requesting ECM reset"
            );
            self.reset_pending = true;
            self.last_progress = now;
        }
        Outcome::Buffered
    }

    fn skip(&mut self, packet: &[u8], sink: &mut dyn FnMut(&[u8])) -> Outcome {
        if !ts::is_scrambled(packet) || self.settings.skip_policy == SkipPolicy::PassThrough {
            self.stats.passed += 1;
            sink(packet);
            Outcome::Consumed
        } else {
            self.stats.dropped += 1;
            Outcome::Dropped
        }
    }

    /// Flushes the queue according to the skip policy.
    fn release_queue(&mut self, sink: &mut dyn FnMut(&[u8])) {
        if self.queue.is_empty() {
            return;
        }
        let (packets, updates) = self.queue.drain();
        for update in updates {
            self.apply_update(update);
        }
        for (_, packet) in packets {
            self.skip(&packet, sink);
        }
    }

    /// Handles a packet without queueing when its parity's key is already
    /// committed and valid.
    fn decrypt_direct(
        &mut self,
        pid: u16,
        packet: &[u8],
        now: Instant,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Option<Outcome> {
        let Some(parity) = ts::parity(packet) else {
            self.stats.passed += 1;
            sink(packet);
            return Some(Outcome::Consumed);
        };
        let idx = slot_index(&self.slots, pid)?;
        let active = self.slots[idx].active;
        match active {
            Some(active) if active == parity && self.slots[idx].is_valid(parity) => {}
            None if self.slots[idx].is_valid(parity) => self.commit(idx, parity, now, false),
            _ => return None,
        }
        let mut out = packet.to_vec();
        self.slots[idx].decrypt(&mut out);
        self.stats.decrypted += 1;
        self.last_progress = now;
        sink(&out);
        Some(Outcome::Consumed)
    }

    /// Emits queued packets in order until one cannot be handled yet.
    fn flush(&mut self, now: Instant, sink: &mut dyn FnMut(&[u8])) {
        loop {
            if let Some(update) = self.queue.front_update() {
                self.apply_update(update);
                continue;
            }
            let Some((pid, parity)) = self.queue.front_packet().map(|(pid, p)| (pid, ts::parity(p))) else {
                break;
            };
            let Some(parity) = parity else {
                if let Some((_, packet)) = self.queue.pop_packet() {
                    self.stats.passed += 1;
                    sink(&packet);
                }
                continue;
            };
            let Some(idx) = slot_index(&self.slots, pid) else {
                break;
            };

            let active = self.slots[idx].active;
            match active {
                Some(active) if active == parity => {
                    if !self.slots[idx].is_valid(parity) {
                        break;
                    }
                }
                None => {
                    if !self.slots[idx].is_valid(parity) {
                        break;
                    }
                    self.commit(idx, parity, now, false);
                }
                Some(_) => {
                    let slots = &self.slots;
                    let scan = self.queue.scan_parity(
                        |p| slot_index(slots, p) == Some(idx),
                        parity,
                        self.settings.parity_check_bytes,
                    );
                    match scan {
                        WindowScan::Inconclusive => break,
                        WindowScan::Contradicted => {
                            self.drop_lone_packet(idx, parity, now, sink);
                            continue;
                        }
                        WindowScan::Corroborated => {
                            self.commit(idx, parity, now, true);
                            if !self.slots[idx].is_valid(parity) {
                                break;
                            }
                        }
                    }
                }
            }

            let Some((_, mut packet)) = self.queue.pop_packet() else {
                break;
            };
            self.slots[idx].decrypt(&mut packet);
            self.stats.decrypted += 1;
            self.last_progress = now;
            sink(&packet);
        }
    }

    /// A packet whose parity flip is not backed by its successors. It is
    /// decrypted with its own half when that is valid, otherwise discarded.
    fn drop_lone_packet(&mut self, idx: usize, parity: Parity, now: Instant, sink: &mut dyn FnMut(&[u8])) {
        let Some((pid, mut packet)) = self.queue.pop_packet() else {
            return;
        };
        if self.slots[idx].is_valid(parity) {
            self.slots[idx].decrypt(&mut packet);
            self.stats.decrypted += 1;
            self.last_progress = now;
            sink(&packet);
        } else {
            debug!(pid, ?parity, "dropping packet with unconfirmed parity change");
            self.stats.dropped += 1;
        }
    }

    fn commit(&mut self, idx: usize, parity: Parity, now: Instant, check_late: bool) {
        let margin = self.settings.key_margin;
        let ecm_start = self.ecm_start[parity.index()];
        let slot = &mut self.slots[idx];
        if let Some(last) = slot.last_switch {
            let observed = now.saturating_duration_since(last);
            if !observed.is_zero() {
                slot.interval = observed;
                self.stats.key_interval = Some(observed);
            }
        }
        slot.last_switch = Some(now);
        slot.active = Some(parity);
        trace!(pid = slot.pid, ?parity, "parity switch committed");

        if check_late && !slot.constant && key_late(slot, parity, ecm_start, now, margin) {
            warn!(pid = slot.pid, ?parity, "key is late, invalidating and requesting ECM reset");
            slot.invalidate(parity);
            self.reset_pending = true;
        }
    }

    /// Discards buffered packets and zeroes every key.
    pub fn shutdown(&mut self) {
        let (packets, _) = self.queue.drain();
        if !packets.is_empty() {
            debug!(discarded = packets.len(), "discarding buffered packets");
        }
        self.slots.clear();
    }
}
