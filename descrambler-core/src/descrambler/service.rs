use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::handle::{DescramblerHandle, HandleId, HandleKind};
use super::runtime::{Runtime, RuntimeSettings, Stats};
use super::{KeyState, Outcome, PreferredCaPid};
use crate::caid::{self, CaDescriptor};
use crate::cipher::CipherType;
use crate::config::{DescramblerConfig, EcmParity};
use crate::manager::ClientManager;
use crate::ts::{self, Parity};

/// Identity of a service as seen by the backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub sid: u16,
    pub tsid: u16,
    /// Multiplex the service is received on.
    pub mux_id: u32,
    pub name: String,
    /// CA system forced by the user regardless of the PMT, 0 for none.
    pub force_caid: u16,
}

/// Result of [`Service::deliver_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDelivery {
    Installed,
    /// Another handle already resolved; the keys were not installed.
    Demoted,
    Rejected,
    /// The handle is not attached or the service is not descrambling.
    Detached,
}

struct HandleSlot {
    id: HandleId,
    name: String,
    kind: HandleKind,
    state: KeyState,
    handle: Arc<dyn DescramblerHandle>,
}

#[derive(Default)]
struct ServiceState {
    runtime: Option<Runtime>,
    handles: Vec<HandleSlot>,
    /// Checksum of the last ECM seen per PID.
    last_ecm: HashMap<u16, u32>,
}

impl ServiceState {
    fn no_access(&self) -> bool {
        self.handles.iter().all(|h| !h.state.is_usable())
    }
}

/// A programme under descrambling.
pub struct Service {
    info: ServiceInfo,
    settings: RuntimeSettings,
    ecm_parity: EcmParity,
    state: Mutex<ServiceState>,
    ca: RwLock<Vec<CaDescriptor>>,
    preferred: Mutex<PreferredCaPid>,
    no_access: AtomicBool,
    next_handle: AtomicU64,
}

impl Service {
    pub fn new(info: ServiceInfo, config: &DescramblerConfig) -> Arc<Self> {
        Arc::new(Self {
            info,
            settings: RuntimeSettings::from(config),
            ecm_parity: config.ecm_parity,
            state: Mutex::new(ServiceState::default()),
            ca: RwLock::new(Vec::new()),
            preferred: Mutex::new(PreferredCaPid::default()),
            no_access: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn ca_descriptors(&self) -> Vec<CaDescriptor> {
        self.ca.read().clone()
    }

    /// Replaces the CA descriptor list, telling every handle when it changed.
    pub fn set_ca_descriptors(&self, descriptors: Vec<CaDescriptor>) {
        {
            let mut ca = self.ca.write();
            if *ca == descriptors {
                return;
            }
            *ca = descriptors;
        }
        for handle in self.handles() {
            handle.caid_changed();
        }
    }

    /// Takes the CA descriptors from a raw PMT descriptor loop.
    pub fn update_pmt_descriptors(&self, data: &[u8]) {
        self.set_ca_descriptors(caid::ca_descriptors(data));
    }

    pub fn preferred_ca_pid(&self) -> PreferredCaPid {
        *self.preferred.lock()
    }

    pub fn set_preferred_ca_pid(&self, preferred: PreferredCaPid) {
        *self.preferred.lock() = preferred;
    }

    pub fn is_descrambling(&self) -> bool {
        self.state.lock().runtime.is_some()
    }

    /// Set while no attached handle can still supply a key.
    pub fn no_access(&self) -> bool {
        self.no_access.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Stats {
        self.state
            .lock()
            .runtime
            .as_ref()
            .map(Runtime::stats)
            .unwrap_or_default()
    }

    /// Creates the runtime and lets every enabled backend attach.
    pub fn start_descrambling(self: &Arc<Self>, manager: &ClientManager) {
        if !self.start_runtime() {
            return;
        }
        info!(service = %self.info.name, sid = self.info.sid, "descrambling started");
        manager.service_start(self);
    }

    pub(crate) fn start_runtime(&self) -> bool {
        let mut state = self.state.lock();
        if state.runtime.is_some() {
            return false;
        }
        state.runtime = Some(Runtime::new(self.settings.clone(), Instant::now()));
        true
    }

    /// Stops every handle, discards buffered packets and zeroes the keys.
    pub fn stop_descrambling(&self) {
        let handles = {
            let mut state = self.state.lock();
            if let Some(mut runtime) = state.runtime.take() {
                runtime.shutdown();
            }
            state.last_ecm.clear();
            std::mem::take(&mut state.handles)
        };
        self.no_access.store(false, Ordering::Relaxed);
        if !handles.is_empty() {
            info!(service = %self.info.name, handles = handles.len(), "descrambling stopped");
        }
        for slot in handles {
            slot.handle.stop();
        }
    }

    /// Attaches a handle built by `make`, which receives the handle's id and a
    /// weak reference back to this service. Returns `None` when the service
    /// is not descrambling.
    pub fn attach<F>(self: &Arc<Self>, make: F) -> Option<HandleId>
    where
        F: FnOnce(HandleId, Weak<Service>) -> Arc<dyn DescramblerHandle>,
    {
        if !self.is_descrambling() {
            return None;
        }
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let handle = make(id, Arc::downgrade(self));
        let slot = HandleSlot {
            id,
            name: handle.name().to_string(),
            kind: handle.kind(),
            state: KeyState::Ready,
            handle: handle.clone(),
        };
        {
            let mut state = self.state.lock();
            if state.runtime.is_none() {
                return None;
            }
            debug!(service = %self.info.name, handle = %slot.name, %id, "handle attached");
            state.handles.push(slot);
            self.update_access(&state);
        }
        handle.start();
        Some(id)
    }

    /// Removes one handle, e.g. when its backend is disabled.
    pub fn detach(&self, id: HandleId) {
        let removed = {
            let mut state = self.state.lock();
            let pos = state.handles.iter().position(|h| h.id == id);
            let removed = pos.map(|pos| state.handles.remove(pos));
            self.update_access(&state);
            removed
        };
        if let Some(slot) = removed {
            slot.handle.stop();
        }
    }

    pub fn key_state(&self, id: HandleId) -> Option<KeyState> {
        self.state.lock().handles.iter().find(|h| h.id == id).map(|h| h.state)
    }

    /// Name and key state of every attached handle, in attach order.
    pub fn handle_states(&self) -> Vec<(String, KeyState)> {
        self.state
            .lock()
            .handles
            .iter()
            .map(|h| (h.name.clone(), h.state))
            .collect()
    }

    /// Whether a handle other than `id` currently supplies the keys.
    pub fn resolved_by_other(&self, id: HandleId) -> bool {
        self.state
            .lock()
            .handles
            .iter()
            .any(|h| h.id != id && h.state == KeyState::Resolved)
    }

    /// Moves a handle to `new_state`. A handle cannot become resolved while a
    /// sibling is; it is parked in `Idle` instead. Returns the state reached.
    pub fn set_key_state(&self, id: HandleId, new_state: KeyState) -> Option<KeyState> {
        let mut demoted = None;
        let reached = {
            let mut state = self.state.lock();
            let other_resolved = state
                .handles
                .iter()
                .any(|h| h.id != id && h.state == KeyState::Resolved);
            let slot = state.handles.iter_mut().find(|h| h.id == id)?;
            let target = if new_state == KeyState::Resolved && other_resolved {
                demoted = Some(slot.handle.clone());
                KeyState::Idle
            } else {
                new_state
            };
            if slot.state != target {
                debug!(service = %self.info.name, handle = %slot.name, from = %slot.state, to = %target, "key state");
                slot.state = target;
            }
            self.update_access(&state);
            target
        };
        if let Some(handle) = demoted {
            handle.ecm_idle();
        }
        Some(reached)
    }

    /// Installs keys from handle `id`. `pid` selects a per-stream key slot,
    /// 0 the service-wide one. All-zero halves are ignored.
    pub fn deliver_keys(
        &self,
        id: HandleId,
        kind: CipherType,
        pid: u16,
        even: Option<&[u8]>,
        odd: Option<&[u8]>,
    ) -> KeyDelivery {
        let now = Instant::now();
        let mut demoted = None;
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(runtime) = state.runtime.as_mut() else {
                return KeyDelivery::Detached;
            };
            let Some(pos) = state.handles.iter().position(|h| h.id == id) else {
                return KeyDelivery::Detached;
            };
            let other_resolved = state
                .handles
                .iter()
                .any(|h| h.id != id && h.state == KeyState::Resolved);
            let slot = &mut state.handles[pos];

            if other_resolved {
                debug!(service = %self.info.name, handle = %slot.name, "another handle already resolved, going idle");
                slot.state = KeyState::Idle;
                demoted = Some(slot.handle.clone());
                KeyDelivery::Demoted
            } else {
                let constant = slot.kind == HandleKind::FixedKey;
                match runtime.install(pid, kind, even, odd, constant, now) {
                    Ok(changed) => {
                        if slot.state != KeyState::Resolved {
                            info!(service = %self.info.name, handle = %slot.name, cipher = %kind, "keys resolved");
                            slot.state = KeyState::Resolved;
                        }
                        debug!(service = %self.info.name, handle = %slot.name, pid, changed, "keys delivered");
                        KeyDelivery::Installed
                    }
                    Err(e) => {
                        warn!(service = %self.info.name, handle = %slot.name, error = %e, "rejecting keys");
                        KeyDelivery::Rejected
                    }
                }
            }
        };
        self.update_access(&self.state.lock());
        if let Some(handle) = demoted {
            handle.ecm_idle();
        }
        result
    }

    /// Maps an ECM table id to the key parity it announces.
    fn ecm_table_parity(&self, table_id: u8) -> Option<Parity> {
        let parity = match table_id {
            0x80 => Parity::Even,
            0x81 => Parity::Odd,
            _ => return None,
        };
        Some(match self.ecm_parity {
            EcmParity::Standard => parity,
            EcmParity::Inverted => parity.other(),
        })
    }

    /// Feeds an ECM section to every handle. A change of content starts the
    /// key request window for the announced parity.
    pub fn ecm_input(&self, pid: u16, data: &[u8]) {
        let Some(&table_id) = data.first() else {
            return;
        };
        let handles = {
            let mut state = self.state.lock();
            if state.runtime.is_none() {
                return;
            }
            let crc = ts::section_crc(data);
            let changed = state.last_ecm.insert(pid, crc) != Some(crc);
            if changed {
                if let (Some(parity), Some(runtime)) = (self.ecm_table_parity(table_id), state.runtime.as_mut()) {
                    runtime.ecm_started(parity, Instant::now());
                }
            }
            state.handles.iter().map(|h| h.handle.clone()).collect::<Vec<_>>()
        };
        for handle in handles {
            handle.ecm_input(pid, data);
        }
    }

    /// Descrambles one transport packet, writing output packets to `sink`
    /// in arrival order.
    pub fn descramble<F>(&self, pid: u16, packet: &[u8], mut sink: F) -> Outcome
    where
        F: FnMut(&[u8]),
    {
        let (outcome, reset) = {
            let mut state = self.state.lock();
            let no_access = state.no_access();
            let Some(runtime) = state.runtime.as_mut() else {
                return Outcome::Fatal;
            };
            let outcome = runtime.descramble(pid, packet, Instant::now(), no_access, &mut sink);
            (outcome, runtime.take_reset())
        };
        if reset {
            self.reset_ecm();
        }
        outcome
    }

    /// Hands packets straight through; a hardware module descrambles them.
    pub fn set_external(&self, external: bool) {
        if let Some(runtime) = self.state.lock().runtime.as_mut() {
            runtime.set_external(external);
        }
    }

    /// Asks every handle to request keys again.
    pub fn reset_ecm(&self) {
        let handles = {
            let mut state = self.state.lock();
            for slot in state.handles.iter_mut().filter(|h| h.state != KeyState::Fatal) {
                slot.state = KeyState::Ready;
            }
            state.last_ecm.clear();
            self.update_access(&state);
            state.handles.iter().map(|h| h.handle.clone()).collect::<Vec<_>>()
        };
        debug!(service = %self.info.name, handles = handles.len(), "ECM reset");
        for handle in handles {
            handle.ecm_reset();
        }
    }

    fn handles(&self) -> Vec<Arc<dyn DescramblerHandle>> {
        self.state.lock().handles.iter().map(|h| h.handle.clone()).collect()
    }

    fn update_access(&self, state: &ServiceState) {
        let no_access = state.runtime.is_some() && state.no_access();
        if self.no_access.swap(no_access, Ordering::Relaxed) != no_access {
            if no_access {
                warn!(service = %self.info.name, "no access: no backend can descramble this service");
            } else {
                info!(service = %self.info.name, "access restored");
            }
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("info", &self.info)
            .field("no_access", &self.no_access())
            .finish_non_exhaustive()
    }
}
