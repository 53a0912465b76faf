//! Local card-interface backend.
//!
//! Hardware CI modules descramble the transport stream themselves; this
//! backend only tells a module which programmes to work on by sending it
//! CA_PMT objects, and switches the service to pass packets through.

pub mod capmt;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::client::{CaClient, ClientStatus};
use crate::config::DvbcamConfig;
use crate::descrambler::{DescramblerHandle, HandleId, HandleKind, KeyState, Service};

pub use capmt::{CaPmtCommand, ListManagement};

/// A conditional-access module in a CI slot.
#[cfg_attr(test, mockall::automock)]
pub trait CaModule: Send + Sync {
    fn slot(&self) -> u8;

    /// CA systems the module reported in its application info.
    fn caids(&self) -> Vec<u16>;

    fn send_capmt(&self, capmt: &[u8]) -> crate::Result<()>;
}

struct ModuleEntry {
    module: Arc<dyn CaModule>,
    programs: usize,
}

struct ActiveService {
    service: Weak<Service>,
    handle_id: HandleId,
    module: Option<Arc<dyn CaModule>>,
    last_pmt: Option<Vec<u8>>,
}

#[derive(Default)]
struct DvbcamState {
    modules: Vec<ModuleEntry>,
    services: Vec<ActiveService>,
}

/// A CA_PMT to send once the state lock is released.
struct Outgoing {
    module: Arc<dyn CaModule>,
    pmt: Vec<u8>,
    list: ListManagement,
    cmd: CaPmtCommand,
}

pub struct Dvbcam {
    me: Weak<Self>,
    name: String,
    enabled: bool,
    slot: u8,
    allowed: Vec<u16>,
    status: RwLock<ClientStatus>,
    state: Mutex<DvbcamState>,
}

impl Dvbcam {
    pub fn new(config: &DvbcamConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: config.common.name.clone(),
            enabled: config.common.enabled,
            slot: config.slot,
            allowed: config.caids.clone(),
            status: RwLock::new(ClientStatus::None),
            state: Mutex::new(DvbcamState::default()),
        })
    }

    /// Module CA systems this client may use.
    fn usable_caids(&self, module: &dyn CaModule) -> Vec<u16> {
        module
            .caids()
            .into_iter()
            .filter(|caid| self.allowed.contains(caid))
            .collect()
    }

    fn service_caids(service: &Service) -> Vec<u16> {
        let force = service.info().force_caid;
        if force != 0 {
            return vec![force];
        }
        service.ca_descriptors().iter().map(|d| d.caid).collect()
    }

    /// First module that handles one of the service's CA systems.
    fn find_module(&self, state: &DvbcamState, service: &Service) -> Option<usize> {
        let wanted = Self::service_caids(service);
        state.modules.iter().position(|entry| {
            self.usable_caids(entry.module.as_ref())
                .iter()
                .any(|caid| wanted.contains(caid))
        })
    }

    fn update_status(&self, state: &DvbcamState) {
        let status = match (self.enabled, state.modules.is_empty()) {
            (false, _) => ClientStatus::None,
            (true, true) => ClientStatus::Ready,
            (true, false) => ClientStatus::Connected,
        };
        *self.status.write() = status;
    }

    /// Makes a module available. Modules in other slots are ignored.
    pub fn register_module(&self, module: Arc<dyn CaModule>) -> bool {
        if module.slot() != self.slot {
            trace!(client = %self.name, slot = module.slot(), "module in another slot");
            return false;
        }
        info!(client = %self.name, slot = self.slot, caids = ?module.caids(), "CA module registered");
        let mut state = self.state.lock();
        state.modules.push(ModuleEntry { module, programs: 0 });
        self.update_status(&state);
        true
    }

    /// Removes a module; services it served keep their handle but lose the
    /// module until the next PMT.
    pub fn unregister_module(&self, module: &Arc<dyn CaModule>) {
        let mut state = self.state.lock();
        state.modules.retain(|entry| !Arc::ptr_eq(&entry.module, module));
        for active in &mut state.services {
            if active.module.as_ref().is_some_and(|m| Arc::ptr_eq(m, module)) {
                active.module = None;
                active.last_pmt = None;
            }
        }
        self.update_status(&state);
        info!(client = %self.name, slot = self.slot, "CA module removed");
    }

    fn send(&self, out: Outgoing) -> crate::Result<()> {
        let caids = self.usable_caids(out.module.as_ref());
        let capmt = capmt::build(&out.pmt, out.list, out.cmd, &caids)?;
        debug!(client = %self.name, list = ?out.list, cmd = ?out.cmd, len = capmt.len(), "sending CA_PMT");
        out.module.send_capmt(&capmt)
    }

    fn service_stop(&self, handle_id: HandleId) {
        let outgoing = {
            let mut state = self.state.lock();
            let Some(pos) = state.services.iter().position(|a| a.handle_id == handle_id) else {
                return;
            };
            let active = state.services.remove(pos);
            let Some(module) = active.module else {
                return;
            };
            if let Some(entry) = state.modules.iter_mut().find(|e| Arc::ptr_eq(&e.module, &module)) {
                entry.programs = entry.programs.saturating_sub(1);
            }
            active.last_pmt.map(|pmt| Outgoing {
                module,
                pmt,
                list: ListManagement::Update,
                cmd: CaPmtCommand::NotSelected,
            })
        };
        if let Some(out) = outgoing {
            if let Err(e) = self.send(out) {
                warn!(client = %self.name, error = %e, "deselecting programme failed");
            }
        }
    }
}

#[async_trait]
impl CaClient for Dvbcam {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "dvbcam"
    }

    fn status(&self) -> ClientStatus {
        *self.status.read()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn service_start(&self, service: &Arc<Service>) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock();
            state.services.retain(|a| a.service.strong_count() > 0);
            if state
                .services
                .iter()
                .any(|a| std::ptr::eq(a.service.as_ptr(), Arc::as_ptr(service)))
            {
                return;
            }
            if self.find_module(&state, service).is_none() {
                trace!(client = %self.name, service = %service.name(), "no module for service");
                return;
            }
        }
        let name = format!("dvbcam-{}-{}", self.name, self.slot);
        let client = self.me.clone();
        let handle_name = name.clone();
        let Some(handle_id) = service.attach(move |id, _| {
            Arc::new(DvbcamHandle {
                client,
                id,
                name: handle_name,
            })
        }) else {
            return;
        };
        debug!(handle = %name, service = %service.name(), "waiting for PMT");
        self.state.lock().services.push(ActiveService {
            service: Arc::downgrade(service),
            handle_id,
            module: None,
            last_pmt: None,
        });
    }

    fn pmt_data(&self, service: &Arc<Service>, section: &[u8]) {
        let (handle_id, outgoing) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(pos) = state
                .services
                .iter()
                .position(|a| std::ptr::eq(a.service.as_ptr(), Arc::as_ptr(service)))
            else {
                return;
            };
            let update = state.services[pos].last_pmt.is_some();
            let list = if update {
                ListManagement::Update
            } else {
                let Some(index) = self.find_module(state, service) else {
                    trace!(client = %self.name, service = %service.name(), "no module for service");
                    return;
                };
                let entry = &mut state.modules[index];
                let list = if entry.programs == 0 {
                    ListManagement::Only
                } else {
                    ListManagement::Add
                };
                entry.programs += 1;
                state.services[pos].module = Some(entry.module.clone());
                list
            };
            let active = &mut state.services[pos];
            active.last_pmt = Some(section.to_vec());
            let outgoing = active.module.clone().map(|module| Outgoing {
                module,
                pmt: section.to_vec(),
                list,
                cmd: CaPmtCommand::OkDescrambling,
            });
            (active.handle_id, outgoing)
        };
        let Some(out) = outgoing else {
            return;
        };
        service.set_external(true);
        match self.send(out) {
            Ok(()) => {
                service.set_key_state(handle_id, KeyState::Resolved);
            }
            Err(e) => {
                warn!(client = %self.name, service = %service.name(), error = %e, "CA_PMT not delivered");
                service.set_external(false);
                service.set_key_state(handle_id, KeyState::Fatal);
            }
        }
    }

    fn start(&self) {
        let state = self.state.lock();
        self.update_status(&state);
    }

    async fn stop(&self) {
        let attached: Vec<(Weak<Service>, HandleId)> = self
            .state
            .lock()
            .services
            .iter()
            .map(|a| (a.service.clone(), a.handle_id))
            .collect();
        for (service, handle_id) in attached {
            if let Some(service) = service.upgrade() {
                service.detach(handle_id);
                service.set_external(false);
            }
        }
        *self.status.write() = ClientStatus::None;
    }
}

struct DvbcamHandle {
    client: Weak<Dvbcam>,
    id: HandleId,
    name: String,
}

impl DescramblerHandle for DvbcamHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Hardware
    }

    fn stop(&self) {
        if let Some(client) = self.client.upgrade() {
            client.service_stop(self.id);
        }
    }

    // the module keeps descrambling without new keys
    fn ecm_reset(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caid::CaDescriptor;
    use crate::config::ClientCommon;
    use crate::descrambler::test_support::started_service;
    use crate::ts::test_packet;

    type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

    fn config() -> DvbcamConfig {
        DvbcamConfig {
            common: ClientCommon {
                name: "ci".to_string(),
                ..ClientCommon::default()
            },
            slot: 0,
            caids: vec![0x0b00],
        }
    }

    fn module(slot: u8, caids: Vec<u16>, sent: &Sent) -> Arc<dyn CaModule> {
        let mut module = MockCaModule::new();
        module.expect_slot().return_const(slot);
        module.expect_caids().returning(move || caids.clone());
        let sent = sent.clone();
        module.expect_send_capmt().returning(move |capmt| {
            sent.lock().push(capmt.to_vec());
            Ok(())
        });
        Arc::new(module)
    }

    fn conax_service() -> Arc<Service> {
        let service = started_service();
        service.set_ca_descriptors(vec![CaDescriptor {
            caid: 0x0b00,
            provider_id: 0,
            pid: 0x100,
        }]);
        service
    }

    #[tokio::test]
    async fn test_programme_selection_sequence() {
        let sent = Sent::default();
        let client = Dvbcam::new(&config());
        client.start();
        assert_eq!(client.status(), ClientStatus::Ready);
        assert!(client.register_module(module(0, vec![0x0b00, 0x0500], &sent)));
        assert_eq!(client.status(), ClientStatus::Connected);

        let pmt = capmt::tests::pmt_section();
        let first = conax_service();
        client.service_start(&first);
        client.pmt_data(&first, &pmt);
        client.pmt_data(&first, &pmt);

        let second = conax_service();
        client.service_start(&second);
        client.pmt_data(&second, &pmt);

        first.stop_descrambling();

        let sent = sent.lock();
        let heads: Vec<(u8, u8)> = sent.iter().map(|c| (c[0], c[6])).collect();
        assert_eq!(
            heads,
            vec![
                (ListManagement::Only as u8, CaPmtCommand::OkDescrambling as u8),
                (ListManagement::Update as u8, CaPmtCommand::OkDescrambling as u8),
                (ListManagement::Add as u8, CaPmtCommand::OkDescrambling as u8),
                (ListManagement::Update as u8, CaPmtCommand::NotSelected as u8),
            ]
        );
        // Viaccess is not allowed by the configuration
        assert!(!sent[0].windows(2).any(|w| w == [0x05, 0x00]));
    }

    #[tokio::test]
    async fn test_service_passes_packets_through() {
        let sent = Sent::default();
        let client = Dvbcam::new(&config());
        client.register_module(module(0, vec![0x0b00], &sent));
        let service = conax_service();
        client.service_start(&service);
        assert_eq!(service.handle_states()[0].1, KeyState::Ready);

        client.pmt_data(&service, &capmt::tests::pmt_section());
        assert_eq!(service.handle_states()[0].1, KeyState::Resolved);

        let mut packet = test_packet(0x200, 0);
        crate::ts::set_scrambling(&mut packet, crate::ts::Parity::Even);
        let mut out = Vec::new();
        service.descramble(0x200, &packet, |p| out.push(p.to_vec()));
        assert_eq!(out, vec![packet]);

        client.stop().await;
        assert!(service.handle_states().is_empty());
        assert_eq!(sent.lock().last().map(|c| c[6]), Some(CaPmtCommand::NotSelected as u8));
    }

    #[test]
    fn test_modules_without_service_caid_are_skipped() {
        let sent = Sent::default();
        let client = Dvbcam::new(&config());
        assert!(!client.register_module(module(1, vec![0x0b00], &sent)));
        client.register_module(module(0, vec![0x0500], &sent));

        let service = conax_service();
        client.service_start(&service);
        assert!(service.handle_states().is_empty());
        client.pmt_data(&service, &capmt::tests::pmt_section());
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_failed_send_marks_handle_fatal() {
        let mut failing = MockCaModule::new();
        failing.expect_slot().return_const(0u8);
        failing.expect_caids().returning(|| vec![0x0b00]);
        failing
            .expect_send_capmt()
            .times(1)
            .returning(|_| Err(crate::Error::invalid_input("slot busy")));

        let client = Dvbcam::new(&config());
        client.register_module(Arc::new(failing));
        let service = conax_service();
        client.service_start(&service);
        client.pmt_data(&service, &capmt::tests::pmt_section());
        assert_eq!(service.handle_states()[0].1, KeyState::Fatal);
        assert!(service.no_access());
    }
}
