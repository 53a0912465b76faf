//! Card-access client manager.
//!
//! Owns the ordered list of configured backends, starts and stops them,
//! offers descrambling services to each and forwards CA table and EMM
//! updates. It holds no key material itself.

mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cccam::Cccam;
use crate::client::{CaClient, ClientStatus};
use crate::config::{ClientConfig, Config};
use crate::constcw::Constcw;
use crate::descrambler::Service;
use crate::dvbcam::{CaModule, Dvbcam};
use crate::newcamd::Newcamd;
use crate::{Error, Result};

pub use store::{JsonFileStore, MemoryStore, SettingsStore};

/// Display row for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub status: ClientStatus,
    pub comment: String,
}

#[derive(Clone)]
struct ClientEntry {
    config: ClientConfig,
    client: Arc<dyn CaClient>,
    dvbcam: Option<Arc<Dvbcam>>,
}

impl ClientEntry {
    fn build(config: ClientConfig) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(Error::invalid_input(errors.join("; ")));
        }
        let mut dvbcam = None;
        let client: Arc<dyn CaClient> = match &config {
            ClientConfig::Newcamd(c) => Newcamd::client(c)?,
            ClientConfig::Cccam(c) => Cccam::client(c)?,
            ClientConfig::Constcw(c) => Constcw::new(c)?,
            ClientConfig::Dvbcam(c) => {
                let client = Dvbcam::new(c);
                dvbcam = Some(client.clone());
                client
            }
        };
        Ok(Self { config, client, dvbcam })
    }
}

pub struct ClientManager {
    clients: RwLock<Vec<ClientEntry>>,
    /// Services currently descrambling, keyed by address.
    services: DashMap<usize, Weak<Service>>,
    modules: RwLock<Vec<Arc<dyn CaModule>>>,
    store: Option<Arc<dyn SettingsStore>>,
    running: AtomicBool,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            services: DashMap::new(),
            modules: RwLock::new(Vec::new()),
            store: None,
            running: AtomicBool::new(false),
        }
    }

    /// Builds every configured client. Nothing is started yet.
    pub fn from_config(config: &Config) -> Result<Self> {
        let manager = Self::new();
        manager.load_clients(config.clients.clone())?;
        Ok(manager)
    }

    /// Builds the clients kept in `store`; changes are saved back to it.
    pub fn with_store(store: Arc<dyn SettingsStore>) -> Result<Self> {
        let clients = store.load()?;
        let mut manager = Self::new();
        manager.load_clients(clients)?;
        manager.store = Some(store);
        Ok(manager)
    }

    fn load_clients(&self, configs: Vec<ClientConfig>) -> Result<()> {
        let mut clients = self.clients.write();
        for config in configs {
            if clients.iter().any(|e| e.config.name() == config.name()) {
                return Err(Error::invalid_input(format!("{}: duplicate client name", config.name())));
            }
            clients.push(ClientEntry::build(config)?);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let configs: Vec<ClientConfig> = self.clients.read().iter().map(|e| e.config.clone()).collect();
        store.save(&configs)
    }

    fn client(&self, name: &str) -> Option<Arc<dyn CaClient>> {
        self.clients
            .read()
            .iter()
            .find(|e| e.config.name() == name)
            .map(|e| e.client.clone())
    }

    fn enabled_clients(&self) -> Vec<Arc<dyn CaClient>> {
        self.clients
            .read()
            .iter()
            .filter(|e| e.client.enabled())
            .map(|e| e.client.clone())
            .collect()
    }

    fn live_services(&self) -> Vec<Arc<Service>> {
        self.services.retain(|_, service| service.strong_count() > 0);
        self.services.iter().filter_map(|s| s.value().upgrade()).collect()
    }

    /// Brings a freshly built client up to the manager's state.
    fn activate(&self, entry: &ClientEntry) {
        if let Some(dvbcam) = &entry.dvbcam {
            for module in self.modules.read().iter() {
                dvbcam.register_module(module.clone());
            }
        }
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        entry.client.start();
        if entry.client.enabled() {
            for service in self.live_services() {
                entry.client.service_start(&service);
            }
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients = self.clients.read();
        for entry in clients.iter() {
            entry.client.start();
        }
        info!(clients = clients.len(), "client manager started");
    }

    /// Stops every client, detaching it from all services.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let clients: Vec<Arc<dyn CaClient>> = self.clients.read().iter().map(|e| e.client.clone()).collect();
        for client in clients {
            client.stop().await;
        }
        info!("client manager stopped");
    }

    /// Appends a client at the end of the list.
    pub fn add_client(&self, config: ClientConfig) -> Result<()> {
        let entry = ClientEntry::build(config)?;
        {
            let mut clients = self.clients.write();
            if clients.iter().any(|e| e.config.name() == entry.config.name()) {
                return Err(Error::invalid_input(format!("{}: duplicate client name", entry.config.name())));
            }
            clients.push(entry.clone());
        }
        info!(client = %entry.config.name(), kind = entry.config.kind(), "client added");
        self.activate(&entry);
        self.persist()
    }

    /// Replaces the configuration of the client with the same name. The old
    /// instance is stopped and a new one takes its place in the list.
    pub async fn update_client(&self, config: ClientConfig) -> Result<()> {
        let entry = ClientEntry::build(config)?;
        let old = {
            let mut clients = self.clients.write();
            let slot = clients
                .iter_mut()
                .find(|e| e.config.name() == entry.config.name())
                .ok_or_else(|| Error::not_found(format!("client {}", entry.config.name())))?;
            std::mem::replace(slot, entry.clone())
        };
        old.client.stop().await;
        info!(client = %entry.config.name(), enabled = entry.config.enabled(), "client reconfigured");
        self.activate(&entry);
        self.persist()
    }

    pub async fn remove_client(&self, name: &str) -> Result<()> {
        let removed = {
            let mut clients = self.clients.write();
            let pos = clients
                .iter()
                .position(|e| e.config.name() == name)
                .ok_or_else(|| Error::not_found(format!("client {name}")))?;
            clients.remove(pos)
        };
        removed.client.stop().await;
        info!(client = %name, "client removed");
        self.persist()
    }

    /// Drops the client's connection and reconnects at once.
    pub fn reconnect(&self, name: &str) -> Result<()> {
        let client = self.client(name).ok_or_else(|| Error::not_found(format!("client {name}")))?;
        client.reconfigure();
        Ok(())
    }

    pub fn client_configs(&self) -> Vec<ClientConfig> {
        self.clients.read().iter().map(|e| e.config.clone()).collect()
    }

    pub fn status(&self, name: &str) -> Option<ClientStatus> {
        self.client(name).map(|c| c.status())
    }

    /// Status of every backend, in list order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .iter()
            .map(|e| ClientInfo {
                name: e.config.name().to_string(),
                kind: e.client.kind(),
                enabled: e.client.enabled(),
                status: e.client.status(),
                comment: e.config.common().comment.clone(),
            })
            .collect()
    }

    /// Offers a service that started descrambling to every enabled client.
    pub fn service_start(&self, service: &Arc<Service>) {
        self.services
            .insert(Arc::as_ptr(service) as usize, Arc::downgrade(service));
        let clients = self.enabled_clients();
        debug!(service = %service.name(), clients = clients.len(), "offering service");
        for client in clients {
            client.service_start(service);
        }
    }

    pub fn service_stop(&self, service: &Arc<Service>) {
        self.services.remove(&(Arc::as_ptr(service) as usize));
        service.stop_descrambling();
    }

    /// A CA system appeared or disappeared on a multiplex's CAT.
    pub fn caid_update(&self, mux: u32, caid: u16, pid: u16, valid: bool) {
        for client in self.enabled_clients() {
            client.caid_update(mux, caid, pid, valid);
        }
    }

    pub fn emm_input(&self, mux: u32, caid: u16, data: &[u8]) {
        for client in self.enabled_clients() {
            client.emm_input(mux, caid, data);
        }
    }

    /// Takes a PMT section of a descrambling service: refreshes its CA
    /// descriptors and passes the section to every client.
    pub fn pmt_data(&self, service: &Arc<Service>, section: &[u8]) {
        if let Some(descriptors) = pmt_ca_descriptors(section) {
            service.set_ca_descriptors(descriptors);
        } else {
            warn!(service = %service.name(), len = section.len(), "malformed PMT section");
            return;
        }
        for client in self.enabled_clients() {
            client.pmt_data(service, section);
        }
    }

    /// A CI module became available.
    pub fn register_ca_module(&self, module: Arc<dyn CaModule>) {
        self.modules.write().push(module.clone());
        let dvbcams: Vec<Arc<Dvbcam>> = self.clients.read().iter().filter_map(|e| e.dvbcam.clone()).collect();
        for dvbcam in dvbcams {
            if dvbcam.register_module(module.clone()) && self.running.load(Ordering::Acquire) {
                for service in self.live_services() {
                    dvbcam.service_start(&service);
                }
            }
        }
    }

    pub fn unregister_ca_module(&self, module: &Arc<dyn CaModule>) {
        self.modules.write().retain(|m| !Arc::ptr_eq(m, module));
        for entry in self.clients.read().iter() {
            if let Some(dvbcam) = &entry.dvbcam {
                dvbcam.unregister_module(module);
            }
        }
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

/// CA descriptors of the programme and of every elementary stream.
fn pmt_ca_descriptors(section: &[u8]) -> Option<Vec<crate::caid::CaDescriptor>> {
    let section_len = usize::from(section.get(1)? & 0x0f) << 8 | usize::from(*section.get(2)?);
    let body = section.get(3..3 + section_len)?;
    let body = body.get(..body.len().checked_sub(4)?)?;
    let info_len = usize::from(body.get(7)? & 0x0f) << 8 | usize::from(*body.get(8)?);
    let mut descriptors = crate::caid::ca_descriptors(body.get(9..9 + info_len)?);
    let mut streams = &body[9 + info_len..];
    while streams.len() >= 5 {
        let es_len = usize::from(streams[3] & 0x0f) << 8 | usize::from(streams[4]);
        let info = streams.get(5..5 + es_len)?;
        for d in crate::caid::ca_descriptors(info) {
            if !descriptors.contains(&d) {
                descriptors.push(d);
            }
        }
        streams = &streams[5 + es_len..];
    }
    Some(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherType;
    use crate::config::{ClientCommon, ConstcwConfig, DvbcamConfig, NewcamdConfig};
    use crate::descrambler::test_support::started_service;
    use crate::descrambler::KeyState;

    fn common(name: &str) -> ClientCommon {
        ClientCommon {
            name: name.to_string(),
            ..ClientCommon::default()
        }
    }

    fn constcw(name: &str) -> ClientConfig {
        ClientConfig::Constcw(ConstcwConfig {
            common: common(name),
            algorithm: CipherType::Csa,
            caid: 0x0b00,
            tsid: 1,
            sid: 0x1234,
            key_even: "0102030605060712".to_string(),
            key_odd: "08090a1b0c0d0e27".to_string(),
            ..ConstcwConfig::default()
        })
    }

    fn disabled_newcamd(name: &str) -> ClientConfig {
        ClientConfig::Newcamd(NewcamdConfig {
            common: ClientCommon {
                enabled: false,
                ..common(name)
            },
            port: 15000,
            ..NewcamdConfig::default()
        })
    }

    fn pmt() -> Vec<u8> {
        crate::dvbcam::capmt::tests::pmt_section()
    }

    #[tokio::test]
    async fn test_statuses_in_list_order() {
        let config = Config {
            clients: vec![disabled_newcamd("nc"), constcw("fixed")],
            ..Config::default()
        };
        let manager = ClientManager::from_config(&config).unwrap();
        manager.start();
        let infos = manager.clients();
        assert_eq!(infos.len(), 2);
        assert_eq!((infos[0].name.as_str(), infos[0].status), ("nc", ClientStatus::None));
        assert_eq!((infos[1].kind, infos[1].status), ("constcw", ClientStatus::Connected));
        assert_eq!(manager.status("fixed"), Some(ClientStatus::Connected));
        assert_eq!(manager.status("nope"), None);
        manager.stop().await;
        assert_eq!(manager.status("fixed"), Some(ClientStatus::None));
    }

    #[tokio::test]
    async fn test_pmt_updates_descriptors_and_offers_service() {
        let manager = ClientManager::from_config(&Config {
            clients: vec![constcw("fixed")],
            ..Config::default()
        })
        .unwrap();
        manager.start();

        let service = started_service();
        manager.pmt_data(&service, &pmt());
        assert_eq!(service.ca_descriptors().len(), 3);

        manager.service_start(&service);
        assert_eq!(service.handle_states(), vec![("constcw-fixed".to_string(), KeyState::Resolved)]);

        manager.service_stop(&service);
        assert!(!service.is_descrambling());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_added_client_serves_running_services() {
        let manager = ClientManager::new();
        manager.start();
        let service = started_service();
        manager.pmt_data(&service, &pmt());
        manager.service_start(&service);
        assert!(service.handle_states().is_empty());

        manager.add_client(constcw("late")).unwrap();
        assert_eq!(service.handle_states().len(), 1);
        assert!(manager.add_client(constcw("late")).is_err());

        let mut disabled = constcw("late");
        disabled.common_mut().enabled = false;
        manager.update_client(disabled).await.unwrap();
        assert!(service.handle_states().is_empty());
        assert_eq!(manager.status("late"), Some(ClientStatus::None));

        manager.remove_client("late").await.unwrap();
        assert!(manager.clients().is_empty());
        assert!(manager.remove_client("late").await.is_err());
    }

    #[tokio::test]
    async fn test_changes_are_persisted() {
        let store = Arc::new(MemoryStore::new(vec![constcw("fixed")]));
        let manager = ClientManager::with_store(store.clone()).unwrap();
        assert_eq!(manager.clients().len(), 1);

        manager.add_client(disabled_newcamd("nc")).unwrap();
        let saved = store.load().unwrap();
        assert_eq!(saved.iter().map(ClientConfig::name).collect::<Vec<_>>(), ["fixed", "nc"]);

        manager.remove_client("fixed").await.unwrap();
        assert_eq!(store.load().unwrap().len(), 1);

        let invalid = ClientConfig::Constcw(ConstcwConfig {
            common: common("bad"),
            key_even: "01".to_string(),
            ..ConstcwConfig::default()
        });
        assert!(manager.add_client(invalid).is_err());
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_module_registration_reaches_dvbcam_clients() {
        let manager = ClientManager::from_config(&Config {
            clients: vec![ClientConfig::Dvbcam(DvbcamConfig {
                common: common("ci"),
                slot: 0,
                caids: vec![0x0b00],
            })],
            ..Config::default()
        })
        .unwrap();
        manager.start();
        assert_eq!(manager.status("ci"), Some(ClientStatus::Ready));

        let service = started_service();
        manager.pmt_data(&service, &pmt());
        manager.service_start(&service);
        assert!(service.handle_states().is_empty());

        let mut module = crate::dvbcam::MockCaModule::new();
        module.expect_slot().return_const(0u8);
        module.expect_caids().returning(|| vec![0x0b00]);
        module.expect_send_capmt().times(1).returning(|capmt| {
            assert_eq!(capmt[0], crate::dvbcam::ListManagement::Only as u8);
            Ok(())
        });
        let module: Arc<dyn CaModule> = Arc::new(module);
        manager.register_ca_module(module.clone());
        assert_eq!(manager.status("ci"), Some(ClientStatus::Connected));
        assert_eq!(service.handle_states().len(), 1);

        manager.pmt_data(&service, &pmt());
        assert_eq!(service.handle_states()[0].1, KeyState::Resolved);

        manager.unregister_ca_module(&module);
        assert_eq!(manager.status("ci"), Some(ClientStatus::Ready));
    }

    #[test]
    fn test_malformed_pmt_is_ignored() {
        let manager = ClientManager::new();
        let service = started_service();
        manager.pmt_data(&service, &[0x02, 0xb0]);
        assert!(service.ca_descriptors().is_empty());
    }
}
