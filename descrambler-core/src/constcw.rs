//! Fixed-key backend: serves one configured service with constant control
//! words. Used for bench testing and for feeds scrambled with a known key.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cipher::CipherType;
use crate::client::{CaClient, ClientStatus};
use crate::config::ConstcwConfig;
use crate::descrambler::{DescramblerHandle, HandleId, HandleKind, KeyDelivery, Service};

struct Keys {
    algorithm: CipherType,
    even: Vec<u8>,
    odd: Vec<u8>,
}

struct Attached {
    service: Weak<Service>,
    handle_id: HandleId,
}

pub struct Constcw {
    me: Weak<Self>,
    name: String,
    enabled: bool,
    caid: u16,
    provider_id: u32,
    tsid: u16,
    sid: u16,
    keys: Arc<Keys>,
    status: RwLock<ClientStatus>,
    services: Mutex<Vec<Attached>>,
}

impl Constcw {
    pub fn new(config: &ConstcwConfig) -> crate::Result<Arc<Self>> {
        let (even, odd) = config.keys().map_err(crate::Error::invalid_input)?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: config.common.name.clone(),
            enabled: config.common.enabled,
            caid: config.caid,
            provider_id: config.provider_id,
            tsid: config.tsid,
            sid: config.sid,
            keys: Arc::new(Keys {
                algorithm: config.algorithm,
                even,
                odd,
            }),
            status: RwLock::new(ClientStatus::None),
            services: Mutex::new(Vec::new()),
        }))
    }

    fn matches(&self, service: &Service) -> bool {
        let info = service.info();
        if info.sid != self.sid || info.tsid != self.tsid {
            return false;
        }
        if info.force_caid != 0 {
            return info.force_caid == self.caid;
        }
        service
            .ca_descriptors()
            .iter()
            .any(|d| d.caid == self.caid && d.provider_id == self.provider_id)
    }

    fn forget(&self, handle_id: HandleId) {
        self.services.lock().retain(|a| a.handle_id != handle_id);
    }
}

#[async_trait]
impl CaClient for Constcw {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "constcw"
    }

    fn status(&self) -> ClientStatus {
        *self.status.read()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn service_start(&self, service: &Arc<Service>) {
        if !self.enabled || !self.matches(service) {
            return;
        }
        {
            let mut services = self.services.lock();
            services.retain(|a| a.service.strong_count() > 0);
            if services.iter().any(|a| std::ptr::eq(a.service.as_ptr(), Arc::as_ptr(service))) {
                return;
            }
        }
        let name = format!("constcw-{}", self.name);
        let keys = self.keys.clone();
        let client = self.me.clone();
        let handle_name = name.clone();
        let Some(handle_id) = service.attach(move |id, service| {
            Arc::new(ConstcwHandle {
                client,
                service,
                id,
                name: handle_name,
                keys,
            })
        }) else {
            return;
        };
        debug!(handle = %name, service = %service.name(), "fixed keys attached");
        self.services.lock().push(Attached {
            service: Arc::downgrade(service),
            handle_id,
        });
    }

    fn start(&self) {
        let status = if self.enabled {
            ClientStatus::Connected
        } else {
            ClientStatus::None
        };
        *self.status.write() = status;
        info!(client = %self.name, %status, "fixed-key client ready");
    }

    async fn stop(&self) {
        let attached: Vec<Attached> = self.services.lock().drain(..).collect();
        for a in attached {
            if let Some(service) = a.service.upgrade() {
                service.detach(a.handle_id);
            }
        }
        *self.status.write() = ClientStatus::None;
    }
}

struct ConstcwHandle {
    client: Weak<Constcw>,
    service: Weak<Service>,
    id: HandleId,
    name: String,
    keys: Arc<Keys>,
}

impl ConstcwHandle {
    fn deliver(&self) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let keys = &self.keys;
        match service.deliver_keys(self.id, keys.algorithm, 0, Some(&keys.even), Some(&keys.odd)) {
            KeyDelivery::Installed | KeyDelivery::Demoted | KeyDelivery::Detached => {}
            KeyDelivery::Rejected => warn!(handle = %self.name, "configured keys rejected"),
        }
    }
}

impl DescramblerHandle for ConstcwHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::FixedKey
    }

    fn start(&self) {
        self.deliver();
    }

    fn stop(&self) {
        if let Some(client) = self.client.upgrade() {
            client.forget(self.id);
        }
    }

    fn ecm_reset(&self) -> bool {
        self.deliver();
        true
    }
}
