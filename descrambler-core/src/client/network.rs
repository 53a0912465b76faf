use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::card::{Card, CardTable, ProviderInfo};
use super::ecm::{EcmBook, EcmState, ReplyVerdict, SectionState, SeqLookup};
use super::error::{ClientError, ClientResult};
use super::session::Session;
use super::{CaClient, ClientStatus};
use crate::caid::{caid_to_name, CaDescriptor};
use crate::cipher::CipherType;
use crate::descrambler::{
    DescramblerHandle, HandleId, HandleKind, KeyDelivery, KeyState, PrefCaPidLock, Service,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Window during which EMMs from another mux are ignored in exclusive mode.
const EMM_EXCLUSIVE_WINDOW: Duration = Duration::from_secs(25);
const MAX_SECTION_LEN: usize = 4096;
/// ECM PIDs followed per service.
const MAX_ECM_PIDS: usize = 8;

/// Settings shared by every card-server protocol.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub name: String,
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Forward EMMs to cards that accept them.
    pub emm: bool,
    /// Take EMMs from one mux at a time.
    pub emmex: bool,
    pub keepalive: Option<Duration>,
    pub ecm_timeout: Duration,
}

/// An ECM section to be sent to a card.
#[derive(Debug, Clone, Copy)]
pub struct EcmRequest<'a> {
    pub caid: u16,
    pub provider: u32,
    pub card_id: u32,
    pub pid: u16,
    pub sid: u16,
    pub data: &'a [u8],
}

/// Card an EMM is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmTarget {
    pub caid: u16,
    pub provider: u32,
    pub card_id: u32,
}

/// Server answer to an ECM request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcmAnswer {
    Keys {
        cipher: CipherType,
        even: Vec<u8>,
        odd: Vec<u8>,
    },
    Nok,
}

/// Wire format of one card-server family.
///
/// The handshake runs on the raw stream; afterwards outgoing requests go
/// through [`Protocol::Encoder`] on the session writer and incoming frames
/// are decoded by [`Protocol::Decoder`] and passed to
/// [`Protocol::handle_reply`].
#[async_trait]
pub trait Protocol: Send + Sync + Sized + 'static {
    type Request: Send + 'static;
    type Reply: Send + 'static;
    type Encoder: Encoder<Self::Request, Error = ClientError> + Send + 'static;
    type Decoder: Decoder<Item = Self::Reply, Error = ClientError> + Send + 'static;

    fn kind(&self) -> &'static str;

    /// Logs in and returns the codec pair for the rest of the session.
    async fn handshake(
        &self,
        client: &NetworkClient<Self>,
        stream: &mut TcpStream,
    ) -> ClientResult<(Self::Encoder, Self::Decoder)>;

    /// Whether the server handles a single ECM at a time.
    fn serialize_ecm(&self) -> bool {
        false
    }

    fn keepalive(&self) -> Option<Self::Request> {
        None
    }

    /// Silence after which the connection is considered dead.
    fn read_timeout(&self, settings: &NetworkSettings) -> Option<Duration>;

    fn handle_reply(
        &self,
        client: &NetworkClient<Self>,
        session: &Session<Self::Request>,
        reply: Self::Reply,
    ) -> ClientResult<()>;

    /// Queues an ECM request and returns the sequence number its answer
    /// will carry.
    fn ecm_request(&self, session: &Session<Self::Request>, request: &EcmRequest<'_>) -> ClientResult<u32>;

    fn emm_request(&self, session: &Session<Self::Request>, target: &EmmTarget, data: &[u8]) -> ClientResult<()>;
}

struct ClientService {
    key: u64,
    handle_id: HandleId,
    service: Weak<Service>,
    name: String,
    caid: u16,
    epids: Vec<u16>,
    book: EcmBook,
}

#[derive(Default)]
struct ClientState {
    cards: CardTable,
    services: Vec<ClientService>,
    /// Services no card could serve yet.
    offered: Vec<Weak<Service>>,
    emm_mux: Option<u32>,
    emm_updated: Option<Instant>,
}

enum StartPlan {
    Keep,
    Detach(Option<HandleId>),
    Create { caid: u16, epids: Vec<u16> },
}

/// A connection to one card server plus the services it serves.
pub struct NetworkClient<P: Protocol> {
    me: Weak<Self>,
    protocol: P,
    settings: NetworkSettings,
    status: RwLock<ClientStatus>,
    state: Mutex<ClientState>,
    session: RwLock<Option<Arc<Session<P::Request>>>>,
    reconnect: Notify,
    reconfigure: AtomicBool,
    next_key: AtomicU64,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<P: Protocol> NetworkClient<P> {
    pub fn new(settings: NetworkSettings, protocol: P) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            protocol,
            settings,
            status: RwLock::new(ClientStatus::None),
            state: Mutex::new(ClientState::default()),
            session: RwLock::new(None),
            reconnect: Notify::new(),
            reconfigure: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
            task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn set_status(&self, status: ClientStatus) {
        let old = std::mem::replace(&mut *self.status.write(), status);
        if old != status {
            debug!(client = %self.settings.name, from = %old, to = %status, "status changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Snapshot of the cards announced by the server.
    pub fn cards(&self) -> Vec<Card> {
        self.state.lock().cards.iter().cloned().collect()
    }

    /// Records a card announced by the server and offers waiting services
    /// to it.
    pub fn add_card(&self, caid: u16, id: u32, ua: Option<[u8; 8]>, providers: &[ProviderInfo]) {
        let (label, emm_active, known_vendor) = {
            let mut state = self.state.lock();
            let card = state.cards.upsert(caid, id, ua, providers);
            (card.label(), card.emm.is_active(), card.emm.is_known_vendor())
        };
        info!(
            client = %self.settings.name,
            user = %self.settings.username,
            system = %caid_to_name(caid),
            card = %label,
            "card available"
        );
        for (i, provider) in providers.iter().enumerate() {
            match provider.sa {
                Some(sa) => debug!(
                    client = %self.settings.name,
                    index = i + 1,
                    provider = format_args!("0x{:06x}", provider.id),
                    sa = %hex::encode(sa),
                    "card provider"
                ),
                None => debug!(
                    client = %self.settings.name,
                    index = i + 1,
                    provider = format_args!("0x{:06x}", provider.id),
                    "card provider"
                ),
            }
        }
        if self.settings.emm {
            if emm_active {
                info!(client = %self.settings.name, caid = format_args!("{caid:04X}"), "will forward EMMs");
            } else if !known_vendor {
                info!(client = %self.settings.name, caid = format_args!("{caid:04X}"), "will not forward EMMs (unsupported CA system)");
            } else {
                info!(client = %self.settings.name, caid = format_args!("{caid:04X}"), "will not forward EMMs (not allowed by server)");
            }
        }
        self.reoffer();
    }

    pub fn remove_card(&self, id: u32) {
        let removed = self.state.lock().cards.remove(id);
        if let Some(card) = removed {
            info!(client = %self.settings.name, card = %card.label(), "card removed");
        }
    }

    fn reoffer(&self) {
        let waiting: Vec<Arc<Service>> = {
            let mut state = self.state.lock();
            state.offered.retain(|w| w.strong_count() > 0);
            state.offered.iter().filter_map(Weak::upgrade).collect()
        };
        for service in waiting {
            self.service_start(&service);
        }
    }

    /// Attaches to `service` when a running card serves one of its CA
    /// systems, refreshes the ECM PIDs of an existing attachment, or
    /// detaches when no card matches any more.
    pub fn service_start(&self, service: &Arc<Service>) {
        let preferred = service.preferred_ca_pid();
        let descriptors = service.ca_descriptors();
        let plan = {
            let mut state = self.state.lock();
            let existing = state
                .services
                .iter()
                .position(|cs| std::ptr::eq(cs.service.as_ptr(), Arc::as_ptr(service)));
            let caid = state
                .cards
                .iter()
                .filter(|card| card.running && card.caid != 0)
                .find(|card| {
                    descriptors.iter().any(|d| {
                        d.caid == card.caid && (preferred.lock != PrefCaPidLock::Fixed || preferred.pid == d.pid)
                    })
                })
                .map(|card| card.caid);
            state
                .offered
                .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), Arc::as_ptr(service)));

            match (caid, existing) {
                (None, existing) => {
                    state.offered.push(Arc::downgrade(service));
                    StartPlan::Detach(existing.map(|pos| state.services.remove(pos).handle_id))
                }
                (Some(caid), Some(pos)) => {
                    let cs = &mut state.services[pos];
                    let epids = ecm_pids(&descriptors, caid);
                    if cs.caid != caid || cs.epids != epids {
                        debug!(handle = %cs.name, service = %service.name(), ?epids, "ECM PIDs changed");
                        cs.caid = caid;
                        cs.epids = epids;
                        cs.book.restart();
                    }
                    StartPlan::Keep
                }
                (Some(caid), None) => StartPlan::Create {
                    caid,
                    epids: ecm_pids(&descriptors, caid),
                },
            }
        };

        match plan {
            StartPlan::Keep => {}
            StartPlan::Detach(None) => {
                trace!(client = %self.settings.name, service = %service.name(), "no matching card");
            }
            StartPlan::Detach(Some(handle_id)) => {
                debug!(client = %self.settings.name, service = %service.name(), "card gone, detaching");
                service.detach(handle_id);
            }
            StartPlan::Create { caid, epids } => {
                let key = self.next_key.fetch_add(1, Ordering::Relaxed);
                let name = format!(
                    "{}-{}-{}-{:04X}",
                    self.protocol.kind(),
                    self.settings.hostname,
                    self.settings.port,
                    caid
                );
                let handle = Arc::new(ClientHandle {
                    client: self.me.clone(),
                    key,
                    name: name.clone(),
                });
                let Some(handle_id) = service.attach(move |_, _| handle) else {
                    return;
                };
                debug!(handle = %name, service = %service.name(), ?epids, "using card server");
                self.state.lock().services.push(ClientService {
                    key,
                    handle_id,
                    service: Arc::downgrade(service),
                    name,
                    caid,
                    epids,
                    book: EcmBook::default(),
                });
            }
        }
    }

    fn remove_entry(&self, key: u64) {
        self.state.lock().services.retain(|cs| cs.key != key);
    }

    fn entry_service(&self, key: u64) -> Option<Arc<Service>> {
        let state = self.state.lock();
        state.services.iter().find(|cs| cs.key == key)?.service.upgrade()
    }

    fn with_book(&self, key: u64, f: impl FnOnce(&mut EcmBook)) {
        if let Some(cs) = self.state.lock().services.iter_mut().find(|cs| cs.key == key) {
            f(&mut cs.book);
        }
    }

    /// Handles an ECM section of an attached service.
    fn table_input(&self, key: u64, pid: u16, data: &[u8]) {
        let Some(&table_id) = data.first() else {
            return;
        };
        if data.len() > MAX_SECTION_LEN || table_id & 0xf0 != 0x80 {
            return;
        }
        let session = self.session.read().clone().filter(|s| !s.is_closed());

        let not_connected = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(cs) = state.services.iter_mut().find(|cs| cs.key == key) else {
                return;
            };
            let Some(service) = cs.service.upgrade() else {
                return;
            };
            if service.key_state(cs.handle_id) == Some(KeyState::Idle) {
                return;
            }

            let mut preferred = service.preferred_ca_pid();
            if cs.book.begin_input() {
                preferred.pid = 0;
                service.set_preferred_ca_pid(preferred);
                debug!(handle = %cs.name, service = %service.name(), "reset after unexpected or missing reply");
            }

            let descriptors = service.ca_descriptors();
            if !cs.book.has_pid(pid) {
                if cs.book.state() == EcmState::Init {
                    if preferred.lock != PrefCaPidLock::Off {
                        let valid = descriptors
                            .iter()
                            .any(|d| d.pid == preferred.pid && state.cards.position_serving(d).is_some());
                        if !valid {
                            debug!(
                                handle = %cs.name,
                                service = %service.name(),
                                pid = preferred.pid,
                                "invalid preferred ECM PID"
                            );
                            preferred.pid = 0;
                            service.set_preferred_ca_pid(preferred);
                        }
                    }
                    if preferred.pid == pid || preferred.pid == 0 || preferred.lock == PrefCaPidLock::Off {
                        cs.book.insert_pid(pid);
                        debug!(
                            handle = %cs.name,
                            service = %service.name(),
                            pid,
                            preferred = preferred.pid != 0,
                            "inserting ECM PID"
                        );
                    }
                }
                if !cs.book.has_pid(pid) {
                    return;
                }
            }

            let Some((desc, card)) = descriptors
                .iter()
                .filter(|d| d.pid == pid)
                .find_map(|d| state.cards.position_serving(d).map(|i| (*d, i)))
                .and_then(|(d, i)| state.cards.get(i).map(|card| (d, card)))
            else {
                return;
            };
            if !is_ecm_table(table_id, desc.caid) {
                return;
            }
            let (number, last) = section_number(desc.caid, data);

            match session {
                None => Some((service, cs.handle_id)),
                Some(session) => {
                    let capid = cs.book.capid();
                    let Some(section) = cs.book.section(pid, number, last) else {
                        return;
                    };
                    if matches!(section.state, SectionState::Forbidden | SectionState::Idle) {
                        return;
                    }
                    if capid.is_some_and(|c| c != pid) {
                        trace!(handle = %cs.name, pid, "filtering ECM");
                        return;
                    }
                    // an unchanged section was already requested
                    if !section.store(data) {
                        return;
                    }
                    let request = EcmRequest {
                        caid: desc.caid,
                        provider: desc.provider_id,
                        card_id: card.id,
                        pid,
                        sid: service.info().sid,
                        data,
                    };
                    match self.protocol.ecm_request(&session, &request) {
                        Ok(seq) => {
                            section.seq = seq;
                            section.pending = true;
                            section.resolved = false;
                            section.sent = Some(Instant::now());
                            section.pid = pid;
                            section.caid = desc.caid;
                            section.provider = desc.provider_id;
                            section.card_id = card.id;
                            debug!(
                                handle = %cs.name,
                                service = %service.name(),
                                pid,
                                section = number,
                                last,
                                seq,
                                "sending ECM"
                            );
                        }
                        Err(e) => {
                            section.store(&[]);
                            warn!(handle = %cs.name, error = %e, "failed to queue ECM");
                        }
                    }
                    None
                }
            }
        };

        if let Some((service, handle_id)) = not_connected {
            // a new key is due but there is no server to ask
            service.set_key_state(handle_id, KeyState::Ready);
        }
    }

    /// Applies the server's answer to the request with sequence `seq`.
    pub fn ecm_reply(&self, seq: u32, answer: EcmAnswer) {
        let (service, handle_id, name, pid, verdict, delay) = {
            let mut guard = self.state.lock();
            let mut found = None;
            for cs in guard.services.iter_mut() {
                match cs.book.lookup(seq) {
                    SeqLookup::Pending(at) => {
                        found = Some((cs, at));
                        break;
                    }
                    SeqLookup::Answered => {
                        debug!(handle = %cs.name, seq, "ignoring duplicate ECM reply");
                        return;
                    }
                    SeqLookup::Unknown => {}
                }
            }
            let Some((cs, at)) = found else {
                warn!(client = %self.settings.name, seq, "unexpected ECM reply");
                return;
            };
            let Some(service) = cs.service.upgrade() else {
                return;
            };
            let Some(section) = cs.book.get(at) else {
                return;
            };
            let pid = section.pid;
            let delay = section.sent.map(|t| t.elapsed()).unwrap_or_default();
            let resolved_elsewhere = service.resolved_by_other(cs.handle_id);
            let keys = matches!(answer, EcmAnswer::Keys { .. });
            let verdict = cs.book.reply(at, keys, resolved_elsewhere);
            (service, cs.handle_id, cs.name.clone(), pid, verdict, delay)
        };

        let delay_ms = delay.as_millis() as u64;
        match (verdict, answer) {
            (ReplyVerdict::Keys, EcmAnswer::Keys { cipher, even, odd }) => {
                debug!(
                    handle = %name,
                    service = %service.name(),
                    pid,
                    seq,
                    delay_ms,
                    even = %hex::encode(&even),
                    odd = %hex::encode(&odd),
                    "received ECM reply"
                );
                let delivery = service.deliver_keys(handle_id, cipher, 0, Some(&even), Some(&odd));
                if delivery == KeyDelivery::Installed {
                    let mut preferred = service.preferred_ca_pid();
                    if preferred.pid == 0 || (preferred.pid != pid && preferred.lock == PrefCaPidLock::Off) {
                        preferred.pid = pid;
                        service.set_preferred_ca_pid(preferred);
                        debug!(handle = %name, pid, "saving preferred ECM PID");
                    }
                }
            }
            (ReplyVerdict::Nok { go_idle }, _) => {
                debug!(handle = %name, service = %service.name(), pid, seq, delay_ms, "received NOK");
                if go_idle && service.key_state(handle_id) == Some(KeyState::Ready) {
                    service.set_key_state(handle_id, KeyState::Idle);
                }
            }
            (ReplyVerdict::Forbidden, _) => {
                warn!(
                    handle = %name,
                    service = %service.name(),
                    seq,
                    delay_ms,
                    "cannot descramble service, access denied"
                );
                service.set_key_state(handle_id, KeyState::Forbidden);
                let mut preferred = service.preferred_ca_pid();
                if preferred.pid == pid && preferred.lock == PrefCaPidLock::Off {
                    preferred.pid = 0;
                    service.set_preferred_ca_pid(preferred);
                }
            }
            (ReplyVerdict::Keys, EcmAnswer::Nok) => {}
        }
    }

    /// A CA system started (`valid`) or stopped on a mux's EMM stream.
    pub fn update_emm_mux(&self, mux: u32, caid: u16, pid: u16, valid: bool) {
        trace!(client = %self.settings.name, mux, caid = format_args!("{caid:04X}"), pid, valid, "CAID update");
        let mut state = self.state.lock();
        for card in state.cards.iter_mut().filter(|c| c.caid == caid) {
            if card.mux.is_some_and(|m| m != mux) {
                continue;
            }
            card.mux = valid.then_some(mux);
        }
    }

    /// Filters an EMM for every card listening on `mux` and forwards what
    /// addresses them.
    pub fn forward_emm(&self, mux: u32, caid: u16, data: &[u8]) {
        if !self.settings.emm {
            return;
        }
        let Some(session) = self.session.read().clone().filter(|s| !s.is_closed()) else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        for card in state.cards.iter_mut() {
            if !card.running || card.caid != caid || card.mux != Some(mux) || !card.emm.is_active() {
                continue;
            }
            if self.settings.emmex {
                let recent = state
                    .emm_updated
                    .is_some_and(|t| now.saturating_duration_since(t) < EMM_EXCLUSIVE_WINDOW);
                if state.emm_mux.is_some_and(|m| m != mux) && recent {
                    continue;
                }
                state.emm_updated = Some(now);
            }
            state.emm_mux = Some(mux);
            if let Some(emm) = card.emm.filter(data, mux) {
                let target = EmmTarget {
                    caid,
                    provider: card.emm.providers().first().map_or(0, |p| p.id),
                    card_id: card.id,
                };
                if let Err(e) = self.protocol.emm_request(&session, &target, &emm) {
                    debug!(client = %self.settings.name, error = %e, "failed to queue EMM");
                }
            }
        }
    }

    fn flush_books(&self) {
        for cs in self.state.lock().services.iter_mut() {
            cs.book.flush();
        }
    }

    fn expire_requests(&self, now: Instant) {
        for cs in self.state.lock().services.iter_mut() {
            let expired = cs.book.expire(now, self.settings.ecm_timeout);
            if expired > 0 {
                debug!(handle = %cs.name, expired, "ECM requests timed out");
            }
        }
    }

    /// Connect, serve, back off; until cancelled.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let name = self.settings.name.clone();
        let addr = format!("{}:{}", self.settings.hostname, self.settings.port);
        let mut backoff = ConstantBuilder::default()
            .with_delay(RECONNECT_DELAY)
            .with_max_times(usize::MAX)
            .build();
        let mut attempts = 0u32;

        while !cancel.is_cancelled() {
            self.state.lock().cards.invalidate();
            self.set_status(ClientStatus::Ready);
            info!(client = %name, %addr, "attempting to connect");

            let connect = tokio::select! {
                () = cancel.cancelled() => break,
                r = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)) => r,
            };
            match connect {
                Ok(Ok(stream)) => {
                    info!(client = %name, %addr, "connected");
                    attempts = 0;
                    self.reconfigure.store(false, Ordering::Relaxed);
                    if let Err(e) = self.serve(stream, &cancel).await {
                        info!(client = %name, error = %e, "session ended");
                    }
                    info!(client = %name, %addr, "disconnected");
                }
                Ok(Err(e)) => {
                    attempts += 1;
                    info!(client = %name, %addr, error = %e, "connection attempt failed");
                }
                Err(_) => {
                    attempts += 1;
                    info!(client = %name, %addr, "connection attempt timed out");
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            if attempts == 1 || self.reconfigure.swap(false, Ordering::Relaxed) {
                continue;
            }

            self.set_status(ClientStatus::Disconnected);
            let delay = backoff.next().unwrap_or(RECONNECT_DELAY);
            info!(client = %name, delay_secs = delay.as_secs(), "automatic connection attempt scheduled");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
                () = self.reconnect.notified() => {}
            }
        }

        info!(client = %name, %addr, "inactive");
        self.state.lock().cards.clear();
    }

    async fn serve(&self, mut stream: TcpStream, cancel: &CancellationToken) -> ClientResult<()> {
        let (encoder, decoder) = self.protocol.handshake(self, &mut stream).await?;
        let (read, write) = stream.into_split();
        let (session, writer) = Session::new(
            &self.settings.name,
            self.protocol.serialize_ecm(),
            self.settings.ecm_timeout,
        );
        let session = Arc::new(session);
        *self.session.write() = Some(session.clone());
        self.flush_books();

        let result = self
            .serve_session(&session, writer.run(encoder, write), FramedRead::new(read, decoder), cancel)
            .await;
        *self.session.write() = None;
        result
    }

    async fn serve_session<W>(
        &self,
        session: &Session<P::Request>,
        writer: W,
        mut frames: FramedRead<OwnedReadHalf, P::Decoder>,
        cancel: &CancellationToken,
    ) -> ClientResult<()>
    where
        W: Future<Output = ClientResult<()>>,
    {
        tokio::pin!(writer);
        let read_timeout = self.protocol.read_timeout(&self.settings);
        let mut last_read = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = self.reconnect.notified() => {
                    info!(client = %self.settings.name, "reconfigured, reconnecting");
                    return Ok(());
                }
                result = &mut writer => {
                    result?;
                    return Err(ClientError::Closed);
                }
                frame = frames.next() => match frame {
                    Some(Ok(reply)) => {
                        last_read = Instant::now();
                        self.protocol.handle_reply(self, session, reply)?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(ClientError::Closed),
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    if read_timeout.is_some_and(|t| now.saturating_duration_since(last_read) >= t) {
                        return Err(ClientError::Timeout("server message"));
                    }
                    if let Some(interval) = self.settings.keepalive {
                        if session.idle_for() >= interval {
                            if let Some(msg) = self.protocol.keepalive() {
                                debug!(client = %self.settings.name, "sending keepalive");
                                session.send(msg)?;
                            }
                        }
                    }
                    self.expire_requests(now);
                }
            }
        }
    }

    #[cfg(test)]
    fn install_session(&self, serialize_ecm: bool) -> (Arc<Session<P::Request>>, super::session::SessionWriter<P::Request>) {
        let (session, writer) = Session::new(&self.settings.name, serialize_ecm, self.settings.ecm_timeout);
        let session = Arc::new(session);
        *self.session.write() = Some(session.clone());
        (session, writer)
    }
}

#[async_trait]
impl<P: Protocol> CaClient for NetworkClient<P> {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> &'static str {
        self.protocol.kind()
    }

    fn status(&self) -> ClientStatus {
        *self.status.read()
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn service_start(&self, service: &Arc<Service>) {
        NetworkClient::service_start(self, service);
    }

    fn caid_update(&self, mux: u32, caid: u16, pid: u16, valid: bool) {
        self.update_emm_mux(mux, caid, pid, valid);
    }

    fn emm_input(&self, mux: u32, caid: u16, data: &[u8]) {
        self.forward_emm(mux, caid, data);
    }

    fn start(&self) {
        if !self.settings.enabled {
            self.set_status(ClientStatus::None);
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(me.run(cancel.clone()));
        *task = Some((cancel, handle));
    }

    async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(client = %self.settings.name, error = %e, "connection task failed");
            }
        }
        let services: Vec<ClientService> = {
            let mut state = self.state.lock();
            state.offered.clear();
            state.cards.clear();
            state.services.drain(..).collect()
        };
        for cs in services {
            if let Some(service) = cs.service.upgrade() {
                service.detach(cs.handle_id);
            }
        }
        self.set_status(ClientStatus::None);
    }

    fn reconfigure(&self) {
        self.reconfigure.store(true, Ordering::Relaxed);
        self.reconnect.notify_one();
    }
}

/// Presence of a network client on one service.
pub struct ClientHandle<P: Protocol> {
    client: Weak<NetworkClient<P>>,
    key: u64,
    name: String,
}

impl<P: Protocol> DescramblerHandle for ClientHandle<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Network
    }

    fn stop(&self) {
        if let Some(client) = self.client.upgrade() {
            client.remove_entry(self.key);
        }
    }

    fn caid_changed(&self) {
        if let Some(client) = self.client.upgrade() {
            if let Some(service) = client.entry_service(self.key) {
                client.service_start(&service);
            }
        }
    }

    fn ecm_reset(&self) -> bool {
        if let Some(client) = self.client.upgrade() {
            client.with_book(self.key, EcmBook::reset);
        }
        false
    }

    fn ecm_idle(&self) {
        if let Some(client) = self.client.upgrade() {
            client.with_book(self.key, EcmBook::idle);
        }
    }

    fn ecm_input(&self, pid: u16, data: &[u8]) {
        if let Some(client) = self.client.upgrade() {
            client.table_input(self.key, pid, data);
        }
    }
}

/// ECM PIDs of `caid` in descriptor order, without repeats.
fn ecm_pids(descriptors: &[CaDescriptor], caid: u16) -> Vec<u16> {
    let mut pids = Vec::new();
    for d in descriptors.iter().filter(|d| d.caid == caid) {
        if !pids.contains(&d.pid) {
            pids.push(d.pid);
        }
        if pids.len() == MAX_ECM_PIDS {
            break;
        }
    }
    pids
}

fn is_ecm_table(table_id: u8, caid: u16) -> bool {
    matches!(table_id, 0x80 | 0x81) || (table_id == 0x50 && caid == 0x4a30)
}

/// Section number and last section number of an ECM. Only Irdeto splits
/// ECMs into numbered sections; PowerVu alternates two.
fn section_number(caid: u16, data: &[u8]) -> (u8, u8) {
    if caid >> 8 == 0x06 {
        (data.get(4).copied().unwrap_or(0), data.get(5).copied().unwrap_or(0))
    } else if caid == 0x0e00 {
        (data[0] & 1, 1)
    } else {
        (0, 0)
    }
}
