//! Card-server client framework.
//!
//! A [`NetworkClient`] owns one connection to a card server: it connects,
//! lets its [`Protocol`] perform the handshake, then serves ECM requests of
//! every attached service until the connection drops and it reconnects.
//! Protocol adapters only describe the wire format; card bookkeeping, ECM
//! request tracking and key delivery live here.

mod card;
mod ecm;
mod error;
mod network;
mod session;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::descrambler::Service;

pub use card::{Card, CardTable, ProviderInfo};
pub use ecm::{EcmBook, EcmSection, EcmState, ReplyVerdict, SectionState, SeqLookup, MAX_NOKS};
pub use error::{ClientError, ClientResult};
pub use network::{ClientHandle, EcmAnswer, EcmRequest, EmmTarget, NetworkClient, NetworkSettings, Protocol};
pub use session::{Session, SessionWriter};

/// Connection status of a backend as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    /// Disabled.
    #[default]
    None,
    /// Connecting.
    Ready,
    /// Logged in and card data received.
    Connected,
    /// Waiting before the next connection attempt.
    Disconnected,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "caclientNone",
            Self::Ready => "caclientReady",
            Self::Connected => "caclientConnected",
            Self::Disconnected => "caclientDisconnected",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured descrambling backend as seen by the manager.
#[async_trait]
pub trait CaClient: Send + Sync {
    fn name(&self) -> &str;

    /// Backend type, e.g. `newcamd`.
    fn kind(&self) -> &'static str;

    fn status(&self) -> ClientStatus;

    fn enabled(&self) -> bool;

    /// Offers a service that started descrambling. The backend attaches a
    /// handle when it can serve one of the service's CA systems.
    fn service_start(&self, service: &Arc<Service>);

    /// A CA system appeared (`valid`) or disappeared on a multiplex's EMM
    /// stream.
    fn caid_update(&self, _mux: u32, _caid: u16, _pid: u16, _valid: bool) {}

    /// An EMM section arrived on a multiplex.
    fn emm_input(&self, _mux: u32, _caid: u16, _data: &[u8]) {}

    /// A new or updated PMT section arrived for a descrambling service.
    fn pmt_data(&self, _service: &Arc<Service>, _section: &[u8]) {}

    /// Starts background work. Must be called inside a Tokio runtime.
    fn start(&self);

    /// Stops background work and detaches from every service.
    async fn stop(&self);

    /// Drops the current connection and reconnects at once.
    fn reconfigure(&self) {}
}
