//! Per-service descrambling: attached key handles, key slots, the packet
//! queue used while keys are uncertain, and the parity state machine.
//!
//! A [`Service`] is created by the stream pipeline for every programme that
//! needs descrambling. Backends attach [`DescramblerHandle`]s to it and
//! deliver keys with [`Service::deliver_keys`]; the pipeline pushes transport
//! packets through [`Service::descramble`].

mod handle;
mod key;
mod queue;
mod runtime;
mod service;

use std::fmt;

pub use handle::{DescramblerHandle, HandleId, HandleKind};
pub use runtime::Stats;
pub use service::{KeyDelivery, Service, ServiceInfo};

pub use crate::config::{EcmParity, SkipPolicy};

#[cfg(test)]
pub(crate) use service::tests as test_support;

/// Key state of one attached handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Constructed, not yet attached.
    Init,
    /// Attached and waiting for its first answer.
    Ready,
    /// Supplying valid keys.
    Resolved,
    /// The card refused the request.
    Forbidden,
    /// Unrecoverable failure, e.g. the backend cannot talk to its card.
    Fatal,
    /// A sibling resolved first, or the key was invalidated.
    Idle,
}

impl KeyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Resolved => "resolved",
            Self::Forbidden => "forbidden",
            Self::Fatal => "fatal",
            Self::Idle => "idle",
        }
    }

    /// Whether a handle in this state can still produce keys.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Forbidden | Self::Fatal)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pushing one transport packet through a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Written to the sink, decrypted or passed through.
    Consumed,
    /// Held back until a usable key arrives; it reaches the sink later.
    Buffered,
    /// Discarded: no key and the skip policy drops scrambled packets.
    Dropped,
    /// The service is not under descrambling; stop feeding it.
    Fatal,
}

/// How strictly the preferred ECM PID is followed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrefCaPidLock {
    /// Learned from the first successful reply, replaced by later ones.
    #[default]
    Off,
    /// Learned, but kept once set.
    On,
    /// Configured; other ECM PIDs are ignored.
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreferredCaPid {
    pub pid: u16,
    pub lock: PrefCaPidLock,
}
