use std::fmt;

/// Identifies a handle within its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Card server reached over the network.
    Network,
    /// Local card interface that descrambles in hardware.
    Hardware,
    /// Keys taken from configuration.
    FixedKey,
}

/// A backend's presence on one service.
///
/// Handles hold only a weak reference to their service and report key
/// material back through [`Service::deliver_keys`](super::Service::deliver_keys).
/// The service never calls into a handle while holding its own lock, so
/// implementations may call back into the service from any hook.
pub trait DescramblerHandle: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> HandleKind;

    /// Called once after the handle has been attached.
    fn start(&self) {}

    /// Detach from the backend; the service is going away.
    fn stop(&self);

    /// The service's CA descriptor list changed.
    fn caid_changed(&self) {}

    /// Forget what was requested so the next ECM is sent again.
    /// Returns `true` when the handle re-delivers keys on its own.
    fn ecm_reset(&self) -> bool;

    /// A sibling handle resolved; stop requesting keys.
    fn ecm_idle(&self) {}

    /// An ECM section arrived on one of the service's ECM PIDs.
    fn ecm_input(&self, _pid: u16, _data: &[u8]) {}
}
