//! Per-request context (Design Notes §9: "Global mutable state → explicit
//! context"). The original server threads a current client, mount,
//! credentials, and dispatch time through module-level variables; every
//! handler here instead receives one value carrying exactly that.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::cred::Credentials;
use crate::export::ClientId;

/// A resolved, authorized mount point within a request's client, identified
/// by index into that client's mount list (spec §4.G step 2).
pub type MountId = usize;

/// Everything a procedure handler needs about the request it is serving,
/// built fresh by the dispatcher (4.K) and authorization (4.G) before the
/// handler runs.
#[derive(Debug, Clone)]
pub struct Context {
    /// Address the request actually arrived from; re-checked on every call
    /// rather than trusted from a cache hit (spec §4.C "Consistency
    /// rules").
    pub caller: SocketAddr,
    /// Client record resolved for `caller` by the export database (4.F).
    pub client: ClientId,
    /// Mount point within `client` that authorized this request (4.G).
    pub mount: MountId,
    /// Mapped identity this request runs its filesystem syscalls as.
    pub creds: Credentials,
    /// Wall-clock deadline for RPC-level operations this request may issue
    /// (sibling-daemon lookups, §4.H); `None` means no external calls are
    /// in flight.
    pub deadline: Option<Duration>,
    /// Time the dispatcher accepted this request, used for identity-map
    /// expiry checks and remote-mount log timestamps.
    pub now: SystemTime,
}

impl Context {
    pub fn new(caller: SocketAddr, client: ClientId, mount: MountId, creds: Credentials, now: SystemTime) -> Self {
        Context { caller, client, mount, creds, deadline: None, now }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
