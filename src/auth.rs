//! Per-request authorization (spec §4.G): resolves the caller address to a
//! client and mount point, with a small round-robin cache (including
//! negative results) so repeat callers skip the export-database walk.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::export::{ClientId, ExportDb, NetgroupResolver};
use crate::resolve::{resolve_client_name, DnsResolver, Resolution};

/// Size of the round-robin address→client cache (spec: "a small
/// round-robin address→client cache"). The original keeps 16 entries
/// (`IPCACHEMAX` in `auth.c`); kept the same here.
const CACHE_SIZE: usize = 16;

/// Outcome of authorizing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted { client: ClientId, mount: usize },
    Denied,
}

struct CacheSlot {
    addr: Ipv4Addr,
    result: Option<ClientId>,
}

/// Caches the last [`CACHE_SIZE`] distinct addresses seen, including
/// addresses that resolved to no client at all (a negative result), so a
/// hammering unauthorized client doesn't re-walk the export database on
/// every call.
struct ClientCache {
    slots: Vec<CacheSlot>,
    next: usize,
}

impl ClientCache {
    fn new() -> Self {
        ClientCache { slots: Vec::with_capacity(CACHE_SIZE), next: 0 }
    }

    fn get(&self, addr: Ipv4Addr) -> Option<Option<ClientId>> {
        self.slots.iter().find(|s| s.addr == addr).map(|s| s.result)
    }

    fn insert(&mut self, addr: Ipv4Addr, result: Option<ClientId>) {
        if self.slots.len() < CACHE_SIZE {
            self.slots.push(CacheSlot { addr, result });
        } else {
            self.slots[self.next] = CacheSlot { addr, result };
            self.next = (self.next + 1) % CACHE_SIZE;
        }
    }
}

/// Whether the globally-configured `-n` flag (waive privileged-port check,
/// spec §6) is active, threaded through from CLI config instead of a
/// module-level flag.
#[derive(Debug, Clone, Copy)]
pub struct SecurityPolicy {
    pub waive_secure_port: bool,
}

/// Ties the export database, name resolver, and client cache together to
/// answer "is this request allowed, and against which mount?" (spec §4.G).
pub struct Authorizer {
    cache: ClientCache,
    policy: SecurityPolicy,
}

impl Authorizer {
    pub fn new(policy: SecurityPolicy) -> Self {
        Authorizer { cache: ClientCache::new(), policy }
    }

    /// Resolves `addr` to a client, consulting the cache first. `path` is
    /// the request's target path (used for mount-point lookup); `port` is
    /// the caller's source port, checked against `secure_port` mounts.
    pub fn authorize(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        path: &str,
        db: &mut ExportDb,
        dns: &dyn DnsResolver,
        netgroups: &dyn NetgroupResolver,
    ) -> Decision {
        let client = match self.cache.get(addr) {
            Some(cached) => cached,
            None => {
                let name = match resolve_client_name(addr, dns) {
                    Resolution::Name(name) => Some(name),
                    Resolution::Unknown | Resolution::Spoof(_) => None,
                };
                let client = db.resolve(addr, name.as_deref(), netgroups);
                self.cache.insert(addr, client);
                client
            }
        };

        let Some(client_id) = client else {
            return Decision::Denied;
        };

        let Some(mount_index) = mount_index_for(db, client_id, path) else {
            return Decision::Denied;
        };

        let mount = &db.client(client_id).mounts()[mount_index];
        if mount.options.secure_port && !self.policy.waive_secure_port && port >= 1024 {
            return Decision::Denied;
        }
        if mount.options.no_access {
            return Decision::Denied;
        }

        Decision::Granted { client: client_id, mount: mount_index }
    }

    /// Bounds the identity-sibling failure window (spec §7: "A crashed
    /// identity sibling marks the client address unavailable for 15
    /// minutes"). Kept here since it gates the same per-address cache this
    /// type owns.
    pub const SIBLING_UNAVAILABLE: Duration = Duration::from_secs(15 * 60);
}

fn mount_index_for(db: &ExportDb, client: ClientId, path: &str) -> Option<usize> {
    db.client(client).mounts().iter().position(|m| m.matches_prefix(path))
}

/// Tracks when the identity sibling was last observed failing, per spec
/// §7's 15-minute cooldown.
pub struct SiblingHealth {
    last_failure: Option<Instant>,
}

impl SiblingHealth {
    pub fn new() -> Self {
        SiblingHealth { last_failure: None }
    }

    pub fn mark_failed(&mut self, now: Instant) {
        self.last_failure = Some(now);
    }

    pub fn is_available(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(failed_at) => now.duration_since(failed_at) >= Authorizer::SIBLING_UNAVAILABLE,
            None => true,
        }
    }
}

impl Default for SiblingHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportOptions, Pattern};

    struct NoDns;
    impl DnsResolver for NoDns {
        fn reverse(&self, _addr: Ipv4Addr) -> Option<String> {
            None
        }
        fn forward(&self, _name: &str) -> Vec<Ipv4Addr> {
            Vec::new()
        }
    }

    struct NoGroups;
    impl NetgroupResolver for NoGroups {
        fn is_member(&self, _netgroup: &str, _host: &str) -> bool {
            false
        }
    }

    #[test]
    fn unknown_client_is_denied() {
        let mut db = ExportDb::new();
        let mut authz = Authorizer::new(SecurityPolicy { waive_secure_port: false });
        let decision = authz.authorize(Ipv4Addr::new(1, 2, 3, 4), 2049, "/x", &mut db, &NoDns, &NoGroups);
        assert_eq!(decision, Decision::Denied);
    }

    #[test]
    fn addr_mask_client_is_granted_against_matching_mount() {
        let mut db = ExportDb::new();
        db.add_export(
            &Pattern::AddrMask(Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00),
            "/srv/pub",
            ExportOptions { secure_port: false, ..Default::default() },
        );
        let mut authz = Authorizer::new(SecurityPolicy { waive_secure_port: false });
        let decision = authz.authorize(Ipv4Addr::new(10, 0, 0, 5), 2049, "/srv/pub/hello.txt", &mut db, &NoDns, &NoGroups);
        assert!(matches!(decision, Decision::Granted { .. }));
    }

    #[test]
    fn secure_port_option_rejects_unprivileged_source_port() {
        let mut db = ExportDb::new();
        db.add_export(
            &Pattern::AddrMask(Ipv4Addr::new(10, 0, 0, 0), 0xFFFF_FF00),
            "/srv/pub",
            ExportOptions { secure_port: true, ..Default::default() },
        );
        let mut authz = Authorizer::new(SecurityPolicy { waive_secure_port: false });
        let decision = authz.authorize(Ipv4Addr::new(10, 0, 0, 5), 4000, "/srv/pub", &mut db, &NoDns, &NoGroups);
        assert_eq!(decision, Decision::Denied);
    }

    #[test]
    fn negative_result_is_cached() {
        let mut db = ExportDb::new();
        let mut authz = Authorizer::new(SecurityPolicy { waive_secure_port: false });
        let addr = Ipv4Addr::new(1, 2, 3, 4);
        assert_eq!(authz.authorize(addr, 2049, "/x", &mut db, &NoDns, &NoGroups), Decision::Denied);
        assert_eq!(authz.cache.get(addr), Some(None));
    }

    #[test]
    fn sibling_health_recovers_after_cooldown() {
        let mut health = SiblingHealth::new();
        let t0 = Instant::now();
        health.mark_failed(t0);
        assert!(!health.is_available(t0));
        assert!(health.is_available(t0 + Authorizer::SIBLING_UNAVAILABLE));
    }
}
