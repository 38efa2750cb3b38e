//! Export database (spec §4.F): resolves a caller into a client record by
//! matching seven ordered pattern buckets, then answers mount-point lookups
//! for that client.
//!
//! Grounded in the original server's `auth.c`, which keeps exactly these
//! seven linked lists (`known_clients`, `unknown_clients`,
//! `wildcard_clients`, `netgroup_clients`, `netmask_clients`,
//! `anonymous_client`, `default_client`) and walks them in the same order.
//! Here each bucket is a flat collection keyed for its own match shape
//! instead of a linked list, but the match order and precedence rules are
//! unchanged.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Cap on how many distinct addresses may share the anonymous client's
/// cache entry before it is periodically flushed (spec §4.F).
pub const MAX_CACHED_ANONYMOUS: usize = 1000;

/// `uidmap` option (exports file, spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidMapMode {
    Identity,
    Static,
    Daemon,
    Nis,
}

/// Per-export option set (spec §3 "Options", §6 exports-file options).
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub read_only: bool,
    pub secure_port: bool,
    pub root_squash: bool,
    pub all_squash: bool,
    pub some_squash: bool,
    pub no_access: bool,
    pub cross_mounts: bool,
    pub link_relative: bool,
    pub uidmap: UidMapMode,
    pub anon_uid: u32,
    pub anon_gid: u32,
    pub nis_domain: Option<String>,
    /// Extra uid/gid ranges squashed to anonymous (`squash_uids=`,
    /// `squash_gids=`), each an inclusive `(low, high)` pair.
    pub squash_uids: Vec<(u32, u32)>,
    pub squash_gids: Vec<(u32, u32)>,
    /// `(remote, local)` pairs loaded from the static-map file named by
    /// `map_static=FILE` (spec §6 "Static-map file"), empty for every other
    /// `uidmap` mode.
    pub static_uid_map: Vec<(u32, u32)>,
    pub static_gid_map: Vec<(u32, u32)>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            read_only: false,
            secure_port: true,
            root_squash: true,
            all_squash: false,
            some_squash: false,
            no_access: false,
            cross_mounts: false,
            link_relative: false,
            uidmap: UidMapMode::Identity,
            anon_uid: 65534,
            anon_gid: 65534,
            nis_domain: None,
            squash_uids: Vec::new(),
            squash_gids: Vec::new(),
            static_uid_map: Vec::new(),
            static_gid_map: Vec::new(),
        }
    }
}

impl ExportOptions {
    /// Whether `uid` falls in a `squash_uids=` range or equals 0 under
    /// `root_squash`, or `all_squash` is set.
    pub fn squashes_uid(&self, uid: u32) -> bool {
        self.all_squash
            || (self.root_squash && uid == 0)
            || self.squash_uids.iter().any(|&(lo, hi)| uid >= lo && uid <= hi)
    }

    pub fn squashes_gid(&self, gid: u32) -> bool {
        self.all_squash || self.squash_gids.iter().any(|&(lo, hi)| gid >= lo && gid <= hi)
    }
}

/// One exported mount point owned by a client record.
#[derive(Debug, Clone)]
pub struct MountPoint {
    /// Canonical absolute path, trailing slashes stripped.
    pub path: String,
    pub options: ExportOptions,
    /// Index, within the same client's mount list, of the longest strictly
    /// shorter path that is a prefix of this one.
    pub parent: Option<usize>,
}

impl MountPoint {
    fn new(path: impl Into<String>, options: ExportOptions) -> Self {
        let mut path = path.into();
        while path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        MountPoint { path, options, parent: None }
    }

    /// True when `candidate` is this mount's path, or a path below it
    /// (spec §4.F "Mount-point lookup").
    pub(crate) fn matches_prefix(&self, candidate: &str) -> bool {
        if candidate == self.path {
            return true;
        }
        candidate.strip_prefix(self.path.as_str()).is_some_and(|rest| rest.starts_with('/'))
            || (self.path == "/" && candidate.starts_with('/'))
    }
}

/// Opaque reference to a [`ClientRecord`] inside an [`ExportDb`].
pub type ClientId = usize;

/// All mount points that belong to one exports-file client token,
/// aggregated across however many lines named that client (spec §4.F:
/// "All matching client records contribute their mount lists").
#[derive(Debug, Default)]
pub struct ClientRecord {
    /// Sorted by descending path length so prefix matching finds the most
    /// specific export first (spec §3).
    mounts: Vec<MountPoint>,
}

impl ClientRecord {
    fn add(&mut self, mount: MountPoint) {
        self.mounts.push(mount);
        self.mounts.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        self.recompute_parents();
    }

    fn recompute_parents(&mut self) {
        for i in 0..self.mounts.len() {
            let mut parent = None;
            for j in 0..self.mounts.len() {
                if i == j {
                    continue;
                }
                if self.mounts[j].path.len() < self.mounts[i].path.len()
                    && self.mounts[j].matches_prefix(&self.mounts[i].path)
                {
                    parent = Some(match parent {
                        None => j,
                        Some(p) if self.mounts[j].path.len() > self.mounts[p].path.len() => j,
                        Some(p) => p,
                    });
                }
            }
            self.mounts[i].parent = parent;
        }
    }

    /// Finds the most specific mount point containing `path` (spec §4.F).
    pub fn lookup(&self, path: &str) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.matches_prefix(path))
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }
}

/// Resolves netgroup membership (`@group` client patterns). The system
/// implementation shells out to glibc's `innetgr(3)`, which the original
/// server also relies on (`auth.c`).
pub trait NetgroupResolver: Send + Sync {
    fn is_member(&self, netgroup: &str, host: &str) -> bool;
}

/// [`NetgroupResolver`] backed by the platform's `innetgr(3)`.
pub struct SystemNetgroups;

#[cfg(target_os = "linux")]
extern "C" {
    fn innetgr(
        netgroup: *const libc::c_char,
        host: *const libc::c_char,
        user: *const libc::c_char,
        domain: *const libc::c_char,
    ) -> libc::c_int;
}

impl NetgroupResolver for SystemNetgroups {
    #[cfg(target_os = "linux")]
    fn is_member(&self, netgroup: &str, host: &str) -> bool {
        use std::ffi::CString;
        let Ok(netgroup) = CString::new(netgroup) else { return false };
        let Ok(host) = CString::new(host) else { return false };
        unsafe { innetgr(netgroup.as_ptr(), host.as_ptr(), std::ptr::null(), std::ptr::null()) != 0 }
    }

    #[cfg(not(target_os = "linux"))]
    fn is_member(&self, _netgroup: &str, _host: &str) -> bool {
        false
    }
}

/// A client pattern as written in the exports file, grouped by which of the
/// seven buckets it lives in once loaded.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Wildcard(String),
    Netgroup(String),
    AddrMask(Ipv4Addr, u32),
    Anonymous,
    Default,
}

/// The loaded set of exports: seven buckets plus the client records they
/// point at.
pub struct ExportDb {
    clients: Vec<ClientRecord>,
    literal: HashMap<String, ClientId>,
    /// Names seen as literal patterns in the exports file whose reverse
    /// lookup previously failed; matched by raw string equality before
    /// wildcard/netgroup resolution is attempted again (spec §4.F step 2).
    unresolved: HashMap<String, ClientId>,
    /// Sorted by descending pattern length (spec §4.F step 3).
    wildcard: Vec<(String, ClientId)>,
    netgroup: Vec<(String, ClientId)>,
    addr_mask: Vec<(Ipv4Addr, u32, ClientId)>,
    anonymous: Option<ClientId>,
    default: Option<ClientId>,
    anonymous_seen: HashMap<Ipv4Addr, ()>,
}

impl ExportDb {
    pub fn new() -> Self {
        ExportDb {
            clients: Vec::new(),
            literal: HashMap::new(),
            unresolved: HashMap::new(),
            wildcard: Vec::new(),
            netgroup: Vec::new(),
            addr_mask: Vec::new(),
            anonymous: None,
            default: None,
            anonymous_seen: HashMap::new(),
        }
    }

    fn client_for(&mut self, pattern: &Pattern) -> ClientId {
        let existing = match pattern {
            Pattern::Literal(name) => self.literal.get(name).copied(),
            Pattern::Wildcard(pat) => self.wildcard.iter().find(|(p, _)| p == pat).map(|(_, id)| *id),
            Pattern::Netgroup(name) => self.netgroup.iter().find(|(n, _)| n == name).map(|(_, id)| *id),
            Pattern::AddrMask(addr, mask) => self
                .addr_mask
                .iter()
                .find(|(a, m, _)| a == addr && m == mask)
                .map(|(_, _, id)| id)
                .copied(),
            Pattern::Anonymous => self.anonymous,
            Pattern::Default => self.default,
        };
        if let Some(id) = existing {
            return id;
        }

        let id = self.clients.len();
        self.clients.push(ClientRecord::default());
        match pattern {
            Pattern::Literal(name) => {
                self.literal.insert(name.clone(), id);
            }
            Pattern::Wildcard(pat) => {
                self.wildcard.push((pat.clone(), id));
                self.wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            Pattern::Netgroup(name) => self.netgroup.push((name.clone(), id)),
            Pattern::AddrMask(addr, mask) => self.addr_mask.push((*addr, *mask, id)),
            Pattern::Anonymous => self.anonymous = Some(id),
            Pattern::Default => self.default = Some(id),
        }
        id
    }

    /// Adds one exported mount point under `pattern` (one exports-file
    /// `<client>(<opts>)` token). Called once per (path, client-token) pair
    /// while loading the exports file.
    pub fn add_export(&mut self, pattern: &Pattern, path: impl Into<String>, options: ExportOptions) {
        let id = self.client_for(pattern);
        self.clients[id].add(MountPoint::new(path, options));
    }

    /// Marks `name` as a previously-unresolved literal (spec §4.F step 2):
    /// a reverse lookup that once failed for `addr` is remembered by name
    /// so later requests skip repeating the DNS round trip.
    pub fn note_unresolved(&mut self, name: &str, id: ClientId) {
        self.unresolved.insert(name.to_string(), id);
    }

    /// Resolves `addr` (with `name`, if the reverse lookup in 4.E
    /// succeeded) to a client record, following the bucket order of spec
    /// §4.F. Returns `None` on no match at all (caller denies access).
    pub fn resolve(&mut self, addr: Ipv4Addr, name: Option<&str>, netgroups: &dyn NetgroupResolver) -> Option<ClientId> {
        if let Some(name) = name {
            if let Some(&id) = self.literal.get(name) {
                return Some(id);
            }
            if let Some(&id) = self.unresolved.get(name) {
                return Some(id);
            }
            for (pattern, id) in &self.wildcard {
                if wildcard_matches(pattern, name) {
                    return Some(*id);
                }
            }
            for (group, id) in &self.netgroup {
                if netgroups.is_member(group, name) {
                    return Some(*id);
                }
            }
        }

        for &(network, mask, id) in &self.addr_mask {
            if addr_in_network(addr, network, mask) {
                return Some(id);
            }
        }

        if let Some(id) = self.anonymous {
            if self.anonymous_seen.len() < MAX_CACHED_ANONYMOUS {
                self.anonymous_seen.insert(addr, ());
            }
            return Some(id);
        }

        self.default
    }

    /// Periodic bound on anonymous-client address tracking (spec §4.F:
    /// "otherwise the cache is periodically flushed to bound growth").
    pub fn flush_anonymous_cache(&mut self) {
        self.anonymous_seen.clear();
    }

    pub fn client(&self, id: ClientId) -> &ClientRecord {
        &self.clients[id]
    }
}

impl Default for ExportDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Matches a host-pattern glob: `*` is any run of non-dot characters (zero
/// or more), `?` is exactly one non-dot character. The host label (before
/// the first dot) is compared case-sensitively; everything from the first
/// dot onward is folded to lowercase first (spec §4.F step 3).
pub fn wildcard_matches(pattern: &str, name: &str) -> bool {
    glob_match(fold_domain(pattern).as_bytes(), fold_domain(name).as_bytes())
}

fn fold_domain(s: &str) -> String {
    match s.find('.') {
        Some(idx) => {
            let (host, rest) = s.split_at(idx);
            format!("{host}{}", rest.to_lowercase())
        }
        None => s.to_string(),
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == text[t] || (pattern[p] == b'?' && text[t] != b'.')) {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            if text[st] == b'.' {
                return false;
            }
            p = sp + 1;
            t = st + 1;
            star = Some((sp, t));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

fn addr_in_network(addr: Ipv4Addr, network: Ipv4Addr, mask: u32) -> bool {
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}
