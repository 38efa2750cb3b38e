//! Identity map (spec §4.H): per-client bidirectional uid/gid translation,
//! with static lookups, dynamic (daemon/NIS) lookups, squashing, and
//! expiry.
//!
//! Storage is a four-level radix trie keyed on successive 8-bit slices of
//! the 32-bit id (spec §3 "Identity map", §4.H "Storage"), so a client that
//! only ever sees a handful of ids allocates only the handful of tiny
//! tables its actual traffic touches, instead of a flat `2^32`-entry table.
//! Reads of never-written keys return `None` without allocating, matching
//! the spec's invariant.

use std::time::{Duration, Instant};

/// How a client's uidmap/gidmap is resolved (exports-file `map_*` options,
/// spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// No squashing: the remote id is used as-is.
    Identity,
    /// Fixed table loaded from the static-map file (spec §6).
    Static,
    /// Resolved on demand via the identity sibling daemon (§6).
    Daemon,
    /// Resolved on demand via NIS.
    Nis,
}

/// Squash behavior applied after mapping (spec §4.H).
#[derive(Debug, Clone, Copy, Default)]
pub struct SquashRules {
    pub root_squash: bool,
    pub all_squash: bool,
    pub anon_uid: u32,
    pub anon_gid: u32,
}

/// Lifetime of a dynamically-resolved entry: `now + 300s` per spec §4.H.
const DYNAMIC_EXPIRY: Duration = Duration::from_secs(300);

/// Resolves remote<->local identities for the daemon/nis map modes. The
/// default (no sibling configured) always fails, which the identity map
/// treats the same as a crashed sibling: the caller falls back to
/// anonymous (spec §7).
pub trait Resolver: Send + Sync {
    fn local_uid_for_remote_name(&self, name: &str) -> Option<u32>;
    fn remote_name_for_local_uid(&self, uid: u32) -> Option<String>;
    fn local_gid_for_remote_name(&self, name: &str) -> Option<u32>;
    fn remote_name_for_local_gid(&self, gid: u32) -> Option<String>;
}

/// A [`Resolver`] that never has an answer, matching §7's "crashed identity
/// sibling" recovery rule generalized to "no sibling configured".
pub struct NoResolver;

impl Resolver for NoResolver {
    fn local_uid_for_remote_name(&self, _name: &str) -> Option<u32> {
        None
    }
    fn remote_name_for_local_uid(&self, _uid: u32) -> Option<String> {
        None
    }
    fn local_gid_for_remote_name(&self, _name: &str) -> Option<u32> {
        None
    }
    fn remote_name_for_local_gid(&self, _gid: u32) -> Option<String> {
        None
    }
}

#[derive(Clone, Copy)]
struct Leaf {
    id: u32,
    /// `None` means permanent (spec: "0 = permanent").
    expires: Option<Instant>,
}

impl Leaf {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires {
            None => true,
            Some(deadline) => now < deadline,
        }
    }
}

/// Four-level radix trie keyed by successive 8-bit slices of a 32-bit id.
/// Each level allocates its 256-entry child table only on first write.
#[derive(Default)]
struct Trie {
    root: Option<Box<[Option<Box<TrieLevel>>; 256]>>,
}

struct TrieLevel {
    children: [Option<Box<TrieLevel2>>; 256],
}

struct TrieLevel2 {
    children: [Option<Box<[Option<Leaf>; 256]>>; 256],
}

impl Trie {
    fn new() -> Self {
        Trie { root: None }
    }

    fn bytes(id: u32) -> [u8; 4] {
        id.to_be_bytes()
    }

    fn get(&self, id: u32, now: Instant) -> Option<u32> {
        let [b0, b1, b2, b3] = Self::bytes(id);
        let l0 = self.root.as_ref()?;
        let l1 = l0[b0 as usize].as_ref()?;
        let l2 = l1.children[b1 as usize].as_ref()?;
        let leaves = l2.children[b2 as usize].as_ref()?;
        let leaf = leaves[b3 as usize]?;
        leaf.is_live(now).then_some(leaf.id)
    }

    fn insert(&mut self, id: u32, value: u32, expires: Option<Instant>) {
        let [b0, b1, b2, b3] = Self::bytes(id);
        let l0 = self.root.get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        let l1 = l0[b0 as usize].get_or_insert_with(|| {
            Box::new(TrieLevel { children: std::array::from_fn(|_| None) })
        });
        let l2 = l1.children[b1 as usize].get_or_insert_with(|| {
            Box::new(TrieLevel2 { children: std::array::from_fn(|_| None) })
        });
        let leaves =
            l2.children[b2 as usize].get_or_insert_with(|| Box::new([None; 256]));
        leaves[b3 as usize] = Some(Leaf { id: value, expires });
    }
}

/// Four sparse tables for one client: uid and gid, each direction.
pub struct IdentityMap {
    mode: MapMode,
    squash: SquashRules,
    uid_remote_to_local: Trie,
    uid_local_to_remote: Trie,
    gid_remote_to_local: Trie,
    gid_local_to_remote: Trie,
}

impl IdentityMap {
    pub fn new(mode: MapMode, squash: SquashRules) -> Self {
        IdentityMap {
            mode,
            squash,
            uid_remote_to_local: Trie::new(),
            uid_local_to_remote: Trie::new(),
            gid_remote_to_local: Trie::new(),
            gid_local_to_remote: Trie::new(),
        }
    }

    /// Loads a static table (from the static-map file, spec §6) as
    /// permanent entries, populating both directions.
    pub fn load_static_uid(&mut self, remote: u32, local: u32) {
        self.uid_remote_to_local.insert(remote, local, None);
        self.uid_local_to_remote.insert(local, remote, None);
    }

    pub fn load_static_gid(&mut self, remote: u32, local: u32) {
        self.gid_remote_to_local.insert(remote, local, None);
        self.gid_local_to_remote.insert(local, remote, None);
    }

    /// Translates a remote uid to a local one, consulting `resolver` for
    /// the daemon/nis modes and applying squash rules afterward.
    pub fn local_uid(&mut self, remote_uid: u32, resolver: &dyn Resolver, now: Instant) -> u32 {
        let mapped = match self.mode {
            MapMode::Identity => remote_uid,
            MapMode::Static => {
                self.uid_remote_to_local.get(remote_uid, now).unwrap_or(self.squash.anon_uid)
            }
            MapMode::Daemon | MapMode::Nis => {
                if let Some(local) = self.uid_remote_to_local.get(remote_uid, now) {
                    local
                } else if let Some(name) = resolver.remote_name_for_local_uid(remote_uid) {
                    // Dynamic modes key by name externally; here the
                    // sibling is asked to resolve the *local* name for the
                    // id it was given, matching unfsd's ugidd round trip.
                    let local = resolver.local_uid_for_remote_name(&name).unwrap_or(self.squash.anon_uid);
                    let expiry = Some(now + DYNAMIC_EXPIRY);
                    self.uid_remote_to_local.insert(remote_uid, local, expiry);
                    self.uid_local_to_remote.insert(local, remote_uid, expiry);
                    local
                } else {
                    self.squash.anon_uid
                }
            }
        };
        self.apply_squash_uid(mapped)
    }

    pub fn remote_uid(&mut self, local_uid: u32, now: Instant) -> u32 {
        match self.mode {
            MapMode::Identity => local_uid,
            _ => self.uid_local_to_remote.get(local_uid, now).unwrap_or(self.squash.anon_uid),
        }
    }

    pub fn local_gid(&mut self, remote_gid: u32, resolver: &dyn Resolver, now: Instant) -> u32 {
        let mapped = match self.mode {
            MapMode::Identity => remote_gid,
            MapMode::Static => {
                self.gid_remote_to_local.get(remote_gid, now).unwrap_or(self.squash.anon_gid)
            }
            MapMode::Daemon | MapMode::Nis => {
                if let Some(local) = self.gid_remote_to_local.get(remote_gid, now) {
                    local
                } else if let Some(name) = resolver.remote_name_for_local_gid(remote_gid) {
                    let local = resolver.local_gid_for_remote_name(&name).unwrap_or(self.squash.anon_gid);
                    let expiry = Some(now + DYNAMIC_EXPIRY);
                    self.gid_remote_to_local.insert(remote_gid, local, expiry);
                    self.gid_local_to_remote.insert(local, remote_gid, expiry);
                    local
                } else {
                    self.squash.anon_gid
                }
            }
        };
        mapped
    }

    pub fn remote_gid(&mut self, local_gid: u32, now: Instant) -> u32 {
        match self.mode {
            MapMode::Identity => local_gid,
            _ => self.gid_local_to_remote.get(local_gid, now).unwrap_or(self.squash.anon_gid),
        }
    }

    /// Applies root/all squash *after* mapping (spec §4.H: "Squashes apply
    /// after mapping").
    fn apply_squash_uid(&self, mapped_uid: u32) -> u32 {
        if self.squash.all_squash {
            self.squash.anon_uid
        } else if self.squash.root_squash && mapped_uid == 0 {
            self.squash.anon_uid
        } else {
            mapped_uid
        }
    }

    /// Truncates an id into 16 bits for systems that wrap uids, applied
    /// just before the syscall boundary (spec §4.H).
    pub fn truncate_16(id: u32) -> u32 {
        id & 0xFFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mode_passes_through() {
        let mut map = IdentityMap::new(MapMode::Identity, SquashRules::default());
        assert_eq!(map.local_uid(1000, &NoResolver, Instant::now()), 1000);
    }

    #[test]
    fn static_mode_misses_fall_back_to_anon() {
        let squash = SquashRules { anon_uid: 65534, ..Default::default() };
        let mut map = IdentityMap::new(MapMode::Static, squash);
        map.load_static_uid(1000, 2000);
        assert_eq!(map.local_uid(1000, &NoResolver, Instant::now()), 2000);
        assert_eq!(map.local_uid(9999, &NoResolver, Instant::now()), 65534);
    }

    #[test]
    fn root_squash_applies_after_mapping() {
        let squash = SquashRules { root_squash: true, anon_uid: 65534, ..Default::default() };
        let mut map = IdentityMap::new(MapMode::Static, squash);
        map.load_static_uid(0, 0);
        assert_eq!(map.local_uid(0, &NoResolver, Instant::now()), 65534);
    }

    #[test]
    fn all_squash_applies_to_every_id() {
        let squash = SquashRules { all_squash: true, anon_uid: 65534, ..Default::default() };
        let mut map = IdentityMap::new(MapMode::Static, squash);
        map.load_static_uid(42, 42);
        assert_eq!(map.local_uid(42, &NoResolver, Instant::now()), 65534);
    }

    #[test]
    fn reverse_mapping_round_trips_to_remote_or_anon() {
        let mut map = IdentityMap::new(MapMode::Static, SquashRules { anon_uid: 65534, ..Default::default() });
        map.load_static_uid(1000, 2000);
        let now = Instant::now();
        let local = map.local_uid(1000, &NoResolver, now);
        let remote = map.remote_uid(local, now);
        assert!(remote == 1000 || remote == 65534);
    }

    #[test]
    fn never_written_key_returns_none_without_allocating() {
        let trie = Trie::new();
        assert!(trie.root.is_none());
        assert_eq!(trie.get(123456, Instant::now()), None);
    }

    #[test]
    fn dynamic_lookup_expires() {
        struct Sibling;
        impl Resolver for Sibling {
            fn local_uid_for_remote_name(&self, _name: &str) -> Option<u32> {
                Some(42)
            }
            fn remote_name_for_local_uid(&self, uid: u32) -> Option<String> {
                Some(format!("user{uid}"))
            }
            fn local_gid_for_remote_name(&self, _name: &str) -> Option<u32> {
                None
            }
            fn remote_name_for_local_gid(&self, _gid: u32) -> Option<String> {
                None
            }
        }

        let mut map = IdentityMap::new(MapMode::Daemon, SquashRules { anon_uid: 65534, ..Default::default() });
        let now = Instant::now();
        assert_eq!(map.local_uid(7, &Sibling, now), 42);

        let far_future = now + Duration::from_secs(301);
        // Expired entry should be re-resolved, not silently kept.
        assert_eq!(map.local_uid(7, &Sibling, far_future), 42);
    }

    #[test]
    fn truncate_16_wraps_ids() {
        assert_eq!(IdentityMap::truncate_16(0x1_0001), 1);
    }
}
