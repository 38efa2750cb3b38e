//! File-handle cache (spec §4.C): the stateless-to-stateful bridge.
//! Maps a wire [`Handle`] to a live path and, on demand, an open
//! descriptor, backed by a two-tier LRU (entries, and separately
//! descriptor-holding entries) plus a pseudo-inode hash chain for lookup.
//!
//! Membership in all three structures is expressed as [`lru::Key`] links
//! inside each [`Entry`] (Design Notes §9), rather than the original's
//! intrusive pointers (`fhcache` in `fh.c`).

mod lru;

use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::context::MountId;
use crate::devtable::DeviceTable;
use crate::error::{Result, Stat};
use crate::export::ClientId;
use crate::handle::{AncestorHash, Handle, MAX_HASH_DEPTH};
use crate::psi::Encoder;
use crate::rebuild;

pub use lru::Key;

/// Maximum resident cache entries (spec §3 "Invariants").
pub const FH_LIMIT: usize = 2000;

/// Entries unused for this long are evicted by [`FileHandleCache::flush`]
/// (spec §4.C).
pub const DISCARD_INTERVAL: Duration = Duration::from_secs(3600);
/// Descriptors unused for this long are closed by `flush` even if the
/// entry survives (spec §4.C).
pub const CLOSE_INTERVAL: Duration = Duration::from_secs(5);

/// `hash_xor8` bucket count, matching the original's `HASH_TAB_SIZE`.
const HASH_BUCKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    /// Whether a descriptor opened under `self` can serve a request that
    /// asked for `requested` (spec §4.C: "reuses a cached descriptor only
    /// if ... read-write satisfies a later read-only or write-only
    /// request").
    fn satisfies(self, requested: OpenMode) -> bool {
        self == OpenMode::ReadWrite || self == requested
    }
}

pub struct Descriptor {
    pub file: File,
    pub mode: OpenMode,
    pub opened_as_uid: u32,
    last_used: Instant,
    fd_prev: Option<Key>,
    fd_next: Option<Key>,
}

struct Entry {
    path: PathBuf,
    pseudo_inode: u32,
    attrs: Metadata,
    descriptor: Option<Descriptor>,
    last_used: Instant,
    /// Hints only (spec §4.C "Consistency rules"); never trusted without
    /// re-running authorization.
    hint_client: Option<ClientId>,
    hint_mount: Option<MountId>,
    lru_prev: Option<Key>,
    lru_next: Option<Key>,
    hash_next: Option<Key>,
}

/// Lookup strategy for [`FileHandleCache::find`] (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Rebuild from the handle if not cached; fail with `stale` if no path
    /// exists.
    MustExist,
    /// Caller is about to create the target; a cache miss is not an
    /// error, just means there is nothing to hand back yet.
    WillCreate,
    /// Only ever consult the cache; never rebuilds.
    CachedOnly,
}

pub struct FileHandleCache {
    slab: lru::Slab<Entry>,
    lru_head: Option<Key>,
    lru_tail: Option<Key>,
    fd_head: Option<Key>,
    fd_tail: Option<Key>,
    hash_buckets: [Option<Key>; HASH_BUCKETS],
    by_psi: HashMap<u32, Key>,
    len: usize,
    open_fds: usize,
    fh_limit: usize,
    fd_limit: usize,
    discard_interval: Duration,
    close_interval: Duration,
}

impl FileHandleCache {
    pub fn new(fd_limit: usize) -> Self {
        FileHandleCache {
            slab: lru::Slab::new(),
            lru_head: None,
            lru_tail: None,
            fd_head: None,
            fd_tail: None,
            hash_buckets: [None; HASH_BUCKETS],
            by_psi: HashMap::new(),
            len: 0,
            open_fds: 0,
            fh_limit: FH_LIMIT,
            fd_limit,
            discard_interval: DISCARD_INTERVAL,
            close_interval: CLOSE_INTERVAL,
        }
    }

    /// Overrides the handle-discard and descriptor-close cadences normally
    /// fixed at [`DISCARD_INTERVAL`]/[`CLOSE_INTERVAL`] (the ambient TOML
    /// tunables file, §6 "Configuration").
    pub fn set_intervals(&mut self, discard: Duration, close: Duration) {
        self.discard_interval = discard;
        self.close_interval = close;
    }

    /// Overrides the resident-handle ceiling normally fixed at
    /// [`FH_LIMIT`].
    pub fn set_fh_limit(&mut self, limit: usize) {
        self.fh_limit = limit;
    }

    fn bucket_of(psi: u32) -> usize {
        (psi % HASH_BUCKETS as u32) as usize
    }

    fn link_lru_head(&mut self, key: Key) {
        if let Some(head) = self.lru_head {
            if let Some(e) = self.slab.get_mut(key) {
                e.lru_next = Some(head);
            }
            if let Some(h) = self.slab.get_mut(head) {
                h.lru_prev = Some(key);
            }
        } else {
            self.lru_tail = Some(key);
        }
        self.lru_head = Some(key);
    }

    fn unlink_lru(&mut self, key: Key) {
        let (prev, next) = match self.slab.get(key) {
            Some(e) => (e.lru_prev, e.lru_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(pe) = self.slab.get_mut(p) {
                    pe.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(ne) = self.slab.get_mut(n) {
                    ne.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
        if let Some(e) = self.slab.get_mut(key) {
            e.lru_prev = None;
            e.lru_next = None;
        }
    }

    fn touch(&mut self, key: Key) {
        self.unlink_lru(key);
        self.link_lru_head(key);
        if let Some(e) = self.slab.get_mut(key) {
            e.last_used = Instant::now();
        }
    }

    fn link_hash(&mut self, key: Key, psi: u32) {
        let bucket = Self::bucket_of(psi);
        let head = self.hash_buckets[bucket];
        if let Some(e) = self.slab.get_mut(key) {
            e.hash_next = head;
        }
        self.hash_buckets[bucket] = Some(key);
        self.by_psi.insert(psi, key);
    }

    fn unlink_hash(&mut self, key: Key, psi: u32) {
        let bucket = Self::bucket_of(psi);
        let mut cursor = self.hash_buckets[bucket];
        let mut prev: Option<Key> = None;
        while let Some(cur) = cursor {
            let next = self.slab.get(cur).and_then(|e| e.hash_next);
            if cur == key {
                match prev {
                    Some(p) => {
                        if let Some(pe) = self.slab.get_mut(p) {
                            pe.hash_next = next;
                        }
                    }
                    None => self.hash_buckets[bucket] = next,
                }
                break;
            }
            prev = Some(cur);
            cursor = next;
        }
        self.by_psi.remove(&psi);
    }

    fn link_fd_head(&mut self, key: Key) {
        if let Some(head) = self.fd_head {
            if let Some(e) = self.slab.get_mut(key).and_then(|e| e.descriptor.as_mut()) {
                e.fd_next = Some(head);
            }
            if let Some(h) = self.slab.get_mut(head).and_then(|e| e.descriptor.as_mut()) {
                h.fd_prev = Some(key);
            }
        } else {
            self.fd_tail = Some(key);
        }
        self.fd_head = Some(key);
    }

    fn unlink_fd(&mut self, key: Key) {
        let (prev, next) = match self.slab.get(key).and_then(|e| e.descriptor.as_ref()) {
            Some(d) => (d.fd_prev, d.fd_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(pd) = self.slab.get_mut(p).and_then(|e| e.descriptor.as_mut()) {
                    pd.fd_next = next;
                }
            }
            None => self.fd_head = next,
        }
        match next {
            Some(n) => {
                if let Some(nd) = self.slab.get_mut(n).and_then(|e| e.descriptor.as_mut()) {
                    nd.fd_prev = prev;
                }
            }
            None => self.fd_tail = prev,
        }
    }

    /// Closes the descriptor-LRU tail entry's descriptor to make room
    /// under `FD_LIMIT`, keeping the cache entry itself resident.
    fn evict_oldest_descriptor(&mut self) {
        let Some(tail) = self.fd_tail else { return };
        self.unlink_fd(tail);
        if let Some(e) = self.slab.get_mut(tail) {
            e.descriptor = None;
        }
        self.open_fds = self.open_fds.saturating_sub(1);
    }

    fn evict(&mut self, key: Key) {
        let Some(entry) = self.slab.get(key) else { return };
        let psi = entry.pseudo_inode;
        let had_descriptor = entry.descriptor.is_some();
        self.unlink_lru(key);
        self.unlink_hash(key, psi);
        if had_descriptor {
            self.unlink_fd(key);
            self.open_fds = self.open_fds.saturating_sub(1);
        }
        self.slab.remove(key);
        self.len -= 1;
    }

    fn insert_entry(&mut self, path: PathBuf, pseudo_inode: u32, attrs: Metadata) -> Key {
        let entry = Entry {
            path,
            pseudo_inode,
            attrs,
            descriptor: None,
            last_used: Instant::now(),
            hint_client: None,
            hint_mount: None,
            lru_prev: None,
            lru_next: None,
            hash_next: None,
        };
        let key = self.slab.insert(entry);
        self.link_lru_head(key);
        self.link_hash(key, pseudo_inode);
        self.len += 1;
        while self.len > self.fh_limit {
            let Some(tail) = self.lru_tail else { break };
            self.evict(tail);
        }
        key
    }

    /// Resolves `handle` to a live cache entry, rebuilding its path from
    /// `root` on a miss when `mode` is [`FindMode::MustExist`].
    ///
    /// `check`: when true, re-`lstat`s a cache hit's path; a vanished file
    /// or pseudo-inode mismatch evicts the stale entry and falls through
    /// to a rebuild, matching the cache's one-silent-retry rule (spec §7).
    pub fn find(
        &mut self,
        handle: &Handle,
        mode: FindMode,
        check: bool,
        root: &Path,
        encoder: &Encoder,
        devtable: &mut DeviceTable,
    ) -> Result<Key> {
        if let Some(&key) = self.by_psi.get(&handle.pseudo_inode) {
            if check {
                let entry = self.slab.get(key).expect("by_psi index is consistent with the slab");
                match std::fs::symlink_metadata(&entry.path) {
                    Ok(meta) if meta.dev() == entry.attrs.dev() && meta.ino() == entry.attrs.ino() => {
                        self.touch(key);
                        if let Some(e) = self.slab.get_mut(key) {
                            e.attrs = meta;
                        }
                        return Ok(key);
                    }
                    _ => {
                        self.evict(key);
                    }
                }
            } else {
                self.touch(key);
                return Ok(key);
            }
        }

        match mode {
            FindMode::CachedOnly => Err(Stat::Stale),
            FindMode::WillCreate => Err(Stat::Stale),
            FindMode::MustExist => {
                let path = rebuild::rebuild(root, handle, encoder, devtable)?;
                let attrs = std::fs::symlink_metadata(&path).map_err(|e| Stat::from_io_error(&e))?;
                let key = self.insert_entry(path, handle.pseudo_inode, attrs);
                Ok(key)
            }
        }
    }

    /// Builds a fresh handle for `path` by walking its ancestors under
    /// `root`, computing each one's pseudo-inode (spec §4.C `create`).
    pub fn create(&mut self, root: &Path, path: &Path, encoder: &Encoder, devtable: &mut DeviceTable) -> Result<(Handle, Key)> {
        let relative = path.strip_prefix(root).map_err(|_| Stat::Inval)?;
        let mut hashes: Vec<AncestorHash> = Vec::new();
        let mut cursor = root.to_path_buf();

        let root_meta = std::fs::symlink_metadata(root).map_err(|e| Stat::from_io_error(&e))?;
        let mut psi = encoder.encode(root_meta.dev(), root_meta.ino(), devtable).map_err(|e| Stat::from_io_error(&e))?;

        let components: Vec<_> = relative.components().collect();
        for (i, component) in components.iter().enumerate() {
            let is_last = i + 1 == components.len();
            if !is_last {
                hashes.push(hash_psi(psi));
                if hashes.len() > MAX_HASH_DEPTH {
                    return Err(Stat::NameTooLong);
                }
            }
            cursor.push(component);
            let meta = std::fs::symlink_metadata(&cursor).map_err(|e| Stat::from_io_error(&e))?;
            psi = encoder.encode(meta.dev(), meta.ino(), devtable).map_err(|e| Stat::from_io_error(&e))?;
        }

        let handle = Handle::new(psi, &hashes)?;
        let attrs = std::fs::symlink_metadata(&cursor).map_err(|e| Stat::from_io_error(&e))?;
        let key = self.insert_entry(cursor, psi, attrs);
        Ok((handle, key))
    }

    /// Inserts an entry for a path whose handle was already computed by the
    /// caller (spec §4.C `compose`/`link`/`rename` callers), without
    /// re-deriving it through a root-relative rebuild.
    pub fn insert_resolved(&mut self, path: PathBuf, pseudo_inode: u32) -> Result<Key> {
        if let Some(&key) = self.by_psi.get(&pseudo_inode) {
            self.touch(key);
            return Ok(key);
        }
        let attrs = std::fs::symlink_metadata(&path).map_err(|e| Stat::from_io_error(&e))?;
        Ok(self.insert_entry(path, pseudo_inode, attrs))
    }

    /// Returns the live path for a cached entry.
    pub fn path(&self, key: Key) -> Result<&Path> {
        self.slab.get(key).map(|e| e.path.as_path()).ok_or(Stat::Stale)
    }

    pub fn attrs(&self, key: Key) -> Result<&Metadata> {
        self.slab.get(key).map(|e| &e.attrs).ok_or(Stat::Stale)
    }

    pub fn refresh_attrs(&mut self, key: Key) -> Result<()> {
        let path = self.slab.get(key).ok_or(Stat::Stale)?.path.clone();
        let attrs = std::fs::symlink_metadata(&path).map_err(|e| Stat::from_io_error(&e))?;
        if let Some(e) = self.slab.get_mut(key) {
            e.attrs = attrs;
        }
        Ok(())
    }

    pub fn hints(&self, key: Key) -> Option<(Option<ClientId>, Option<MountId>)> {
        self.slab.get(key).map(|e| (e.hint_client, e.hint_mount))
    }

    pub fn set_hints(&mut self, key: Key, client: ClientId, mount: MountId) {
        if let Some(e) = self.slab.get_mut(key) {
            e.hint_client = Some(client);
            e.hint_mount = Some(mount);
        }
    }

    /// Opens (or reuses) a descriptor for `key` under `mode`. Forces
    /// descriptor-LRU evictions to stay under `FD_LIMIT` (spec §4.C).
    pub fn fd(&mut self, key: Key, mode: OpenMode, opener_uid: u32) -> Result<&File> {
        let reusable = self
            .slab
            .get(key)
            .and_then(|e| e.descriptor.as_ref())
            .is_some_and(|d| d.opened_as_uid == opener_uid && d.mode.satisfies(mode));

        if reusable {
            self.unlink_fd(key);
            self.link_fd_head(key);
            let entry = self.slab.get_mut(key).ok_or(Stat::Stale)?;
            let descriptor = entry.descriptor.as_mut().expect("checked reusable above");
            descriptor.last_used = Instant::now();
            return Ok(&descriptor.file);
        }

        let path = self.slab.get(key).ok_or(Stat::Stale)?.path.clone();
        let had_descriptor = self.slab.get(key).is_some_and(|e| e.descriptor.is_some());
        if had_descriptor {
            self.unlink_fd(key);
            self.open_fds = self.open_fds.saturating_sub(1);
        }

        let mut options = std::fs::OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Write => {
                options.write(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true);
            }
        }
        let file = options.open(&path).map_err(|e| Stat::from_io_error(&e))?;

        if self.open_fds >= self.fd_limit {
            self.evict_oldest_descriptor();
        }

        let entry = self.slab.get_mut(key).ok_or(Stat::Stale)?;
        entry.descriptor =
            Some(Descriptor { file, mode, opened_as_uid: opener_uid, last_used: Instant::now(), fd_prev: None, fd_next: None });
        self.open_fds += 1;
        self.link_fd_head(key);

        Ok(&self.slab.get(key).unwrap().descriptor.as_ref().unwrap().file)
    }

    /// Resolves `.`/`..` without a filesystem call, and otherwise opens
    /// `name` under the directory's path, extending its hash path by one
    /// level (spec §4.C `compose`).
    pub fn compose(
        &mut self,
        dir_key: Key,
        name: &str,
        dir_handle: &Handle,
        encoder: &Encoder,
        devtable: &mut DeviceTable,
    ) -> Result<(Handle, PathBuf)> {
        if name.contains('/') {
            return Err(Stat::Access);
        }
        let dir_path = self.path(dir_key)?.to_path_buf();

        if name == "." {
            return Ok((*dir_handle, dir_path));
        }
        if name == ".." {
            let parent = dir_path.parent().map(Path::to_path_buf).unwrap_or_else(|| dir_path.clone());
            let parent_meta = std::fs::symlink_metadata(&parent).map_err(|e| Stat::from_io_error(&e))?;
            let parent_psi = encoder.encode(parent_meta.dev(), parent_meta.ino(), devtable).map_err(|e| Stat::from_io_error(&e))?;
            let hashes = &dir_handle.hash_path()[..dir_handle.depth().saturating_sub(1)];
            let handle = Handle::new(parent_psi, hashes)?;
            return Ok((handle, parent));
        }

        let child_path = dir_path.join(name);
        let dir_meta = std::fs::symlink_metadata(&dir_path).map_err(|e| Stat::from_io_error(&e))?;
        let dir_psi = encoder.encode(dir_meta.dev(), dir_meta.ino(), devtable).map_err(|e| Stat::from_io_error(&e))?;
        let child_meta = std::fs::symlink_metadata(&child_path).map_err(|e| Stat::from_io_error(&e))?;
        let child_psi = encoder.encode(child_meta.dev(), child_meta.ino(), devtable).map_err(|e| Stat::from_io_error(&e))?;

        let mut hashes = dir_handle.hash_path().to_vec();
        hashes.push(hash_psi(dir_psi));
        let handle = Handle::new(child_psi, &hashes)?;
        Ok((handle, child_path))
    }

    /// Evicts any cached entry for `path` (spec §4.C `remove`).
    pub fn remove(&mut self, path: &Path) {
        let mut to_evict = Vec::new();
        for (&psi, &key) in self.by_psi.iter() {
            if self.slab.get(key).is_some_and(|e| e.path == path) {
                to_evict.push((psi, key));
            }
        }
        for (_, key) in to_evict {
            self.evict(key);
        }
    }

    /// Periodic expiry (spec §4.C `flush`): with `force`, discard
    /// everything unconditionally (used on `SIGHUP` reinitialization);
    /// otherwise apply the normal age thresholds.
    pub fn flush(&mut self, force: bool) {
        let now = Instant::now();
        let mut stale_entries = Vec::new();
        let mut stale_descriptors = Vec::new();

        let mut cursor = self.lru_tail;
        while let Some(key) = cursor {
            let entry = match self.slab.get(key) {
                Some(e) => e,
                None => break,
            };
            cursor = entry.lru_prev;
            if force || now.duration_since(entry.last_used) >= self.discard_interval {
                stale_entries.push(key);
                continue;
            }
            if let Some(d) = &entry.descriptor {
                if force || now.duration_since(d.last_used) >= self.close_interval {
                    stale_descriptors.push(key);
                }
            }
        }

        for key in stale_descriptors {
            self.unlink_fd(key);
            if let Some(e) = self.slab.get_mut(key) {
                e.descriptor = None;
            }
            self.open_fds = self.open_fds.saturating_sub(1);
        }
        for key in stale_entries {
            self.evict(key);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn open_descriptors(&self) -> usize {
        self.open_fds
    }
}

/// `hash_xor8` from the original's `fh.c`, shared with the path rebuilder.
fn hash_psi(psi: u32) -> u8 {
    (psi ^ (psi >> 8) ^ (psi >> 16) ^ (psi >> 24)) as u8
}
