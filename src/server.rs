//! Shared daemon state (spec §2 data-flow paragraph): the collaborators
//! every procedure handler needs, bundled so the dispatcher (4.K) can pass
//! one `&mut Server` down into `nfs`/`mount` instead of threading a dozen
//! arguments through every call, mirroring how the original keeps these as
//! file-scope globals in `nfs_prot_svc.c`/`mount_prot_svc.c` but collected
//! here into one explicit value (Design Notes §9).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use crate::auth::{Authorizer, Decision, SecurityPolicy};
use crate::cache::{FileHandleCache, FindMode, Key};
use crate::context::Context;
use crate::cred::{Credentials, Switch};
use crate::devtable::DeviceTable;
use crate::error::{Result, Stat};
use crate::export::{ClientId, ExportDb, NetgroupResolver, SystemNetgroups};
use crate::handle::Handle;
use crate::idmap::{IdentityMap, MapMode, NoResolver, Resolver, SquashRules};
use crate::psi::Encoder;
use crate::resolve::{DnsResolver, SystemResolver};
use crate::rmtab::RemoteMountLog;
use crate::rpc::Credential;

/// Runtime-configurable limits the ambient TOML tunables file (§ Ambient
/// stack / Configuration) may override.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub fd_limit: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables { fd_limit: default_fd_limit() }
    }
}

fn default_fd_limit() -> usize {
    // ~75% of the process's soft descriptor limit (spec §3 "Invariants").
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft > 0 => (soft as usize * 3) / 4,
        _ => 512,
    }
}

/// Everything a request handler touches: the three core engines (C/F/H),
/// their supporting collaborators (A/B/D/E/I/J), and the authorization
/// front-end (G).
pub struct Server {
    pub export_db: ExportDb,
    pub cache: FileHandleCache,
    pub devtable: DeviceTable,
    pub rmtab: RemoteMountLog,
    pub authorizer: Authorizer,
    pub dns: Box<dyn DnsResolver>,
    pub netgroups: Box<dyn NetgroupResolver>,
    pub idmap_resolver: Box<dyn Resolver>,
    pub identity_maps: HashMap<(ClientId, usize), IdentityMap>,
    pub cred_switch: Switch,
    pub psi_encoder: Encoder,
    /// Canonicalized roots of every exported subtree, used to pick a
    /// starting point for the path rebuilder (4.D) on a cache miss; a
    /// handle's hash path carries no client context of its own, so every
    /// known root is tried until one's ancestry matches (spec §8 scenario
    /// 5: "the path rebuilder walks `/`... matches... descends").
    pub export_roots: Vec<PathBuf>,
    /// NFSv2 public root (`-R PATH` / `=public` exports-file target,
    /// spec §6), if configured.
    pub public_root: Option<PathBuf>,
    pub waive_secure_port: bool,
    pub promiscuous: bool,
    pub allow_reexport: bool,
    pub cross_mount: bool,
    pub suppress_spoof_warnings: bool,
    pub log_transfers: bool,
    /// Directory → client-pattern strings, as loaded verbatim from the
    /// exports file by [`crate::config`]; kept alongside `export_db`'s
    /// bucketed view because MOUNT's `EXPORT`/`EXPORTALL` echo the
    /// original tokens back to the caller rather than the resolved
    /// buckets (spec §6 exports-file format).
    pub export_list: Vec<(String, Vec<String>)>,
}

impl Server {
    pub fn new(export_db: ExportDb, export_roots: Vec<PathBuf>, devtable: DeviceTable, rmtab: RemoteMountLog, tunables: &Tunables) -> Self {
        Server {
            export_db,
            cache: FileHandleCache::new(tunables.fd_limit),
            devtable,
            rmtab,
            authorizer: Authorizer::new(SecurityPolicy { waive_secure_port: false }),
            dns: Box::new(SystemResolver),
            netgroups: Box::new(SystemNetgroups),
            idmap_resolver: Box::new(NoResolver),
            identity_maps: HashMap::new(),
            cred_switch: Switch::detect(),
            psi_encoder: Encoder::new(crate::psi::Strategy::BitMangle),
            export_roots,
            public_root: None,
            waive_secure_port: false,
            promiscuous: false,
            allow_reexport: false,
            cross_mount: true,
            suppress_spoof_warnings: false,
            log_transfers: false,
            export_list: Vec::new(),
        }
    }

    /// Resolves a wire handle to a cache entry, rebuilding from whichever
    /// known export root actually contains it on a miss (spec §4.C
    /// `find`).
    pub fn find_handle(&mut self, handle: &Handle, check: bool) -> Result<Key> {
        let cached = self.cache.find(
            handle,
            FindMode::CachedOnly,
            check,
            std::path::Path::new("/"),
            &self.psi_encoder,
            &mut self.devtable,
        );
        if let Ok(key) = cached {
            return Ok(key);
        }

        for root in self.export_roots.clone() {
            if let Ok(key) = self.cache.find(handle, FindMode::MustExist, check, &root, &self.psi_encoder, &mut self.devtable) {
                return Ok(key);
            }
        }
        Err(Stat::Stale)
    }

    /// Authorizes a request against the path a handle (or MNT argument)
    /// resolved to, building the per-request [`Context`] (spec §4.G,
    /// applied fresh by every handler per §4.L's closing note).
    pub fn authorize(&mut self, caller: SocketAddr, path: &str, credential: &Credential) -> Result<Context> {
        let Some(ipv4) = caller_ipv4(caller) else { return Err(Stat::Access) };
        let decision = self.authorizer.authorize(ipv4, caller.port(), path, &mut self.export_db, self.dns.as_ref(), self.netgroups.as_ref());
        let Decision::Granted { client, mount } = decision else { return Err(Stat::Access) };

        let mount_opts = self.export_db.client(client).mounts()[mount].options.clone_squash_relevant();
        let creds = self.map_credentials(client, mount, credential, &mount_opts);
        Ok(Context::new(caller, client, mount, creds, SystemTime::now()))
    }

    fn map_credentials(&mut self, client: ClientId, mount: usize, credential: &Credential, opts: &SquashView) -> Credentials {
        let (remote_uid, remote_gid, remote_gids) = match credential {
            Credential::Unix(cred) => (cred.uid, cred.gid, cred.gids.clone()),
            Credential::Other(_) => (opts.anon_uid, opts.anon_gid, Vec::new()),
        };

        let map_mode = match opts.uidmap {
            crate::export::UidMapMode::Identity => MapMode::Identity,
            crate::export::UidMapMode::Static => MapMode::Static,
            crate::export::UidMapMode::Daemon => MapMode::Daemon,
            crate::export::UidMapMode::Nis => MapMode::Nis,
        };
        let squash =
            SquashRules { root_squash: opts.root_squash, all_squash: opts.all_squash, anon_uid: opts.anon_uid, anon_gid: opts.anon_gid };

        let entry = self.identity_maps.entry((client, mount)).or_insert_with(|| {
            let mut map = IdentityMap::new(map_mode, squash);
            for &(remote, local) in &opts.static_uid_map {
                map.load_static_uid(remote, local);
            }
            for &(remote, local) in &opts.static_gid_map {
                map.load_static_gid(remote, local);
            }
            map
        });

        let now = Instant::now();
        let uid = if opts.squashes_uid(remote_uid) {
            opts.anon_uid
        } else {
            entry.local_uid(remote_uid, self.idmap_resolver.as_ref(), now)
        };
        let gid = if opts.squashes_gid(remote_gid) {
            opts.anon_gid
        } else {
            entry.local_gid(remote_gid, self.idmap_resolver.as_ref(), now)
        };
        let groups = remote_gids.into_iter().map(|g| entry.local_gid(g, self.idmap_resolver.as_ref(), now)).collect();

        Credentials { uid, gid, groups }
    }
}

pub(crate) fn caller_ipv4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// The handful of export-option fields the identity map and squash checks
/// need, captured by value so [`Server::map_credentials`] does not hold a
/// borrow of `export_db` across the identity-map lookup.
struct SquashView {
    uidmap: crate::export::UidMapMode,
    root_squash: bool,
    all_squash: bool,
    anon_uid: u32,
    anon_gid: u32,
    squash_uids: Vec<(u32, u32)>,
    squash_gids: Vec<(u32, u32)>,
    static_uid_map: Vec<(u32, u32)>,
    static_gid_map: Vec<(u32, u32)>,
}

impl SquashView {
    fn squashes_uid(&self, uid: u32) -> bool {
        self.all_squash || (self.root_squash && uid == 0) || self.squash_uids.iter().any(|&(lo, hi)| uid >= lo && uid <= hi)
    }
    fn squashes_gid(&self, gid: u32) -> bool {
        self.all_squash || self.squash_gids.iter().any(|&(lo, hi)| gid >= lo && gid <= hi)
    }
}

impl crate::export::ExportOptions {
    fn clone_squash_relevant(&self) -> SquashView {
        SquashView {
            uidmap: self.uidmap,
            root_squash: self.root_squash,
            all_squash: self.all_squash,
            anon_uid: self.anon_uid,
            anon_gid: self.anon_gid,
            squash_uids: self.squash_uids.clone(),
            squash_gids: self.squash_gids.clone(),
            static_uid_map: self.static_uid_map.clone(),
            static_gid_map: self.static_gid_map.clone(),
        }
    }
}
