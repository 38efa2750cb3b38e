//! MOUNT protocol v1/v2 (RFC 1094 Appendix A): the "companion MOUNT
//! protocol" spec §1 names as in scope alongside the NFS program itself.
//!
//! Grounded in the original server's `mountd.c` (procedure bodies —
//! `mountproc_mnt_1_svc`'s realpath-then-authorize-then-stat sequence,
//! `mountproc_dump_1_svc`'s rmtab listing, `mountproc_umnt*_1_svc`'s
//! pass-through to the remote-mount log) and `mount_dispatch.c` (the
//! per-version procedure table), rewritten against
//! [`crate::server::Server`] the same way `nfs::proc` rewrites the
//! teacher's `vfs/mod.rs` operation set against a concrete filesystem
//! instead of a pluggable `Vfs` trait. PATHCONF (MOUNT v2 procedure 7) is
//! the one procedure this crate does not answer: spec §1 marks "the
//! pathconf responder" as an external collaborator out of scope, so it
//! falls through to [`Outcome::ProcUnavailable`] like any unrecognized
//! procedure.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::Stat;
use crate::handle::HANDLE_SIZE;
use crate::nfs::put_stat;
use crate::resolve::{resolve_client_name, Resolution};
use crate::rpc::Credential;
use crate::server::Server;
use crate::wire::{self, DecodeResult, Decoder, Encoder};

pub const PROGRAM: u32 = 100005;
pub const VERSION_1: u32 = 1;
pub const VERSION_2: u32 = 2;

/// Longest `dirpath` argument accepted (spec §6 exports-file path lengths
/// apply equally to the path a client names in `MNT`/`UMNT`).
const MAX_DIRPATH: usize = 1024;
/// Longest client hostname `DUMP` will echo back.
const MAX_HOSTNAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Proc {
    Null = 0,
    Mnt = 1,
    Dump = 2,
    Umnt = 3,
    UmntAll = 4,
    Export = 5,
    ExportAll = 6,
}

impl Proc {
    fn from_u32(v: u32) -> Option<Proc> {
        Some(match v {
            0 => Proc::Null,
            1 => Proc::Mnt,
            2 => Proc::Dump,
            3 => Proc::Umnt,
            4 => Proc::UmntAll,
            5 => Proc::Export,
            6 => Proc::ExportAll,
            _ => return None,
        })
    }
}

/// Outcome of routing one call onto this program.
pub enum Outcome {
    Handled,
    ProcUnavailable,
}

pub fn dispatch(
    server: &mut Server,
    caller: SocketAddr,
    credential: &Credential,
    procedure: u32,
    src: &mut Decoder<'_>,
    dst: &mut Encoder,
) -> DecodeResult<Outcome> {
    let Some(p) = Proc::from_u32(procedure) else { return Ok(Outcome::ProcUnavailable) };
    match p {
        Proc::Null => {}
        Proc::Mnt => mnt(server, caller, credential, src, dst)?,
        Proc::Dump => dump(server, dst)?,
        Proc::Umnt => umnt(server, caller, src)?,
        Proc::UmntAll => umntall(server, caller),
        Proc::Export | Proc::ExportAll => export(server, dst),
    }
    Ok(Outcome::Handled)
}

/// The name a client is recorded under in the remote-mount log: the
/// verified reverse-DNS name (spec §4.E) if one resolves, else the dotted
/// address (`rmtab_add_client`'s fallback when `gethostbyaddr` fails).
fn client_host(server: &Server, caller: SocketAddr) -> String {
    match crate::server::caller_ipv4(caller) {
        Some(ipv4) => match resolve_client_name(ipv4, server.dns.as_ref()) {
            Resolution::Name(name) => name,
            Resolution::Unknown | Resolution::Spoof(_) => ipv4.to_string(),
        },
        None => caller.ip().to_string(),
    }
}

/// Picks whichever configured export root is an ancestor of `path`,
/// needed to compute a fresh handle for a freshly authorized mount point
/// (spec §4.C `create` wants a root to hash ancestors against). Mirrors
/// `nfs::proc::find_export_root`.
fn find_export_root(server: &Server, path: &Path) -> crate::error::Result<PathBuf> {
    server.export_roots.iter().find(|root| path.starts_with(root)).cloned().ok_or(Stat::Access)
}

#[cfg(target_os = "linux")]
fn is_nfs_mounted(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    // `statfs.f_type` for an NFS mount (`NFS_SUPER_MAGIC`, linux/magic.h).
    const NFS_SUPER_MAGIC: i64 = 0x6969;
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else { return false };
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut buf) };
    rc == 0 && buf.f_type as i64 == NFS_SUPER_MAGIC
}

#[cfg(not(target_os = "linux"))]
fn is_nfs_mounted(_path: &Path) -> bool {
    false
}

// ---------------------------------------------------------------------
// MNT
// ---------------------------------------------------------------------

fn mnt_handle(server: &mut Server, caller: SocketAddr, credential: &Credential, requested: &str) -> crate::error::Result<[u8; HANDLE_SIZE]> {
    let canonical = std::fs::canonicalize(requested).map_err(|e| Stat::from_io_error(&e))?;
    let path_str = canonical.to_string_lossy().into_owned();
    let ctx = server.authorize(caller, &path_str, credential)?;

    let meta = std::fs::metadata(&canonical).map_err(|e| Stat::from_io_error(&e))?;
    if !meta.is_dir() && !meta.is_file() {
        return Err(Stat::NotDir);
    }
    if !server.allow_reexport && is_nfs_mounted(&canonical) {
        return Err(Stat::Access);
    }

    let root = find_export_root(server, &canonical)?;
    let (handle, key) = server.cache.create(&root, &canonical, &server.psi_encoder, &mut server.devtable)?;
    server.cache.set_hints(key, ctx.client, ctx.mount);

    let host = client_host(server, caller);
    let _ = server.rmtab.add(&host, &path_str);

    Ok(handle.to_bytes())
}

/// `MNT` (spec §8 scenario example: "Client `10.0.0.5` issues `MNT
/// "/srv/pub"` → status 0, handle *H*"). Resolves symlinks before
/// authorizing (`mountd.c`: "It is important to resolve symlinks before
/// checking permissions"), then refuses a path that is itself an
/// NFS-mounted filesystem unless `-r` (re-export) is set.
fn mnt(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dirpath = wire::get_string(src, MAX_DIRPATH)?;
    let requested = if dirpath.is_empty() { "/".to_string() } else { dirpath };

    match mnt_handle(server, caller, credential, &requested) {
        Ok(bytes) => {
            put_stat(dst, Stat::Ok);
            let _ = wire::put_fixed(dst, &bytes);
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// DUMP
// ---------------------------------------------------------------------

/// `DUMP`: the remote-mount log, as an XDR optional-list (spec §4.J: "a
/// text file `host:path\n` per active mount").
fn dump(server: &mut Server, dst: &mut Encoder) -> DecodeResult<()> {
    let records: Vec<crate::rmtab::Record> = server.rmtab.records().map(|set| set.iter().cloned().collect()).unwrap_or_default();
    for record in &records {
        let _ = wire::put_bool(dst, true);
        let _ = wire::put_string(dst, &record.host);
        let _ = wire::put_string(dst, &record.path);
    }
    let _ = wire::put_bool(dst, false);
    Ok(())
}

// ---------------------------------------------------------------------
// UMNT / UMNTALL
// ---------------------------------------------------------------------

/// `UMNT`: removes one `(host, path)` pair, matched literally against
/// whatever the client sends back (the original does not re-canonicalize
/// on unmount either — `rmtab_del_client` takes the raw argument).
fn umnt(server: &mut Server, caller: SocketAddr, src: &mut Decoder<'_>) -> DecodeResult<()> {
    let dirpath = wire::get_string(src, MAX_DIRPATH)?;
    let host = client_host(server, caller);
    let _ = server.rmtab.remove(&host, &dirpath);
    Ok(())
}

/// `UMNTALL`: removes every record for the calling host.
fn umntall(server: &mut Server, caller: SocketAddr) {
    let host = client_host(server, caller);
    let _ = server.rmtab.remove_all(&host);
}

// ---------------------------------------------------------------------
// EXPORT / EXPORTALL
// ---------------------------------------------------------------------

/// `EXPORT`/`EXPORTALL`: the configured exports list, as loaded from the
/// exports file by [`crate::config`] (the original returns the same
/// static `export_list` for both procedures — "EXPORTALL / Same as
/// EXPORT").
fn export(server: &Server, dst: &mut Encoder) {
    for (directory, clients) in &server.export_list {
        let _ = wire::put_bool(dst, true);
        let _ = wire::put_string(dst, directory);
        for client in clients {
            let _ = wire::put_bool(dst, true);
            let _ = wire::put_string(dst, client);
        }
        let _ = wire::put_bool(dst, false);
    }
    let _ = wire::put_bool(dst, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devtable::DeviceTable;
    use crate::export::{ExportDb, ExportOptions, Pattern};
    use crate::resolve::DnsResolver;
    use crate::rmtab::RemoteMountLog;
    use crate::rpc::AuthFlavor;
    use crate::server::{Server, Tunables};
    use std::io::Cursor;
    use std::net::IpAddr;

    struct NoDns;
    impl DnsResolver for NoDns {
        fn reverse(&self, _addr: Ipv4Addr) -> Option<String> {
            None
        }
        fn forward(&self, _name: &str) -> Vec<Ipv4Addr> {
            Vec::new()
        }
    }

    fn test_server(root: &Path) -> (Server, tempfile::TempDir) {
        let state = tempfile::tempdir().unwrap();
        let mut db = ExportDb::new();
        db.add_export(&Pattern::Default, root.to_string_lossy(), ExportOptions { secure_port: false, ..Default::default() });
        let devtable = DeviceTable::open(state.path().join("devtab")).unwrap();
        let rmtab = RemoteMountLog::open(state.path().join("rmtab")).unwrap();
        let mut server = Server::new(db, vec![root.to_path_buf()], devtable, rmtab, &Tunables::default());
        server.dns = Box::new(NoDns);
        (server, state)
    }

    fn caller(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), port)
    }

    #[test]
    fn mnt_grants_a_handle_for_an_exported_root() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        let credential = Credential::Other(AuthFlavor::None);

        let mut buf = Vec::new();
        wire::put_string(&mut buf, &root.path().to_string_lossy()).unwrap();
        let mut src = Cursor::new(buf.as_slice());
        let mut dst = Vec::new();
        mnt(&mut server, caller(700), &credential, &mut src, &mut dst).unwrap();

        let mut reply = Cursor::new(dst.as_slice());
        assert_eq!(wire::get_u32(&mut reply).unwrap(), Stat::Ok as u32);
        let handle = wire::get_fixed::<HANDLE_SIZE>(&mut reply).unwrap();
        assert_ne!(handle, [0u8; HANDLE_SIZE]);
        assert_eq!(server.rmtab.records().unwrap().len(), 1);
    }

    #[test]
    fn mnt_denies_a_path_outside_any_export() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        let outside = tempfile::tempdir().unwrap();
        let credential = Credential::Other(AuthFlavor::None);

        let mut buf = Vec::new();
        wire::put_string(&mut buf, &outside.path().to_string_lossy()).unwrap();
        let mut src = Cursor::new(buf.as_slice());
        let mut dst = Vec::new();
        mnt(&mut server, caller(700), &credential, &mut src, &mut dst).unwrap();

        let mut reply = Cursor::new(dst.as_slice());
        assert_eq!(wire::get_u32(&mut reply).unwrap(), Stat::Access as u32);
        assert!(server.rmtab.records().unwrap().is_empty());
    }

    #[test]
    fn dump_lists_what_mnt_recorded() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        server.rmtab.add("10.0.0.5", &root.path().to_string_lossy()).unwrap();

        let mut dst = Vec::new();
        dump(&mut server, &mut dst).unwrap();
        let mut reply = Cursor::new(dst.as_slice());
        assert!(wire::get_bool(&mut reply).unwrap());
        assert_eq!(wire::get_string(&mut reply, MAX_HOSTNAME).unwrap(), "10.0.0.5");
        assert_eq!(wire::get_string(&mut reply, MAX_DIRPATH).unwrap(), root.path().to_string_lossy());
        assert!(!wire::get_bool(&mut reply).unwrap());
    }

    #[test]
    fn umnt_removes_only_the_calling_hosts_entry() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        server.rmtab.add("10.0.0.5", &root.path().to_string_lossy()).unwrap();
        server.rmtab.add("10.0.0.6", &root.path().to_string_lossy()).unwrap();

        let mut buf = Vec::new();
        wire::put_string(&mut buf, &root.path().to_string_lossy()).unwrap();
        let mut src = Cursor::new(buf.as_slice());
        umnt(&mut server, caller(700), &mut src).unwrap();

        let remaining = server.rmtab.records().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|r| r.host == "10.0.0.6"));
    }

    #[test]
    fn umntall_removes_every_mount_for_the_calling_host() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        server.rmtab.add("10.0.0.5", &root.path().to_string_lossy()).unwrap();
        server.rmtab.add("10.0.0.5", "/other").unwrap();

        umntall(&mut server, caller(700));
        assert!(server.rmtab.records().unwrap().is_empty());
    }

    #[test]
    fn export_reflects_the_configured_list() {
        let root = tempfile::tempdir().unwrap();
        let (mut server, _state) = test_server(root.path());
        server.export_list.push((root.path().to_string_lossy().into_owned(), vec!["*.corp".to_string()]));

        let mut dst = Vec::new();
        export(&server, &mut dst);
        let mut reply = Cursor::new(dst.as_slice());
        assert!(wire::get_bool(&mut reply).unwrap());
        assert_eq!(wire::get_string(&mut reply, MAX_DIRPATH).unwrap(), root.path().to_string_lossy());
        assert!(wire::get_bool(&mut reply).unwrap());
        assert_eq!(wire::get_string(&mut reply, MAX_HOSTNAME).unwrap(), "*.corp");
        assert!(!wire::get_bool(&mut reply).unwrap());
        assert!(!wire::get_bool(&mut reply).unwrap());
    }
}
