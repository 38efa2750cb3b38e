//! Shared fixtures for the end-to-end tests: a one-export [`Server`] over a
//! tempdir, plus thin wire-encode/decode helpers so each test can drive
//! `mount::dispatch`/`nfs::dispatch` the same way a real datagram would,
//! without hand-rolling XDR bytes at every call site.
//!
//! Mirrors the style of `mount.rs`'s own `#[cfg(test)]` module (plain
//! `#[test]` functions over a `Cursor`-backed `Decoder`/`Vec<u8>` `Encoder`)
//! rather than the teacher's async `Fixture`, since every handler here is a
//! synchronous function over a concrete filesystem.

#![allow(dead_code)]

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use rnfsd::devtable::DeviceTable;
use rnfsd::export::{ExportDb, ExportOptions, Pattern};
use rnfsd::handle::HANDLE_SIZE;
use rnfsd::resolve::DnsResolver;
use rnfsd::rmtab::RemoteMountLog;
use rnfsd::rpc::{AuthFlavor, Credential};
use rnfsd::server::{Server, Tunables};
use rnfsd::wire::{self, Decoder, Encoder};

/// A [`DnsResolver`] that answers every reverse lookup with one fixed name,
/// for tests that exercise hostname-pattern matching (wildcards,
/// netgroups) without a real resolver.
pub struct FixedName(pub &'static str);

impl DnsResolver for FixedName {
    fn reverse(&self, _addr: Ipv4Addr) -> Option<String> {
        Some(self.0.to_string())
    }
    fn forward(&self, _name: &str) -> Vec<Ipv4Addr> {
        Vec::new()
    }
}

pub struct NoDns;

impl DnsResolver for NoDns {
    fn reverse(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }
    fn forward(&self, _name: &str) -> Vec<Ipv4Addr> {
        Vec::new()
    }
}

/// Builds a [`Server`] exporting `root` under `pattern`, backed by a
/// scratch tempdir for the device table and remote-mount log. The returned
/// `TempDir` must be kept alive for as long as the server is used.
pub fn test_server(root: &Path, pattern: Pattern, options: ExportOptions) -> (Server, tempfile::TempDir) {
    let state = tempfile::tempdir().unwrap();
    let mut db = ExportDb::new();
    db.add_export(&pattern, root.to_string_lossy(), options);
    let devtable = DeviceTable::open(state.path().join("devtab")).unwrap();
    let rmtab = RemoteMountLog::open(state.path().join("rmtab")).unwrap();
    let mut server = Server::new(db, vec![root.to_path_buf()], devtable, rmtab, &Tunables::default());
    server.dns = Box::new(NoDns);
    (server, state)
}

pub fn caller_from(octets: [u8; 4], port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
}

pub fn anon_credential() -> Credential {
    Credential::Other(AuthFlavor::None)
}

/// Issues `MNT path`, returning the reply status and, on success, the
/// 32-byte handle.
pub fn mnt(server: &mut Server, caller: SocketAddr, credential: &Credential, path: &str) -> (u32, Option<[u8; HANDLE_SIZE]>) {
    let mut args = Vec::new();
    wire::put_string(&mut args, path).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::mount::dispatch(server, caller, credential, rnfsd::mount::Proc::Mnt as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    (stat, Some(wire::get_fixed::<HANDLE_SIZE>(&mut reply).unwrap()))
}

/// Issues `LOOKUP(dir_handle, name)`, returning the reply status and, on
/// success, the child's handle and `fattr.size`/`fattr.fileid`.
pub fn lookup(
    server: &mut Server,
    caller: SocketAddr,
    credential: &Credential,
    dir_handle: &[u8; HANDLE_SIZE],
    name: &str,
) -> (u32, Option<([u8; HANDLE_SIZE], RawFattr)>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, dir_handle).unwrap();
    wire::put_string(&mut args, name).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::Lookup as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    let handle = wire::get_fixed::<HANDLE_SIZE>(&mut reply).unwrap();
    let fattr = RawFattr::decode(&mut reply);
    (stat, Some((handle, fattr)))
}

/// Issues `GETATTR(handle)`.
pub fn getattr(server: &mut Server, caller: SocketAddr, credential: &Credential, handle: &[u8; HANDLE_SIZE]) -> (u32, Option<RawFattr>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::GetAttr as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    (stat, Some(RawFattr::decode(&mut reply)))
}

/// Issues `READ(handle, offset, count)`, returning the reply status and,
/// on success, the attrs plus the bytes actually returned.
pub fn read(
    server: &mut Server,
    caller: SocketAddr,
    credential: &Credential,
    handle: &[u8; HANDLE_SIZE],
    offset: u32,
    count: u32,
) -> (u32, Option<(RawFattr, Vec<u8>)>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    wire::put_u32(&mut args, offset).unwrap();
    wire::put_u32(&mut args, count).unwrap();
    wire::put_u32(&mut args, count).unwrap(); // legacy totalcount
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::Read as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    let fattr = RawFattr::decode(&mut reply);
    let data = wire::get_var(&mut reply, rnfsd::nfs::MAX_TRANSFER).unwrap();
    (stat, Some((fattr, data)))
}

/// Issues `READDIR(handle, cookie, maxcount)`, returning the reply status
/// and, on success, `(fileid, name, cookie)` entries plus `eof`.
pub fn readdir(
    server: &mut Server,
    caller: SocketAddr,
    credential: &Credential,
    handle: &[u8; HANDLE_SIZE],
    cookie: u32,
    max_count: u32,
) -> (u32, Option<(Vec<(u32, String, u32)>, bool)>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    wire::put_u32(&mut args, cookie).unwrap();
    wire::put_u32(&mut args, max_count).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::ReadDir as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    let mut entries = Vec::new();
    while wire::get_bool(&mut reply).unwrap() {
        let fileid = wire::get_u32(&mut reply).unwrap();
        let name = wire::get_string(&mut reply, rnfsd::nfs::MAX_NAME_LEN).unwrap();
        let next_cookie = wire::get_u32(&mut reply).unwrap();
        entries.push((fileid, name, next_cookie));
    }
    let eof = wire::get_bool(&mut reply).unwrap();
    (stat, Some((entries, eof)))
}

/// Issues `READLINK(handle)`.
pub fn readlink(server: &mut Server, caller: SocketAddr, credential: &Credential, handle: &[u8; HANDLE_SIZE]) -> (u32, Option<String>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::ReadLink as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    (stat, Some(wire::get_string(&mut reply, rnfsd::nfs::MAX_PATH_LEN).unwrap()))
}

/// Issues `STATFS(handle)`, returning `(tsize, bsize, blocks, bfree, bavail)`.
pub fn statfs(server: &mut Server, caller: SocketAddr, credential: &Credential, handle: &[u8; HANDLE_SIZE]) -> (u32, Option<[u32; 5]>) {
    let mut args = Vec::new();
    wire::put_fixed(&mut args, handle).unwrap();
    let mut src: Decoder<'_> = Cursor::new(args.as_slice());
    let mut dst: Encoder = Vec::new();
    rnfsd::nfs::dispatch(server, caller, credential, rnfsd::nfs::Proc::StatFs as u32, &mut src, &mut dst).unwrap();

    let mut reply = Cursor::new(dst.as_slice());
    let stat = wire::get_u32(&mut reply).unwrap();
    if stat != 0 {
        return (stat, None);
    }
    let mut out = [0u32; 5];
    for slot in &mut out {
        *slot = wire::get_u32(&mut reply).unwrap();
    }
    (stat, Some(out))
}

/// The handful of `fattr` fields the tests actually assert on, decoded in
/// [`Fattr::encode`]'s field order.
#[derive(Debug, Clone, Copy)]
pub struct RawFattr {
    pub ftype: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub fileid: u32,
}

impl RawFattr {
    fn decode(src: &mut Decoder<'_>) -> RawFattr {
        let ftype = wire::get_u32(src).unwrap();
        let mode = wire::get_u32(src).unwrap();
        let _nlink = wire::get_u32(src).unwrap();
        let uid = wire::get_u32(src).unwrap();
        let gid = wire::get_u32(src).unwrap();
        let size = wire::get_u32(src).unwrap();
        let _blocksize = wire::get_u32(src).unwrap();
        let _rdev = wire::get_u32(src).unwrap();
        let _blocks = wire::get_u32(src).unwrap();
        let _fsid = wire::get_u32(src).unwrap();
        let fileid = wire::get_u32(src).unwrap();
        let _atime = (wire::get_u32(src).unwrap(), wire::get_u32(src).unwrap());
        let _mtime = (wire::get_u32(src).unwrap(), wire::get_u32(src).unwrap());
        let _ctime = (wire::get_u32(src).unwrap(), wire::get_u32(src).unwrap());
        RawFattr { ftype, mode, uid, gid, size, fileid }
    }
}

/// Whether this process can actually assume another uid (`setfsuid`/
/// `seteuid` need `CAP_SETUID`), which READ/WRITE/SETATTR exercise via
/// [`rnfsd::cred::Switch`]. Tests that move real bytes through a mapped
/// identity skip themselves when it is not available, the same
/// accommodation `cred.rs`'s own unit tests make.
pub fn running_privileged() -> bool {
    nix::unistd::Uid::effective().is_root()
}
