//! The 17 NFSv2 procedure handlers (spec §4.L).
//!
//! Every handler re-resolves its handle(s) through [`Server::find_handle`]
//! and re-authorizes through [`Server::authorize`] on every call (closing
//! note of §4.L: "so a revoked export takes effect on the very next
//! call"), switches process identity via [`crate::cred::Switch`] for the
//! span of the actual syscall, and never trusts a cache hint without that
//! re-check.
//!
//! Grounded in the teacher's `vfs/mod.rs` operation set (the same handful
//! of path-based primitives: getattr/lookup/read/write/create/remove/
//! rename/mkdir/rmdir/readdir), rewritten against the real filesystem
//! instead of the teacher's in-memory shadow tree, and the teacher's
//! `message_types.rs` field layout for what each NFSv3 op decodes,
//! narrowed to NFSv2's simpler argument shapes (RFC 1094 §2.2).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cache::{Key, OpenMode};
use crate::context::Context;
use crate::error::{Result as NfsResult, Stat};
use crate::handle::Handle;
use crate::idmap::{IdentityMap, MapMode, SquashRules};
use crate::rpc::Credential;
use crate::server::Server;
use crate::wire::{self, DecodeResult, Decoder, Encoder};

use super::attr::{self, Fattr, SAttr, Timeval};
use super::{put_stat, MAX_NAME_LEN, MAX_PATH_LEN, MAX_TRANSFER};
use std::net::SocketAddr;

/// Resolves a handle to a live cache entry and authorizes the request
/// against the path it names (spec §4.L: resolve, then authorize, every
/// call).
fn resolve(server: &mut Server, caller: SocketAddr, credential: &Credential, handle: &Handle) -> NfsResult<(Key, Context)> {
    let key = server.find_handle(handle, true)?;
    let path = server.cache.path(key)?.to_string_lossy().into_owned();
    let ctx = server.authorize(caller, &path, credential)?;
    server.cache.set_hints(key, ctx.client, ctx.mount);
    Ok((key, ctx))
}

fn nix_to_stat(err: nix::errno::Errno) -> Stat {
    Stat::from_io_error(&std::io::Error::from_raw_os_error(err as i32))
}

fn identity_map_for<'s>(server: &'s mut Server, ctx: &Context) -> &'s mut IdentityMap {
    server
        .identity_maps
        .entry((ctx.client, ctx.mount))
        .or_insert_with(|| IdentityMap::new(MapMode::Identity, SquashRules::default()))
}

/// Translates a local `(uid, gid)` pair into the remote space the client
/// expects to see in `fattr` (the inverse of the mapping `authorize`
/// applied on the way in, spec §4.H).
fn remote_ids(server: &mut Server, ctx: &Context, local_uid: u32, local_gid: u32) -> (u32, u32) {
    let now = Instant::now();
    let map = identity_map_for(server, ctx);
    (map.remote_uid(local_uid, now), map.remote_gid(local_gid, now))
}

fn encode_fattr_for(server: &mut Server, key: Key, handle: &Handle, ctx: &Context) -> NfsResult<Fattr> {
    let meta = server.cache.attrs(key)?.clone();
    let (uid, gid) = remote_ids(server, ctx, meta.uid(), meta.gid());
    Ok(Fattr::from_metadata(&meta, handle.pseudo_inode, uid, gid))
}

fn finish_with_handle_and_attrs(server: &mut Server, key: Key, handle: Handle, ctx: &Context) -> NfsResult<(Handle, Fattr)> {
    let fattr = encode_fattr_for(server, key, &handle, ctx)?;
    Ok((handle, fattr))
}

/// Picks whichever configured export root is an ancestor of `path`, needed
/// to compute a fresh handle for something just created (spec §4.C
/// `create` wants a root to hash ancestors against).
fn find_export_root(server: &Server, path: &Path) -> NfsResult<PathBuf> {
    server.export_roots.iter().find(|root| path.starts_with(root)).cloned().ok_or(Stat::Access)
}

fn mount_read_only(server: &Server, ctx: &Context) -> bool {
    server.export_db.client(ctx.client).mounts()[ctx.mount].options.read_only
}

/// Sets a path's own atime/mtime (not following a trailing symlink), using
/// `UTIME_OMIT` for whichever of the two was not supplied.
fn set_times(path: &Path, atime: Option<Timeval>, mtime: Option<Timeval>) -> NfsResult<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Stat::Inval)?;
    let to_spec = |t: Option<Timeval>| match t {
        Some(tv) => libc::timespec { tv_sec: tv.seconds as libc::time_t, tv_nsec: (tv.useconds as i64 * 1000) as _ },
        None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT as _ },
    };
    let specs = [to_spec(atime), to_spec(mtime)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), specs.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        return Err(Stat::from_io_error(&std::io::Error::last_os_error()));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// GETATTR
// ---------------------------------------------------------------------

pub(crate) fn getattr(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, ctx)) => {
            let _ = server.cache.refresh_attrs(key);
            match encode_fattr_for(server, key, &handle, &ctx) {
                Ok(fattr) => {
                    put_stat(dst, Stat::Ok);
                    fattr.encode(dst);
                }
                Err(stat) => put_stat(dst, stat),
            }
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// SETATTR
// ---------------------------------------------------------------------

fn apply_sattr(server: &mut Server, ctx: &Context, key: Key, sattr: &SAttr) -> NfsResult<()> {
    let path = server.cache.path(key)?.to_path_buf();

    let (mapped_uid, mapped_gid) = if sattr.uid.is_some() || sattr.gid.is_some() {
        let now = Instant::now();
        let map = identity_map_for(server, ctx);
        let uid = sattr.uid.map(|u| map.local_uid(u, server.idmap_resolver.as_ref(), now));
        let gid = sattr.gid.map(|g| map.local_gid(g, server.idmap_resolver.as_ref(), now));
        (uid, gid)
    } else {
        (None, None)
    };

    let guard = server.cred_switch.assume(&ctx.creds).map_err(|e| Stat::from_io_error(&e))?;

    if let Some(mode) = sattr.mode {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| Stat::from_io_error(&e))?;
    }
    if mapped_uid.is_some() || mapped_gid.is_some() {
        nix::unistd::fchownat(
            None,
            &path,
            mapped_uid.map(nix::unistd::Uid::from_raw),
            mapped_gid.map(nix::unistd::Gid::from_raw),
            nix::unistd::FchownatFlags::NoFollowSymlink,
        )
        .map_err(nix_to_stat)?;
    }
    if let Some(size) = sattr.size {
        let file = std::fs::OpenOptions::new().write(true).open(&path).map_err(|e| Stat::from_io_error(&e))?;
        file.set_len(size as u64).map_err(|e| Stat::from_io_error(&e))?;
    }
    if sattr.atime.is_some() || sattr.mtime.is_some() {
        set_times(&path, sattr.atime, sattr.mtime)?;
    }
    drop(guard);
    Ok(())
}

pub(crate) fn setattr(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    let sattr = attr::decode_sattr(src)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, ctx)) => {
            if mount_read_only(server, &ctx) {
                put_stat(dst, Stat::RoFs);
                return Ok(());
            }
            match apply_sattr(server, &ctx, key, &sattr) {
                Ok(()) => {
                    let _ = server.cache.refresh_attrs(key);
                    match encode_fattr_for(server, key, &handle, &ctx) {
                        Ok(fattr) => {
                            put_stat(dst, Stat::Ok);
                            fattr.encode(dst);
                        }
                        Err(stat) => put_stat(dst, stat),
                    }
                }
                Err(stat) => put_stat(dst, stat),
            }
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// LOOKUP
// ---------------------------------------------------------------------

fn lookup_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str) -> NfsResult<(Handle, Fattr)> {
    let (dir_key, _dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    let (child_handle, child_path) = server.cache.compose(dir_key, name, dir_handle, &server.psi_encoder, &mut server.devtable)?;
    let path_str = child_path.to_string_lossy().into_owned();
    let ctx = server.authorize(caller, &path_str, credential)?;
    let child_key = server.cache.insert_resolved(child_path, child_handle.pseudo_inode)?;
    server.cache.set_hints(child_key, ctx.client, ctx.mount);
    finish_with_handle_and_attrs(server, child_key, child_handle, &ctx)
}

pub(crate) fn lookup(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    match lookup_impl(server, caller, credential, &dir_handle, &name) {
        Ok((handle, fattr)) => {
            put_stat(dst, Stat::Ok);
            attr::encode_fhandle(dst, &handle);
            fattr.encode(dst);
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// READLINK
// ---------------------------------------------------------------------

fn readlink_target(server: &mut Server, key: Key, handle: &Handle, ctx: &Context) -> NfsResult<String> {
    let path = server.cache.path(key)?.to_path_buf();
    let raw = std::fs::read_link(&path).map_err(|e| Stat::from_io_error(&e))?;
    let link_relative = server.export_db.client(ctx.client).mounts()[ctx.mount].options.link_relative;
    if link_relative && raw.is_absolute() {
        let prefix = "../".repeat(handle.depth());
        let rewritten = format!("{prefix}{}", raw.to_string_lossy().trim_start_matches('/'));
        return Ok(rewritten);
    }
    Ok(raw.to_string_lossy().into_owned())
}

pub(crate) fn readlink(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, ctx)) => match readlink_target(server, key, &handle, &ctx) {
            Ok(target) => {
                put_stat(dst, Stat::Ok);
                let _ = wire::put_string(dst, &target);
            }
            Err(stat) => put_stat(dst, stat),
        },
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// READ
// ---------------------------------------------------------------------

fn read_impl(server: &mut Server, key: Key, handle: &Handle, ctx: &Context, offset: u64, count: usize) -> NfsResult<(Fattr, Vec<u8>)> {
    use std::io::{Read, Seek, SeekFrom};

    let capped = count.min(MAX_TRANSFER);
    let guard = server.cred_switch.assume(&ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    let opener_uid = IdentityMap::truncate_16(ctx.creds.uid);
    let file_ref = server.cache.fd(key, OpenMode::Read, opener_uid)?;
    let mut file_ref = file_ref;
    file_ref.seek(SeekFrom::Start(offset)).map_err(|e| Stat::from_io_error(&e))?;
    let mut buf = vec![0u8; capped];
    let n = file_ref.read(&mut buf).map_err(|e| Stat::from_io_error(&e))?;
    buf.truncate(n);
    drop(guard);

    let _ = server.cache.refresh_attrs(key);
    let fattr = encode_fattr_for(server, key, handle, ctx)?;
    Ok((fattr, buf))
}

pub(crate) fn read(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    let offset = wire::get_u32(src)? as u64;
    let count = wire::get_u32(src)? as usize;
    let _legacy_total_count = wire::get_u32(src)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, ctx)) => match read_impl(server, key, &handle, &ctx, offset, count) {
            Ok((fattr, data)) => {
                put_stat(dst, Stat::Ok);
                fattr.encode(dst);
                let _ = wire::put_var(dst, &data);
            }
            Err(stat) => put_stat(dst, stat),
        },
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// WRITE
// ---------------------------------------------------------------------

fn write_impl(server: &mut Server, key: Key, handle: &Handle, ctx: &Context, offset: u64, data: &[u8]) -> NfsResult<Fattr> {
    use std::io::{Seek, SeekFrom, Write};

    let guard = server.cred_switch.assume(&ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    let opener_uid = IdentityMap::truncate_16(ctx.creds.uid);
    let file_ref = server.cache.fd(key, OpenMode::Write, opener_uid)?;
    let mut file_ref = file_ref;
    file_ref.seek(SeekFrom::Start(offset)).map_err(|e| Stat::from_io_error(&e))?;
    // Synchronous: the reply is only sent once every byte is on its way to
    // the descriptor (spec §4.L WRITE note).
    file_ref.write_all(data).map_err(|e| Stat::from_io_error(&e))?;
    file_ref.flush().map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);

    server.cache.refresh_attrs(key)?;
    encode_fattr_for(server, key, handle, ctx)
}

pub(crate) fn write(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    let _begin_offset = wire::get_u32(src)?;
    let offset = wire::get_u32(src)? as u64;
    let _legacy_total_count = wire::get_u32(src)?;
    let data = wire::get_var(src, MAX_TRANSFER)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, ctx)) => {
            if mount_read_only(server, &ctx) {
                put_stat(dst, Stat::RoFs);
                return Ok(());
            }
            match write_impl(server, key, &handle, &ctx, offset, &data) {
                Ok(fattr) => {
                    put_stat(dst, Stat::Ok);
                    fattr.encode(dst);
                }
                Err(stat) => put_stat(dst, stat),
            }
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// CREATE
// ---------------------------------------------------------------------

/// Creates a FIFO or device node, the SunOS `CREATE` overload that signals
/// "this isn't a regular file" by sending a `size` of `-1` (spec §4.L
/// CREATE note). A `mode` that also reads as all-ones (`0xFFFF,0xFFFF`,
/// i.e. every type bit set, which no real file type is) asks for a FIFO;
/// otherwise the type bits in `mode` name a character or block device and
/// `uid`/`gid` carry its major/minor numbers.
fn create_special(path: &Path, sattr: &SAttr) -> NfsResult<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let (kind, perm_bits, dev) = match sattr.mode {
        None => (SFlag::S_IFIFO, 0o600u32, 0u64),
        Some(m) => {
            let masked = m & (libc::S_IFMT as u32);
            if masked == libc::S_IFCHR as u32 {
                (SFlag::S_IFCHR, m & 0o7777, makedev(sattr.uid.unwrap_or(0) as u64, sattr.gid.unwrap_or(0) as u64))
            } else if masked == libc::S_IFBLK as u32 {
                (SFlag::S_IFBLK, m & 0o7777, makedev(sattr.uid.unwrap_or(0) as u64, sattr.gid.unwrap_or(0) as u64))
            } else {
                (SFlag::S_IFIFO, m & 0o7777, 0u64)
            }
        }
    };
    let perm = Mode::from_bits_truncate(perm_bits as libc::mode_t);
    mknod(path, kind, perm, dev).map_err(nix_to_stat)
}

fn create_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str, sattr: &SAttr) -> NfsResult<(Handle, Fattr)> {
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let child_path = dir_path.join(name);

    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    // `size == -1` is the SunOS signal for a special-file create; otherwise
    // any type bits `mode` carries are ignored (spec: "file-type-bits-zero
    // inheritance") and only the permission bits are honored.
    if sattr.size.is_none() {
        create_special(&child_path, sattr)?;
    } else {
        let perm = sattr.mode.unwrap_or(0o644) & 0o7777;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(perm)
            .open(&child_path)
            .map_err(|e| Stat::from_io_error(&e))?;
    }
    drop(guard);

    let root = find_export_root(server, &dir_path)?;
    let (handle, key) = server.cache.create(&root, &child_path, &server.psi_encoder, &mut server.devtable)?;
    server.cache.set_hints(key, dir_ctx.client, dir_ctx.mount);
    finish_with_handle_and_attrs(server, key, handle, &dir_ctx)
}

pub(crate) fn create(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let sattr = attr::decode_sattr(src)?;
    match create_impl(server, caller, credential, &dir_handle, &name, &sattr) {
        Ok((handle, fattr)) => {
            put_stat(dst, Stat::Ok);
            attr::encode_fhandle(dst, &handle);
            fattr.encode(dst);
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// REMOVE
// ---------------------------------------------------------------------

fn remove_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str) -> NfsResult<()> {
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let target = dir_path.join(name);
    // Evict before unlinking: once the link count drops, a rebuild
    // starting from a stale cache entry for this path would see nothing
    // (spec §4.C `remove`).
    server.cache.remove(&target);
    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::fs::remove_file(&target).map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);
    Ok(())
}

pub(crate) fn remove(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let stat = remove_impl(server, caller, credential, &dir_handle, &name).err().unwrap_or(Stat::Ok);
    put_stat(dst, stat);
    Ok(())
}

// ---------------------------------------------------------------------
// RENAME
// ---------------------------------------------------------------------

fn rename_impl(
    server: &mut Server,
    caller: SocketAddr,
    credential: &Credential,
    from_dir: &Handle,
    from_name: &str,
    to_dir: &Handle,
    to_name: &str,
) -> NfsResult<()> {
    let (from_key, from_ctx) = resolve(server, caller, credential, from_dir)?;
    let (to_key, to_ctx) = resolve(server, caller, credential, to_dir)?;
    if from_ctx.client != to_ctx.client || from_ctx.mount != to_ctx.mount {
        return Err(Stat::Access);
    }
    if mount_read_only(server, &from_ctx) {
        return Err(Stat::RoFs);
    }
    let from_path = server.cache.path(from_key)?.to_path_buf();
    let to_path = server.cache.path(to_key)?.to_path_buf();
    let src_path = from_path.join(from_name);
    let dst_path = to_path.join(to_name);
    server.cache.remove(&src_path);
    server.cache.remove(&dst_path);
    let guard = server.cred_switch.assume(&from_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::fs::rename(&src_path, &dst_path).map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);
    Ok(())
}

pub(crate) fn rename(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let from_dir = attr::decode_fhandle(src)?;
    let from_name = wire::get_string(src, MAX_NAME_LEN)?;
    let to_dir = attr::decode_fhandle(src)?;
    let to_name = wire::get_string(src, MAX_NAME_LEN)?;
    let stat = rename_impl(server, caller, credential, &from_dir, &from_name, &to_dir, &to_name).err().unwrap_or(Stat::Ok);
    put_stat(dst, stat);
    Ok(())
}

// ---------------------------------------------------------------------
// LINK
// ---------------------------------------------------------------------

fn link_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, target_handle: &Handle, dir_handle: &Handle, name: &str) -> NfsResult<()> {
    let (target_key, target_ctx) = resolve(server, caller, credential, target_handle)?;
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    // A hard link spanning two exports would let a client see through one
    // export into another's ownership/squash rules; refused outright.
    if target_ctx.client != dir_ctx.client || target_ctx.mount != dir_ctx.mount {
        return Err(Stat::Access);
    }
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let target_path = server.cache.path(target_key)?.to_path_buf();
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let link_path = dir_path.join(name);
    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::fs::hard_link(&target_path, &link_path).map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);
    Ok(())
}

pub(crate) fn link(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let target_handle = attr::decode_fhandle(src)?;
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let stat = link_impl(server, caller, credential, &target_handle, &dir_handle, &name).err().unwrap_or(Stat::Ok);
    put_stat(dst, stat);
    Ok(())
}

// ---------------------------------------------------------------------
// SYMLINK
// ---------------------------------------------------------------------

fn symlink_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str, target: &str, sattr: &SAttr) -> NfsResult<()> {
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let link_path = dir_path.join(name);

    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::os::unix::fs::symlink(target, &link_path).map_err(|e| Stat::from_io_error(&e))?;

    // Only owner and times from `sattr` are honored; a symlink's mode bits
    // are not meaningful on most platforms (spec §4.L SYMLINK note).
    if sattr.uid.is_some() || sattr.gid.is_some() {
        let now = Instant::now();
        let (local_uid, local_gid) = {
            let map = identity_map_for(server, &dir_ctx);
            let uid = sattr.uid.map(|u| map.local_uid(u, server.idmap_resolver.as_ref(), now));
            let gid = sattr.gid.map(|g| map.local_gid(g, server.idmap_resolver.as_ref(), now));
            (uid, gid)
        };
        nix::unistd::fchownat(
            None,
            &link_path,
            local_uid.map(nix::unistd::Uid::from_raw),
            local_gid.map(nix::unistd::Gid::from_raw),
            nix::unistd::FchownatFlags::NoFollowSymlink,
        )
        .map_err(nix_to_stat)?;
    }
    if sattr.atime.is_some() || sattr.mtime.is_some() {
        set_times(&link_path, sattr.atime, sattr.mtime)?;
    }
    drop(guard);
    Ok(())
}

pub(crate) fn symlink(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let target = wire::get_string(src, MAX_PATH_LEN)?;
    let sattr = attr::decode_sattr(src)?;
    let stat = symlink_impl(server, caller, credential, &dir_handle, &name, &target, &sattr).err().unwrap_or(Stat::Ok);
    put_stat(dst, stat);
    Ok(())
}

// ---------------------------------------------------------------------
// MKDIR
// ---------------------------------------------------------------------

fn mkdir_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str, sattr: &SAttr) -> NfsResult<(Handle, Fattr)> {
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let dir_meta = server.cache.attrs(dir_key)?.clone();

    let child_path = dir_path.join(name);
    let perm = sattr.mode.unwrap_or(0o755) & 0o7777;

    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::fs::create_dir(&child_path).map_err(|e| Stat::from_io_error(&e))?;
    let mut inherited = perm;
    if dir_meta.mode() & (libc::S_ISGID as u32) != 0 {
        inherited |= libc::S_ISGID as u32;
    }
    std::fs::set_permissions(&child_path, std::fs::Permissions::from_mode(inherited)).map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);

    let root = find_export_root(server, &dir_path)?;
    let (handle, key) = server.cache.create(&root, &child_path, &server.psi_encoder, &mut server.devtable)?;
    server.cache.set_hints(key, dir_ctx.client, dir_ctx.mount);
    finish_with_handle_and_attrs(server, key, handle, &dir_ctx)
}

pub(crate) fn mkdir(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let sattr = attr::decode_sattr(src)?;
    match mkdir_impl(server, caller, credential, &dir_handle, &name, &sattr) {
        Ok((handle, fattr)) => {
            put_stat(dst, Stat::Ok);
            attr::encode_fhandle(dst, &handle);
            fattr.encode(dst);
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// RMDIR
// ---------------------------------------------------------------------

fn rmdir_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, dir_handle: &Handle, name: &str) -> NfsResult<()> {
    let (dir_key, dir_ctx) = resolve(server, caller, credential, dir_handle)?;
    if mount_read_only(server, &dir_ctx) {
        return Err(Stat::RoFs);
    }
    let dir_path = server.cache.path(dir_key)?.to_path_buf();
    let target = dir_path.join(name);
    server.cache.remove(&target);
    let guard = server.cred_switch.assume(&dir_ctx.creds).map_err(|e| Stat::from_io_error(&e))?;
    std::fs::remove_dir(&target).map_err(|e| Stat::from_io_error(&e))?;
    drop(guard);
    Ok(())
}

pub(crate) fn rmdir(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let dir_handle = attr::decode_fhandle(src)?;
    let name = wire::get_string(src, MAX_NAME_LEN)?;
    let stat = rmdir_impl(server, caller, credential, &dir_handle, &name).err().unwrap_or(Stat::Ok);
    put_stat(dst, stat);
    Ok(())
}

// ---------------------------------------------------------------------
// READDIR
// ---------------------------------------------------------------------

/// A raw `DIR*` stream exposing `telldir`/`seekdir`, so an NFSv2 cookie can
/// name an exact resume point across however many round trips a large
/// directory takes (spec §8: a 100k-entry directory must be fully
/// enumerable via repeated `READDIR` calls).
struct RawDirStream {
    handle: *mut libc::DIR,
}

impl RawDirStream {
    fn open(path: &Path) -> std::io::Result<Self> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        let handle = unsafe { libc::opendir(cpath.as_ptr()) };
        if handle.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(RawDirStream { handle })
    }

    fn seek(&mut self, cookie: i64) {
        unsafe { libc::seekdir(self.handle, cookie as libc::c_long) }
    }

    /// Returns the entry's name, inode, and the cookie a subsequent call
    /// should seek to in order to resume right after it.
    fn next(&mut self) -> std::io::Result<Option<(String, u64, i64)>> {
        unsafe {
            *libc::__errno_location() = 0;
            let ent = libc::readdir(self.handle);
            if ent.is_null() {
                let err = std::io::Error::last_os_error();
                return if err.raw_os_error() == Some(0) { Ok(None) } else { Err(err) };
            }
            let name = std::ffi::CStr::from_ptr((*ent).d_name.as_ptr()).to_string_lossy().into_owned();
            let ino = (*ent).d_ino as u64;
            let next_cookie = libc::telldir(self.handle);
            Ok(Some((name, ino, next_cookie)))
        }
    }
}

impl Drop for RawDirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.handle);
        }
    }
}

// SAFETY: touched only through `&mut self`, and every request runs on the
// single dispatch thread (spec §5).
unsafe impl Send for RawDirStream {}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn readdir_impl(server: &mut Server, caller: SocketAddr, credential: &Credential, handle: &Handle, cookie: u32, max_count: usize) -> NfsResult<(Vec<(u32, String, u32)>, bool)> {
    let (key, ctx) = resolve(server, caller, credential, handle)?;
    let dir_path = server.cache.path(key)?.to_path_buf();
    let dir_meta = server.cache.attrs(key)?.clone();
    let is_export_root = server.export_roots.iter().any(|r| r == &dir_path);
    let cross_mounts = server.export_db.client(ctx.client).mounts()[ctx.mount].options.cross_mounts;

    let mut stream = RawDirStream::open(&dir_path).map_err(|e| Stat::from_io_error(&e))?;
    if cookie != 0 {
        stream.seek(cookie as i64);
    }

    const ENTRY_OVERHEAD: usize = 4 + 4 + 4 + 4; // value-follows + fileid + name length + cookie
    let mut entries = Vec::new();
    let mut used = 0usize;
    let mut eof = true;

    loop {
        let Some((name, ino, next_cookie)) = stream.next().map_err(|e| Stat::from_io_error(&e))? else {
            eof = true;
            break;
        };

        // A directory that holds a different underlying filesystem (a real
        // mount point, not an export) is hidden from listings unless this
        // export allows crossing it (spec §4.L READDIR note).
        if !cross_mounts && name != "." && name != ".." {
            let child_path = dir_path.join(&name);
            if let Ok(child_meta) = std::fs::symlink_metadata(&child_path) {
                if child_meta.dev() != dir_meta.dev() {
                    continue;
                }
            }
        }

        // At the top of an export, ".." must not leak the pseudo-inode of
        // whatever lies outside the exported subtree; it is rewritten to
        // point back at the export root itself.
        let fileid = if name == ".." && is_export_root {
            handle.pseudo_inode
        } else {
            server.psi_encoder.encode(dir_meta.dev(), ino, &mut server.devtable).map_err(|e| Stat::from_io_error(&e))?
        };

        let entry_cost = ENTRY_OVERHEAD + align4(name.len());
        if !entries.is_empty() && used + entry_cost > max_count {
            eof = false;
            break;
        }
        used += entry_cost;
        entries.push((fileid, name, next_cookie as u32));
    }

    Ok((entries, eof))
}

pub(crate) fn readdir(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    let cookie = wire::get_u32(src)?;
    let max_count = wire::get_u32(src)? as usize;
    match readdir_impl(server, caller, credential, &handle, cookie, max_count) {
        Ok((entries, eof)) => {
            put_stat(dst, Stat::Ok);
            for (fileid, name, next_cookie) in &entries {
                let _ = wire::put_bool(dst, true);
                let _ = wire::put_u32(dst, *fileid);
                let _ = wire::put_string(dst, name);
                let _ = wire::put_u32(dst, *next_cookie);
            }
            let _ = wire::put_bool(dst, false);
            let _ = wire::put_bool(dst, eof);
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}

// ---------------------------------------------------------------------
// STATFS
// ---------------------------------------------------------------------

/// Real block counts scaled into fixed 512-byte units, alongside the fixed
/// 8 KiB transfer size this server always reports (spec §4.L STATFS note).
fn statfs_counts(path: &Path) -> NfsResult<(u32, u32, u32)> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Stat::Inval)?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(Stat::from_io_error(&std::io::Error::last_os_error()));
    }
    let frsize = (buf.f_frsize as u64).max(1);
    let scale = (frsize / attr::STATFS_BSIZE as u64).max(1);
    let blocks = ((buf.f_blocks as u64) * scale).min(u32::MAX as u64) as u32;
    let bfree = ((buf.f_bfree as u64) * scale).min(u32::MAX as u64) as u32;
    let bavail = ((buf.f_bavail as u64) * scale).min(u32::MAX as u64) as u32;
    Ok((blocks, bfree, bavail))
}

pub(crate) fn statfs(server: &mut Server, caller: SocketAddr, credential: &Credential, src: &mut Decoder<'_>, dst: &mut Encoder) -> DecodeResult<()> {
    let handle = attr::decode_fhandle(src)?;
    match resolve(server, caller, credential, &handle) {
        Ok((key, _ctx)) => {
            let path = match server.cache.path(key) {
                Ok(p) => p.to_path_buf(),
                Err(stat) => {
                    put_stat(dst, stat);
                    return Ok(());
                }
            };
            match statfs_counts(&path) {
                Ok((blocks, bfree, bavail)) => {
                    put_stat(dst, Stat::Ok);
                    let _ = wire::put_u32(dst, attr::STATFS_TSIZE);
                    let _ = wire::put_u32(dst, attr::STATFS_BSIZE);
                    let _ = wire::put_u32(dst, blocks);
                    let _ = wire::put_u32(dst, bfree);
                    let _ = wire::put_u32(dst, bavail);
                }
                Err(stat) => put_stat(dst, stat),
            }
        }
        Err(stat) => put_stat(dst, stat),
    }
    Ok(())
}
