//! NFSv2 `fattr`/`sattr` (RFC 1094 §2.3.3/§2.3.5): the wire attribute
//! structures every procedure in §4.L reads or writes.

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::time::{SystemTime, UNIX_EPOCH};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::wire::{self, DecodeResult, Decoder, Encoder};

/// Fixed transfer size this server reports in `STATFS` (spec §4.L).
pub const STATFS_TSIZE: u32 = 8192;
/// Block size this server reports in `STATFS` (spec §4.L).
pub const STATFS_BSIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum FType {
    Non = 0,
    Reg = 1,
    Dir = 2,
    Blk = 3,
    Chr = 4,
    Lnk = 5,
}

impl FType {
    pub fn from_metadata(meta: &Metadata) -> FType {
        let ft = meta.file_type();
        if ft.is_dir() {
            FType::Dir
        } else if ft.is_symlink() {
            FType::Lnk
        } else if ft.is_block_device() {
            FType::Blk
        } else if ft.is_char_device() {
            FType::Chr
        } else if ft.is_file() {
            FType::Reg
        } else {
            FType::Non
        }
    }
}

/// A `timeval` (seconds, microseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub seconds: u32,
    pub useconds: u32,
}

impl Timeval {
    pub fn from_system_time(t: SystemTime) -> Timeval {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timeval { seconds: d.as_secs() as u32, useconds: d.subsec_micros() },
            Err(_) => Timeval::default(),
        }
    }

    fn decode(src: &mut Decoder<'_>) -> DecodeResult<Timeval> {
        Ok(Timeval { seconds: wire::get_u32(src)?, useconds: wire::get_u32(src)? })
    }

    fn encode(&self, dst: &mut Encoder) {
        let _ = wire::put_u32(dst, self.seconds);
        let _ = wire::put_u32(dst, self.useconds);
    }
}

/// NFSv2 `fattr`: everything `GETATTR`/`SETATTR`/`LOOKUP`/`CREATE`/etc.
/// return about a file, after uid/gid have been mapped through §4.H.
#[derive(Debug, Clone)]
pub struct Fattr {
    pub ftype: FType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    pub atime: Timeval,
    pub mtime: Timeval,
    pub ctime: Timeval,
}

impl Fattr {
    /// Builds attrs from real filesystem metadata; `fileid` is the
    /// pseudo-inode (spec §6: "Pseudo-inodes are placed in the `fileid`
    /// field"), `uid`/`gid` are already mapped to the remote space.
    pub fn from_metadata(meta: &Metadata, fileid: u32, uid: u32, gid: u32) -> Fattr {
        Fattr {
            ftype: FType::from_metadata(meta),
            mode: file_type_mode_bits(meta) | (meta.permissions().mode() & 0o7777),
            nlink: meta.nlink() as u32,
            uid,
            gid,
            size: meta.size().min(u32::MAX as u64) as u32,
            blocksize: STATFS_BSIZE,
            rdev: meta.rdev() as u32,
            blocks: meta.blocks() as u32,
            fsid: meta.dev() as u32,
            fileid,
            atime: Timeval { seconds: meta.atime() as u32, useconds: (meta.atime_nsec() / 1000) as u32 },
            mtime: Timeval { seconds: meta.mtime() as u32, useconds: (meta.mtime_nsec() / 1000) as u32 },
            ctime: Timeval { seconds: meta.ctime() as u32, useconds: (meta.ctime_nsec() / 1000) as u32 },
        }
    }

    pub fn encode(&self, dst: &mut Encoder) {
        let _ = wire::put_u32(dst, self.ftype as u32);
        let _ = wire::put_u32(dst, self.mode);
        let _ = wire::put_u32(dst, self.nlink);
        let _ = wire::put_u32(dst, self.uid);
        let _ = wire::put_u32(dst, self.gid);
        let _ = wire::put_u32(dst, self.size);
        let _ = wire::put_u32(dst, self.blocksize);
        let _ = wire::put_u32(dst, self.rdev);
        let _ = wire::put_u32(dst, self.blocks);
        let _ = wire::put_u32(dst, self.fsid);
        let _ = wire::put_u32(dst, self.fileid);
        self.atime.encode(dst);
        self.mtime.encode(dst);
        self.ctime.encode(dst);
    }
}

/// Standard unix permission bits implied by a file type, matching what
/// `stat(2)`'s `st_mode` carries and what NFSv2 clients expect `fattr.mode`
/// to repeat in its high bits.
fn file_type_mode_bits(meta: &Metadata) -> u32 {
    let ft = meta.file_type();
    let bits: u32 = if ft.is_dir() {
        libc::S_IFDIR
    } else if ft.is_symlink() {
        libc::S_IFLNK
    } else if ft.is_block_device() {
        libc::S_IFBLK
    } else if ft.is_char_device() {
        libc::S_IFCHR
    } else if ft.is_fifo() {
        libc::S_IFIFO
    } else if ft.is_socket() {
        libc::S_IFSOCK
    } else {
        libc::S_IFREG
    };
    bits as u32
}

/// A decoded `sattr`, with the Ultrix "unchanged" sentinel (`-1` /
/// `0xFFFFFFFF`, spec §4.L SETATTR note) already translated to `None`.
#[derive(Debug, Clone, Default)]
pub struct SAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u32>,
    pub atime: Option<Timeval>,
    pub mtime: Option<Timeval>,
}

const UNCHANGED: u32 = 0xFFFF_FFFF;

fn decode_sentinel_u32(src: &mut Decoder<'_>) -> DecodeResult<Option<u32>> {
    let v = wire::get_u32(src)?;
    Ok(if v == UNCHANGED { None } else { Some(v) })
}

fn decode_sentinel_time(src: &mut Decoder<'_>) -> DecodeResult<Option<Timeval>> {
    let t = Timeval::decode(src)?;
    Ok(if t.seconds == UNCHANGED && t.useconds == UNCHANGED { None } else { Some(t) })
}

pub fn decode_sattr(src: &mut Decoder<'_>) -> DecodeResult<SAttr> {
    Ok(SAttr {
        mode: decode_sentinel_u32(src)?,
        uid: decode_sentinel_u32(src)?,
        gid: decode_sentinel_u32(src)?,
        size: decode_sentinel_u32(src)?,
        atime: decode_sentinel_time(src)?,
        mtime: decode_sentinel_time(src)?,
    })
}

pub fn decode_fhandle(src: &mut Decoder<'_>) -> DecodeResult<crate::handle::Handle> {
    let bytes = wire::get_fixed::<{ crate::handle::HANDLE_SIZE }>(src)?;
    crate::handle::Handle::from_bytes(&bytes).map_err(|_| wire::DecodeError::TooLong)
}

pub fn encode_fhandle(dst: &mut Encoder, handle: &crate::handle::Handle) {
    let _ = wire::put_fixed(dst, &handle.to_bytes());
}

/// Decodes `FType` off the wire (used nowhere on read today but kept
/// alongside the encode path for symmetry and future `CREATE` charmode
/// decoding).
pub fn ftype_from_u32(v: u32) -> Option<FType> {
    FType::from_u32(v)
}
