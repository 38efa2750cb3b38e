//! NFS v2 program (spec §4.L, §6): the 17 procedure handlers, dispatched
//! by procedure number onto the decoded argument stream.
//!
//! Grounded in the teacher's `nfsv3.rs` constant table and `parser/mod.rs`
//! dispatch-by-`(program, version, procedure)` match, narrowed to exactly
//! one program/version pair (NFSv2 has no minor-version negotiation) and
//! rewritten against the concrete [`crate::server::Server`] instead of the
//! teacher's pluggable `Vfs` trait, since this server always operates on
//! the real local filesystem.

pub mod attr;
mod proc;

use crate::rpc::Credential;
use crate::server::Server;
use crate::wire::{self, DecodeError, DecodeResult, Decoder, Encoder};
use std::net::SocketAddr;

pub const PROGRAM: u32 = 100003;
pub const VERSION: u32 = 2;

/// Longest name component this server accepts in `LOOKUP`/`CREATE`/etc.
/// (RFC 1094's `MAXNAMLEN`).
pub const MAX_NAME_LEN: usize = 255;
/// Longest path this server accepts from `READLINK`'s target or `SYMLINK`'s
/// target argument (RFC 1094's `MAXPATHLEN`).
pub const MAX_PATH_LEN: usize = 1024;
/// Maximum bytes a single `READ`/`WRITE` may move (spec §4.L: "Max 16 KiB").
pub const MAX_TRANSFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Proc {
    Null = 0,
    GetAttr = 1,
    SetAttr = 2,
    Lookup = 4,
    ReadLink = 5,
    Read = 6,
    Write = 8,
    Create = 9,
    Remove = 10,
    Rename = 11,
    Link = 12,
    Symlink = 13,
    Mkdir = 14,
    Rmdir = 15,
    ReadDir = 16,
    StatFs = 17,
}

impl Proc {
    fn from_u32(v: u32) -> Option<Proc> {
        Some(match v {
            0 => Proc::Null,
            1 => Proc::GetAttr,
            2 => Proc::SetAttr,
            4 => Proc::Lookup,
            5 => Proc::ReadLink,
            6 => Proc::Read,
            8 => Proc::Write,
            9 => Proc::Create,
            10 => Proc::Remove,
            11 => Proc::Rename,
            12 => Proc::Link,
            13 => Proc::Symlink,
            14 => Proc::Mkdir,
            15 => Proc::Rmdir,
            16 => Proc::ReadDir,
            17 => Proc::StatFs,
            _ => return None,
        })
    }
}

/// Outcome of routing one call onto this program.
pub enum Outcome {
    /// The procedure ran; its NFSv2 result (status + body) is already
    /// appended to `dst`.
    Handled,
    /// `procedure` names no NFSv2 v2 operation.
    ProcUnavailable,
}

/// Looks up and runs the handler for `procedure`, re-authorizing against
/// the handle it resolves per call (spec §4.L closing note: "Every handler
/// re-authorizes the handle... so a revoked export takes effect on the
/// very next call").
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
        Proc::GetAttr => proc::getattr(server, caller, credential, src, dst)?,
        Proc::SetAttr => proc::setattr(server, caller, credential, src, dst)?,
        Proc::Lookup => proc::lookup(server, caller, credential, src, dst)?,
        Proc::ReadLink => proc::readlink(server, caller, credential, src, dst)?,
        Proc::Read => proc::read(server, caller, credential, src, dst)?,
        Proc::Write => proc::write(server, caller, credential, src, dst)?,
        Proc::Create => proc::create(server, caller, credential, src, dst)?,
        Proc::Remove => proc::remove(server, caller, credential, src, dst)?,
        Proc::Rename => proc::rename(server, caller, credential, src, dst)?,
        Proc::Link => proc::link(server, caller, credential, src, dst)?,
        Proc::Symlink => proc::symlink(server, caller, credential, src, dst)?,
        Proc::Mkdir => proc::mkdir(server, caller, credential, src, dst)?,
        Proc::Rmdir => proc::rmdir(server, caller, credential, src, dst)?,
        Proc::ReadDir => proc::readdir(server, caller, credential, src, dst)?,
        Proc::StatFs => proc::statfs(server, caller, credential, src, dst)?,
    }
    Ok(Outcome::Handled)
}

/// Appends an NFSv2 status word, used by handlers that have nothing else
/// to return (REMOVE/RENAME/LINK/SYMLINK/RMDIR).
pub(crate) fn put_stat(dst: &mut Encoder, stat: crate::error::Stat) {
    let _ = wire::put_u32(dst, stat as u32);
}
