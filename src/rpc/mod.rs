//! RPC envelope (spec §4.K): decodes an ONC RPC (RFC 1057) call header and
//! its `AUTH_UNIX`/`AUTH_SYS` credential body into a [`Call`], and encodes
//! the matching reply. This is the layer that turns a raw datagram into
//! "here is an xid, a program/version/procedure, and a caller identity"
//! for the dispatcher to authorize and hand off to `nfs`/`mount`.
//!
//! Grounded in the teacher's `parser/rpc.rs` (message shape, `AuthFlavor`/
//! `AuthStat`) and `src/rpc.rs` (the RFC 1057 struct names), rewritten as a
//! synchronous decode/encode pair instead of an async-stream parser table,
//! and extended with the `AUTH_UNIX` credential body the teacher left
//! unparsed (its dead-code mirror never actually decoded `cred.body`).

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::wire::{self, DecodeError, DecodeResult};

/// Longest machine name an `AUTH_UNIX` credential may carry (matches the
/// original server's `MAXHOSTNAMELEN`-derived bound).
pub const MAX_MACHINE_NAME: usize = 255;
/// Longest supplementary group list an `AUTH_UNIX` credential may carry.
pub const MAX_GIDS: usize = 16;
/// RPC message type: call.
const CALL: u32 = 0;
/// RPC message type: reply.
const REPLY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum AuthFlavor {
    None = 0,
    Sys = 1,
    Short = 2,
    Des = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum AuthStat {
    Ok = 0,
    BadCred = 1,
    RejectedCred = 2,
    BadVerf = 3,
    RejectedVerf = 4,
    TooWeak = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

/// The decoded `AUTH_UNIX` credential body (RFC 1057 §9.2), the only
/// flavor this server accepts identity claims from; `AUTH_NONE` callers
/// are treated as the anonymous user by the identity map (spec §4.H).
#[derive(Debug, Clone)]
pub struct UnixCred {
    pub stamp: u32,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

/// Either an `AUTH_UNIX` credential or any other (unparsed) flavor, which
/// the authorization engine (4.G) downgrades to anonymous.
#[derive(Debug, Clone)]
pub enum Credential {
    Unix(UnixCred),
    Other(AuthFlavor),
}

/// A fully decoded RPC call: header fields plus the credential, ready for
/// the dispatcher to authorize and route to `nfs`/`mount`.
#[derive(Debug, Clone)]
pub struct Call {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: Credential,
}

/// Decodes the RPC call header and credential, leaving `src`'s cursor
/// positioned at the start of the procedure-specific arguments.
pub fn decode_call(src: &mut wire::Decoder<'_>) -> DecodeResult<Call> {
    let xid = wire::get_u32(src)?;
    let msg_type = wire::get_u32(src)?;
    if msg_type != CALL {
        return Err(DecodeError::BadDiscriminant(msg_type));
    }
    let rpcvers = wire::get_u32(src)?;
    if rpcvers != 2 {
        return Err(DecodeError::BadDiscriminant(rpcvers));
    }
    let program = wire::get_u32(src)?;
    let version = wire::get_u32(src)?;
    let procedure = wire::get_u32(src)?;
    let credential = decode_credential(src)?;
    // Verifier: we don't validate it (AUTH_NONE/AUTH_UNIX verifiers carry
    // no information this server acts on), but it must still be consumed.
    let verf_flavor = wire::get_u32(src)?;
    let _ = AuthFlavor::from_u32(verf_flavor);
    let _verf_body = wire::get_var(src, 400)?;
    Ok(Call { xid, program, version, procedure, credential })
}

fn decode_credential(src: &mut wire::Decoder<'_>) -> DecodeResult<Credential> {
    let flavor_raw = wire::get_u32(src)?;
    let flavor = AuthFlavor::from_u32(flavor_raw).ok_or(DecodeError::BadDiscriminant(flavor_raw))?;
    let body = wire::get_var(src, 400)?;
    match flavor {
        AuthFlavor::Sys => {
            let mut body_src: wire::Decoder<'_> = std::io::Cursor::new(body.as_slice());
            let stamp = wire::get_u32(&mut body_src)?;
            let machine_name = wire::get_string(&mut body_src, MAX_MACHINE_NAME)?;
            let uid = wire::get_u32(&mut body_src)?;
            let gid = wire::get_u32(&mut body_src)?;
            let ngids = wire::get_u32(&mut body_src)? as usize;
            if ngids > MAX_GIDS {
                return Err(DecodeError::TooLong);
            }
            let mut gids = Vec::with_capacity(ngids);
            for _ in 0..ngids {
                gids.push(wire::get_u32(&mut body_src)?);
            }
            Ok(Credential::Unix(UnixCred { stamp, machine_name, uid, gid, gids }))
        }
        other => Ok(Credential::Other(other)),
    }
}

/// Appends a successful reply header (xid + `MSG_ACCEPTED` + `SUCCESS` +
/// empty verifier) to `dst`; the caller appends the procedure's XDR result
/// immediately after.
pub fn encode_success(dst: &mut wire::Encoder, xid: u32) {
    encode_accepted_header(dst, xid, AcceptStat::Success);
}

/// Appends an accepted-but-failed reply (anything other than `SUCCESS`
/// carries no further result data per RFC 1057 §9.1).
pub fn encode_accept_error(dst: &mut wire::Encoder, xid: u32, stat: AcceptStat) {
    encode_accepted_header(dst, xid, stat);
    if stat == AcceptStat::ProgMismatch {
        // RFC 1057: mismatch_info low/high version; we only ever serve one
        // version per program, so low == high.
        let _ = wire::put_u32(dst, 2);
        let _ = wire::put_u32(dst, 2);
    }
}

fn encode_accepted_header(dst: &mut wire::Encoder, xid: u32, stat: AcceptStat) {
    let _ = wire::put_u32(dst, xid);
    let _ = wire::put_u32(dst, REPLY);
    let _ = wire::put_u32(dst, 0); // MSG_ACCEPTED
    let _ = wire::put_u32(dst, AuthFlavor::None as u32);
    let _ = wire::put_var(dst, &[]);
    let _ = wire::put_u32(dst, stat as u32);
}

/// Appends a rejected reply: either an RPC version mismatch or an auth
/// failure (bad/expired credential, spec §4.G "unauthorized clients are
/// rejected at the RPC layer, before any filesystem syscall runs").
pub fn encode_auth_rejected(dst: &mut wire::Encoder, xid: u32, why: AuthStat) {
    let _ = wire::put_u32(dst, xid);
    let _ = wire::put_u32(dst, REPLY);
    let _ = wire::put_u32(dst, 1); // MSG_DENIED
    let _ = wire::put_u32(dst, 1); // AUTH_ERROR
    let _ = wire::put_u32(dst, why as u32);
}
