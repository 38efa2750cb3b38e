//! XDR (External Data Representation, RFC 1014) primitives shared by the
//! RPC envelope (4.K), the NFSv2 procedures (4.L), and the MOUNT
//! protocol — the "RPC argument marshaling" collaborator that spec §1
//! marks out of scope as a generic facility, narrowed here to exactly the
//! primitives this server's own wire types need.
//!
//! Ported from the teacher's `parser/primitive.rs` (decode) and
//! `serializer/mod.rs` (encode), collapsed into one synchronous module:
//! the dispatcher (4.K) reads a whole datagram before decoding and writes
//! a whole reply before sending, so there is no `AsyncRead` plumbing to
//! thread through here (spec §5: dispatch is strictly sequential, one
//! request fully handled before the next is read).

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// XDR aligns every field to a 4-byte boundary.
pub const ALIGNMENT: usize = 4;

#[derive(Debug)]
pub enum DecodeError {
    Io(io::Error),
    BadString,
    TooLong,
    BadDiscriminant(u32),
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        DecodeError::Io(err)
    }
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// A cursor over an already-received datagram or record.
pub type Decoder<'a> = Cursor<&'a [u8]>;

fn read_padding(src: &mut impl Read, n: usize) -> DecodeResult<()> {
    let pad = (ALIGNMENT - n % ALIGNMENT) % ALIGNMENT;
    let mut buf = [0u8; ALIGNMENT];
    src.read_exact(&mut buf[..pad])?;
    Ok(())
}

pub fn get_u32(src: &mut impl Read) -> DecodeResult<u32> {
    Ok(src.read_u32::<BigEndian>()?)
}

pub fn get_u64(src: &mut impl Read) -> DecodeResult<u64> {
    Ok(src.read_u64::<BigEndian>()?)
}

/// Decodes a signed 32-bit field. NFSv2 `sattr` overloads this with the
/// sentinel `-1` meaning "leave unchanged" (spec §4.L SETATTR).
pub fn get_i32(src: &mut impl Read) -> DecodeResult<i32> {
    Ok(src.read_i32::<BigEndian>()?)
}

pub fn get_bool(src: &mut impl Read) -> DecodeResult<bool> {
    match get_u32(src)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::BadDiscriminant(other)),
    }
}

/// Reads a fixed-size opaque array (no length prefix), padded to the next
/// 4-byte boundary. Used for file handles and cookie verifiers.
pub fn get_fixed<const N: usize>(src: &mut impl Read) -> DecodeResult<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf)?;
    read_padding(src, N)?;
    Ok(buf)
}

/// Reads a variable-length opaque/string field (length-prefixed, then
/// padded), rejecting anything longer than `max`.
pub fn get_var(src: &mut impl Read, max: usize) -> DecodeResult<Vec<u8>> {
    let len = get_u32(src)? as usize;
    if len > max {
        return Err(DecodeError::TooLong);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    read_padding(src, len)?;
    Ok(buf)
}

pub fn get_string(src: &mut impl Read, max: usize) -> DecodeResult<String> {
    String::from_utf8(get_var(src, max)?).map_err(|_| DecodeError::BadString)
}

// --- Encoding -------------------------------------------------------

/// A growable byte buffer a reply is assembled into before being sent as
/// one UDP datagram (or one TCP record).
pub type Encoder = Vec<u8>;

fn write_padding(dst: &mut impl Write, n: usize) -> io::Result<()> {
    let pad = (ALIGNMENT - n % ALIGNMENT) % ALIGNMENT;
    dst.write_all(&[0u8; ALIGNMENT][..pad])
}

pub fn put_u32(dst: &mut impl Write, v: u32) -> io::Result<()> {
    dst.write_u32::<BigEndian>(v)
}

pub fn put_u64(dst: &mut impl Write, v: u64) -> io::Result<()> {
    dst.write_u64::<BigEndian>(v)
}

pub fn put_i32(dst: &mut impl Write, v: i32) -> io::Result<()> {
    dst.write_i32::<BigEndian>(v)
}

pub fn put_bool(dst: &mut impl Write, v: bool) -> io::Result<()> {
    put_u32(dst, v as u32)
}

pub fn put_fixed(dst: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    dst.write_all(bytes)?;
    write_padding(dst, bytes.len())
}

pub fn put_var(dst: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    put_u32(dst, bytes.len() as u32)?;
    dst.write_all(bytes)?;
    write_padding(dst, bytes.len())
}

pub fn put_string(dst: &mut impl Write, s: &str) -> io::Result<()> {
    put_var(dst, s.as_bytes())
}
