//! The on-wire file handle (spec §3 "Handle").
//!
//! A handle is a fixed 32-byte opaque token: a 4-byte pseudo-inode followed
//! by a 28-byte hash path (a length byte plus up to 27 single-byte hashes
//! of the pseudo-inodes of ancestor directories). Modeled in-memory as a
//! typed record rather than a raw byte array, per the Design Notes §9
//! ("Opaque fixed-size handle → tagged record"); [`Handle::to_bytes`] and
//! [`Handle::from_bytes`] are the only places the wire layout is visible.

use crate::error::{Result, Stat};

/// Size in bytes of a handle on the wire.
pub const HANDLE_SIZE: usize = 32;
/// Maximum number of ancestor hashes a hash path can hold.
pub const MAX_HASH_DEPTH: usize = 27;

/// A single-byte hash of an ancestor's pseudo-inode, used to verify a
/// candidate directory while rebuilding a path from a handle (§4.D).
pub type AncestorHash = u8;

/// Parsed, typed form of the 32-byte wire handle.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub pseudo_inode: u32,
    depth: u8,
    hashes: [AncestorHash; MAX_HASH_DEPTH],
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("pseudo_inode", &format_args!("{:#010x}", self.pseudo_inode))
            .field("hash_path", &self.hash_path())
            .finish()
    }
}

impl Handle {
    /// Builds a handle from a pseudo-inode and the sequence of ancestor
    /// hashes (root-to-parent order, i.e. `hashes[0]` is the hash of the
    /// top-level exported directory's pseudo-inode).
    ///
    /// Returns [`Stat::NameTooLong`] when `hashes.len()` exceeds
    /// [`MAX_HASH_DEPTH`] (spec §8: "A hash-path of maximum depth (27) must
    /// succeed; depth 28 must be rejected *nametoolong*.").
    pub fn new(pseudo_inode: u32, hashes: &[AncestorHash]) -> Result<Self> {
        if hashes.len() > MAX_HASH_DEPTH {
            return Err(Stat::NameTooLong);
        }
        let mut buf = [0u8; MAX_HASH_DEPTH];
        buf[..hashes.len()].copy_from_slice(hashes);
        Ok(Handle { pseudo_inode, depth: hashes.len() as u8, hashes: buf })
    }

    /// The hash path, in root-to-parent order.
    pub fn hash_path(&self) -> &[AncestorHash] {
        &self.hashes[..self.depth as usize]
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Serializes to the fixed 32-byte wire representation: 4-byte
    /// pseudo-inode, 1-byte length, up to 27 hash bytes, zero-padded.
    pub fn to_bytes(&self) -> [u8; HANDLE_SIZE] {
        let mut out = [0u8; HANDLE_SIZE];
        out[0..4].copy_from_slice(&self.pseudo_inode.to_be_bytes());
        out[4] = self.depth;
        out[5..5 + self.depth as usize].copy_from_slice(&self.hashes[..self.depth as usize]);
        out
    }

    /// Parses a handle from its 32-byte wire representation.
    ///
    /// A `depth` byte greater than [`MAX_HASH_DEPTH`] is a malformed handle
    /// (never produced by this server) and is treated as *stale* rather
    /// than panicking, since handles ultimately originate from untrusted
    /// clients.
    pub fn from_bytes(bytes: &[u8; HANDLE_SIZE]) -> Result<Self> {
        let pseudo_inode = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let depth = bytes[4];
        if depth as usize > MAX_HASH_DEPTH {
            return Err(Stat::Stale);
        }
        let mut hashes = [0u8; MAX_HASH_DEPTH];
        hashes[..depth as usize].copy_from_slice(&bytes[5..5 + depth as usize]);
        Ok(Handle { pseudo_inode, depth, hashes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let h = Handle::new(0xdead_beef, &[1, 2, 3, 4]).unwrap();
        let bytes = h.to_bytes();
        let h2 = Handle::from_bytes(&bytes).unwrap();
        assert_eq!(h.pseudo_inode, h2.pseudo_inode);
        assert_eq!(h.hash_path(), h2.hash_path());
    }

    #[test]
    fn max_depth_27_succeeds() {
        let hashes = [7u8; MAX_HASH_DEPTH];
        let h = Handle::new(1, &hashes).expect("depth 27 must be accepted");
        assert_eq!(h.depth(), MAX_HASH_DEPTH);
    }

    #[test]
    fn depth_28_is_nametoolong() {
        let hashes = [7u8; MAX_HASH_DEPTH + 1];
        assert_eq!(Handle::new(1, &hashes), Err(Stat::NameTooLong));
    }

    #[test]
    fn empty_hash_path_is_the_export_root() {
        let h = Handle::new(42, &[]).unwrap();
        assert!(h.hash_path().is_empty());
        assert_eq!(h.depth(), 0);
    }
}
