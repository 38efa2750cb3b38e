//! Host resolver (spec §4.E): reverse-looks-up a caller address, then
//! forward-verifies the name it got back actually owns that address —
//! `auth.c`'s `auth_reverse_lookup`/`auth_forward_lookup` pair, ported to
//! the platform resolver via `libc::getnameinfo`/`std::net::ToSocketAddrs`
//! (the standard library's forward-lookup path already shells out to the
//! same resolver the original called `gethostbyname` on).

use std::net::{Ipv4Addr, ToSocketAddrs};

/// Performs the raw reverse and forward DNS lookups. Split out as a trait
/// so the spoof-check logic in [`resolve_client_name`] can be tested
/// without a real resolver.
pub trait DnsResolver: Send + Sync {
    /// `AF_INET` reverse lookup; `None` on failure (spec: "failures are
    /// surfaced as host-unknown", §6).
    fn reverse(&self, addr: Ipv4Addr) -> Option<String>;
    /// Forward lookup; returns every `AF_INET` address the name resolves
    /// to (other address families are dropped, spec §4.E: "Only AF_INET
    /// with a 4-byte address length is accepted").
    fn forward(&self, name: &str) -> Vec<Ipv4Addr>;
}

/// [`DnsResolver`] backed by the platform's resolver.
pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn reverse(&self, addr: Ipv4Addr) -> Option<String> {
        reverse_lookup(addr)
    }

    fn forward(&self, name: &str) -> Vec<Ipv4Addr> {
        (name, 0u16)
            .to_socket_addrs()
            .into_iter()
            .flatten()
            .filter_map(|sa| match sa.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect()
    }
}

#[cfg(unix)]
fn reverse_lookup(addr: Ipv4Addr) -> Option<String> {
    use std::ffi::CStr;
    use std::mem;

    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) },
        sin_zero: [0; 8],
    };

    let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
    let rc = unsafe {
        libc::getnameinfo(
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            0,
        )
    };
    if rc != 0 {
        return None;
    }
    let name = unsafe { CStr::from_ptr(host.as_ptr()) }.to_string_lossy().into_owned();
    Some(strip_trailing_whitespace(&name))
}

#[cfg(not(unix))]
fn reverse_lookup(_addr: Ipv4Addr) -> Option<String> {
    None
}

/// Some NIS maps carry trailing whitespace on hostname records that
/// `gethostbyaddr` doesn't strip (spec §4.E); trim it the same way.
fn strip_trailing_whitespace(name: &str) -> String {
    name.trim_end().to_string()
}

/// Outcome of resolving a caller address to a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Reverse lookup succeeded and forward-verified.
    Name(String),
    /// Reverse lookup returned nothing.
    Unknown,
    /// Reverse lookup returned a name whose forward lookup does not
    /// include the original address.
    Spoof(String),
}

/// Resolves `addr` to a verified hostname (spec §4.E): the name a reverse
/// lookup returns is trusted only if a forward lookup on that name
/// includes `addr` among its results.
pub fn resolve_client_name(addr: Ipv4Addr, resolver: &dyn DnsResolver) -> Resolution {
    let Some(name) = resolver.reverse(addr) else {
        return Resolution::Unknown;
    };
    let forward = resolver.forward(&name);
    if forward.contains(&addr) {
        Resolution::Name(name)
    } else {
        Resolution::Spoof(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeResolver {
        reverse: HashMap<Ipv4Addr, String>,
        forward: HashMap<String, Vec<Ipv4Addr>>,
    }

    impl DnsResolver for FakeResolver {
        fn reverse(&self, addr: Ipv4Addr) -> Option<String> {
            self.reverse.get(&addr).cloned()
        }
        fn forward(&self, name: &str) -> Vec<Ipv4Addr> {
            self.forward.get(name).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn verified_round_trip_resolves_to_name() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        let resolver = FakeResolver {
            reverse: HashMap::from([(addr, "host.example".to_string())]),
            forward: HashMap::from([("host.example".to_string(), vec![addr])]),
        };
        assert_eq!(resolve_client_name(addr, &resolver), Resolution::Name("host.example".into()));
    }

    #[test]
    fn mismatched_forward_lookup_is_a_spoof() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        let other = Ipv4Addr::new(10, 0, 0, 6);
        let resolver = FakeResolver {
            reverse: HashMap::from([(addr, "host.example".to_string())]),
            forward: HashMap::from([("host.example".to_string(), vec![other])]),
        };
        assert_eq!(resolve_client_name(addr, &resolver), Resolution::Spoof("host.example".into()));
    }

    #[test]
    fn no_reverse_record_is_unknown() {
        let resolver = FakeResolver { reverse: HashMap::new(), forward: HashMap::new() };
        assert_eq!(resolve_client_name(Ipv4Addr::new(1, 1, 1, 1), &resolver), Resolution::Unknown);
    }

    #[test]
    fn trailing_whitespace_is_stripped() {
        assert_eq!(strip_trailing_whitespace("host.example   \t"), "host.example");
    }
}
