// Copyright (c) The Keel Project Authors.
// Licensed under the MIT License.

//! Socket addressing.
//!
//! Addresses stay opaque to applications: look a name up, hand the result to
//! a channel constructor, or render it for humans. Lookup is synchronous by
//! design: platforms do not agree on an async resolver, and an application
//! that wants one can run its own and convert the results.

use std::net::{SocketAddr, ToSocketAddrs};

use keel_error::{Error, ErrorHub, code_values};

bitflags::bitflags! {
    /// Controls for [`address_lookup`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Sort IPv4 results ahead of IPv6.
        const PREFER_IPV4 = 0x0001;
        /// Sort IPv6 results ahead of IPv4.
        const PREFER_IPV6 = 0x0002;
    }
}

/// Resolves `name` (synchronously) to the addresses it maps to, associated
/// with `port`.
///
/// A name may map to several addresses across families. With
/// [`PREFER_IPV4`](LookupFlags::PREFER_IPV4) or
/// [`PREFER_IPV6`](LookupFlags::PREFER_IPV6) the preferred family is sorted to
/// the front; with neither (or both) set, every family comes back in resolver
/// order.
///
/// # Errors
///
/// `ADDRESS_LOOKUP` when resolution fails or yields nothing.
pub fn address_lookup(hub: &ErrorHub, name: &str, port: u16, flags: LookupFlags) -> keel_error::Result<Vec<SocketAddr>> {
    let mut addresses: Vec<SocketAddr> = match (name, port).to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(err) => {
            return Err(Error::with_message(
                hub,
                code_values::ADDRESS_LOOKUP,
                format!("resolving {name}:{port}: {err}"),
            ));
        }
    };

    if addresses.is_empty() {
        return Err(Error::with_message(
            hub,
            code_values::ADDRESS_LOOKUP,
            format!("{name}:{port} did not resolve to any address"),
        ));
    }

    let prefer_v4 = flags.contains(LookupFlags::PREFER_IPV4);
    let prefer_v6 = flags.contains(LookupFlags::PREFER_IPV6);
    if prefer_v4 != prefer_v6 {
        // Stable sort keeps resolver order within each family.
        addresses.sort_by_key(|addr| match addr {
            SocketAddr::V4(_) => !prefer_v4,
            SocketAddr::V6(_) => !prefer_v6,
        });
    }

    Ok(addresses)
}

/// Formats `address` into its canonical printable form: dotted-quad for IPv4,
/// RFC 5952 text for IPv6, both with the port.
#[must_use]
pub fn address_readable(address: &SocketAddr) -> String {
    address.to_string()
}

/// Converts an address into raw sockaddr storage for the syscall layer.
pub(crate) fn to_raw(address: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    match address {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                (&raw mut storage).cast::<libc::sockaddr_in>().write(sin);
            }
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                (&raw mut storage).cast::<libc::sockaddr_in6>().write(sin6);
            }
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Converts raw sockaddr storage (as filled in by accept/recvfrom) back into
/// an address. Unknown families yield `None`.
pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the kernel filled this as a sockaddr_in.
            let sin = unsafe { &*(&raw const *storage).cast::<libc::sockaddr_in>() };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: the kernel filled this as a sockaddr_in6.
            let sin6 = unsafe { &*(&raw const *storage).cast::<libc::sockaddr_in6>() };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use keel_error::ErrorHub;

    use super::*;

    #[test]
    fn readable_forms() {
        let v4: SocketAddr = (Ipv4Addr::new(192, 0, 2, 17), 8080).into();
        assert_eq!(address_readable(&v4), "192.0.2.17:8080");

        let v6: SocketAddr = (Ipv6Addr::LOCALHOST, 443).into();
        assert_eq!(address_readable(&v6), "[::1]:443");
    }

    #[test]
    fn localhost_resolves() {
        let hub = ErrorHub::new(false);
        let addrs = address_lookup(&hub, "localhost", 80, LookupFlags::empty()).expect("localhost resolves");
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 80));
    }

    #[test]
    fn family_preference_sorts() {
        let hub = ErrorHub::new(false);
        let Ok(addrs) = address_lookup(&hub, "localhost", 80, LookupFlags::PREFER_IPV4) else {
            return;
        };
        if addrs.len() > 1 {
            assert!(addrs[0].is_ipv4());
        }

        let Ok(addrs) = address_lookup(&hub, "localhost", 80, LookupFlags::PREFER_IPV6) else {
            return;
        };
        if addrs.len() > 1 {
            assert!(addrs[0].is_ipv6());
        }
    }

    #[test]
    fn lookup_failure_is_reported() {
        let hub = ErrorHub::new(false);
        let err = address_lookup(&hub, "no-such-host.invalid", 80, LookupFlags::empty())
            .expect_err("reserved TLD never resolves");
        assert_eq!(err.errval(), code_values::ADDRESS_LOOKUP);
        err.handled();
    }

    #[test]
    fn raw_round_trip() {
        let v4: SocketAddr = (Ipv4Addr::new(203, 0, 113, 9), 9000).into();
        let (storage, _len) = to_raw(&v4);
        assert_eq!(from_raw(&storage), Some(v4));

        let v6: SocketAddr = (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 9001).into();
        let (storage, _len) = to_raw(&v6);
        assert_eq!(from_raw(&storage), Some(v6));
    }
}
