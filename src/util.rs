//! Address classification and subnet handling for EDNS Client Subnet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// The Client Subnet address family number for IPv4.
pub const FAMILY_IPV4: u16 = 1;

/// The Client Subnet address family number for IPv6.
pub const FAMILY_IPV6: u16 = 2;

// Local-use IPv4 prefixes per RFC 6890, as (network, prefix length).
const LOCAL_IPV4_NETS: [(Ipv4Addr, u8); 10] = [
    (Ipv4Addr::new(0, 0, 0, 0), 8),        // This host on this network
    (Ipv4Addr::new(10, 0, 0, 0), 8),       // Private-Use Networks
    (Ipv4Addr::new(100, 64, 0, 0), 10),    // Shared Address Space
    (Ipv4Addr::new(127, 0, 0, 0), 8),      // Loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),   // Link Local
    (Ipv4Addr::new(172, 16, 0, 0), 12),    // Private-Use Networks
    (Ipv4Addr::new(192, 0, 0, 0), 29),     // DS-Lite
    (Ipv4Addr::new(192, 88, 99, 0), 24),   // 6to4 Relay Anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16),   // Private-Use Networks
    (Ipv4Addr::new(240, 0, 0, 0), 4),      // Reserved & Limited Broadcast
];

// Local-use IPv6 prefixes per RFC 6890.
const LOCAL_IPV6_NETS: [(Ipv6Addr, u8); 4] = [
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 127),      // Unspecified & Loopback
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),   // Discard-Only Prefix
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),   // Unique-Local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),  // Link-Scoped Unicast
];

/// Returns true iff the address is not covered by any RFC 6890 local-use
/// prefix, and is therefore meaningful to a resolver on the open Internet.
pub fn is_global_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => !LOCAL_IPV4_NETS
            .iter()
            .any(|(net, bits)| mask_v4(ip, *bits) == *net),
        IpAddr::V6(ip) => {
            // An IPv4 address arriving in its mapped form is judged by the
            // IPv4 table.
            if let Some(ipv4) = to_ipv4_mapped(ip) {
                return is_global_ip(IpAddr::V4(ipv4));
            }
            !LOCAL_IPV6_NETS
                .iter()
                .any(|(net, bits)| mask_v6(ip, *bits) == *net)
        }
    }
}

/// Zeroes all but the leftmost `bits` bits of the address.
pub fn mask_ip(ip: IpAddr, bits: u8) -> IpAddr {
    match ip {
        IpAddr::V4(ip) => IpAddr::V4(mask_v4(ip, bits)),
        IpAddr::V6(ip) => IpAddr::V6(mask_v6(ip, bits)),
    }
}

fn mask_v4(ip: Ipv4Addr, bits: u8) -> Ipv4Addr {
    let mask = match bits {
        0 => 0,
        1..=31 => u32::MAX << (32 - bits),
        _ => u32::MAX,
    };
    Ipv4Addr::from(u32::from(ip) & mask)
}

fn mask_v6(ip: Ipv6Addr, bits: u8) -> Ipv6Addr {
    let mask = match bits {
        0 => 0,
        1..=127 => u128::MAX << (128 - bits),
        _ => u128::MAX,
    };
    Ipv6Addr::from(u128::from(ip) & mask)
}

fn to_ipv4_mapped(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    match ip.octets() {
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, a, b, c, d] => {
            Some(Ipv4Addr::new(a, b, c, d))
        }
        _ => None,
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SubnetError {
    #[error("invalid subnet address {0:?}")]
    InvalidAddress(String),

    #[error("invalid subnet prefix length {0:?}")]
    InvalidPrefix(String),
}

/// Parses `"a.b.c.d"`, `"a.b.c.d/N"` or their IPv6 forms into
/// `(family, masked address, prefix length)`.
///
/// Without an explicit prefix the full host length applies (32 or 128).
/// Oversized prefixes are clamped rather than rejected, and `"0/0"` is
/// accepted as an alias for `"0.0.0.0/0"`.
pub fn parse_subnet(subnet: &str) -> Result<(u16, IpAddr, u8), SubnetError> {
    let subnet = if subnet == "0/0" { "0.0.0.0/0" } else { subnet };

    let (addr, prefix) = match subnet.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (subnet, None),
    };

    let addr: IpAddr = addr
        .parse()
        .map_err(|_| SubnetError::InvalidAddress(subnet.to_string()))?;

    let host_bits = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let bits = match prefix {
        Some(prefix) => prefix
            .parse::<u8>()
            .map_err(|_| SubnetError::InvalidPrefix(subnet.to_string()))?
            .min(host_bits),
        None => host_bits,
    };

    let family = match addr {
        IpAddr::V4(_) => FAMILY_IPV4,
        IpAddr::V6(_) => FAMILY_IPV6,
    };

    Ok((family, mask_ip(addr, bits), bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_local_ips() {
        for ip in [
            "0.0.0.1",
            "10.0.0.1",
            "100.64.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "172.16.0.1",
            "192.0.0.1",
            "192.88.99.1",
            "192.168.1.1",
            "240.0.0.1",
            "255.255.255.255",
            "::",
            "::1",
            "100::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "::ffff:10.0.0.1",
        ] {
            let ip = IpAddr::from_str(ip).unwrap();
            assert!(!is_global_ip(ip), "{} should be local", ip);
        }
    }

    #[test]
    fn test_global_ips() {
        for ip in [
            "8.8.8.8",
            "1.1.1.1",
            "93.184.216.34",
            "2001:4860:4860::8888",
            "2606:2800:220:1::1",
            "::ffff:8.8.8.8",
        ] {
            let ip = IpAddr::from_str(ip).unwrap();
            assert!(is_global_ip(ip), "{} should be global", ip);
        }
    }

    #[test]
    fn test_parse_subnet() {
        assert_eq!(
            parse_subnet("0/0").unwrap(),
            (FAMILY_IPV4, IpAddr::from_str("0.0.0.0").unwrap(), 0)
        );
        assert_eq!(
            parse_subnet("203.0.113.99/24").unwrap(),
            (FAMILY_IPV4, IpAddr::from_str("203.0.113.0").unwrap(), 24)
        );
        assert_eq!(
            parse_subnet("203.0.113.99").unwrap(),
            (FAMILY_IPV4, IpAddr::from_str("203.0.113.99").unwrap(), 32)
        );
        assert_eq!(
            parse_subnet("2001:db8:1234::1/56").unwrap(),
            (FAMILY_IPV6, IpAddr::from_str("2001:db8:1200::").unwrap(), 56)
        );

        // Oversized prefixes clamp to the host length.
        assert_eq!(
            parse_subnet("127.0.0.1/33").unwrap(),
            (FAMILY_IPV4, IpAddr::from_str("127.0.0.1").unwrap(), 32)
        );
        assert_eq!(parse_subnet("2001:db8::/129").unwrap().2, 128);

        assert!(parse_subnet("bogus").is_err());
        assert!(parse_subnet("bogus/24").is_err());
        assert!(parse_subnet("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_mask_ip() {
        assert_eq!(
            mask_ip(IpAddr::from_str("203.0.113.99").unwrap(), 24),
            IpAddr::from_str("203.0.113.0").unwrap()
        );
        assert_eq!(
            mask_ip(IpAddr::from_str("2001:db8:aaaa:bbbb::1").unwrap(), 48),
            IpAddr::from_str("2001:db8:aaaa::").unwrap()
        );
        assert_eq!(
            mask_ip(IpAddr::from_str("255.255.255.255").unwrap(), 0),
            IpAddr::from_str("0.0.0.0").unwrap()
        );
    }
}
