//! Matching of addresses against allow-list entries.
//!
//! An entry is either an exact address (`10.0.0.1`, `2001:db8::1`) or a CIDR block
//! (`10.0.0.0/24`, `2001:db8::/32`). Malformed entries and addresses never match.
//!
//! # IPv6 prefixes
//!
//! IPv6 blocks are compared on the first `ceil(n / 4)` hex digits of the fully expanded form.
//! This is exact when the prefix length is a multiple of 4; for other lengths the block is
//! rounded up to the next nibble, so some addresses inside the block do not match.

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;

/// Whether `ip` falls within `entry`.
pub fn ip_matches(ip: &str, entry: &str) -> bool {
    let Ok(ip) = ip.trim().parse::<IpAddr>() else {
        return false;
    };
    let entry = entry.trim();
    match entry.split_once('/') {
        Some((network, prefix)) => match (network.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(network), Ok(prefix)) => in_block(ip, network, prefix),
            _ => false,
        },
        None => entry.parse::<IpAddr>().map_or(false, |entry| entry == ip),
    }
}

/// Whether `ip` matches any of the entries.
pub fn matches_any<'a, I>(ip: &str, entries: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    entries.into_iter().any(|entry| ip_matches(ip, entry))
}

fn in_block(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            Ipv4Net::new(network, prefix).map_or(false, |net| net.contains(&ip))
        }
        // Comparing the first ceil(n / 4) hex digits is a prefix of 4 * ceil(n / 4) bits
        (IpAddr::V6(ip), IpAddr::V6(network)) if prefix <= 128 => {
            Ipv6Net::new(network, nibble_prefix(prefix)).map_or(false, |net| net.contains(&ip))
        }
        _ => false,
    }
}

fn nibble_prefix(prefix: u8) -> u8 {
    prefix.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_block() {
        assert!(ip_matches("192.168.1.5", "192.168.1.0/24"));
        assert!(!ip_matches("192.168.2.5", "192.168.1.0/24"));
        assert!(ip_matches("10.0.0.200", "10.0.0.0/24"));
        assert!(!ip_matches("10.0.1.1", "10.0.0.0/24"));
        assert!(ip_matches("172.31.255.255", "172.16.0.0/12"));
        assert!(!ip_matches("172.32.0.0", "172.16.0.0/12"));
    }

    #[test]
    fn test_ipv4_edge_prefixes() {
        assert!(ip_matches("8.8.8.8", "0.0.0.0/0"));
        assert!(ip_matches("10.0.0.1", "10.0.0.1/32"));
        assert!(!ip_matches("10.0.0.2", "10.0.0.1/32"));
        // Host bits in the network address are ignored
        assert!(ip_matches("10.0.0.9", "10.0.0.77/24"));
    }

    #[test]
    fn test_exact() {
        assert!(ip_matches("10.0.0.1", "10.0.0.1"));
        assert!(!ip_matches("10.0.0.2", "10.0.0.1"));
        assert!(ip_matches(" 10.0.0.1", "10.0.0.1 "));
        assert!(ip_matches("2001:db8::1", "2001:0db8:0000:0000:0000:0000:0000:0001"));
        assert!(ip_matches("2001:DB8::1", "2001:db8::1"));
        assert!(!ip_matches("2001:db8::2", "2001:db8::1"));
    }

    #[test]
    fn test_ipv6_block() {
        assert!(ip_matches("2001:db8:abcd::1", "2001:db8::/32"));
        assert!(!ip_matches("2001:db9::1", "2001:db8::/32"));
        assert!(ip_matches("fe80::1", "fe80::/64"));
        assert!(ip_matches("::1", "::/0"));
    }

    #[test]
    fn test_ipv6_prefix_rounds_to_nibble() {
        // 2001:db8:8000:: is inside 2001:db8::/33 bitwise, but the 9th hex digit differs
        assert!(!ip_matches("2001:db8:8000::1", "2001:db8::/33"));
        assert!(ip_matches("2001:db8:0fff::1", "2001:db8::/33"));
    }

    #[test]
    fn test_malformed_never_matches() {
        assert!(!ip_matches("10.0.0.1", "10.0.0.0/33"));
        assert!(!ip_matches("10.0.0.1", "10.0.0.0/abc"));
        assert!(!ip_matches("10.0.0.1", "not-an-ip"));
        assert!(!ip_matches("not-an-ip", "10.0.0.0/8"));
        assert!(!ip_matches("2001:db8::1", "2001:db8::/129"));
        assert!(!ip_matches("10.0.0.1", "2001:db8::/32"));
        assert!(!ip_matches("2001:db8::1", "10.0.0.0/8"));
        assert!(!ip_matches("10.0.0.1", "10.0.0.0/-1"));
    }

    #[test]
    fn test_nibble_prefix() {
        assert_eq!(nibble_prefix(0), 0);
        assert_eq!(nibble_prefix(32), 32);
        assert_eq!(nibble_prefix(33), 36);
        assert_eq!(nibble_prefix(127), 128);
    }

    #[test]
    fn test_matches_any_skips_bad_entries() {
        let entries = ["garbage", "10.0.0.0/99", "192.168.0.0/16"];
        assert!(matches_any("192.168.7.7", entries));
        assert!(!matches_any("10.0.0.1", entries));
        assert!(!matches_any("10.0.0.1", []));
    }
}
