//! CIDR block arithmetic.
//!
//! Two blocks either nest or are disjoint, so "overlapping" reduces to one
//! containing the other.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};

use crate::error::{CoreError, Result};

/// The IPv4 default route, the source CIDR of every pod route.
pub const DEFAULT_ROUTE_V4: &str = "0.0.0.0/0";

/// Parse a CIDR string, normalizing host bits away.
///
/// # Errors
///
/// Returns `CoreError::InvalidCidr` if the string is not a CIDR block.
pub fn parse(s: &str) -> Result<IpNet> {
    s.trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| CoreError::InvalidCidr(s.to_string()))
}

/// Whether two blocks share at least one address.
///
/// Blocks of different address families never overlap.
#[must_use]
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// The IPv4 default route as a block.
#[must_use]
pub fn default_route_v4() -> IpNet {
    IpNet::V4(Ipv4Net::default())
}

/// Whether the block is the default route of its family.
#[must_use]
pub fn is_default_route(net: &IpNet) -> bool {
    net.prefix_len() == 0
}

/// The block of the same size directly after `net`.
///
/// Returns `None` when `net` is the last block of the address space.
#[must_use]
pub fn next_block(net: &Ipv4Net) -> Option<Ipv4Net> {
    let net = net.trunc();
    let size = 1u64 << (32 - u32::from(net.prefix_len()));
    let next = u64::from(u32::from(net.network())) + size;
    let next = u32::try_from(next).ok()?;
    Ipv4Net::new(Ipv4Addr::from(next), net.prefix_len()).ok()
}

/// The first block after `start` (same prefix length) that overlaps none of `taken`.
///
/// When `within` is given the search stops at its boundary.
///
/// # Errors
///
/// Returns `CoreError::CidrExhausted` when no free block remains.
pub fn next_free_block(
    start: &Ipv4Net,
    taken: &[Ipv4Net],
    within: Option<&Ipv4Net>,
) -> Result<Ipv4Net> {
    let mut candidate = next_block(start);

    while let Some(block) = candidate {
        if let Some(outer) = within {
            if !outer.contains(&block) {
                break;
            }
        }

        let block_net = IpNet::V4(block);
        let used = taken
            .iter()
            .any(|t| overlaps(&block_net, &IpNet::V4(*t)));
        if !used {
            return Ok(block);
        }
        candidate = next_block(&block);
    }

    Err(CoreError::CidrExhausted(start.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn parse_truncates_host_bits() {
        assert_eq!(parse("10.0.0.7/24").unwrap(), net("10.0.0.0/24"));
        assert!(parse("10.0.0.0/33").is_err());
        assert!(parse("garbage").is_err());
    }

    #[test]
    fn overlap_rules() {
        assert!(overlaps(&net("10.0.0.0/16"), &net("10.0.3.0/24")));
        assert!(overlaps(&net("10.0.3.0/24"), &net("10.0.0.0/16")));
        assert!(overlaps(&net("10.0.3.0/24"), &net("10.0.3.0/24")));
        assert!(!overlaps(&net("10.0.3.0/24"), &net("10.0.4.0/24")));
        assert!(overlaps(&net("0.0.0.0/0"), &net("172.16.0.0/12")));
        assert!(!overlaps(&net("10.0.0.0/8"), &net("fd00::/8")));
    }

    #[test]
    fn default_route_detection() {
        assert!(is_default_route(&net(DEFAULT_ROUTE_V4)));
        assert!(!is_default_route(&net("10.0.0.0/8")));
    }

    #[test]
    fn next_block_same_prefix() {
        assert_eq!(next_block(&v4("192.168.0.0/24")), Some(v4("192.168.1.0/24")));
        assert_eq!(next_block(&v4("192.168.0.0/20")), Some(v4("192.168.16.0/20")));
        assert_eq!(next_block(&v4("10.255.255.0/24")), Some(v4("11.0.0.0/24")));
        assert_eq!(next_block(&v4("255.255.255.0/24")), None);
    }

    #[test]
    fn next_free_block_skips_taken() {
        let taken = vec![v4("192.168.0.0/24"), v4("192.168.1.0/24"), v4("192.168.2.0/23")];
        let free = next_free_block(&v4("192.168.0.0/24"), &taken, None).unwrap();
        assert_eq!(free, v4("192.168.4.0/24"));
    }

    #[test]
    fn next_free_block_respects_boundary() {
        let outer = v4("192.168.0.0/23");
        let taken = vec![v4("192.168.0.0/24"), v4("192.168.1.0/24")];
        let err = next_free_block(&v4("192.168.0.0/24"), &taken, Some(&outer)).unwrap_err();
        assert!(matches!(err, CoreError::CidrExhausted(_)));
    }
}
