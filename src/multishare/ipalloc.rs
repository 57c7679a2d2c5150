//! Reserved IP Range Allocation
//!
//! Enterprise instances need a /26 of the peered network. When a storage
//! class supplies a wider CIDR, carve the first /26 inside it that no
//! existing instance is using.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Prefix length of the block each instance consumes
pub const INSTANCE_PREFIX_LEN: u8 = 26;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: u32,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Parse `a.b.c.d/n`; host bits must be zero
    pub fn parse(raw: &str) -> Result<Self> {
        let (addr, len) = raw
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a CIDR range", raw)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid address in {:?}", raw)))?;
        let prefix_len: u8 = len
            .parse()
            .ok()
            .filter(|l| *l <= 32)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid prefix in {:?}", raw)))?;

        let base = u32::from(addr);
        let cidr = Self { base, prefix_len };
        if base & !cidr.mask() != 0 {
            return Err(Error::InvalidArgument(format!(
                "{:?} has host bits set",
                raw
            )));
        }
        Ok(cidr)
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len)
    }

    fn last(&self) -> u32 {
        self.base | !self.mask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix_len)
    }
}

/// First free /26 inside `parent` not overlapping any of `used`.
///
/// Entries of `used` that are not CIDRs (named allocations) are ignored.
pub fn allocate_instance_range(parent: &str, used: &[String]) -> Result<String> {
    let parent = Ipv4Cidr::parse(parent)?;
    if parent.prefix_len > INSTANCE_PREFIX_LEN {
        return Err(Error::InvalidArgument(format!(
            "reserved range {} is smaller than a /{}",
            parent, INSTANCE_PREFIX_LEN
        )));
    }

    let used: Vec<Ipv4Cidr> = used.iter().filter_map(|r| Ipv4Cidr::parse(r).ok()).collect();
    let block = 1u64 << (32 - INSTANCE_PREFIX_LEN);
    let mut offset = 0u64;
    while offset < parent.size() {
        let candidate = Ipv4Cidr {
            base: parent.base + offset as u32,
            prefix_len: INSTANCE_PREFIX_LEN,
        };
        if !used.iter().any(|u| u.overlaps(&candidate)) {
            return Ok(candidate.to_string());
        }
        offset += block;
    }

    Err(Error::InsufficientCapacity {
        requested: block,
        available: 0,
    })
}

/// Resolve the `reserved-ip-range` parameter for a new instance.
///
/// Wider CIDRs are narrowed to a free /26; a /26 or a named allocated
/// range is used as given.
pub fn resolve_reserved_ip_range(param: Option<&str>, used: &[String]) -> Result<Option<String>> {
    let raw = match param {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    if !raw.contains('/') {
        return Ok(Some(raw.to_string()));
    }
    let cidr = Ipv4Cidr::parse(raw)?;
    if cidr.prefix_len() == INSTANCE_PREFIX_LEN {
        return Ok(Some(cidr.to_string()));
    }
    allocate_instance_range(raw, used).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_cidr() {
        let cidr = Ipv4Cidr::parse("10.0.0.0/24").unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/24");
        assert!(Ipv4Cidr::parse("10.0.0.1/24").is_err());
        assert!(Ipv4Cidr::parse("10.0.0.0/33").is_err());
        assert!(Ipv4Cidr::parse("10.0.0.0").is_err());
    }

    #[test]
    fn test_allocates_first_free_block() {
        assert_eq!(
            allocate_instance_range("10.0.0.0/24", &[]).unwrap(),
            "10.0.0.0/26"
        );
        let used = vec![
            "10.0.0.0/26".to_string(),
            "10.0.0.72/29".to_string(),
            "named-range".to_string(),
        ];
        assert_eq!(
            allocate_instance_range("10.0.0.0/24", &used).unwrap(),
            "10.0.0.128/26"
        );
    }

    #[test]
    fn test_exhausted_parent() {
        let used = vec!["10.0.0.0/25".to_string()];
        assert_matches!(
            allocate_instance_range("10.0.0.0/25", &used),
            Err(Error::InsufficientCapacity { .. })
        );
        assert!(allocate_instance_range("10.0.0.0/28", &[]).is_err());
    }

    #[test]
    fn test_resolve_parameter() {
        assert_eq!(resolve_reserved_ip_range(None, &[]).unwrap(), None);
        assert_eq!(
            resolve_reserved_ip_range(Some("psa-range"), &[]).unwrap(),
            Some("psa-range".to_string())
        );
        assert_eq!(
            resolve_reserved_ip_range(Some("192.168.4.64/26"), &[]).unwrap(),
            Some("192.168.4.64/26".to_string())
        );
        assert_eq!(
            resolve_reserved_ip_range(Some("192.168.4.0/23"), &["192.168.4.0/26".into()]).unwrap(),
            Some("192.168.4.64/26".to_string())
        );
    }
}
