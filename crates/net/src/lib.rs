//! IPv4 primitives for cidrwatch.
//!
//! Addresses live as plain `u32` throughout the hot path; this crate owns the
//! conversions to and from dotted-quad text, the [`Cidr`] range type and a
//! radix sort for bulk ordering of address arrays.

pub mod sort;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use cidrwatch_common::CidrwatchError;
use serde::{Deserialize, Serialize};

pub use sort::radix_sort;

/// Parse a dotted-quad IPv4 address into its 32-bit form.
pub fn parse_addr(text: &str) -> Result<u32, CidrwatchError> {
    text.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| CidrwatchError::Addr(text.to_string()))
}

/// Render a 32-bit address as dotted-quad text.
pub fn render_addr(addr: u32) -> String {
    Ipv4Addr::from(addr).to_string()
}

/// An IPv4 CIDR range: base address plus prefix length.
///
/// The base is always canonical (host bits masked off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    /// Build a range, masking the base down to its prefix.
    /// Fails when the prefix exceeds 32.
    pub fn new(base: u32, prefix: u8) -> Result<Self, CidrwatchError> {
        if prefix > 32 {
            return Err(CidrwatchError::Cidr(format!(
                "{}/{}: prefix exceeds 32",
                render_addr(base),
                prefix
            )));
        }
        Ok(Self {
            base: base & prefix_mask(prefix),
            prefix,
        })
    }

    /// A /32 range covering a single address.
    pub fn host(addr: u32) -> Self {
        Self {
            base: addr,
            prefix: 32,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The last address inside the range.
    pub fn last_addr(&self) -> u32 {
        self.base | !prefix_mask(self.prefix)
    }

    /// Whether `addr` falls inside this range.
    pub fn contains(&self, addr: u32) -> bool {
        addr & prefix_mask(self.prefix) == self.base
    }

    /// Whether `other` is entirely inside this range.
    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(other.base)
    }

    /// Whether `other` is a proper sub-range (contained, and strictly
    /// narrower).
    pub fn contains_proper(&self, other: &Cidr) -> bool {
        other.prefix > self.prefix && self.contains(other.base)
    }
}

/// Network mask for a prefix length (0 yields an empty mask).
fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl FromStr for Cidr {
    type Err = CidrwatchError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (addr_text, prefix_text) = text
            .split_once('/')
            .ok_or_else(|| CidrwatchError::Cidr(format!("{}: missing '/'", text)))?;
        let base = parse_addr(addr_text)
            .map_err(|_| CidrwatchError::Cidr(format!("{}: bad address", text)))?;
        let prefix: u8 = prefix_text
            .parse()
            .map_err(|_| CidrwatchError::Cidr(format!("{}: bad prefix", text)))?;
        Cidr::new(base, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", render_addr(self.base), self.prefix)
    }
}

impl From<ipnet::Ipv4Net> for Cidr {
    fn from(net: ipnet::Ipv4Net) -> Self {
        Self {
            base: u32::from(net.network()),
            prefix: net.prefix_len(),
        }
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a list entry as either a CIDR or a bare address (treated as /32).
///
/// This is the lenient form used for operator-supplied list files.
pub fn parse_list_entry(text: &str) -> Result<Cidr, CidrwatchError> {
    if let Ok(net) = text.parse::<ipnet::Ipv4Net>() {
        return Ok(net.into());
    }
    if let Ok(addr) = text.parse::<Ipv4Addr>() {
        return Ok(Cidr::host(u32::from(addr)));
    }
    Err(CidrwatchError::Cidr(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trip() {
        for text in ["0.0.0.0", "10.0.0.1", "192.168.1.255", "255.255.255.255"] {
            let addr = parse_addr(text).unwrap();
            assert_eq!(render_addr(addr), text);
        }
    }

    #[test]
    fn addr_numeric_round_trip() {
        for addr in [0u32, 1, 0x0A00_0001, 0xC0A8_01FF, u32::MAX] {
            assert_eq!(parse_addr(&render_addr(addr)).unwrap(), addr);
        }
    }

    #[test]
    fn addr_rejects_malformed() {
        assert!(parse_addr("10.0.0").is_err());
        assert!(parse_addr("10.0.0.256").is_err());
        assert!(parse_addr("::1").is_err());
        assert!(parse_addr("not-an-ip").is_err());
    }

    #[test]
    fn cidr_parse_and_render() {
        let cidr: Cidr = "192.168.1.0/24".parse().unwrap();
        assert_eq!(cidr.base(), 0xC0A8_0100);
        assert_eq!(cidr.prefix(), 24);
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn cidr_canonicalizes_base() {
        let cidr: Cidr = "192.168.1.77/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn cidr_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
        assert!("10.0.0.0".parse::<Cidr>().is_err());
    }

    #[test]
    fn last_addr() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(render_addr(cidr.last_addr()), "10.255.255.255");
        let host: Cidr = "10.1.2.3/32".parse().unwrap();
        assert_eq!(host.last_addr(), host.base());
        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.last_addr(), u32::MAX);
    }

    #[test]
    fn containment() {
        let net: Cidr = "192.168.0.0/16".parse().unwrap();
        assert!(net.contains(parse_addr("192.168.200.1").unwrap()));
        assert!(!net.contains(parse_addr("192.169.0.1").unwrap()));

        let sub: Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains_cidr(&sub));
        assert!(net.contains_proper(&sub));
        assert!(!sub.contains_cidr(&net));
        assert!(net.contains_cidr(&net));
        assert!(!net.contains_proper(&net));
    }

    #[test]
    fn zero_prefix_contains_everything() {
        let all = Cidr::new(0, 0).unwrap();
        assert!(all.contains(0));
        assert!(all.contains(u32::MAX));
        assert!(all.contains_proper(&Cidr::host(1)));
    }

    #[test]
    fn list_entry_lenient_forms() {
        assert_eq!(
            parse_list_entry("10.0.0.0/8").unwrap().to_string(),
            "10.0.0.0/8"
        );
        assert_eq!(
            parse_list_entry("192.168.1.1").unwrap().to_string(),
            "192.168.1.1/32"
        );
        assert!(parse_list_entry("garbage").is_err());
    }
}
