//! IP range lists
//!
//! Text format, one or more entries separated by newlines, `,` or `|`:
//! ```text
//! # comment
//! 142.250.0.0/15
//! 172.217.1.1-172.217.1.200
//! 64.233.160.
//! 2404:6800:4000::/36
//! 8.8.8.8
//! ```
//! Entries are kept as inclusive numeric intervals, sorted and merged.

use super::IpError;
use ipnet::IpNet;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// One inclusive interval of addresses of a single family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    v6: bool,
    start: u128,
    end: u128,
}

impl IpRange {
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, IpError> {
        let (v6, s, e) = match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => (false, u32::from(s) as u128, u32::from(e) as u128),
            (IpAddr::V6(s), IpAddr::V6(e)) => (true, u128::from(s), u128::from(e)),
            _ => {
                return Err(IpError::InvalidRange(format!(
                    "mixed address families: {}-{}",
                    start, end
                )))
            }
        };
        if s > e {
            return Err(IpError::InvalidRange(format!("{} > {}", start, end)));
        }
        Ok(Self { v6, start: s, end: e })
    }

    pub fn start(&self) -> IpAddr {
        self.addr(self.start)
    }

    pub fn end(&self) -> IpAddr {
        self.addr(self.end)
    }

    /// Number of addresses covered
    pub fn len(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (v6, n) = Self::key(ip);
        v6 == self.v6 && n >= self.start && n <= self.end
    }

    fn addr(&self, n: u128) -> IpAddr {
        if self.v6 {
            IpAddr::V6(Ipv6Addr::from(n))
        } else {
            IpAddr::V4(Ipv4Addr::from(n as u32))
        }
    }

    fn key(ip: IpAddr) -> (bool, u128) {
        match ip {
            IpAddr::V4(v4) => (false, u32::from(v4) as u128),
            IpAddr::V6(v6) => (true, u128::from(v6)),
        }
    }

    /// Parse a single entry
    pub fn parse(entry: &str) -> Result<Self, IpError> {
        let entry = entry.trim();
        let invalid = || IpError::InvalidRange(entry.to_string());

        if entry.contains('/') {
            let net: IpNet = entry.parse().map_err(|_| invalid())?;
            let net = net.trunc();
            return Self::new(net.network(), net.broadcast());
        }

        if let Some((start, end)) = entry.split_once('-') {
            let start: IpAddr = start.trim().parse().map_err(|_| invalid())?;
            let end: IpAddr = end.trim().parse().map_err(|_| invalid())?;
            return Self::new(start, end);
        }

        // "a.b.c." style prefix
        if entry.ends_with('.') {
            let octets: Vec<u8> = entry
                .trim_end_matches('.')
                .split('.')
                .map(|o| o.parse::<u8>().map_err(|_| invalid()))
                .collect::<Result<_, _>>()?;
            if octets.is_empty() || octets.len() > 3 {
                return Err(invalid());
            }
            let mut start = [0u8; 4];
            let mut end = [255u8; 4];
            start[..octets.len()].copy_from_slice(&octets);
            end[..octets.len()].copy_from_slice(&octets);
            return Self::new(Ipv4Addr::from(start).into(), Ipv4Addr::from(end).into());
        }

        let ip: IpAddr = entry.parse().map_err(|_| invalid())?;
        Self::new(ip, ip)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start())
        } else {
            write!(f, "{}-{}", self.start(), self.end())
        }
    }
}

/// Sorted, merged set of ranges
#[derive(Debug, Clone, Default)]
pub struct IpRangeSet {
    ranges: Vec<IpRange>,
    total: u128,
}

impl IpRangeSet {
    /// Parse range text; any bad entry fails the whole list
    pub fn parse(text: &str) -> Result<Self, IpError> {
        let mut ranges = Vec::new();
        for line in text.lines() {
            let line = match line.split_once('#') {
                Some((content, _)) => content,
                None => line,
            };
            for entry in line.split([',', '|']) {
                if entry.trim().is_empty() {
                    continue;
                }
                ranges.push(IpRange::parse(entry)?);
            }
        }
        Ok(Self::from_ranges(ranges))
    }

    /// Read and parse a range file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IpError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn from_ranges(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort();

        let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.v6 == range.v6 && range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }

        let total = merged
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.len()));
        Self {
            ranges: merged,
            total,
        }
    }

    /// Union with another set
    pub fn merge(&self, other: &IpRangeSet) -> Self {
        let mut all = self.ranges.clone();
        all.extend_from_slice(&other.ranges);
        Self::from_ranges(all)
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// Total number of addresses
    pub fn len(&self) -> u128 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.range_of(ip).is_some()
    }

    /// The merged range an address came from
    pub fn range_of(&self, ip: IpAddr) -> Option<&IpRange> {
        self.ranges.iter().find(|r| r.contains(ip))
    }

    /// Address at position `n` across all ranges
    fn nth(&self, mut n: u128) -> Option<IpAddr> {
        for range in &self.ranges {
            if n < range.len() {
                return Some(range.addr(range.start + n));
            }
            n -= range.len();
        }
        None
    }

    /// Uniform random address, weighted by range size
    pub fn random_ip(&self) -> Option<IpAddr> {
        if self.total == 0 {
            return None;
        }
        let n = rand::rng().random_range(0..self.total);
        self.nth(n)
    }

    /// Up to `limit` distinct addresses; all of them when the set is small enough
    pub fn sample(&self, limit: usize) -> Vec<IpAddr> {
        if self.total <= limit as u128 {
            return (0..self.total).filter_map(|n| self.nth(n)).collect();
        }

        let mut seen = HashSet::with_capacity(limit);
        // Bounded so a pathological set cannot spin forever.
        let mut attempts = limit.saturating_mul(4);
        while seen.len() < limit && attempts > 0 {
            attempts -= 1;
            if let Some(ip) = self.random_ip() {
                seen.insert(ip);
            }
        }
        seen.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_formats() {
        let set = IpRangeSet::parse(
            "# google\n10.0.0.0/30\n10.0.1.1-10.0.1.4, 10.0.2.7 | 192.168.5.\n2001:db8::/126",
        )
        .unwrap();

        assert_eq!(set.len(), 4 + 4 + 1 + 256 + 4);
        assert!(set.contains(ip("10.0.1.3")));
        assert!(set.contains(ip("192.168.5.200")));
        assert!(set.contains(ip("2001:db8::3")));
        assert!(!set.contains(ip("10.0.1.5")));
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let set = IpRangeSet::parse("1.1.1.0-1.1.1.9\n1.1.1.10-1.1.1.20\n1.1.1.5").unwrap();
        assert_eq!(set.ranges().len(), 1);
        assert_eq!(set.len(), 21);
        assert_eq!(set.ranges()[0].to_string(), "1.1.1.0-1.1.1.20");
    }

    #[test]
    fn test_cidr_with_host_bits_is_truncated() {
        let range = IpRange::parse("10.1.2.3/24").unwrap();
        assert_eq!(range.start(), ip("10.1.2.0"));
        assert_eq!(range.end(), ip("10.1.2.255"));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(IpRange::parse("10.0.0.9-10.0.0.1").is_err());
        assert!(IpRange::parse("10.0.0.1-::1").is_err());
        assert!(IpRange::parse("not-an-ip").is_err());
        assert!(IpRangeSet::parse("1.1.1.1\n300.1.1.").is_err());
    }

    #[test]
    fn test_sample_and_random() {
        let set = IpRangeSet::parse("10.0.0.0/29").unwrap();
        let mut all = set.sample(100);
        all.sort();
        assert_eq!(all.len(), 8);
        assert_eq!(all[0], ip("10.0.0.0"));

        let big = IpRangeSet::parse("10.0.0.0/8").unwrap();
        let some = big.sample(50);
        assert_eq!(some.len(), 50);
        assert!(some.iter().all(|a| big.contains(*a)));
        assert!(big.contains(big.random_ip().unwrap()));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_range.txt");
        std::fs::write(&path, "1.2.3.4\n5.6.7.8 # trailing comment\n").unwrap();

        let set = IpRangeSet::from_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(IpRangeSet::from_file(dir.path().join("missing.txt")).is_err());
    }
}
