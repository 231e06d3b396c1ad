use cidrwatch_net::{radix_sort, Cidr};
use std::collections::HashMap;

/// An immutable membership set over CIDR ranges.
///
/// Entries collapse into merged, sorted `(start, end)` address ranges, so a
/// lookup is one binary search regardless of how many ranges were supplied.
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    starts: Vec<u32>,
    ends: Vec<u32>,
}

impl CidrSet {
    pub fn from_cidrs(cidrs: &[Cidr]) -> Self {
        if cidrs.is_empty() {
            return Self::default();
        }

        // Keep only the widest range per base, then order bases.
        let mut widest: HashMap<u32, u8> = HashMap::with_capacity(cidrs.len());
        for cidr in cidrs {
            widest
                .entry(cidr.base())
                .and_modify(|prefix| *prefix = (*prefix).min(cidr.prefix()))
                .or_insert(cidr.prefix());
        }
        let mut bases: Vec<u32> = widest.keys().copied().collect();
        radix_sort(&mut bases);

        let mut starts = Vec::with_capacity(bases.len());
        let mut ends: Vec<u32> = Vec::with_capacity(bases.len());
        for base in bases {
            let prefix = widest[&base];
            let last = Cidr::new(base, prefix).expect("prefix came from a valid Cidr").last_addr();
            match ends.last_mut() {
                // Merge ranges that overlap or touch the previous one.
                Some(prev_end) if base <= prev_end.saturating_add(1) => {
                    if last > *prev_end {
                        *prev_end = last;
                    }
                }
                _ => {
                    starts.push(base);
                    ends.push(last);
                }
            }
        }

        Self { starts, ends }
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Number of merged ranges.
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn contains(&self, addr: u32) -> bool {
        let idx = self.starts.partition_point(|&start| start <= addr);
        if idx == 0 {
            return false;
        }
        addr <= self.ends[idx - 1]
    }
}
