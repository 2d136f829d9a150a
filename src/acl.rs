//! CIDR-based allow/deny lists, used to gate which senders a PTP port will accept timing and
//! management messages from.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclOrder {
    /// Deny only if matched by deny AND not matched by permit.
    PermitDeny,
    /// Permit only if matched by permit OR not matched by deny.
    DenyPermit,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    network: u32,
    mask: u32,
    hits: u64,
}

impl Entry {
    fn matches(&self, addr: u32) -> bool {
        (addr & self.mask) == (self.network & self.mask)
    }
}

/// A single compiled permit or deny list. An empty list matches nothing (used by `AccessList`'s
/// empty-list-means-permit-all rule at the outer level, not here).
#[derive(Debug, Clone, Default)]
struct SubList {
    entries: Vec<Entry>,
}

impl SubList {
    fn parse(spec: &str) -> Self {
        let mut entries = Vec::new();
        for item in spec.split([',', ';']).map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((network, mask)) = parse_item(item) {
                entries.push(Entry { network, mask, hits: 0 });
            }
        }
        entries.sort_by_key(|e| (e.network, e.mask));
        SubList { entries }
    }

    fn matches(&mut self, addr: u32) -> bool {
        let mut matched = false;
        for entry in &mut self.entries {
            if entry.matches(addr) {
                entry.hits += 1;
                matched = true;
            }
        }
        matched
    }

    fn total_hits(&self) -> u64 {
        self.entries.iter().map(|e| e.hits).sum()
    }
}

fn parse_item(item: &str) -> Option<(u32, u32)> {
    let (addr_part, suffix) = match item.split_once('/') {
        Some((a, s)) => (a, Some(s)),
        None => (item, None),
    };
    let network: u32 = addr_part.parse::<Ipv4Addr>().ok()?.into();
    let mask = match suffix {
        None => u32::MAX,
        Some(s) => {
            if let Ok(prefix) = s.parse::<u32>() {
                if prefix == 0 {
                    0
                } else if prefix > 32 {
                    return None;
                } else {
                    u32::MAX << (32 - prefix)
                }
            } else {
                s.parse::<Ipv4Addr>().ok()?.into()
            }
        }
    };
    Some((network, mask))
}

/// Compiled permit/deny access list with a configurable evaluation order. An entirely empty
/// list (both sub-lists empty) permits everything, per spec.md §4.4.
#[derive(Debug, Clone)]
pub struct AccessList {
    order: AclOrder,
    permit: SubList,
    deny: SubList,
}

impl AccessList {
    /// `permit_spec`/`deny_spec` are comma/semicolon-separated `network[/prefix_or_mask]` items.
    pub fn new(order: AclOrder, permit_spec: &str, deny_spec: &str) -> Self {
        AccessList { order, permit: SubList::parse(permit_spec), deny: SubList::parse(deny_spec) }
    }

    pub fn permits(&mut self, addr: Ipv4Addr) -> bool {
        if self.permit.entries.is_empty() && self.deny.entries.is_empty() {
            return true;
        }
        let addr: u32 = addr.into();
        let permit_match = self.permit.matches(addr);
        let deny_match = self.deny.matches(addr);
        match self.order {
            AclOrder::PermitDeny => !(deny_match && !permit_match),
            AclOrder::DenyPermit => permit_match || !deny_match,
        }
    }

    pub fn permit_hits(&self) -> u64 {
        self.permit.total_hits()
    }

    pub fn deny_hits(&self) -> u64 {
        self.deny.total_hits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_permits_all() {
        let mut acl = AccessList::new(AclOrder::PermitDeny, "", "");
        assert!(acl.permits("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn permit_deny_order_denies_unmatched_with_deny_hit() {
        let mut acl = AccessList::new(AclOrder::PermitDeny, "10.0.0.0/8", "0.0.0.0/0");
        assert!(acl.permits("10.1.2.3".parse().unwrap()));
        assert!(!acl.permits("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn deny_permit_order_permits_unmatched() {
        let mut acl = AccessList::new(AclOrder::DenyPermit, "", "10.0.0.0/8");
        assert!(acl.permits("192.168.1.1".parse().unwrap()));
        assert!(!acl.permits("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn comma_and_semicolon_separators_both_work() {
        let mut acl = AccessList::new(AclOrder::PermitDeny, "10.0.0.0/8;192.168.0.0/16", "0.0.0.0/0");
        assert!(acl.permits("10.1.1.1".parse().unwrap()));
        assert!(acl.permits("192.168.5.5".parse().unwrap()));
    }

    #[test]
    fn hits_are_counted_per_entry() {
        let mut acl = AccessList::new(AclOrder::PermitDeny, "10.0.0.0/8", "0.0.0.0/0");
        acl.permits("10.1.1.1".parse().unwrap());
        acl.permits("10.1.1.2".parse().unwrap());
        assert_eq!(acl.permit_hits(), 2);
    }

    #[test]
    fn invariant_i10_order_independent_within_same_policy() {
        let mut a = AccessList::new(AclOrder::PermitDeny, "10.0.0.0/8,192.168.0.0/16", "0.0.0.0/0");
        let mut b = AccessList::new(AclOrder::PermitDeny, "192.168.0.0/16,10.0.0.0/8", "0.0.0.0/0");
        for ip in ["10.5.5.5", "192.168.1.1", "8.8.8.8"] {
            let addr = ip.parse().unwrap();
            assert_eq!(a.permits(addr), b.permits(addr));
        }
    }

    #[test]
    fn prefix_slash_zero_matches_everything() {
        let mut acl = AccessList::new(AclOrder::PermitDeny, "", "0.0.0.0/0");
        assert!(!acl.permits("1.2.3.4".parse().unwrap()));
    }
}
