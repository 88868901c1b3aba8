use std::collections::HashMap;

use qlink_types::{ExistingInterface, MacAddr};
use tracing::warn;

/// Where a previously created interface lives, copied verbatim on reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseEntry {
    pub slot: String,
    pub bus_address: Option<u8>,
}

/// Summary of a VM's existing NICs: highest `netN` index and a MAC lookup.
#[derive(Debug, Clone, Default)]
pub struct SlotScan {
    /// `None` when no slot name parsed (so the first new NIC gets `net0`).
    pub highest_slot: Option<u32>,
    pub reuse: HashMap<MacAddr, ReuseEntry>,
}

impl SlotScan {
    /// Index the first newly created interface should take; `None` once
    /// the highest existing slot is `u32::MAX`.
    pub fn next_slot(&self) -> Option<u32> {
        self.highest_slot.map_or(Some(0), |h| h.checked_add(1))
    }

    pub fn lookup(&self, mac: &MacAddr) -> Option<&ReuseEntry> {
        self.reuse.get(mac)
    }
}

/// Numeric suffix of a slot name: `net3` → 3. `None` for `net`, `3net`, `netx`.
pub fn slot_index(name: &str) -> Option<u32> {
    let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn scan(interfaces: &[ExistingInterface]) -> SlotScan {
    let mut out = SlotScan::default();
    for iface in interfaces {
        if let Some(idx) = slot_index(&iface.slot) {
            out.highest_slot = Some(out.highest_slot.map_or(idx, |h| h.max(idx)));
        }
        match iface.mac.parse::<MacAddr>() {
            Ok(mac) => {
                // Duplicate MACs: first one wins.
                out.reuse.entry(mac).or_insert_with(|| ReuseEntry {
                    slot: iface.slot.clone(),
                    bus_address: iface.bus_address,
                });
            }
            Err(e) => warn!(slot = %iface.slot, "ignoring interface for reuse: {e}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(mac: &str, slot: &str, addr: Option<u8>) -> ExistingInterface {
        ExistingInterface {
            mac: mac.into(),
            slot: slot.into(),
            bus_address: addr,
            model: None,
        }
    }

    #[test]
    fn test_slot_index() {
        assert_eq!(slot_index("net0"), Some(0));
        assert_eq!(slot_index("net12"), Some(12));
        assert_eq!(slot_index("net"), None);
        assert_eq!(slot_index("net1a"), None);
        assert_eq!(slot_index(""), None);
    }

    #[test]
    fn test_scan_empty() {
        let s = scan(&[]);
        assert_eq!(s.highest_slot, None);
        assert_eq!(s.next_slot(), Some(0));
        assert!(s.reuse.is_empty());
    }

    #[test]
    fn test_scan_highest_slot() {
        let s = scan(&[
            iface("bc:24:11:00:00:01", "net0", None),
            iface("be:24:99:00:64:01", "net4", Some(0x10)),
            iface("be:24:99:00:64:02", "net2", Some(0x11)),
        ]);
        assert_eq!(s.highest_slot, Some(4));
        assert_eq!(s.next_slot(), Some(5));
    }

    #[test]
    fn test_scan_unparseable_slot_still_indexed() {
        let s = scan(&[
            iface("be:24:99:00:64:01", "net1", Some(0x10)),
            iface("be:24:99:00:64:02", "uplink", Some(0x11)),
        ]);
        assert_eq!(s.highest_slot, Some(1));
        let mac: MacAddr = "be:24:99:00:64:02".parse().unwrap();
        assert_eq!(
            s.lookup(&mac),
            Some(&ReuseEntry {
                slot: "uplink".into(),
                bus_address: Some(0x11)
            })
        );
    }

    #[test]
    fn test_scan_mac_lookup_case_insensitive() {
        let s = scan(&[iface("BE:24:99:00:64:01", "net3", Some(0x12))]);
        let mac: MacAddr = "be:24:99:00:64:01".parse().unwrap();
        assert_eq!(s.lookup(&mac).unwrap().slot, "net3");
    }

    #[test]
    fn test_scan_next_slot_at_u32_max() {
        let s = scan(&[iface("be:24:99:00:64:01", "net4294967295", None)]);
        assert_eq!(s.highest_slot, Some(u32::MAX));
        assert_eq!(s.next_slot(), None);
    }

    #[test]
    fn test_scan_duplicate_mac_first_wins() {
        let s = scan(&[
            iface("be:24:99:00:64:01", "net1", Some(0x10)),
            iface("BE:24:99:00:64:01", "net5", Some(0x14)),
        ]);
        assert_eq!(s.reuse.len(), 1);
        let mac: MacAddr = "be:24:99:00:64:01".parse().unwrap();
        assert_eq!(
            s.lookup(&mac),
            Some(&ReuseEntry {
                slot: "net1".into(),
                bus_address: Some(0x10)
            })
        );
        assert_eq!(s.highest_slot, Some(5));
    }

    #[test]
    fn test_scan_skips_bad_mac() {
        let s = scan(&[iface("not-a-mac", "net7", None)]);
        assert!(s.reuse.is_empty());
        assert_eq!(s.highest_slot, Some(7));
    }
}
