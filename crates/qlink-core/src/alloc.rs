//! PCI address allocation on `pci.0`.
//!
//! Usable range is 0x10..=0x1f, shared with Proxmox's fixed placements:
//! legacy `hostpci0`/`hostpci1` on 0x10/0x11 and native `net0`..`net5` on
//! 0x12..=0x17. The pci.1/pci.2 bridges sit on 0x1e/0x1f, so those two are
//! never handed out.

use std::collections::BTreeSet;

use qlink_types::{ExistingInterface, PciAllocStrategy};

pub const PCI_BUS: &str = "pci.0";
pub const PCI_ADDR_MIN: u8 = 0x10;
pub const PCI_ADDR_MAX: u8 = 0x1f;
pub const PCI_RESERVED: [u8; 2] = [0x1e, 0x1f];

pub fn is_reserved(addr: u8) -> bool {
    PCI_RESERVED.contains(&addr)
}

/// Address Proxmox gives a native `netN:` NIC on `pci.0`, if fixed.
pub fn native_nic_addr(index: u32) -> Option<u8> {
    match index {
        0..=5 => Some(0x12 + index as u8),
        _ => None,
    }
}

/// Address of a non-PCIe `hostpciN:` passthrough on `pci.0`, if fixed.
pub fn native_hostpci_addr(index: u32) -> Option<u8> {
    match index {
        0..=1 => Some(0x10 + index as u8),
        _ => None,
    }
}

/// Every address either strategy may return, ascending.
fn candidates() -> impl Iterator<Item = u8> {
    (PCI_ADDR_MIN..=PCI_ADDR_MAX).filter(|a| !is_reserved(*a))
}

/// Per-VM view of the bus: what is taken, and the highest NIC address of the
/// configured device model.
#[derive(Debug, Clone, Default)]
pub struct BusState {
    in_use: BTreeSet<u8>,
    highest_nic: Option<u8>,
}

impl BusState {
    /// `occupied` holds addresses of non-NIC devices on the same bus.
    pub fn new(interfaces: &[ExistingInterface], occupied: &BTreeSet<u8>, model: &str) -> Self {
        let mut bus = Self {
            in_use: occupied.clone(),
            highest_nic: None,
        };
        for iface in interfaces {
            let Some(addr) = iface.bus_address else {
                continue;
            };
            bus.in_use.insert(addr);
            if iface.model.as_deref() == Some(model) {
                bus.highest_nic = Some(bus.highest_nic.map_or(addr, |h| h.max(addr)));
            }
        }
        bus
    }

    pub fn is_free(&self, addr: u8) -> bool {
        !is_reserved(addr) && !self.in_use.contains(&addr)
    }

    /// Mark an address consumed by an interface created in this run.
    pub fn claim(&mut self, addr: u8) {
        self.in_use.insert(addr);
        self.highest_nic = Some(self.highest_nic.map_or(addr, |h| h.max(addr)));
    }

    pub fn highest_nic(&self) -> Option<u8> {
        self.highest_nic
    }
}

/// A bus address allocation strategy.
pub trait Allocator {
    /// `None` means the usable range is exhausted.
    fn allocate(&self, bus: &BusState) -> Option<u8>;
}

fn lowest_free(bus: &BusState) -> Option<u8> {
    candidates().find(|a| bus.is_free(*a))
}

impl Allocator for PciAllocStrategy {
    fn allocate(&self, bus: &BusState) -> Option<u8> {
        match self {
            PciAllocStrategy::LowestFree => lowest_free(bus),
            PciAllocStrategy::NextHighest => {
                let start = bus
                    .highest_nic
                    .map_or(PCI_ADDR_MIN, |h| h.saturating_add(1))
                    .max(PCI_ADDR_MIN);
                candidates()
                    .filter(|a| *a >= start)
                    .find(|a| bus.is_free(*a))
                    .or_else(|| lowest_free(bus))
            }
        }
    }
}
