use std::fmt;

use crate::alloc::{PCI_ADDR_MAX, PCI_ADDR_MIN, PCI_BUS};

pub type Result<T> = std::result::Result<T, LinkError>;

/// What an operator can do when a VM has no free bus address left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    EnableAutoPciAddr,
    FreeBusAddress,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnableAutoPciAddr => {
                f.write_str("set `auto_pci_addr: true` to let the hypervisor assign addresses")
            }
            Self::FreeBusAddress => write!(
                f,
                "free a PCI address on {PCI_BUS} (0x{PCI_ADDR_MIN:02x}..=0x{PCI_ADDR_MAX:02x}, bridges excluded)"
            ),
        }
    }
}

/// Fatal resolution errors. Any of these aborts the whole run before output.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("VM {vmid} eth{eth}: {reason}")]
    InvalidIdentifier {
        vmid: u32,
        eth: u32,
        reason: &'static str,
    },

    #[error("VM {vmid} eth{eth}: illegal UDP port {port} (VMID must be <= 999, eth index <= 9, port <= 65535)")]
    PortRangeExceeded { vmid: u32, eth: u32, port: u64 },

    #[error("port collision {port} between VM{vmid} eth{eth} and VM{prev_vmid} eth{prev_eth}")]
    PortCollision {
        port: u16,
        vmid: u32,
        eth: u32,
        prev_vmid: u32,
        prev_eth: u32,
    },

    #[error("VM {vmid}: no interface slot left after net{highest}")]
    SlotSpaceExhausted { vmid: u32, highest: u32 },

    #[error("VM {vmid}: no free PCI address on pci.0; {}", join_remediations(.remediations))]
    AddressSpaceExhausted {
        vmid: u32,
        remediations: [Remediation; 2],
    },
}

fn join_remediations(r: &[Remediation]) -> String {
    r.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", or ")
}

impl LinkError {
    pub fn exhausted(vmid: u32) -> Self {
        Self::AddressSpaceExhausted {
            vmid,
            remediations: [Remediation::EnableAutoPciAddr, Remediation::FreeBusAddress],
        }
    }

    /// Suggested fixes, for tooling that wants to surface them separately.
    pub fn remediations(&self) -> &[Remediation] {
        match self {
            Self::AddressSpaceExhausted { remediations, .. } => remediations,
            _ => &[],
        }
    }
}
