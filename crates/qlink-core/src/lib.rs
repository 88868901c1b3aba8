//! Endpoint allocation and reconciliation for UDP socket links between
//! Proxmox VMs.

pub mod alloc;
pub mod config;
pub mod emit;
pub mod error;
pub mod identity;
pub mod pve;
pub mod resolve;
pub mod scan;
pub mod state;

pub use error::{LinkError, Remediation};
pub use resolve::{resolve, Endpoint, PlannedNic, Resolution, ResolvedNic, VmPlan};
pub use state::{StateSource, VmState};
