use anyhow::{Context, Result};
use qlink_types::ExistingInterface;
use std::collections::{BTreeMap, BTreeSet};

/// Everything the engine needs to know about one VM's current configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmState {
    pub interfaces: Vec<ExistingInterface>,
    /// Bus addresses held by devices that are not NICs.
    pub occupied: BTreeSet<u8>,
    /// Current `args:` fragments, e.g. `-netdev socket,id=net3,...`.
    pub args: Vec<String>,
}

/// Trait abstracting where existing VM configuration comes from.
pub trait StateSource {
    fn read(&self, vmid: u32) -> Result<VmState>;
}

/// In-memory source; unknown VMs have no existing configuration.
impl StateSource for BTreeMap<u32, VmState> {
    fn read(&self, vmid: u32) -> Result<VmState> {
        Ok(self.get(&vmid).cloned().unwrap_or_default())
    }
}

/// Read every VM up front, one query each.
pub fn read_all<S, I>(source: &S, vmids: I) -> Result<BTreeMap<u32, VmState>>
where
    S: StateSource + ?Sized,
    I: IntoIterator<Item = u32>,
{
    vmids
        .into_iter()
        .map(|vmid| {
            source
                .read(vmid)
                .with_context(|| format!("failed to read configuration of VM {vmid}"))
                .map(|state| (vmid, state))
        })
        .collect()
}
