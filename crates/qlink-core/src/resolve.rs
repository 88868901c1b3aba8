use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};

use qlink_types::{Defaults, LinkSpec, MacAddr};
use tracing::{debug, info};

use crate::alloc::{Allocator, BusState};
use crate::error::{LinkError, Result};
use crate::identity::{derive_mac, derive_port};
use crate::scan::{scan, slot_index};
use crate::state::VmState;

/// One side of a declared link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub vmid: u32,
    pub eth: u32,
    pub peer_vmid: u32,
    pub peer_eth: u32,
    pub mac: MacAddr,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Endpoint {
    pub fn local_port(&self) -> u16 {
        self.local.port()
    }
}

/// Outcome of reconciling an endpoint with the VM's existing interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNic {
    /// Interface id on the VM, `netN`.
    pub slot: String,
    /// `None` when the hypervisor assigns the address at boot.
    pub bus_address: Option<u8>,
    pub reused: bool,
}

impl ResolvedNic {
    pub fn slot_index(&self) -> Option<u32> {
        slot_index(&self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNic {
    pub nic: ResolvedNic,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPlan {
    pub vmid: u32,
    /// Slot index the first new interface received (or would have).
    /// Saturates at `u32::MAX` when every slot index is taken.
    pub first_new_slot: u32,
    /// In link declaration order.
    pub nics: Vec<PlannedNic>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Keyed by VM id, so iteration is sorted.
    pub vms: BTreeMap<u32, VmPlan>,
    pub ports: BTreeSet<u16>,
}

/// Accumulates every local port of a run and rejects the first duplicate.
#[derive(Debug, Default)]
pub struct PortLedger {
    owners: BTreeMap<u16, (u32, u32)>,
}

impl PortLedger {
    pub fn claim(&mut self, ep: &Endpoint) -> Result<()> {
        let port = ep.local_port();
        if let Some(&(prev_vmid, prev_eth)) = self.owners.get(&port) {
            return Err(LinkError::PortCollision {
                port,
                vmid: ep.vmid,
                eth: ep.eth,
                prev_vmid,
                prev_eth,
            });
        }
        self.owners.insert(port, (ep.vmid, ep.eth));
        Ok(())
    }

    pub fn into_ports(self) -> BTreeSet<u16> {
        self.owners.into_keys().collect()
    }
}

/// VM ids touched by any link, sorted.
pub fn referenced_vms(links: &[LinkSpec]) -> BTreeSet<u32> {
    links.iter().flat_map(|l| [l.vm_a, l.vm_b]).collect()
}

/// Host addresses for both sides; both become loopback when they share a host.
fn host_pair(defaults: &Defaults, vm_a: u32, vm_b: u32) -> (Ipv4Addr, Ipv4Addr) {
    let ip_a = defaults.ip_for(vm_a);
    let ip_b = defaults.ip_for(vm_b);
    if defaults.loopback_if_same_host && ip_a == ip_b && !ip_a.is_loopback() {
        return (Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
    }
    (ip_a, ip_b)
}

/// Both endpoints of a link, A first.
pub fn derive_endpoints(defaults: &Defaults, link: &LinkSpec) -> Result<[Endpoint; 2]> {
    let mac_a = derive_mac(defaults.mac_prefix, link.vm_a, link.eth_a)?;
    let mac_b = derive_mac(defaults.mac_prefix, link.vm_b, link.eth_b)?;
    let port_a = derive_port(defaults.udp_port_base, link.vm_a, link.eth_a)?;
    let port_b = derive_port(defaults.udp_port_base, link.vm_b, link.eth_b)?;
    let (ip_a, ip_b) = host_pair(defaults, link.vm_a, link.vm_b);

    let a = SocketAddr::from((ip_a, port_a));
    let b = SocketAddr::from((ip_b, port_b));
    Ok([
        Endpoint {
            vmid: link.vm_a,
            eth: link.eth_a,
            peer_vmid: link.vm_b,
            peer_eth: link.eth_b,
            mac: mac_a,
            local: a,
            remote: b,
        },
        Endpoint {
            vmid: link.vm_b,
            eth: link.eth_b,
            peer_vmid: link.vm_a,
            peer_eth: link.eth_a,
            mac: mac_b,
            local: b,
            remote: a,
        },
    ])
}

/// Reconcile one VM's endpoints against its existing interfaces.
fn plan_vm(
    defaults: &Defaults,
    vmid: u32,
    endpoints: Vec<Endpoint>,
    state: &VmState,
) -> Result<VmPlan> {
    let existing = scan(&state.interfaces);
    let mut bus = BusState::new(&state.interfaces, &state.occupied, &defaults.model);
    let mut next_slot = existing.next_slot();
    let first_new_slot = next_slot.unwrap_or(u32::MAX);

    let mut nics = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let nic = if let Some(entry) = existing.lookup(&endpoint.mac) {
            ResolvedNic {
                slot: entry.slot.clone(),
                bus_address: entry.bus_address,
                reused: true,
            }
        } else {
            let idx = next_slot.ok_or(LinkError::SlotSpaceExhausted {
                vmid,
                highest: u32::MAX,
            })?;
            let slot = format!("net{idx}");
            next_slot = idx.checked_add(1);
            let bus_address = if defaults.auto_pci_addr {
                None
            } else {
                let addr = defaults
                    .pci_alloc_strategy
                    .allocate(&bus)
                    .ok_or_else(|| LinkError::exhausted(vmid))?;
                bus.claim(addr);
                Some(addr)
            };
            ResolvedNic {
                slot,
                bus_address,
                reused: false,
            }
        };
        debug!(
            vmid,
            eth = endpoint.eth,
            slot = %nic.slot,
            mac = %endpoint.mac,
            reused = nic.reused,
            "resolved interface"
        );
        nics.push(PlannedNic { nic, endpoint });
    }

    info!(
        vmid,
        first_new_slot,
        created = nics.iter().filter(|n| !n.nic.reused).count(),
        reused = nics.iter().filter(|n| n.nic.reused).count(),
        "planned VM"
    );
    Ok(VmPlan {
        vmid,
        first_new_slot,
        nics,
    })
}

/// Resolve the whole link list. All-or-nothing: the first error aborts.
///
/// VMs missing from `states` are treated as having no existing interfaces.
pub fn resolve(
    defaults: &Defaults,
    links: &[LinkSpec],
    states: &BTreeMap<u32, VmState>,
) -> Result<Resolution> {
    let mut ledger = PortLedger::default();
    let mut by_vm: BTreeMap<u32, Vec<Endpoint>> = BTreeMap::new();

    for link in links {
        for endpoint in derive_endpoints(defaults, link)? {
            ledger.claim(&endpoint)?;
            by_vm.entry(endpoint.vmid).or_default().push(endpoint);
        }
    }

    let empty = VmState::default();
    let mut vms = BTreeMap::new();
    for (vmid, endpoints) in by_vm {
        let state = states.get(&vmid).unwrap_or(&empty);
        vms.insert(vmid, plan_vm(defaults, vmid, endpoints, state)?);
    }

    Ok(Resolution {
        vms,
        ports: ledger.into_ports(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlink_types::{ExistingInterface, PciAllocStrategy};

    fn link(a: u32, ai: u32, b: u32, bi: u32) -> LinkSpec {
        LinkSpec::new(a, ai, b, bi)
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    /// Turn a resolution into the state the hypervisor would hold after applying it.
    fn applied(res: &Resolution, model: &str) -> BTreeMap<u32, VmState> {
        res.vms
            .values()
            .map(|plan| {
                let interfaces = plan
                    .nics
                    .iter()
                    .map(|p| ExistingInterface {
                        mac: p.endpoint.mac.to_string().to_uppercase(),
                        slot: p.nic.slot.clone(),
                        bus_address: p.nic.bus_address,
                        model: Some(model.into()),
                    })
                    .collect();
                (
                    plan.vmid,
                    VmState {
                        interfaces,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn single_link_scenario() {
        let defaults = Defaults::default();
        let res = resolve(&defaults, &[link(100, 1, 102, 1)], &BTreeMap::new()).unwrap();

        let vm100 = &res.vms[&100].nics[0];
        assert_eq!(vm100.endpoint.local, "127.0.0.1:41001".parse().unwrap());
        assert_eq!(vm100.endpoint.remote, "127.0.0.1:41021".parse().unwrap());
        assert_eq!(vm100.nic.slot, "net0");
        assert!(!vm100.nic.reused);

        let vm102 = &res.vms[&102].nics[0];
        assert_eq!(vm102.endpoint.local, "127.0.0.1:41021".parse().unwrap());
        assert_eq!(vm102.endpoint.remote, "127.0.0.1:41001".parse().unwrap());

        assert_eq!(res.ports, [41001, 41021].into_iter().collect::<BTreeSet<u16>>());
    }

    #[test]
    fn loopback_substitution_same_host() {
        let mut defaults = Defaults::default();
        defaults.udp_ip_by_vm.insert(100, ip("10.0.0.5"));
        defaults.udp_ip_by_vm.insert(102, ip("10.0.0.5"));
        let [a, b] = derive_endpoints(&defaults, &link(100, 1, 102, 1)).unwrap();
        for addr in [a.local, a.remote, b.local, b.remote] {
            assert!(addr.ip().is_loopback(), "{addr}");
            assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        }
    }

    #[test]
    fn loopback_disabled_keeps_host_ips() {
        let mut defaults = Defaults::default();
        defaults.loopback_if_same_host = false;
        defaults.udp_default_ip = ip("10.0.0.5");
        let [a, _] = derive_endpoints(&defaults, &link(100, 1, 102, 1)).unwrap();
        assert_eq!(a.local.ip(), ip("10.0.0.5"));
        assert_eq!(a.remote.ip(), ip("10.0.0.5"));
    }

    #[test]
    fn different_hosts_use_table() {
        let mut defaults = Defaults::default();
        defaults.udp_ip_by_vm.insert(100, ip("10.0.0.5"));
        defaults.udp_ip_by_vm.insert(102, ip("10.0.0.6"));
        let [a, b] = derive_endpoints(&defaults, &link(100, 1, 102, 2)).unwrap();
        assert_eq!(a.local, "10.0.0.5:41001".parse().unwrap());
        assert_eq!(a.remote, "10.0.0.6:41022".parse().unwrap());
        assert_eq!(b.local, a.remote);
        assert_eq!(b.remote, a.local);
    }

    #[test]
    fn port_collision_across_links() {
        let defaults = Defaults::default();
        let err = resolve(
            &defaults,
            &[link(100, 1, 102, 1), link(103, 1, 100, 1)],
            &BTreeMap::new(),
        )
        .unwrap_err();
        match err {
            LinkError::PortCollision {
                port,
                vmid,
                eth,
                prev_vmid,
                prev_eth,
            } => {
                assert_eq!(port, 41001);
                assert_eq!((vmid, eth), (100, 1));
                assert_eq!((prev_vmid, prev_eth), (100, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_link_on_same_eth_collides() {
        let err = resolve(&Defaults::default(), &[link(100, 1, 100, 1)], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::PortCollision { port: 41001, .. }));
    }

    #[test]
    fn out_of_range_link_fails_whole_run() {
        let err = resolve(
            &Defaults::default(),
            &[link(100, 1, 102, 1), link(1000, 1, 102, 2)],
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::PortRangeExceeded { vmid: 1000, .. }));
    }

    #[test]
    fn invalid_identifier_checked_before_port() {
        let err = resolve(&Defaults::default(), &[link(70000, 1, 102, 1)], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidIdentifier { vmid: 70000, .. }));
    }

    #[test]
    fn monotonic_slots_after_existing() {
        let mut states = BTreeMap::new();
        states.insert(
            100,
            VmState {
                interfaces: vec![
                    ExistingInterface {
                        mac: "BC:24:11:AA:BB:CC".into(),
                        slot: "net0".into(),
                        bus_address: Some(0x12),
                        model: Some("virtio-net-pci".into()),
                    },
                    ExistingInterface {
                        mac: "BC:24:11:AA:BB:CD".into(),
                        slot: "net2".into(),
                        bus_address: None,
                        model: None,
                    },
                ],
                ..Default::default()
            },
        );
        let links = [link(100, 1, 102, 1), link(100, 2, 103, 1), link(104, 1, 100, 3)];
        let res = resolve(&Defaults::default(), &links, &states).unwrap();

        let plan = &res.vms[&100];
        assert_eq!(plan.first_new_slot, 3);
        let slots: Vec<_> = plan.nics.iter().map(|n| n.nic.slot_index().unwrap()).collect();
        assert_eq!(slots, vec![3, 4, 5]);
        let eths: Vec<_> = plan.nics.iter().map(|n| n.endpoint.eth).collect();
        assert_eq!(eths, vec![1, 2, 3]);
        let addrs: Vec<_> = plan.nics.iter().map(|n| n.nic.bus_address.unwrap()).collect();
        assert_eq!(addrs, vec![0x13, 0x14, 0x15]);
    }

    #[test]
    fn slot_overflow_is_an_error() {
        let mut states = BTreeMap::new();
        states.insert(
            100,
            VmState {
                interfaces: vec![ExistingInterface {
                    mac: "BC:24:11:AA:BB:CC".into(),
                    slot: "net4294967295".into(),
                    bus_address: None,
                    model: None,
                }],
                ..Default::default()
            },
        );
        let err = resolve(&Defaults::default(), &[link(100, 1, 102, 1)], &states).unwrap_err();
        assert!(matches!(
            err,
            LinkError::SlotSpaceExhausted {
                vmid: 100,
                highest: u32::MAX
            }
        ));
    }

    #[test]
    fn slot_at_u32_max_still_usable() {
        let mut states = BTreeMap::new();
        states.insert(
            100,
            VmState {
                interfaces: vec![ExistingInterface {
                    mac: "BC:24:11:AA:BB:CC".into(),
                    slot: "net4294967294".into(),
                    bus_address: None,
                    model: None,
                }],
                ..Default::default()
            },
        );
        let res = resolve(&Defaults::default(), &[link(100, 1, 102, 1)], &states).unwrap();
        assert_eq!(res.vms[&100].nics[0].nic.slot, "net4294967295");

        let err = resolve(
            &Defaults::default(),
            &[link(100, 1, 102, 1), link(100, 2, 102, 2)],
            &states,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::SlotSpaceExhausted { vmid: 100, .. }));
    }

    #[test]
    fn rerun_reuses_everything() {
        let defaults = Defaults::default();
        let links = [link(100, 1, 102, 1), link(100, 2, 103, 4), link(102, 2, 103, 5)];
        let first = resolve(&defaults, &links, &BTreeMap::new()).unwrap();
        let state = applied(&first, &defaults.model);
        let second = resolve(&defaults, &links, &state).unwrap();

        for (vmid, plan) in &second.vms {
            let before = &first.vms[vmid];
            for (a, b) in before.nics.iter().zip(&plan.nics) {
                assert!(b.nic.reused, "VM {vmid} {} not reused", b.nic.slot);
                assert_eq!(a.nic.slot, b.nic.slot);
                assert_eq!(a.nic.bus_address, b.nic.bus_address);
                assert_eq!(a.endpoint, b.endpoint);
            }
        }
    }

    #[test]
    fn rerun_with_new_link_appends() {
        let defaults = Defaults::default();
        let first = resolve(&defaults, &[link(100, 1, 102, 1)], &BTreeMap::new()).unwrap();
        let state = applied(&first, &defaults.model);
        let second = resolve(
            &defaults,
            &[link(100, 1, 102, 1), link(100, 2, 102, 2)],
            &state,
        )
        .unwrap();

        let nics = &second.vms[&100].nics;
        assert!(nics[0].nic.reused);
        assert_eq!(nics[0].nic.slot, "net0");
        assert!(!nics[1].nic.reused);
        assert_eq!(nics[1].nic.slot, "net1");
        assert_eq!(nics[1].nic.bus_address, Some(0x11));
    }

    #[test]
    fn auto_pci_addr_skips_allocation() {
        let mut defaults = Defaults::default();
        defaults.auto_pci_addr = true;
        let res = resolve(&defaults, &[link(100, 1, 102, 1)], &BTreeMap::new()).unwrap();
        assert_eq!(res.vms[&100].nics[0].nic.bus_address, None);
    }

    #[test]
    fn exhaustion_reports_vm_and_remediations() {
        let mut defaults = Defaults::default();
        defaults.pci_alloc_strategy = PciAllocStrategy::LowestFree;
        let mut states = BTreeMap::new();
        states.insert(
            102,
            VmState {
                occupied: (0x10..=0x1d).collect(),
                ..Default::default()
            },
        );
        let err = resolve(&defaults, &[link(100, 1, 102, 1)], &states).unwrap_err();
        assert!(matches!(err, LinkError::AddressSpaceExhausted { vmid: 102, .. }));
        assert_eq!(err.remediations().len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("auto_pci_addr"));
        assert!(msg.contains("free a PCI address"));
    }

    #[test]
    fn exhaustion_not_hit_when_reusing() {
        let defaults = Defaults::default();
        let mac = derive_mac(defaults.mac_prefix, 102, 1).unwrap();
        let mut states = BTreeMap::new();
        states.insert(
            102,
            VmState {
                interfaces: vec![ExistingInterface {
                    mac: mac.to_string(),
                    slot: "net4".into(),
                    bus_address: Some(0x1d),
                    model: Some(defaults.model.clone()),
                }],
                occupied: (0x10..=0x1c).collect(),
                ..Default::default()
            },
        );
        let res = resolve(&defaults, &[link(100, 1, 102, 1)], &states).unwrap();
        let nic = &res.vms[&102].nics[0].nic;
        assert!(nic.reused);
        assert_eq!(nic.slot, "net4");
        assert_eq!(nic.bus_address, Some(0x1d));
    }

    #[test]
    fn referenced_vms_sorted_unique() {
        let vms = referenced_vms(&[link(105, 1, 100, 1), link(100, 2, 103, 1)]);
        assert_eq!(vms.into_iter().collect::<Vec<_>>(), vec![100, 103, 105]);
    }
}
