//! Rendering of resolved interfaces into `qm set <vmid> --args "..."`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use qlink_types::Defaults;

use crate::alloc::PCI_BUS;
use crate::identity::port_prefix_digit;
use crate::resolve::{PlannedNic, Resolution, VmPlan};
use crate::state::VmState;

pub const QM_BIN: &str = "qm";

/// One `qm set` invocation replacing a VM's `args:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmSet {
    pub vmid: u32,
    pub fragments: Vec<String>,
}

impl QmSet {
    pub fn args_value(&self) -> String {
        self.fragments.join(" ")
    }

    /// Arguments for spawning `qm` directly, no shell involved.
    pub fn argv(&self) -> Vec<String> {
        vec![
            "set".to_string(),
            self.vmid.to_string(),
            "--args".to_string(),
            self.args_value(),
        ]
    }
}

/// Escape for use inside a double-quoted shell word.
fn dquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for QmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{QM_BIN} set {} --args {}", self.vmid, dquote(&self.args_value()))
    }
}

pub fn netdev_fragment(p: &PlannedNic) -> String {
    format!(
        "-netdev socket,id={slot},udp={remote},localaddr={local}",
        slot = p.nic.slot,
        remote = p.endpoint.remote,
        local = p.endpoint.local,
    )
}

pub fn device_fragment(defaults: &Defaults, p: &PlannedNic) -> String {
    let mut s = format!(
        "-device {model},mac={mac},rx_queue_size={rx},tx_queue_size={tx},netdev={slot},id={slot}",
        model = defaults.model,
        mac = p.endpoint.mac,
        rx = defaults.rx_queue_size,
        tx = defaults.tx_queue_size,
        slot = p.nic.slot,
    );
    if let Some(addr) = p.nic.bus_address {
        s.push_str(&format!(",bus={PCI_BUS},addr=0x{addr:x}"));
    }
    if defaults.host_mtu > 0 {
        s.push_str(&format!(",host_mtu={}", defaults.host_mtu));
    }
    s
}

/// `id=` of a `-netdev`/`-device` fragment.
fn fragment_id(fragment: &str) -> Option<&str> {
    let (flag, value) = fragment.split_once(' ')?;
    if flag != "-netdev" && flag != "-device" {
        return None;
    }
    value.split(',').find_map(|kv| kv.strip_prefix("id="))
}

/// Existing args are kept, minus fragments for slots being (re-)emitted.
pub fn render_vm(defaults: &Defaults, plan: &VmPlan, existing_args: &[String]) -> QmSet {
    let slots: HashSet<&str> = plan.nics.iter().map(|p| p.nic.slot.as_str()).collect();
    let mut fragments: Vec<String> = existing_args
        .iter()
        .filter(|f| !fragment_id(f).is_some_and(|id| slots.contains(id)))
        .cloned()
        .collect();
    for p in &plan.nics {
        fragments.push(netdev_fragment(p));
        fragments.push(device_fragment(defaults, p));
    }
    QmSet {
        vmid: plan.vmid,
        fragments,
    }
}

/// One command per VM, sorted by VM id.
pub fn render(
    defaults: &Defaults,
    resolution: &Resolution,
    states: &BTreeMap<u32, VmState>,
) -> Vec<QmSet> {
    resolution
        .vms
        .values()
        .map(|plan| {
            let args = states
                .get(&plan.vmid)
                .map(|s| s.args.as_slice())
                .unwrap_or_default();
            render_vm(defaults, plan, args)
        })
        .collect()
}

/// Comment header listing ports and starting slots.
pub fn summary(defaults: &Defaults, resolution: &Resolution) -> String {
    let mut out = String::new();
    if !resolution.ports.is_empty() {
        let ports = resolution
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "# UDP ports used: {ports} (formula: {} + VMID + ethIndex)\n",
            port_prefix_digit(defaults.udp_port_base)
        ));
    }
    out.push_str("# Existing netN count per VM respected (starting indices):\n");
    for plan in resolution.vms.values() {
        out.push_str(&format!(
            "#   VM {}: starting at net{}\n",
            plan.vmid, plan.first_new_slot
        ));
    }
    out
}

/// Full printable output: summary, then one commented command per VM.
pub fn script(defaults: &Defaults, resolution: &Resolution, commands: &[QmSet]) -> String {
    let mut out = summary(defaults, resolution);
    out.push('\n');
    for cmd in commands {
        out.push_str(&format!("# VM {}\n{cmd}\n\n", cmd.vmid));
    }
    out
}
