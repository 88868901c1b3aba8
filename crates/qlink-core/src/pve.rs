//! Proxmox VE state reader and `qm` invocation.
//!
//! Existing interfaces come from `/etc/pve/qemu-server/<vmid>.conf` (native
//! `netN:` lines and `-device` entries in the `args:` line). `qm showcmd`
//! fills in the PCI addresses the conf file does not record and reports
//! which other devices already sit on the bus.

use anyhow::{bail, Context, Result};
use qlink_types::ExistingInterface;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

use crate::alloc::{native_hostpci_addr, native_nic_addr, PCI_BUS};
use crate::config;
use crate::emit::{QmSet, QM_BIN};
use crate::scan::slot_index;
use crate::state::{StateSource, VmState};

/// Split a command line the way a POSIX shell would (quotes and backslashes).
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    cur.push(q);
                }
            }
            '"' => {
                in_token = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(n) = chars.next() {
                                cur.push(n);
                            }
                        }
                        _ => cur.push(q),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            _ => {
                in_token = true;
                cur.push(c);
            }
        }
    }
    if in_token {
        tokens.push(cur);
    }
    tokens
}

/// Pair each `-flag` with its value: `["-device", "x"]` → `["-device x"]`.
pub fn group_fragments(tokens: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = tokens.iter().peekable();
    while let Some(tok) = iter.next() {
        match iter.peek() {
            Some(next) if tok.starts_with('-') && !next.starts_with('-') => {
                out.push(format!("{tok} {next}"));
                iter.next();
            }
            _ => out.push(tok.clone()),
        }
    }
    out
}

/// A parsed `-device` value: `model,key=value,...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub model: String,
    pub id: Option<String>,
    pub netdev: Option<String>,
    pub mac: Option<String>,
    pub bus: Option<String>,
    pub addr: Option<u8>,
}

impl Device {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(',');
        let mut dev = Device {
            model: parts.next().unwrap_or_default().to_string(),
            ..Default::default()
        };
        for kv in parts {
            let Some((k, v)) = kv.split_once('=') else {
                continue;
            };
            match k {
                "id" => dev.id = Some(v.to_string()),
                "netdev" => dev.netdev = Some(v.to_string()),
                "mac" => dev.mac = Some(v.to_string()),
                "bus" => dev.bus = Some(v.to_string()),
                "addr" => dev.addr = parse_pci_addr(v),
                _ => {}
            }
        }
        dev
    }

    /// Address on the bus new interfaces go to.
    pub fn bus_address(&self) -> Option<u8> {
        if self.bus.as_deref() == Some(PCI_BUS) {
            self.addr
        } else {
            None
        }
    }

    pub fn is_nic(&self) -> bool {
        self.netdev.is_some()
    }

    fn slot(&self) -> Option<&str> {
        self.id.as_deref().or(self.netdev.as_deref())
    }

    fn to_interface(&self) -> Option<ExistingInterface> {
        Some(ExistingInterface {
            mac: self.mac.clone()?,
            slot: self.slot()?.to_string(),
            bus_address: self.bus_address(),
            model: Some(self.model.clone()),
        })
    }
}

/// `0x12`, `0x12.0` (slot.function) or `12` → 0x12.
pub fn parse_pci_addr(v: &str) -> Option<u8> {
    let v = v.trim();
    let hex = v.strip_prefix("0x").unwrap_or(v);
    let slot = hex.split('.').next().unwrap_or(hex);
    u8::from_str_radix(slot, 16).ok()
}

fn device_fragments(fragments: &[String]) -> impl Iterator<Item = Device> + '_ {
    fragments
        .iter()
        .filter_map(|f| f.strip_prefix("-device "))
        .map(Device::parse)
}

/// Proxmox NIC model names are QEMU device names, except virtio.
fn qemu_model(pve_model: &str) -> String {
    match pve_model {
        "virtio" => "virtio-net-pci".to_string(),
        other => other.to_string(),
    }
}

/// `virtio=BC:24:11:AA:BB:CC,bridge=vmbr0,firewall=1`
fn parse_net_line(slot: &str, value: &str) -> Option<ExistingInterface> {
    let mut model = None;
    let mut mac = None;
    for kv in value.split(',') {
        let Some((k, v)) = kv.split_once('=') else {
            continue;
        };
        match k {
            "macaddr" => mac = Some(v.to_string()),
            "model" => model = Some(qemu_model(v)),
            "bridge" | "firewall" | "tag" | "trunks" | "rate" | "queues" | "mtu" | "link_down" => {}
            _ if model.is_none() => {
                model = Some(qemu_model(k));
                mac = Some(v.to_string());
            }
            _ => {}
        }
    }
    Some(ExistingInterface {
        mac: mac?,
        slot: slot.to_string(),
        bus_address: None,
        model,
    })
}

/// Interfaces and args from a VM conf file. Snapshot sections are ignored.
///
/// Native NICs and legacy passthroughs carry Proxmox's fixed `pci.0`
/// addresses, so allocation stays clear of them without `qm showcmd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfEntries {
    pub interfaces: Vec<ExistingInterface>,
    pub occupied: BTreeSet<u8>,
    pub args: Vec<String>,
}

pub fn parse_conf(text: &str) -> ConfEntries {
    let mut out = ConfEntries::default();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            break;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key == "args" {
            out.args = group_fragments(&tokenize(value));
        } else if key.starts_with("net") && slot_index(key).is_some() {
            let fixed = slot_index(key).and_then(native_nic_addr);
            match parse_net_line(key, value) {
                Some(iface) => out.interfaces.push(ExistingInterface {
                    bus_address: fixed,
                    ..iface
                }),
                None => {
                    warn!(slot = key, "no MAC address in conf entry");
                    out.occupied.extend(fixed);
                }
            }
        } else if key.starts_with("hostpci") && !value.split(',').any(|kv| kv == "pcie=1") {
            out.occupied
                .extend(slot_index(key).and_then(native_hostpci_addr));
        }
    }
    let from_args: Vec<_> = device_fragments(&out.args)
        .filter(Device::is_nic)
        .filter_map(|d| d.to_interface())
        .collect();
    out.interfaces.extend(from_args);
    out
}

/// Fold `qm showcmd` output into state read from the conf file.
pub fn merge_showcmd(state: &mut VmState, showcmd: &str) {
    let fragments = group_fragments(&tokenize(showcmd));
    for dev in device_fragments(&fragments) {
        let Some(addr) = dev.bus_address() else {
            continue;
        };
        if !dev.is_nic() {
            state.occupied.insert(addr);
            continue;
        }
        let Some(slot) = dev.slot() else {
            state.occupied.insert(addr);
            continue;
        };
        match state.interfaces.iter_mut().find(|i| i.slot == slot) {
            Some(iface) => {
                iface.bus_address = Some(addr);
                iface.model = Some(dev.model.clone());
            }
            None => match dev.to_interface() {
                Some(iface) => state.interfaces.push(iface),
                None => {
                    state.occupied.insert(addr);
                }
            },
        }
    }
}

fn run_qm(args: &[&str]) -> Result<String> {
    let output = Command::new(QM_BIN)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {QM_BIN}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{QM_BIN} {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run one `qm set` command.
pub fn apply(cmd: &QmSet) -> Result<()> {
    let argv = cmd.argv();
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    run_qm(&args).with_context(|| format!("failed to update VM {}", cmd.vmid))?;
    Ok(())
}

/// Reads VM state from the local Proxmox node.
#[derive(Debug, Clone)]
pub struct ProxmoxSource {
    pub conf_dir: PathBuf,
    /// Also query `qm showcmd` for bus addresses.
    pub showcmd: bool,
}

impl Default for ProxmoxSource {
    fn default() -> Self {
        Self {
            conf_dir: config::qemu_server_dir(),
            showcmd: true,
        }
    }
}

impl StateSource for ProxmoxSource {
    fn read(&self, vmid: u32) -> Result<VmState> {
        let path = config::vm_conf_path(&self.conf_dir, vmid);
        let conf = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_conf(&text)
        } else {
            warn!(vmid, path = %path.display(), "VM config not found, assuming no interfaces");
            ConfEntries::default()
        };

        let mut state = VmState {
            interfaces: conf.interfaces,
            occupied: conf.occupied,
            args: conf.args,
        };

        if self.showcmd {
            match run_qm(&["showcmd", &vmid.to_string()]) {
                Ok(out) => merge_showcmd(&mut state, &out),
                Err(e) => warn!(vmid, "qm showcmd unavailable, using conf file only: {e:#}"),
            }
        }

        debug!(
            vmid,
            interfaces = state.interfaces.len(),
            occupied = state.occupied.len(),
            args = state.args.len(),
            "read VM state"
        );
        Ok(state)
    }
}
