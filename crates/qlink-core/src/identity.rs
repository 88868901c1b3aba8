//! Deterministic per-endpoint identifiers.
//!
//! MAC: 3-byte prefix (locally administered, unicast) + VMID (2 bytes) + eth (1 byte).
//!   bc:24:99 + vm 100 + eth1 → be:24:99:00:64:01
//!
//! UDP port: first digit of the base port, then VMID, then eth index, as text.
//!   base 40000 + vm 101 + eth2 → 41012
//!
//! The port scheme is meant to be computed by hand, so it is not a hash.

use qlink_types::{MacAddr, MacPrefix};

use crate::error::{LinkError, Result};

pub const MAX_PORT_VMID: u32 = 999;
pub const MAX_PORT_ETH: u32 = 9;

pub fn derive_mac(prefix: MacPrefix, vmid: u32, eth: u32) -> Result<MacAddr> {
    let vm = u16::try_from(vmid).map_err(|_| LinkError::InvalidIdentifier {
        vmid,
        eth,
        reason: "VMID does not fit in two MAC bytes (max 65535)",
    })?;
    let iface = u8::try_from(eth).map_err(|_| LinkError::InvalidIdentifier {
        vmid,
        eth,
        reason: "eth index does not fit in one MAC byte (max 255)",
    })?;

    let [b0, b1, b2] = prefix.0;
    let [hi, lo] = vm.to_be_bytes();
    Ok(MacAddr::from_bytes([(b0 | 0x02) & 0xfe, b1, b2, hi, lo, iface]))
}

/// Leading decimal digit of the base port.
pub fn port_prefix_digit(udp_port_base: u32) -> char {
    udp_port_base
        .to_string()
        .chars()
        .next()
        .unwrap_or('0')
}

pub fn derive_port(udp_port_base: u32, vmid: u32, eth: u32) -> Result<u16> {
    let text = format!("{}{vmid}{eth}", port_prefix_digit(udp_port_base));
    let port: u64 = text.parse().unwrap_or(u64::MAX);
    if vmid > MAX_PORT_VMID || eth > MAX_PORT_ETH {
        return Err(LinkError::PortRangeExceeded { vmid, eth, port });
    }
    u16::try_from(port).map_err(|_| LinkError::PortRangeExceeded { vmid, eth, port })
}
