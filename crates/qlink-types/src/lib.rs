use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

// --- Parse errors ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

// --- MAC addresses ---

/// A normalized 48-bit MAC address. Parsing is case-insensitive and
/// rendering is always lowercase, colon-delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub macaddr::MacAddr6);

impl MacAddr {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(macaddr::MacAddr6::from(bytes))
    }
}

impl std::ops::Deref for MacAddr {
    type Target = macaddr::MacAddr6;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Colon-delimited, two hex digits per byte; `-` and `.` forms are rejected.
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseError(format!("MAC address must have 6 bytes (got {s})")));
        }
        if parts.iter().any(|p| p.len() != 2) {
            return Err(ParseError(format!("malformed MAC address: {s}")));
        }
        s.parse::<macaddr::MacAddr6>()
            .map(Self)
            .map_err(|e| ParseError(format!("invalid MAC address {s}: {e}")))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0.into_array();
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// The three leading bytes shared by every generated MAC, as written in the
/// mapping file (e.g. `bc:24:99`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacPrefix(pub [u8; 3]);

impl FromStr for MacPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(ParseError(format!("mac_prefix must have 3 bytes (got {s})")));
        }
        let mut bytes = [0u8; 3];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseError(format!("mac_prefix byte out of range: {s}")));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError(format!("mac_prefix contains non-hex bytes: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}")
    }
}

impl TryFrom<String> for MacPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacPrefix> for String {
    fn from(prefix: MacPrefix) -> Self {
        prefix.to_string()
    }
}

// --- Links ---

/// Accept `3`, `"3"`, `"eth3"` or `"ETH3"`.
pub fn parse_eth_index(token: &str) -> Result<u32, ParseError> {
    let t = token.trim();
    let digits = match t.get(..3) {
        Some(head) if head.eq_ignore_ascii_case("eth") => &t[3..],
        _ => t,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError(format!("invalid eth index: {token}")));
    }
    digits
        .parse()
        .map_err(|_| ParseError(format!("invalid eth index: {token}")))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LinkToken {
    Int(u64),
    Str(String),
}

impl LinkToken {
    fn vmid(&self) -> Result<u32, ParseError> {
        match self {
            Self::Int(n) => u32::try_from(*n).map_err(|_| ParseError(format!("invalid VM id: {n}"))),
            Self::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| ParseError(format!("invalid VM id: {s}"))),
        }
    }

    fn eth(&self) -> Result<u32, ParseError> {
        match self {
            Self::Int(n) => {
                u32::try_from(*n).map_err(|_| ParseError(format!("invalid eth index: {n}")))
            }
            Self::Str(s) => parse_eth_index(s),
        }
    }
}

/// One declared connection `[vmA, ethA, vmB, ethB]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LinkToken>", into = "[u32; 4]")]
pub struct LinkSpec {
    pub vm_a: u32,
    pub eth_a: u32,
    pub vm_b: u32,
    pub eth_b: u32,
}

impl LinkSpec {
    pub fn new(vm_a: u32, eth_a: u32, vm_b: u32, eth_b: u32) -> Self {
        Self {
            vm_a,
            eth_a,
            vm_b,
            eth_b,
        }
    }
}

impl TryFrom<Vec<LinkToken>> for LinkSpec {
    type Error = ParseError;

    fn try_from(tokens: Vec<LinkToken>) -> Result<Self, Self::Error> {
        let [a, ai, b, bi] = tokens.as_slice() else {
            return Err(ParseError(format!(
                "each link must be [vmA, ethA|A, vmB, ethB|B], got {} elements",
                tokens.len()
            )));
        };
        Ok(Self {
            vm_a: a.vmid()?,
            eth_a: ai.eth()?,
            vm_b: b.vmid()?,
            eth_b: bi.eth()?,
        })
    }
}

impl From<LinkSpec> for [u32; 4] {
    fn from(l: LinkSpec) -> Self {
        [l.vm_a, l.eth_a, l.vm_b, l.eth_b]
    }
}

// --- Defaults ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PciAllocStrategy {
    LowestFree,
    #[default]
    NextHighest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_model")]
    pub model: String,
    /// 0 omits `host_mtu` from the device fragment.
    #[serde(default = "default_host_mtu")]
    pub host_mtu: u32,
    #[serde(default = "default_rx_queue_size")]
    pub rx_queue_size: u32,
    #[serde(default = "default_tx_queue_size")]
    pub tx_queue_size: u32,
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: MacPrefix,
    #[serde(default = "default_udp_port_base")]
    pub udp_port_base: u32,
    /// IPv4 only: QEMU's `-netdev socket` takes no IPv6 `udp=`/`localaddr=`.
    #[serde(default, deserialize_with = "deserialize_ip_map")]
    pub udp_ip_by_vm: BTreeMap<u32, Ipv4Addr>,
    #[serde(default = "default_udp_ip")]
    pub udp_default_ip: Ipv4Addr,
    #[serde(default = "default_true")]
    pub loopback_if_same_host: bool,
    #[serde(default)]
    pub auto_pci_addr: bool,
    #[serde(default)]
    pub pci_alloc_strategy: PciAllocStrategy,
}

fn default_model() -> String {
    "virtio-net-pci".to_string()
}
fn default_host_mtu() -> u32 {
    9300
}
fn default_rx_queue_size() -> u32 {
    1024
}
fn default_tx_queue_size() -> u32 {
    256
}
fn default_mac_prefix() -> MacPrefix {
    MacPrefix([0xbc, 0x24, 0x99])
}
fn default_udp_port_base() -> u32 {
    40000
}
fn default_udp_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}
fn default_true() -> bool {
    true
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            host_mtu: default_host_mtu(),
            rx_queue_size: default_rx_queue_size(),
            tx_queue_size: default_tx_queue_size(),
            mac_prefix: default_mac_prefix(),
            udp_port_base: default_udp_port_base(),
            udp_ip_by_vm: BTreeMap::new(),
            udp_default_ip: default_udp_ip(),
            loopback_if_same_host: true,
            auto_pci_addr: false,
            pci_alloc_strategy: PciAllocStrategy::default(),
        }
    }
}

impl Defaults {
    /// Host address for a VM: per-VM override, else the default.
    pub fn ip_for(&self, vmid: u32) -> Ipv4Addr {
        self.udp_ip_by_vm
            .get(&vmid)
            .copied()
            .unwrap_or(self.udp_default_ip)
    }
}

/// TOML only has string keys, YAML gives integers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(untagged)]
enum VmKey {
    Int(u32),
    Str(String),
}

fn deserialize_ip_map<'de, D>(deserializer: D) -> Result<BTreeMap<u32, Ipv4Addr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<VmKey, Ipv4Addr>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, ip)| match k {
            VmKey::Int(n) => Ok((n, ip)),
            VmKey::Str(s) => s
                .trim()
                .parse::<u32>()
                .map(|n| (n, ip))
                .map_err(|_| serde::de::Error::custom(format!("invalid VM id key: {s}"))),
        })
        .collect()
}

/// Top-level mapping file: `defaults` plus the ordered `links` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

// --- Existing hypervisor state ---

/// A NIC already present in a VM's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingInterface {
    pub mac: String,
    /// Interface slot name, e.g. `net3`.
    pub slot: String,
    #[serde(default)]
    pub bus_address: Option<u8>,
    #[serde(default)]
    pub model: Option<String>,
}

// --- Report types ---

/// One resolved NIC as shown by `qlink plan --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicReport {
    pub vmid: u32,
    pub slot: String,
    pub eth: u32,
    pub peer_vmid: u32,
    pub peer_eth: u32,
    pub mac: MacAddr,
    pub local: String,
    pub remote: String,
    pub bus_address: Option<String>,
    pub reused: bool,
}
