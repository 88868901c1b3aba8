use anyhow::Result;
use qlink_core::Resolution;
use qlink_types::NicReport;
use tabled::{Table, Tabled};

pub fn reports(resolution: &Resolution) -> Vec<NicReport> {
    resolution
        .vms
        .values()
        .flat_map(|plan| plan.nics.iter().map(move |p| (plan.vmid, p)))
        .map(|(vmid, p)| NicReport {
            vmid,
            slot: p.nic.slot.clone(),
            eth: p.endpoint.eth,
            peer_vmid: p.endpoint.peer_vmid,
            peer_eth: p.endpoint.peer_eth,
            mac: p.endpoint.mac,
            local: p.endpoint.local.to_string(),
            remote: p.endpoint.remote.to_string(),
            bus_address: p.nic.bus_address.map(|a| format!("0x{a:02x}")),
            reused: p.nic.reused,
        })
        .collect()
}

#[derive(Tabled)]
struct NicRow {
    vm: u32,
    slot: String,
    eth: String,
    peer: String,
    mac: String,
    local: String,
    remote: String,
    addr: String,
    status: String,
}

pub fn table(resolution: &Resolution) -> String {
    let rows: Vec<NicRow> = reports(resolution)
        .into_iter()
        .map(|r| NicRow {
            vm: r.vmid,
            slot: r.slot,
            eth: format!("eth{}", r.eth),
            peer: format!("{} eth{}", r.peer_vmid, r.peer_eth),
            mac: r.mac.to_string(),
            local: r.local,
            remote: r.remote,
            addr: r.bus_address.unwrap_or_else(|| "auto".into()),
            status: if r.reused { "reused" } else { "new" }.into(),
        })
        .collect();
    Table::new(rows).to_string()
}

pub fn json(resolution: &Resolution) -> Result<String> {
    Ok(serde_json::to_string_pretty(&reports(resolution))?)
}
