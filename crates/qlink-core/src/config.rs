use std::path::{Path, PathBuf};

pub const QEMU_SERVER_DIR: &str = "/etc/pve/qemu-server";

pub fn qemu_server_dir() -> PathBuf {
    PathBuf::from(QEMU_SERVER_DIR)
}

pub fn vm_conf_path(dir: &Path, vmid: u32) -> PathBuf {
    dir.join(format!("{vmid}.conf"))
}
