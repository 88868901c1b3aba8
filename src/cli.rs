use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "qlink",
    about = "Deterministic UDP socket links between Proxmox VMs",
    version
)]
pub struct Cli {
    /// Log more (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Directory holding <vmid>.conf files
    #[arg(long, global = true, default_value = qlink_core::config::QEMU_SERVER_DIR)]
    pub conf_dir: PathBuf,
    /// Do not query `qm showcmd` for PCI addresses
    #[arg(long, global = true)]
    pub no_showcmd: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print one `qm set` command per VM
    Print {
        /// Link mapping file (YAML, or TOML by extension)
        mapping: PathBuf,
    },
    /// Show how every endpoint resolves
    Plan {
        /// Link mapping file (YAML, or TOML by extension)
        mapping: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run the `qm set` commands
    Apply {
        /// Link mapping file (YAML, or TOML by extension)
        mapping: PathBuf,
    },
}
