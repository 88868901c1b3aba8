mod cli;
mod config;
mod plan;

use anyhow::Result;
use clap::Parser;
use qlink_core::pve::{self, ProxmoxSource};
use qlink_core::{emit, resolve, state, Resolution, StateSource, VmState};
use qlink_types::MappingFile;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

/// Logs go to stderr; stdout carries commands, tables and JSON.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Everything needed for output, fully validated.
struct Prepared {
    mapping: MappingFile,
    states: BTreeMap<u32, VmState>,
    resolution: Resolution,
}

impl Prepared {
    fn commands(&self) -> Vec<emit::QmSet> {
        emit::render(&self.mapping.defaults, &self.resolution, &self.states)
    }
}

fn prepare(path: &Path, source: &dyn StateSource) -> Result<Prepared> {
    let mapping = config::load_mapping(path)?;
    let vms = resolve::referenced_vms(&mapping.links);
    info!(links = mapping.links.len(), vms = vms.len(), "loaded mapping");

    let states = state::read_all(source, vms)?;
    let resolution = resolve(&mapping.defaults, &mapping.links, &states)?;
    Ok(Prepared {
        mapping,
        states,
        resolution,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let source = ProxmoxSource {
        conf_dir: cli.conf_dir,
        showcmd: !cli.no_showcmd,
    };

    match cli.command {
        Command::Print { mapping } => {
            let p = prepare(&mapping, &source)?;
            let commands = p.commands();
            print!(
                "{}",
                emit::script(&p.mapping.defaults, &p.resolution, &commands)
            );
        }
        Command::Plan { mapping, json } => {
            let p = prepare(&mapping, &source)?;
            if json {
                println!("{}", plan::json(&p.resolution)?);
            } else {
                print!("{}", emit::summary(&p.mapping.defaults, &p.resolution));
                println!("{}", plan::table(&p.resolution));
            }
        }
        Command::Apply { mapping } => {
            let p = prepare(&mapping, &source)?;
            for cmd in p.commands() {
                println!("Updating VM {}...", cmd.vmid);
                pve::apply(&cmd)?;
            }
            println!("Updated {} VM(s)", p.resolution.vms.len());
        }
    }

    Ok(())
}
