use std::net::SocketAddrV4;

use clap::Parser;

mod bootstrap;
mod child;
mod cli;
mod codec;
mod counters;
mod options;
mod engine;
mod parent;
mod procstat;
mod rdma;
mod shared_mem;
mod soak;
mod stats_output;
mod task;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let (opts, local) = cli.resolve()?;

    if options::Options::bool_flag(opts.tracing) {
        tracing_subscriber::fmt::init();
    }

    let soaks = if local.report_cpu {
        Some(soak::start_soakers()?)
    } else {
        None
    };

    let receive_ip = std::net::Ipv4Addr::from(opts.receive_addr);
    let listen_addr = SocketAddrV4::new(receive_ip, opts.starting_port);

    if local.is_active {
        let peer_ip = std::net::Ipv4Addr::from(opts.send_addr);
        let peer_addr = SocketAddrV4::new(peer_ip, opts.starting_port);
        parent::run_active(peer_addr, opts, local, soaks)?;
    } else {
        parent::run_passive(listen_addr, soaks)?;
    }

    Ok(())
}
