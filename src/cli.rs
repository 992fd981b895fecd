//! Command-line surface, mirroring `rds-stress`'s `getopt_long` table.
//! `Cli::resolve` applies the same defaulting and validation the original
//! did inline in `main()`, then splits the result into the [`Options`] that
//! get shipped to the peer and the [`LocalConfig`] that never leaves this
//! process.

use std::net::Ipv4Addr;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;

use crate::options::{Options, MIN_MSG_BYTES};

const DEFAULT_RDMA_ALIGNMENT: u32 = 4096;

#[derive(Parser, Debug)]
#[command(about = "Reliable connectionless datagram transport load generator", disable_version_flag = true)]
pub struct Cli {
    /// Size of each request message, in bytes.
    #[arg(short = 'q', long = "req-bytes", default_value_t = 1024)]
    pub req_size: u32,

    /// Size of each ack message, in bytes. Defaults to the wire minimum.
    #[arg(short = 'a', long = "ack-bytes")]
    pub ack_size: Option<u32>,

    /// Size of the remote-memory payload attached to each task, in bytes.
    /// Zero disables remote-memory operations entirely.
    #[arg(short = 'D', long = "rdma-bytes", default_value_t = 0)]
    pub rdma_size: u32,

    /// Number of concurrent tasks per destination.
    #[arg(short = 't', long = "tasks")]
    pub nr_tasks: Option<u16>,

    /// Number of requests kept in flight per task.
    #[arg(short = 'd', long = "depth")]
    pub req_depth: Option<u32>,

    /// Address this process receives on.
    #[arg(short = 'r', long = "recv-addr")]
    pub receive_addr: String,

    /// Address of the peer to send to. Omit to run as the passive side,
    /// which receives its run parameters from the active peer instead.
    #[arg(short = 's', long = "send-addr")]
    pub send_addr: Option<String>,

    /// Bootstrap TCP port (and base UDP port).
    #[arg(short = 'p', long = "port")]
    pub starting_port: u16,

    /// Run time in seconds. Zero runs until interrupted.
    #[arg(short = 'T', long = "time", default_value_t = 0)]
    pub run_time: u32,

    /// Fork a CPU soaker per core and report utilization alongside
    /// throughput.
    #[arg(short = 'c', long = "report-cpu")]
    pub report_cpu: bool,

    /// Print only the final summary line, skipping the per-interval table.
    #[arg(short = 'z', long = "report-summary")]
    pub summary_only: bool,

    /// Run children at real-time scheduling priority.
    #[arg(short = 'R', long = "rtprio")]
    pub rtprio: bool,

    /// Fill and check every message against the deterministic pattern.
    #[arg(short = 'v', long = "verify")]
    pub verify: bool,

    /// Enable verbose tracing of the send/receive state machine.
    #[arg(short = 'V', long = "trace")]
    pub tracing: bool,

    /// Recycle each remote-memory key after a single use.
    #[arg(long = "rdma-use-once", default_value_t = 1)]
    pub rdma_use_once: u8,

    /// Request a fresh memory registration per operation rather than
    /// reusing one for the task's lifetime.
    #[arg(long = "rdma-use-get-mr", default_value_t = 0)]
    pub rdma_use_get_mr: u8,

    /// Byte alignment applied to the remote-memory region. Defaults to the
    /// system page size.
    #[arg(long = "rdma-alignment")]
    pub rdma_alignment: Option<u32>,

    /// Print the negotiated parameters before the run starts.
    #[arg(long = "show-params")]
    pub show_params: bool,

    /// Emit machine-readable `::`-prefixed CSV sample lines instead of the
    /// human-readable table.
    #[arg(long = "show-perfdata")]
    pub show_perfdata: bool,

    /// Bounded retry count for the bootstrap TCP connect.
    #[arg(long = "connect-retries", default_value_t = 0)]
    pub connect_retries: u32,

    /// Honor the receiver's congestion-update backpressure signal.
    #[arg(long = "use-cong-monitor", default_value_t = 1)]
    pub use_cong_monitor: u8,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid address {addr:?}: {source}")]
    BadAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("{desc} of {size} bytes is too small, need at least {min} ({flag})")]
    TooSmall { desc: &'static str, size: u32, min: u32, flag: &'static str },
}

/// Parameters that stay local to this process: they shape behavior here but
/// are never part of the peer-negotiated [`Options`].
#[derive(Debug, Clone, Copy)]
pub struct LocalConfig {
    pub report_cpu: bool,
    pub is_active: bool,
}

fn parse_addr(s: &str) -> Result<u32, CliError> {
    Ipv4Addr::from_str(s)
        .map(u32::from)
        .map_err(|source| CliError::BadAddress { addr: s.to_string(), source })
}

fn check_size(size: u32, min: u32, desc: &'static str, flag: &'static str) -> Result<(), CliError> {
    if size < min {
        return Err(CliError::TooSmall { desc, size, min, flag });
    }
    Ok(())
}

impl Cli {
    /// Applies the original's post-parse defaulting (`ack_size`,
    /// `req_depth`, `nr_tasks`, `rdma_alignment`) and, for the active side,
    /// its size validation and RDMA page-alignment rounding.
    pub fn resolve(self) -> Result<(Options, LocalConfig), CliError> {
        let receive_addr = parse_addr(&self.receive_addr)?;
        let is_active = self.send_addr.is_some();
        let send_addr = match &self.send_addr {
            Some(s) => parse_addr(s)?,
            None => 0,
        };

        let ack_size = self.ack_size.unwrap_or(MIN_MSG_BYTES);
        let req_depth = self.req_depth.unwrap_or(1);
        let nr_tasks = self.nr_tasks.unwrap_or(1);
        let rdma_alignment = self.rdma_alignment.unwrap_or(DEFAULT_RDMA_ALIGNMENT);

        if is_active {
            check_size(ack_size, MIN_MSG_BYTES, "ack size", "-a")?;
            check_size(self.req_size, MIN_MSG_BYTES, "req size", "-q")?;
        }

        let rdma_size = if self.rdma_size != 0 {
            (self.rdma_size + (rdma_alignment - 1)) & !(rdma_alignment - 1)
        } else {
            0
        };

        let opts = Options {
            req_depth,
            req_size: self.req_size,
            ack_size,
            rdma_size,
            send_addr,
            receive_addr,
            starting_port: self.starting_port,
            nr_tasks,
            run_time: self.run_time,
            summary_only: self.summary_only as u8,
            rtprio: self.rtprio as u8,
            tracing: self.tracing as u8,
            verify: self.verify as u8,
            show_params: self.show_params as u8,
            show_perfdata: self.show_perfdata as u8,
            use_cong_monitor: self.use_cong_monitor,
            rdma_use_once: self.rdma_use_once,
            rdma_use_get_mr: self.rdma_use_get_mr,
            rdma_alignment,
            connect_retries: self.connect_retries,
            suppress_warnings: 0,
        };

        Ok((opts, LocalConfig { report_cpu: self.report_cpu, is_active }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut v = vec!["rds-stress"];
        v.extend_from_slice(args);
        Cli::parse_from(v)
    }

    #[test]
    fn defaults_match_original() {
        let (opts, local) = cli(&["-r", "127.0.0.1", "-p", "4000"]).resolve().unwrap();
        assert_eq!({ opts.ack_size }, MIN_MSG_BYTES);
        assert_eq!({ opts.req_size }, 1024);
        assert_eq!({ opts.req_depth }, 1);
        assert_eq!({ opts.nr_tasks }, 1);
        assert_eq!({ opts.rdma_alignment }, DEFAULT_RDMA_ALIGNMENT);
        assert!(!local.is_active);
    }

    #[test]
    fn rdma_size_rounds_up_to_alignment() {
        let (opts, _) = cli(&["-r", "127.0.0.1", "-s", "127.0.0.1", "-p", "4000", "-D", "100"])
            .resolve()
            .unwrap();
        assert_eq!({ opts.rdma_size }, 4096);
    }

    #[test]
    fn active_side_rejects_undersized_ack() {
        let err = cli(&["-r", "127.0.0.1", "-s", "127.0.0.1", "-p", "4000", "-a", "1"]).resolve();
        assert!(matches!(err, Err(CliError::TooSmall { .. })));
    }

    #[test]
    fn passive_side_skips_size_validation() {
        let (_, local) = cli(&["-r", "127.0.0.1", "-p", "4000", "-a", "1"]).resolve().unwrap();
        assert!(!local.is_active);
    }
}
