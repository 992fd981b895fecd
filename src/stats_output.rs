//! Renders the per-interval and summary lines, in either the human-readable
//! table or the `::`-prefixed CSV the `--show-perfdata` flag asks for.
//! Mirrors the `printf` calls in `release_children_and_wait()` and
//! `get_perfdata()` in `rds-stress.c`.

use crate::counters::{CounterSet, Metric};
use crate::options::Options;
use crate::procstat::CpuBreakdown;

pub fn print_table_header() {
    println!("{:>4} {:>6} {:>10} {:>10} {:>7} {:>8} {:>5}", "tsks", "tx/s", "tx+rx K/s", "rw+rr K/s", "tx us/c", "rtt us", "cpu %");
}

pub fn print_perfdata_header(opts: &Options) {
    print!("::nr_tasks:count,req_size:bytes,ack_size:bytes,rdma_size:bytes");
    print!(",req_sent:count,thruput:kB/s,thruput_rdma:kB/s,tx_delay:microseconds,rtt:microseconds,cpu:percent");
    print!(",user:percent,system:percent,idle:percent,irq:percent,intr:count");
    let _ = opts;
    println!();
}

/// One interval's scaled line. `scale` converts the interval's raw counter
/// deltas to a per-second rate (`1e6 / elapsed_usecs`).
pub struct IntervalLine {
    pub nr_running: u16,
    pub req_tx_per_sec: f64,
    pub throughput_kbps: f64,
    pub throughput_rdma_kbps: f64,
    pub tx_delay_usecs: f64,
    pub rtt_usecs: f64,
    pub cpu_pct: Option<f64>,
}

impl IntervalLine {
    pub fn from_delta(nr_running: u16, disp: &CounterSet, scale: f64, cpu_pct: Option<f64>) -> IntervalLine {
        IntervalLine {
            nr_running,
            req_tx_per_sec: scale * disp[Metric::ReqTxBytes].nr as f64,
            throughput_kbps: scale * disp.throughput() as f64 / 1024.0,
            throughput_rdma_kbps: scale * disp.throughput_rdma() as f64 / 1024.0,
            tx_delay_usecs: scale * disp[Metric::SendmsgUsecs].avg(),
            rtt_usecs: scale * disp[Metric::RttUsecs].avg(),
            cpu_pct,
        }
    }
}

pub fn print_table_row(line: &IntervalLine) {
    println!(
        "{:>4} {:>6.0} {:>10.2} {:>10.2} {:>7.2} {:>8.2} {:>5.2}",
        line.nr_running,
        line.req_tx_per_sec,
        line.throughput_kbps,
        line.throughput_rdma_kbps,
        line.tx_delay_usecs,
        line.rtt_usecs,
        line.cpu_pct.unwrap_or(-1.0),
    );
}

pub fn print_perfdata_row(opts: &Options, line: &IntervalLine, raw_req_count: u64, cpu: CpuBreakdown) {
    print!(
        "::{},{},{},{},",
        { opts.nr_tasks },
        { opts.req_size },
        { opts.ack_size },
        { opts.rdma_size }
    );
    print!(
        "{},{:.6},{:.6},{:.6},{:.6},{:.6}",
        raw_req_count,
        line.throughput_kbps,
        line.throughput_rdma_kbps,
        line.tx_delay_usecs,
        line.rtt_usecs,
        line.cpu_pct.unwrap_or(0.0),
    );
    println!(
        ",{:.6},{:.6},{:.6},{:.6},{}",
        cpu.user_pct, cpu.system_pct, cpu.idle_pct, cpu.irq_pct, cpu.intr_delta
    );
}

pub fn print_summary_divider() {
    println!("---------------------------------------------");
}

pub fn print_summary_line(nr_tasks: u16, line: &IntervalLine) {
    println!(
        "{:>4} {:>6.0} {:>10.2} {:>10.2} {:>7.2} {:>8.2} {:>5.2}  (average)",
        nr_tasks,
        line.req_tx_per_sec,
        line.throughput_kbps,
        line.throughput_rdma_kbps,
        line.tx_delay_usecs,
        line.rtt_usecs,
        line.cpu_pct.unwrap_or(-1.0),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_line_scales_raw_counters() {
        let mut disp = CounterSet::new();
        disp.inc(Metric::ReqTxBytes, 1000);
        disp.inc(Metric::RttUsecs, 200);

        let line = IntervalLine::from_delta(4, &disp, 2.0, Some(87.5));
        assert_eq!(line.req_tx_per_sec, 2.0);
        assert_eq!(line.rtt_usecs, 400.0);
        assert_eq!(line.cpu_pct, Some(87.5));
    }
}
