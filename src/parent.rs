//! The parent process: forks the per-destination children, waits for them
//! to come up, runs the burn-in/sampling loop, and prints the summary.
//! Mirrors `start_children`, `release_children_and_wait`, `active_parent`,
//! and `passive_parent` in `rds-stress.c`.

use std::net::SocketAddrV4;
use std::thread;
use std::time::{Duration, SystemTime};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use crate::bootstrap::{self, BootstrapError};
use crate::cli::LocalConfig;
use crate::counters::CounterSet;
use crate::options::Options;
use crate::procstat;
use crate::shared_mem::{ChildControl, SharedArray, WireTime};
use crate::soak::{self, SoakControl};
use crate::stats_output::{self, IntervalLine};

/// Forks `opts.nr_tasks` children sharing a mmap'd [`ChildControl`] array,
/// then blocks until every one has signalled ready (or dies trying).
/// Mirrors `start_children`.
pub fn start_children(opts: &Options) -> nix::Result<SharedArray<ChildControl>> {
    let mut ctl: SharedArray<ChildControl> = SharedArray::new(opts.nr_tasks as usize)?;
    let parent = getpid();

    for i in 0..opts.nr_tasks {
        // Safety: no other threads have been spawned in this process yet.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let mut child_opts = *opts;
                child_opts.suppress_warnings = (i > 0) as u8;
                crate::child::run_child(parent, &mut ctl[i as usize], &child_opts, i);
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                ctl[i as usize].pid = child.as_raw();
            }
        }
    }

    for i in 0..opts.nr_tasks as usize {
        while !ctl[i].is_ready() {
            if let Ok(WaitStatus::Exited(pid, status)) = waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                panic!("child {i} (pid {pid}) exited with status {status} before becoming ready");
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    Ok(ctl)
}

fn reap_one_child(block: bool) -> Option<Pid> {
    let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };
    match waitpid(None, flags) {
        Ok(WaitStatus::Exited(pid, 0)) => Some(pid),
        Ok(WaitStatus::Exited(pid, status)) => panic!("child pid {pid} exited with status {status}"),
        Ok(WaitStatus::Signaled(pid, Signal::SIGTERM, _)) => Some(pid),
        Ok(WaitStatus::Signaled(pid, sig, _)) => panic!("child pid {pid} exited with signal {sig}"),
        Ok(WaitStatus::StillAlive) => None,
        Ok(other) => panic!("unexpected wait status {other:?}"),
        Err(nix::errno::Errno::ECHILD) => None,
        Err(e) => panic!("waitpid failed: {e}"),
    }
}

fn set_rt_priority() {
    let param = libc::sched_param { sched_priority: 1 };
    // Safety: plain syscall wrapper, no aliasing concerns.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc < 0 {
        tracing::warn!("sched_setscheduler(SCHED_RR) failed: {}", std::io::Error::last_os_error());
    }
}

fn snapshot(ctl: &mut SharedArray<ChildControl>) -> CounterSet {
    let mut disp = CounterSet::new();
    for child in ctl.iter_mut() {
        let delta = CounterSet::snapshot(child.cur, &mut child.last);
        CounterSet::accumulate(&mut disp, &delta);
    }
    disp
}

fn total(ctl: &SharedArray<ChildControl>) -> CounterSet {
    CounterSet::total(ctl.iter().map(|c| &c.cur))
}

/// Runs the full post-negotiation lifecycle: burn-in, per-interval
/// reporting, and the final summary line. Mirrors
/// `release_children_and_wait`.
pub fn release_children_and_wait(opts: &Options, ctl: &mut SharedArray<ChildControl>, soaks: &mut Option<SharedArray<SoakControl>>) {
    let start = WireTime::from(SystemTime::now() + Duration::from_secs(2));
    for child in ctl.iter_mut() {
        child.start = start;
    }

    print!("Starting up");
    for _ in 0..4 {
        thread::sleep(Duration::from_secs(1));
        snapshot(ctl);
        if let Some(soaks) = soaks.as_mut() {
            soak::cpu_use(soaks);
        }
        print!(".");
    }
    println!();

    let first_ts = SystemTime::now();
    let end = (opts.run_time != 0).then(|| first_ts + Duration::from_secs(opts.run_time as u64));

    let mut nr_running = opts.nr_tasks;
    let mut summary = CounterSet::new();
    let mut cpu_total = 0.0;

    if Options::bool_flag(opts.rtprio) {
        set_rt_priority();
    }

    let mut prev_stats = procstat::read_stats().unwrap_or_default();

    if Options::bool_flag(opts.show_perfdata) {
        stats_output::print_perfdata_header(opts);
    } else {
        stats_output::print_table_header();
    }

    let mut last_ts = first_ts;
    while nr_running > 0 {
        thread::sleep(Duration::from_secs(1));

        let disp = snapshot(ctl);
        let now = SystemTime::now();
        let cpu_pct = soaks.as_mut().and_then(soak::cpu_use);

        if !Options::bool_flag(opts.summary_only) {
            let elapsed_usecs = now.duration_since(last_ts).unwrap_or_default().as_micros().max(1) as f64;
            let scale = 1e6 / elapsed_usecs;
            let line = IntervalLine::from_delta(nr_running, &disp, scale, cpu_pct);

            if !Options::bool_flag(opts.show_perfdata) {
                stats_output::print_table_row(&line);
            } else {
                let current_stats = procstat::read_stats().unwrap_or_default();
                let breakdown = procstat::delta(prev_stats, current_stats);
                prev_stats = current_stats;
                stats_output::print_perfdata_row(opts, &line, disp[crate::counters::Metric::ReqTxBytes].nr, breakdown);
            }
        }

        CounterSet::accumulate(&mut summary, &disp);
        if let Some(cpu_pct) = cpu_pct {
            cpu_total += cpu_pct;
        }
        last_ts = now;

        if let Some(end) = end {
            if now >= end {
                for child in ctl.iter() {
                    let _ = kill(Pid::from_raw(child.pid), Signal::SIGTERM);
                }
                if let Some(soaks) = soaks.as_ref() {
                    soak::stop_soakers(soaks);
                }
                break;
            }
        }

        if reap_one_child(false).is_some() {
            nr_running -= 1;
        }
    }

    while nr_running > 0 && reap_one_child(true).is_some() {
        nr_running -= 1;
    }

    let _ = total(ctl);
    if !Options::bool_flag(opts.summary_only) {
        stats_output::print_summary_divider();
    }
    let elapsed_usecs = last_ts.duration_since(first_ts).unwrap_or(Duration::from_micros(1)).as_micros().max(1) as f64;
    let scale = 1e6 / elapsed_usecs;
    let cpu_pct = soaks.as_ref().map(|_| scale * cpu_total);
    let summary_line = IntervalLine::from_delta(opts.nr_tasks, &summary, scale, cpu_pct);
    stats_output::print_summary_line(opts.nr_tasks, &summary_line);
}

/// The active side: connects out, sends the negotiated options, forks the
/// children, then runs the shared release/wait loop. Mirrors
/// `active_parent`.
pub fn run_active(peer: SocketAddrV4, opts: Options, local: LocalConfig, mut soaks: Option<SharedArray<SoakControl>>) -> Result<(), BootstrapError> {
    if Options::bool_flag(opts.show_params) {
        print_params(&opts);
    }

    let mut stream = bootstrap::active_handshake(peer, &opts, opts.connect_retries)?;
    println!("negotiated options, tasks will start in 2 seconds");

    let mut ctl = start_children(&opts).expect("failed to start children");
    bootstrap::active_go(&mut stream)?;
    drop(stream);

    let _ = local;
    release_children_and_wait(&opts, &mut ctl, &mut soaks);
    Ok(())
}

/// The passive side: listens, accepts one connection, receives the active
/// peer's options, forks children, then runs the shared release/wait loop.
/// Mirrors `passive_parent`.
pub fn run_passive(listen_addr: SocketAddrV4, mut soaks: Option<SharedArray<SoakControl>>) -> Result<(), BootstrapError> {
    let (mut stream, opts) = bootstrap::passive_handshake(listen_addr)?;

    let mut ctl = start_children(&opts).expect("failed to start children");
    bootstrap::passive_go(&mut stream)?;
    drop(stream);
    println!("negotiated options, tasks will start in 2 seconds");

    release_children_and_wait(&opts, &mut ctl, &mut soaks);
    Ok(())
}

fn print_params(opts: &Options) {
    println!("Options:");
    println!("  {:<10} {:<7}", "Tasks", { opts.nr_tasks });
    println!("  {:<10} {:<7}", "Req size", { opts.req_size });
    println!("  {:<10} {:<7}", "ACK size", { opts.ack_size });
    println!("  {:<10} {:<7}", "RDMA size", { opts.rdma_size });

    let mut rdma_opts = String::new();
    if Options::bool_flag(opts.rdma_use_once) {
        rdma_opts.push_str(" use_once");
    }
    if Options::bool_flag(opts.rdma_use_get_mr) {
        rdma_opts.push_str(" use_get_mr");
    }
    if opts.rdma_alignment != 0 {
        rdma_opts.push_str(&format!(" align={}", { opts.rdma_alignment }));
    }
    if rdma_opts.is_empty() {
        rdma_opts.push_str(" (defaults)");
    }
    println!("  {:<10}{}", "RDMA opts", rdma_opts);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_total_agree_on_running_totals() {
        let mut ctl: SharedArray<ChildControl> = SharedArray::new(2).unwrap();
        ctl[0].cur.inc(crate::counters::Metric::ReqTxBytes, 100);
        ctl[1].cur.inc(crate::counters::Metric::ReqTxBytes, 50);

        let disp = snapshot(&mut ctl);
        assert_eq!(disp[crate::counters::Metric::ReqTxBytes].sum, 150);

        let t = total(&ctl);
        assert_eq!(t[crate::counters::Metric::ReqTxBytes].sum, 150);
    }
}
