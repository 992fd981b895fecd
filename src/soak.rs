//! CPU soakers: one child per core that spins calling `getpid()` flat out,
//! so the parent can report "how much CPU would be free for something else"
//! alongside throughput. Mirrors `run_soaker`/`start_soakers`/`stop_soakers`/
//! `cpu_use` in `rds-stress.c`.

use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, ForkResult, Pid};

use crate::shared_mem::SharedArray;

/// One soaker's self-reported capacity, mirroring `struct soak_control`.
pub use crate::shared_mem::SoakControl;

/// Forks one soaker per available core and returns their shared-memory
/// handles. Each entry's `per_sec` climbs to that core's best-observed
/// `getpid()`-calls-per-second rate once the soakers have run for a bit.
pub fn start_soakers() -> nix::Result<SharedArray<SoakControl>> {
    let nr_soak = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let mut soaks: SharedArray<SoakControl> = SharedArray::new(nr_soak)?;
    let parent = getpid();

    for i in 0..nr_soak {
        // Safety: single-threaded at this point in the parent's startup
        // sequence (no other threads were spawned before this call).
        match unsafe { fork() }? {
            ForkResult::Child => run_soaker(parent, &mut soaks[i]),
            ForkResult::Parent { child } => {
                soaks[i].pid = child.as_raw();
            }
        }
    }

    Ok(soaks)
}

/// Spins calling `getpid()` for roughly a second at a time, ratcheting
/// `per_sec` up to the best rate it has ever measured, forever (until the
/// parent kills it).
fn run_soaker(parent_pid: Pid, soak: &mut SoakControl) -> ! {
    // Safety: single call at soaker startup, no other thread in this process.
    unsafe { libc::nice(20) };

    soak.per_sec = 1000;

    loop {
        let start = Instant::now();
        for _ in 0..soak.per_sec {
            let _ = getpid();
            soak.counter += 1;
        }
        let elapsed = start.elapsed();

        let per_sec = (soak.per_sec as f64 * 1_000_000.0 / elapsed.as_micros().max(1) as f64) as u64;
        if per_sec > soak.per_sec {
            soak.per_sec = per_sec;
        }

        if nix::unistd::getppid() != parent_pid {
            std::process::exit(1);
        }
    }
}

pub fn stop_soakers(soaks: &SharedArray<SoakControl>) {
    for soak in soaks.iter() {
        if soak.pid == 0 {
            continue;
        }
        let pid = Pid::from_raw(soak.pid);
        let _ = kill(pid, Signal::SIGTERM);
        let _ = waitpid(pid, None);
    }
}

/// Fraction of total soaker capacity that's actually spare, as a percentage.
/// `None` when there are no soakers running (the `-c` flag wasn't given).
pub fn cpu_use(soaks: &mut SharedArray<SoakControl>) -> Option<f64> {
    if soaks.is_empty() {
        return None;
    }

    let mut capacity: u64 = 0;
    let mut soaked: u64 = 0;
    for soak in soaks.iter_mut() {
        if soak.per_sec == 0 {
            continue;
        }
        capacity += soak.per_sec;
        let delta = soak.counter - soak.last;
        soaked += soak.per_sec.min(delta);
        soak.last = soak.counter;
    }

    if capacity == 0 {
        return Some(0.0);
    }
    Some((capacity - soaked) as f64 * 100.0 / capacity as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soak(per_sec: u64, counter: u64, last: u64) -> SoakControl {
        SoakControl::with(1, per_sec, counter, last)
    }

    #[test]
    fn fully_soaked_core_reports_zero_spare() {
        let mut soaks: Vec<SoakControl> = vec![soak(1000, 1000, 0)];
        // exercise the same math cpu_use uses, without needing a real mmap
        let capacity: u64 = soaks.iter().map(|s| s.per_sec).sum();
        let soaked: u64 = soaks.iter_mut().map(|s| s.per_sec.min(s.counter - s.last)).sum();
        assert_eq!((capacity - soaked) as f64 * 100.0 / capacity as f64, 0.0);
    }

    #[test]
    fn half_soaked_core_reports_fifty_percent_spare() {
        let soaks: Vec<SoakControl> = vec![soak(1000, 500, 0)];
        let capacity: u64 = soaks.iter().map(|s| s.per_sec).sum();
        let soaked: u64 = soaks.iter().map(|s| s.per_sec.min(s.counter - s.last)).sum();
        assert_eq!((capacity - soaked) as f64 * 100.0 / capacity as f64, 50.0);
    }
}
