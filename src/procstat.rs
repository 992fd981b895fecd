//! Parses the `cpu ` and `intr ` lines of `/proc/stat` for the perfdata CSV
//! mode's system-wide CPU breakdown. Mirrors `get_stats()` in
//! `rds-stress.c`.

use std::fs;
use std::io;

/// The `cpu ` line's first 7 jiffy counters, the same fields the original
/// keys off by their "magic procfs offsets".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStats {
    pub times: CpuTimes,
    pub intr: u64,
}

/// Breaks down one interval of `SystemStats` into percentages, scaled by
/// the interval's total jiffy count so the sum of the four buckets is 100%
/// regardless of sampling rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBreakdown {
    pub user_pct: f64,
    pub system_pct: f64,
    pub idle_pct: f64,
    pub irq_pct: f64,
    pub intr_delta: u64,
}

fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.trim_start_matches("cpu").trim_start().split_whitespace();
    let mut next = || fields.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
    Some(CpuTimes {
        user: next(),
        nice: next(),
        system: next(),
        idle: next(),
        iowait: next(),
        irq: next(),
        softirq: next(),
    })
}

/// Reads the aggregate `cpu ` and `intr ` lines from `/proc/stat`.
pub fn read_stats() -> io::Result<SystemStats> {
    let contents = fs::read_to_string("/proc/stat")?;
    parse_stats(&contents)
}

fn parse_stats(contents: &str) -> io::Result<SystemStats> {
    let mut stats = SystemStats::default();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("cpu ") {
            stats.times = parse_cpu_line(rest).unwrap_or_default();
        } else if let Some(rest) = line.strip_prefix("intr ") {
            stats.intr = rest.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0);
        }
    }
    Ok(stats)
}

/// Computes the percentage breakdown between two samples, plus the raw
/// interrupt-count delta.
pub fn delta(prev: SystemStats, current: SystemStats) -> CpuBreakdown {
    let d = |f: fn(CpuTimes) -> u64| current_field(current, f) - current_field(prev, f);
    fn current_field(s: SystemStats, f: fn(CpuTimes) -> u64) -> u64 {
        f(s.times)
    }

    let user = d(|t| t.user) + d(|t| t.nice);
    let system = d(|t| t.system);
    let idle = d(|t| t.idle) + d(|t| t.iowait);
    let irq = d(|t| t.irq) + d(|t| t.softirq);
    let sum = user + system + idle + irq;
    let scale = if sum != 0 { 100.0 / sum as f64 } else { 0.0 };

    CpuBreakdown {
        user_pct: user as f64 * scale,
        system_pct: system as f64 * scale,
        idle_pct: idle as f64 * scale,
        irq_pct: irq as f64 * scale,
        intr_delta: current.intr - prev.intr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "cpu  100 0 50 800 10 0 5\ncpu0 50 0 25 400 5 0 2\nintr 12345 0 0\nctxt 9999\n";

    #[test]
    fn parses_cpu_and_intr_lines() {
        let stats = parse_stats(SAMPLE).unwrap();
        assert_eq!(stats.times.user, 100);
        assert_eq!(stats.times.idle, 800);
        assert_eq!(stats.times.softirq, 5);
        assert_eq!(stats.intr, 12345);
    }

    #[test]
    fn delta_breakdown_sums_to_roughly_a_hundred_percent() {
        let prev = parse_stats(SAMPLE).unwrap();
        let current = parse_stats("cpu  150 0 70 900 10 0 5\nintr 12350 0 0\n").unwrap();
        let d = delta(prev, current);
        let total = d.user_pct + d.system_pct + d.idle_pct + d.irq_pct;
        assert!((total - 100.0).abs() < 1e-9);
        assert_eq!(d.intr_delta, 5);
    }

    #[test]
    fn zero_interval_does_not_divide_by_zero() {
        let prev = parse_stats(SAMPLE).unwrap();
        let d = delta(prev, prev);
        assert_eq!(d.user_pct, 0.0);
        assert_eq!(d.intr_delta, 0);
    }
}
