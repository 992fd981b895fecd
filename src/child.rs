//! The per-child event loop. Each child owns one UDP socket and drives
//! `nr_tasks` [`Task`]s against the same number of peer children. Mirrors
//! `run_child()`/`start_children()` in `rds-stress.c`.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{getppid, Pid};

use crate::counters::CounterSet;
use crate::engine::{self, SendOutcome};
use crate::options::Options;
use crate::rdma::RdmaKeyAllocator;
use crate::shared_mem::{ChildControl, WireTime};
use crate::task::Task;

/// Builds this child's `nr_tasks` tasks: task `i` targets the peer child
/// bound at `starting_port + 1 + i`, exactly as `run_child` lays them out.
fn build_tasks(id: u16, opts: &Options) -> Vec<Task> {
    let local_ip = Ipv4Addr::from(opts.receive_addr);
    let peer_ip = Ipv4Addr::from(if opts.send_addr != 0 { opts.send_addr } else { opts.receive_addr });
    let src_addr = SocketAddrV4::new(local_ip, opts.starting_port + 1 + id);
    let rdma_words = opts.rdma_size as usize / std::mem::size_of::<u64>();

    (0..opts.nr_tasks)
        .map(|i| {
            let dst_addr = SocketAddrV4::new(peer_ip, opts.starting_port + 1 + i);
            Task::new(i as u32, src_addr, dst_addr, opts.req_depth as u16, rdma_words)
        })
        .collect()
}

/// Dies (exits the process) once this child is no longer attached to the
/// parent that spawned it, exactly like `check_parent()`.
fn check_parent(parent_pid: Pid) {
    if getppid() != parent_pid {
        eprintln!("parent {parent_pid} exited");
        std::process::exit(1);
    }
}

/// Blocks (polling the parent's liveness once a second) until the parent
/// publishes a start time in `ctl.start`, then sleeps off whatever's left
/// before that moment so every child begins at the same instant.
fn wait_for_start(parent_pid: Pid, ctl: &ChildControl) {
    while !ctl.start.is_set() {
        check_parent(parent_pid);
        thread::sleep(Duration::from_secs(1));
    }

    if let Some(start) = ctl.start.to_system_time() {
        if let Ok(remaining) = start.duration_since(std::time::SystemTime::now()) {
            thread::sleep(remaining);
        }
    }
}

/// Runs forever (until the parent kills this process), pipelining
/// request/ack traffic across every task and publishing running counters
/// into `ctl.cur` for the parent to sample.
pub fn run_child(parent_pid: Pid, ctl: &mut ChildControl, opts: &Options, id: u16) {
    let local_ip = Ipv4Addr::from(opts.receive_addr);
    let bind_addr = SocketAddrV4::new(local_ip, opts.starting_port + 1 + id);
    let socket = engine::bind_socket(bind_addr, opts).expect("failed to bind child socket");

    let mut tasks = build_tasks(id, opts);
    let keys = RdmaKeyAllocator::new();
    let mut counters = CounterSet::new();

    ctl.set_ready();
    wait_for_start(parent_pid, ctl);

    run_event_loop(&socket, parent_pid, &mut tasks, opts, &mut counters, &keys, ctl);
}

fn run_event_loop(
    socket: &UdpSocket,
    parent_pid: Pid,
    tasks: &mut [Task],
    opts: &Options,
    counters: &mut CounterSet,
    keys: &RdmaKeyAllocator,
    ctl: &mut ChildControl,
) {
    let mut want_write = true;
    loop {
        check_parent(parent_pid);

        let mut fds = [PollFd::new(socket, poll_events(want_write))];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => panic!("poll failed: {e}"),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());

        if revents.contains(PollFlags::POLLIN) {
            loop {
                match engine::recv_one(socket, tasks, opts, counters, keys) {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed datagram");
                        break;
                    }
                }
            }
        }

        let can_send = revents.contains(PollFlags::POLLOUT);
        want_write = false;
        for task in tasks.iter_mut() {
            if Options::bool_flag(opts.use_cong_monitor) && task.congested {
                continue;
            }
            if task.drain_rdmas {
                continue;
            }
            match engine::send_anything(socket, task, opts, counters, keys, can_send) {
                SendOutcome::QueueFull => want_write = true,
                SendOutcome::Progressed | SendOutcome::Idle => {}
            }
        }

        ctl.cur = *counters;
    }
}

fn poll_events(want_write: bool) -> PollFlags {
    if want_write {
        PollFlags::POLLIN | PollFlags::POLLOUT
    } else {
        PollFlags::POLLIN
    }
}

#[allow(dead_code)]
fn now_wire() -> WireTime {
    WireTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tasks_targets_sequential_ports() {
        let opts = Options {
            req_depth: 2,
            req_size: 1040,
            ack_size: 32,
            rdma_size: 0,
            send_addr: u32::from(Ipv4Addr::new(127, 0, 0, 1)),
            receive_addr: u32::from(Ipv4Addr::new(127, 0, 0, 1)),
            starting_port: 9000,
            nr_tasks: 3,
            run_time: 0,
            summary_only: 0,
            rtprio: 0,
            tracing: 0,
            verify: 0,
            show_params: 0,
            show_perfdata: 0,
            use_cong_monitor: 1,
            rdma_use_once: 1,
            rdma_use_get_mr: 0,
            rdma_alignment: 4096,
            connect_retries: 0,
            suppress_warnings: 1,
        };

        let tasks = build_tasks(1, &opts);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].src_addr.port(), 9002);
        assert_eq!(tasks[0].dst_addr.port(), 9001);
        assert_eq!(tasks[1].dst_addr.port(), 9002);
        assert_eq!(tasks[2].dst_addr.port(), 9003);
    }
}
