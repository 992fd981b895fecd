//! The send/recv state machine that drives a child's tasks over its one
//! shared UDP socket. Mirrors `send_anything`/`send_one`/`send_ack`/
//! `recv_one` in `rds-stress.c`.
//!
//! The back-pressure the original distinguished by `errno` has three
//! analogs here: `io::ErrorKind::WouldBlock` means the send queue itself is
//! full (stop sending this poll pass, same as `EAGAIN`); a task's
//! congestion window hitting zero is the simulated `ENOBUFS`; an in-flight
//! remote-memory slot blocks only that task's ack send (the simulated
//! `EBADSLT`, checked locally instead of from a real errno).

use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::time::Instant;

use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::trace;

use crate::codec::{self, Header, Op, RdmaOp};
use crate::counters::{CounterSet, Metric};
use crate::options::Options;
use crate::rdma::{self, RdmaKeyAllocator, RdmaStatus, RdmaToken};
use crate::task::Task;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sendto() truncated: wrote {wrote} of {expected} bytes")]
    Truncated { wrote: usize, expected: usize },
    #[error("recvmsg() returned a short datagram: {0} bytes")]
    ShortDatagram(usize),
    #[error("received bad task index {0}")]
    BadTaskIndex(i64),
    #[error("req size {got}, not {expected}")]
    BadReqSize { got: usize, expected: u32 },
    #[error("ack size {got}, not {expected}")]
    BadAckSize { got: usize, expected: u32 },
    #[error("unknown message op {0}")]
    UnknownOp(u8),
    #[error("header from {from} bogus: {0}", from = .1)]
    BogusHeader(codec::HeaderDiff, SocketAddrV4),
    #[error("corrupted payload from {from}: {corrupted} of {total} bytes wrong starting at offset {offset}")]
    BogusPayload { offset: usize, corrupted: usize, total: usize, from: SocketAddrV4 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a call into the send loop: either it made progress, or every
/// task it looked at is currently blocked for one of the three reasons
/// above.
pub enum SendOutcome {
    Progressed,
    QueueFull,
    Idle,
}

/// Builds and tunes the per-child UDP socket exactly as `rds_socket()` does:
/// sized send/receive buffers based on the worst-case in-flight byte count,
/// non-blocking mode.
pub fn bind_socket(local_addr: SocketAddrV4, opts: &Options) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;

    let bytes = { opts.nr_tasks } as usize
        * { opts.req_depth } as usize
        * ({ opts.req_size } as usize + { opts.ack_size } as usize)
        * 2;
    socket.set_send_buffer_size(bytes)?;
    socket.set_recv_buffer_size(bytes)?;

    if socket.send_buffer_size()? / 2 < bytes && { opts.suppress_warnings } == 0 {
        tracing::warn!(wanted = bytes, got = socket.send_buffer_size()?, "SO_SNDBUF smaller than requested");
    }
    if socket.recv_buffer_size()? / 2 < bytes && { opts.suppress_warnings } == 0 {
        tracing::warn!(wanted = bytes, got = socket.recv_buffer_size()?, "SO_RCVBUF smaller than requested");
    }

    socket.set_nonblocking(true)?;
    socket.bind(&local_addr.into())?;
    Ok(socket.into())
}

fn build_header(task: &Task, op: Op, index: u16) -> Header {
    let mut hdr = Header::zeroed_with(op);
    hdr.seq = task.send_seq;
    hdr.from_addr = u32::from(*task.src_addr.ip());
    hdr.from_port = task.src_addr.port();
    hdr.to_addr = u32::from(*task.dst_addr.ip());
    hdr.to_port = task.dst_addr.port();
    hdr.index = index;
    hdr
}

/// Sends one datagram, always re-stamping `seq` from `task`'s current
/// `send_seq` first: a cached ack header carries whatever `send_seq` was at
/// the moment the request it answers was received, which goes stale the
/// instant a new request is sent before that ack actually goes out.
fn send_packet(socket: &UdpSocket, task: &Task, dst: SocketAddrV4, hdr: &Header, size: usize, verify: bool) -> io::Result<usize> {
    let mut hdr = *hdr;
    hdr.seq = task.send_seq;
    let mut buf = vec![0u8; size];
    codec::fill(&mut buf, size, &hdr, verify);
    let n = socket.send_to(&buf, dst)?;
    if n != size {
        return Err(io::Error::other(format!("sendto() truncated: wrote {n} of {size}")));
    }
    Ok(n)
}

/// Sends the next outstanding request for `task`, attaching a remote-memory
/// op once the connection has warmed up (`send_seq > 10`, as in the
/// original, to keep the first few packets simple while debugging). Blocks
/// (returning `WouldBlock`, and parking the task via `drain_rdmas`) if the
/// slot's previous RDMA op hasn't been confirmed complete by the peer yet.
fn send_one(
    socket: &UdpSocket,
    task: &mut Task,
    opts: &Options,
    counters: &mut CounterSet,
    keys: &RdmaKeyAllocator,
) -> io::Result<usize> {
    let idx = task.send_index as usize;
    if task.rdma_inflight[idx] {
        // The previous RDMA op issued for this slot hasn't been confirmed
        // complete by the peer yet; reusing the slot now would race the
        // mirrored copy. Mirrors the original's EBADSLT/drain_rdmas path.
        task.drain_rdmas = true;
        return Err(io::Error::from(io::ErrorKind::WouldBlock));
    }

    let mut hdr = build_header(task, Op::Request, task.send_index);

    if opts.rdma_size != 0 && task.send_seq > 10 {
        attach_rdma_request(&mut hdr, task, opts, keys);
    }

    let start = Instant::now();
    let n = send_packet(socket, task, task.dst_addr, &hdr, opts.req_size as usize, Options::bool_flag(opts.verify))?;
    counters.inc(Metric::SendmsgUsecs, start.elapsed().as_micros() as u64);
    counters.inc(Metric::ReqTxBytes, n as u64);

    task.on_request_sent(start);
    task.send_seq += 1;
    task.rdma_req_key[idx] = 0; // we consumed this key
    Ok(n)
}

fn attach_rdma_request(hdr: &mut Header, task: &mut Task, opts: &Options, keys: &RdmaKeyAllocator) {
    let idx = task.send_index as usize;
    if Options::bool_flag(opts.rdma_use_get_mr) && task.rdma_req_key[idx] == 0 {
        task.rdma_req_key[idx] = keys.get_key();
    }
    task.rdma_inflight[idx] = true;

    let op = task.toggle_rdma_op();
    hdr.rdma_op = op as u8;
    hdr.rdma_pattern = rdma::rdma_pattern(task.send_seq, std::process::id());
    hdr.rdma_addr = idx as u64;
    hdr.rdma_phyaddr = 0;
    hdr.rdma_size = opts.rdma_size;
    hdr.rdma_key = task.rdma_req_key[idx];

    if op == RdmaOp::Read && Options::bool_flag(opts.verify) {
        rdma::fill_buffer(&mut task.local_buf[idx], hdr.rdma_pattern);
    } else if op == RdmaOp::Write && Options::bool_flag(opts.verify) {
        rdma::fill_buffer(&mut task.local_buf[idx], 0);
    }
}

/// Sends the ack for the oldest unacked request. Performs the "remote"
/// memory copy in user space when the request attached an RDMA op — see
/// `SPEC_FULL.md`'s remote-memory substitution — and fires off a separate
/// `RdmaCompletion` datagram back to the requester, who owns the
/// `rdma_inflight`/`drain_rdmas` bookkeeping for the slot (see `send_one`):
/// the copy happens synchronously here, so this side has no reuse hazard
/// of its own to guard against.
fn send_ack(
    socket: &UdpSocket,
    task: &mut Task,
    qindex: u16,
    opts: &Options,
    counters: &mut CounterSet,
) -> io::Result<usize> {
    let idx = qindex as usize;
    let hdr = task.ack_header[idx].expect("ack_header populated before send_ack is reachable");
    let n = send_packet(socket, task, task.dst_addr, &hdr, opts.ack_size as usize, Options::bool_flag(opts.verify))?;
    counters.inc(Metric::AckTxBytes, n as u64);
    // send_seq tracks exactly what recv_seq counts on the peer: messages of
    // type Request or Ack, not the locally-invented CongestionUpdate/
    // RdmaCompletion datagrams (see their senders below, which don't bump it).
    task.send_seq += 1;

    if hdr.has_rdma() {
        let op = RdmaOp::from_u8(hdr.rdma_op).expect("validated on receipt");
        perform_remote_copy(task, idx, op, hdr.rdma_pattern, opts.rdma_size);
        match op {
            RdmaOp::Write => counters.inc(Metric::RdmaWriteBytes, opts.rdma_size as u64),
            RdmaOp::Read => counters.inc(Metric::RdmaReadBytes, opts.rdma_size as u64),
        }

        // queue_index must name a slot in the *requester's* own rdma
        // bookkeeping, not this side's ack slot: hdr.rdma_addr carries the
        // requester's original send_index, copied through unchanged since
        // the request was received (see recv_one's Op::Request handling).
        let token = RdmaToken { task_index: task.nr, queue_index: hdr.rdma_addr as u32 }.encode(opts.req_depth);
        send_rdma_completion(socket, task, token, RdmaStatus::Success)?;
    }

    Ok(n)
}

fn perform_remote_copy(task: &mut Task, idx: usize, op: RdmaOp, pattern: u64, rdma_size: u32) {
    let words = rdma_size as usize / std::mem::size_of::<u64>();
    match op {
        RdmaOp::Write => rdma::fill_buffer(&mut task.rdma_buf[idx][..words], pattern),
        RdmaOp::Read => rdma::fill_buffer(&mut task.local_buf[idx][..words], pattern),
    }
}

fn send_rdma_completion(socket: &UdpSocket, task: &Task, token: u32, status: RdmaStatus) -> io::Result<usize> {
    let mut hdr = build_header(task, Op::RdmaCompletion, 0);
    hdr.rdma_key = token as u64;
    hdr.rdma_addr = status.to_i32() as u64;
    send_packet(socket, task, task.dst_addr, &hdr, std::mem::size_of::<Header>(), false)
}

/// Tells the peer its send window for this destination can reopen: sent once
/// this task's own unacked backlog drains back to zero, mirroring
/// `RDS_CMSG_CONG_UPDATE`'s real trigger (receiver buffer no longer full).
fn send_congestion_update(socket: &UdpSocket, task: &Task) -> io::Result<usize> {
    let hdr = build_header(task, Op::CongestionUpdate, 0);
    send_packet(socket, task, task.dst_addr, &hdr, std::mem::size_of::<Header>(), false)
}

/// Keeps `task`'s pipeline full: drains unacked requests (sending acks) and
/// tops up pending requests up to `req_depth`, exactly as `send_anything`'s
/// while loop does.
pub fn send_anything(
    socket: &UdpSocket,
    task: &mut Task,
    opts: &Options,
    counters: &mut CounterSet,
    keys: &RdmaKeyAllocator,
    can_send: bool,
) -> SendOutcome {
    let mut progressed = false;

    while task.has_work() {
        if task.unacked > 0 {
            if !can_send {
                return if progressed { SendOutcome::Progressed } else { SendOutcome::QueueFull };
            }
            let qindex = task.ack_slot();
            match send_ack(socket, task, qindex, opts, counters) {
                Ok(_) => {
                    task.on_ack_sent();
                    progressed = true;
                    if task.unacked == 0 {
                        if let Err(e) = send_congestion_update(socket, task) {
                            trace!(error = %e, "send_congestion_update failed");
                        }
                    }
                }
                Err(e) => {
                    trace!(error = %e, "send_ack failed");
                    return if progressed { SendOutcome::Progressed } else { SendOutcome::QueueFull };
                }
            }
        }

        if task.pending < task.req_depth() as u32 {
            let has_credit = !Options::bool_flag(opts.use_cong_monitor) || task.try_consume_credit();
            if !can_send || !has_credit {
                return if progressed { SendOutcome::Progressed } else { SendOutcome::QueueFull };
            }
            match send_one(socket, task, opts, counters, keys) {
                Ok(_) => progressed = true,
                Err(e) => {
                    trace!(error = %e, "send_one failed");
                    return if progressed { SendOutcome::Progressed } else { SendOutcome::QueueFull };
                }
            }
        }
    }

    SendOutcome::Progressed
}

fn task_index_from_port(port: u16, starting_port: u16) -> Result<usize, EngineError> {
    let idx = port as i64 - starting_port as i64 - 1;
    if idx < 0 {
        return Err(EngineError::BadTaskIndex(idx));
    }
    Ok(idx as usize)
}

/// Receives and dispatches a single datagram. Returns `Ok(None)` when the
/// socket has nothing more to read (`WouldBlock`), matching `recv_one`
/// returning a negative value on `EAGAIN`.
pub fn recv_one(
    socket: &UdpSocket,
    tasks: &mut [Task],
    opts: &Options,
    counters: &mut CounterSet,
    keys: &RdmaKeyAllocator,
) -> Result<Option<usize>, EngineError> {
    let mut buf = vec![0u8; opts.req_size.max(opts.ack_size) as usize];
    let (n, from) = match socket.recv_from(&mut buf) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let tstamp = Instant::now();

    if n < std::mem::size_of::<Header>() {
        return Err(EngineError::ShortDatagram(n));
    }
    let from = match from {
        std::net::SocketAddr::V4(v4) => v4,
        std::net::SocketAddr::V6(_) => return Err(EngineError::BadTaskIndex(-1)),
    };

    let in_hdr: Header = *bytemuck::from_bytes(&buf[..std::mem::size_of::<Header>()]);
    let op = Op::from_u8(in_hdr.op).ok_or(EngineError::UnknownOp(in_hdr.op))?;
    let task_index = task_index_from_port(from.port(), opts.starting_port)?;
    if task_index >= tasks.len() {
        return Err(EngineError::BadTaskIndex(task_index as i64));
    }

    match op {
        Op::CongestionUpdate => {
            tasks[task_index].refill_credit();
            return Ok(Some(n));
        }
        Op::RdmaCompletion => {
            // task_index is derived from the source port exactly as for
            // every other op, not from the token: the token's task_index
            // component is the *sender's* own peer-slot numbering, which is
            // meaningless once decoded on this side (see send_ack).
            let token = RdmaToken::decode(in_hdr.rdma_key as u32, opts.req_depth);
            let status = RdmaStatus::from_i32(in_hdr.rdma_addr as i32);
            mark_rdma_completed(&mut tasks[task_index], token.queue_index as usize, status, keys);
            return Ok(Some(n));
        }
        Op::Request | Op::Ack => {}
    }

    let expect_index = match op {
        Op::Request => tasks[task_index].recv_index,
        Op::Ack => tasks[task_index].expected_ack_index(),
        _ => unreachable!(),
    };

    let expected_size = match op {
        Op::Request => opts.req_size,
        Op::Ack => opts.ack_size,
        _ => unreachable!(),
    };
    if n != expected_size as usize {
        return match op {
            Op::Request => Err(EngineError::BadReqSize { got: n, expected: expected_size }),
            _ => Err(EngineError::BadAckSize { got: n, expected: expected_size }),
        };
    }

    let expected_hdr = Header {
        seq: tasks[task_index].recv_seq,
        from_addr: u32::from(*from.ip()),
        from_port: from.port(),
        to_addr: u32::from(*tasks[task_index].src_addr.ip()),
        to_port: tasks[task_index].src_addr.port(),
        index: expect_index,
        op: in_hdr.op,
        ..Header::zeroed_with(op)
    };
    match codec::check(&buf, n, &expected_hdr, Options::bool_flag(opts.verify)) {
        Some(codec::Mismatch::Header(diff)) => return Err(EngineError::BogusHeader(diff, from)),
        Some(codec::Mismatch::Payload { offset, corrupted, total }) => {
            return Err(EngineError::BogusPayload { offset, corrupted, total, from });
        }
        None => {}
    }

    let task = &mut tasks[task_index];
    match op {
        Op::Ack => {
            if let Some(rtt) = task.on_ack_received(tstamp) {
                counters.inc(Metric::RttUsecs, rtt.as_micros() as u64);
            }
            counters.inc(Metric::AckRxBytes, n as u64);
        }
        Op::Request => {
            counters.inc(Metric::ReqRxBytes, n as u64);
            let mut ack_hdr = build_header(task, Op::Ack, task.recv_index);
            if in_hdr.has_rdma() {
                if in_hdr.rdma_size != opts.rdma_size {
                    return Err(EngineError::BadReqSize { got: in_hdr.rdma_size as usize, expected: opts.rdma_size });
                }
                ack_hdr.rdma_op = in_hdr.rdma_op;
                ack_hdr.rdma_size = in_hdr.rdma_size;
                ack_hdr.rdma_key = in_hdr.rdma_key;
                ack_hdr.rdma_phyaddr = in_hdr.rdma_phyaddr;
                ack_hdr.rdma_addr = in_hdr.rdma_addr;
                ack_hdr.rdma_pattern = in_hdr.rdma_pattern;
            }
            task.on_request_received(ack_hdr);
        }
        _ => unreachable!(),
    }

    Ok(Some(n))
}

fn mark_rdma_completed(task: &mut Task, qindex: usize, status: RdmaStatus, keys: &RdmaKeyAllocator) {
    if status.is_err() {
        tracing::warn!(task = task.nr, qindex, reason = status.message(), "RDMA op failed");
    }
    if task.rdma_req_key[qindex] != 0 {
        keys.free_key(task.rdma_req_key[qindex]);
        task.rdma_req_key[qindex] = 0;
    }
    task.rdma_inflight[qindex] = false;
    task.drain_rdmas = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Binds two sockets at `starting_port + 1 + 0` and `starting_port + 1 +
    /// 1`, exactly the port scheme `run_child` uses, so that each side's
    /// peer task lands at the expected array index on receipt.
    fn loopback_pair(starting_port: u16) -> (UdpSocket, UdpSocket, SocketAddrV4, SocketAddrV4) {
        let a = UdpSocket::bind((Ipv4Addr::LOCALHOST, starting_port + 1)).unwrap();
        let b = UdpSocket::bind((Ipv4Addr::LOCALHOST, starting_port + 2)).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let addr_a = match a.local_addr().unwrap() {
            std::net::SocketAddr::V4(v) => v,
            _ => unreachable!(),
        };
        let addr_b = match b.local_addr().unwrap() {
            std::net::SocketAddr::V4(v) => v,
            _ => unreachable!(),
        };
        (a, b, addr_a, addr_b)
    }

    fn base_opts(starting_port: u16, req_depth: u32, nr_tasks: u16) -> Options {
        Options {
            req_depth,
            req_size: crate::options::MIN_MSG_BYTES + 16,
            ack_size: crate::options::MIN_MSG_BYTES,
            rdma_size: 0,
            send_addr: 0,
            receive_addr: 0,
            starting_port,
            nr_tasks,
            run_time: 0,
            summary_only: 0,
            rtprio: 0,
            tracing: 0,
            verify: 1,
            show_params: 0,
            show_perfdata: 0,
            use_cong_monitor: 1,
            rdma_use_once: 1,
            rdma_use_get_mr: 0,
            rdma_alignment: 4096,
            connect_retries: 0,
            suppress_warnings: 1,
        }
    }

    #[test]
    fn request_then_ack_round_trip_over_loopback() {
        let starting_port = 20_000;
        let (sock_a, sock_b, addr_a, addr_b) = loopback_pair(starting_port);

        let opts = base_opts(starting_port, 4, 2);
        let keys = RdmaKeyAllocator::new();

        // A is bound at id 0 (starting_port+1), B at id 1 (starting_port+2).
        // So from B's perspective A is task 0; from A's perspective B is
        // task 1 — each side's array needs a slot at that index.
        let mut tasks_a = vec![Task::new(0, addr_a, addr_a, 4, 0), Task::new(1, addr_a, addr_b, 4, 0)];
        let mut tasks_b = vec![Task::new(0, addr_b, addr_a, 4, 0)];

        let mut counters_a = CounterSet::new();
        let mut counters_b = CounterSet::new();

        send_one(&sock_a, &mut tasks_a[1], &opts, &mut counters_a, &keys).unwrap();
        assert_eq!(tasks_a[1].pending, 1);

        // B receives the request and queues an ack.
        let n = recv_one(&sock_b, &mut tasks_b, &opts, &mut counters_b, &keys).unwrap();
        assert!(n.is_some());
        assert_eq!(tasks_b[0].unacked, 1);

        let qindex = tasks_b[0].ack_slot();
        send_ack(&sock_b, &mut tasks_b[0], qindex, &opts, &mut counters_b).unwrap();
        tasks_b[0].on_ack_sent();

        // A receives the ack.
        let n = recv_one(&sock_a, &mut tasks_a, &opts, &mut counters_a, &keys).unwrap();
        assert!(n.is_some());
        assert_eq!(tasks_a[1].pending, 0);
        assert_eq!(counters_a[Metric::RttUsecs].nr, 1);
    }

    #[test]
    fn recv_one_returns_none_when_socket_is_empty() {
        let (sock_a, _sock_b, _addr_a, _addr_b) = loopback_pair(1);
        let opts = base_opts(1000, 1, 1);
        let keys = RdmaKeyAllocator::new();
        let mut tasks: Vec<Task> = vec![];
        let mut counters = CounterSet::new();
        assert!(recv_one(&sock_a, &mut tasks, &opts, &mut counters, &keys).unwrap().is_none());
    }
}
