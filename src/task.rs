//! Per-destination task state: one [`Task`] per `(local index, remote
//! index)` pair exchanging a pipelined stream of request/ack messages,
//! optionally with a remote-memory op attached to each request.
//!
//! Mirrors `struct task` in `rds-stress.c`, minus the fields that only
//! existed to hold raw `sockaddr_in`s (the engine keeps those separately).

use std::net::SocketAddrV4;
use std::time::Instant;

use crate::codec::{Header, RdmaOp};

/// One task's send/recv pipeline state. `pending`/`unacked` are both bounded
/// by `req_depth`; `send_index`/`recv_index` wrap modulo `req_depth`.
pub struct Task {
    pub nr: u32,
    pub src_addr: SocketAddrV4,
    pub dst_addr: SocketAddrV4,

    pub pending: u32,
    pub unacked: u32,
    pub congested: bool,
    pub drain_rdmas: bool,

    /// Stand-in for the kernel's per-destination congestion feedback (see
    /// `SPEC_FULL.md`): decremented on every new outbound request, refilled
    /// to `req_depth` when a `CongestionUpdate` message arrives. Hitting zero
    /// is the simulated analog of the kernel returning `ENOBUFS` on a send;
    /// it does not gate ack sends, which only drain existing backlog and so
    /// never add new load to the destination.
    congestion_window: u32,

    pub send_seq: u32,
    pub recv_seq: u32,
    pub send_index: u16,
    pub recv_index: u16,

    req_depth: u16,

    /// Send timestamp per in-flight request slot, used to compute RTT when
    /// the matching ack arrives.
    send_time: Vec<Option<Instant>>,
    /// Pre-built ack header per slot, assembled as soon as the
    /// corresponding request is received so `send_ack` just has to copy it
    /// out.
    pub ack_header: Vec<Option<Header>>,

    /// Remote-memory buffer mirrors, one pair per in-flight slot.
    pub rdma_buf: Vec<Vec<u64>>,
    pub local_buf: Vec<Vec<u64>>,
    pub rdma_req_key: Vec<u64>,
    pub rdma_inflight: Vec<bool>,

    pub rdma_next_op: RdmaOp,
}

impl Task {
    pub fn new(nr: u32, src_addr: SocketAddrV4, dst_addr: SocketAddrV4, req_depth: u16, rdma_words: usize) -> Task {
        let depth = req_depth as usize;
        Task {
            nr,
            src_addr,
            dst_addr,
            pending: 0,
            unacked: 0,
            congested: false,
            drain_rdmas: false,
            congestion_window: req_depth as u32,
            send_seq: 0,
            recv_seq: 0,
            send_index: 0,
            recv_index: 0,
            req_depth,
            send_time: vec![None; depth],
            ack_header: vec![None; depth],
            rdma_buf: vec![vec![0u64; rdma_words]; depth],
            local_buf: vec![vec![0u64; rdma_words]; depth],
            rdma_req_key: vec![0; depth],
            rdma_inflight: vec![false; depth],
            // The original seeds this from task parity so paired tasks on
            // either side exercise both RDMA directions from the start.
            rdma_next_op: if nr & 1 == 1 { RdmaOp::Read } else { RdmaOp::Write },
        }
    }

    pub fn req_depth(&self) -> u16 {
        self.req_depth
    }

    pub fn has_work(&self) -> bool {
        self.unacked > 0 || self.pending < self.req_depth as u32
    }

    /// Index of the oldest unacked slot, i.e. the one the next ack send
    /// should drain.
    pub fn ack_slot(&self) -> u16 {
        let depth = self.req_depth as i32;
        (((self.recv_index as i32) - (self.unacked as i32) + depth) % depth) as u16
    }

    /// Index of the request slot the next incoming ack must match, derived
    /// from how many requests are still pending.
    pub fn expected_ack_index(&self) -> u16 {
        let depth = self.req_depth as i32;
        (((self.send_index as i32) - (self.pending as i32) + depth) % depth) as u16
    }

    pub fn on_request_sent(&mut self, at: Instant) {
        let idx = self.send_index as usize;
        self.send_time[idx] = Some(at);
        self.rdma_req_key[idx] = 0;
        self.send_index = (self.send_index + 1) % self.req_depth;
        self.pending += 1;
    }

    pub fn on_ack_sent(&mut self) {
        self.unacked -= 1;
    }

    /// Records a received request: builds and stashes its ack header slot
    /// and advances `recv_index`.
    pub fn on_request_received(&mut self, ack_header: Header) {
        let idx = self.recv_index as usize;
        self.ack_header[idx] = Some(ack_header);
        self.unacked += 1;
        self.recv_index = (self.recv_index + 1) % self.req_depth;
        self.recv_seq += 1;
    }

    /// Records a received ack: returns the RTT against the original send
    /// timestamp, if one was recorded.
    pub fn on_ack_received(&mut self, at: Instant) -> Option<std::time::Duration> {
        let idx = self.expected_ack_index() as usize;
        let rtt = self.send_time[idx].take().map(|sent| at.saturating_duration_since(sent));
        self.pending -= 1;
        self.recv_seq += 1;
        rtt
    }

    pub fn toggle_rdma_op(&mut self) -> RdmaOp {
        let op = self.rdma_next_op;
        self.rdma_next_op = op.toggle();
        op
    }

    /// Spends one unit of congestion credit. Returns `false` (and marks the
    /// task congested) when the window is already exhausted, the simulated
    /// equivalent of the kernel's `ENOBUFS`.
    pub fn try_consume_credit(&mut self) -> bool {
        if self.congestion_window == 0 {
            self.congested = true;
            return false;
        }
        self.congestion_window -= 1;
        true
    }

    /// Handles an incoming `CongestionUpdate`: refills the credit window and
    /// clears the congested flag.
    pub fn refill_credit(&mut self) {
        self.congestion_window = self.req_depth as u32;
        self.congested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn task(depth: u16) -> Task {
        Task::new(0, addr(4000), addr(4001), depth, 0)
    }

    #[test]
    fn pending_and_has_work_track_depth() {
        let mut t = task(2);
        assert!(t.has_work());
        t.on_request_sent(Instant::now());
        assert_eq!(t.pending, 1);
        assert!(t.has_work());
        t.on_request_sent(Instant::now());
        assert_eq!(t.pending, 2);
        assert!(!t.has_work());
    }

    #[test]
    fn expected_ack_index_tracks_oldest_pending() {
        let mut t = task(4);
        t.on_request_sent(Instant::now());
        t.on_request_sent(Instant::now());
        t.on_request_sent(Instant::now());
        // send_index is now 3, pending 3: oldest pending is slot 0.
        assert_eq!(t.expected_ack_index(), 0);
        t.on_ack_received(Instant::now());
        // one ack in: oldest pending is now slot 1.
        assert_eq!(t.expected_ack_index(), 1);
    }

    #[test]
    fn ack_slot_tracks_oldest_unacked() {
        let mut t = task(4);
        t.on_request_received(Header::zeroed_with(crate::codec::Op::Ack));
        t.on_request_received(Header::zeroed_with(crate::codec::Op::Ack));
        // recv_index is now 2, unacked 2: oldest unacked is slot 0.
        assert_eq!(t.ack_slot(), 0);
        t.on_ack_sent();
        assert_eq!(t.ack_slot(), 1);
    }

    #[test]
    fn congestion_window_exhausts_then_refills() {
        let mut t = task(2);
        assert!(t.try_consume_credit());
        assert!(t.try_consume_credit());
        assert!(!t.congested);
        assert!(!t.try_consume_credit());
        assert!(t.congested);
        t.refill_credit();
        assert!(!t.congested);
        assert!(t.try_consume_credit());
    }

    #[test]
    fn rdma_op_toggles_from_seeded_parity() {
        let mut even = Task::new(0, addr(4000), addr(4001), 1, 1);
        let mut odd = Task::new(1, addr(4000), addr(4001), 1, 1);
        assert_eq!(even.rdma_next_op, RdmaOp::Write);
        assert_eq!(odd.rdma_next_op, RdmaOp::Read);
        assert_eq!(even.toggle_rdma_op(), RdmaOp::Write);
        assert_eq!(even.rdma_next_op, RdmaOp::Read);
        assert_eq!(odd.toggle_rdma_op(), RdmaOp::Read);
    }
}
