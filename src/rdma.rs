//! Remote-memory helper: key allocation, buffer fill/compare, and the
//! completion-status plumbing that would otherwise ride `RDS_GET_MR` /
//! `RDS_RDMA_STATUS` control messages.
//!
//! This process has no RDMA hardware underneath it (see `SPEC_FULL.md`).
//! The allocator here still tracks `mrs_allocated` the way the original
//! did, so "every key we hand out gets freed exactly once" remains a
//! checkable invariant, but the keys themselves are just a monotonic
//! counter rather than a kernel memory registration handle.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::codec::RdmaOp;

/// Hands out unique, never-zero remote-memory keys and tracks how many are
/// currently outstanding. Mirrors `get_rdma_key`/`free_rdma_key` and the
/// file-scope `mrs_allocated` counter.
#[derive(Debug, Default)]
pub struct RdmaKeyAllocator {
    next: AtomicU64,
    allocated: AtomicU64,
}

impl RdmaKeyAllocator {
    pub fn new() -> RdmaKeyAllocator {
        RdmaKeyAllocator { next: AtomicU64::new(1), allocated: AtomicU64::new(0) }
    }

    pub fn get_key(&self) -> u64 {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(key, "allocated rdma key");
        key
    }

    pub fn free_key(&self, key: u64) {
        trace!(key, "freed rdma key");
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Fills `buf` with repeating 8-byte copies of `pattern`, the way
/// `rds_fill_buffer` seeds a remote-memory region before a READ or after a
/// WRITE so a later compare can detect corruption.
pub fn fill_buffer(buf: &mut [u64], pattern: u64) {
    buf.fill(pattern);
}

/// Result of [`compare_buffer`]: `None` on a clean match, `Some(offset)` of
/// the first mismatching 8-byte word otherwise.
pub fn compare_buffer(buf: &[u64], pattern: u64) -> Option<usize> {
    buf.iter().position(|&w| w != pattern)
}

/// Identifies a task's in-flight remote-memory slot. `rdma_user_token`
/// packs `(task index, queue index)` into a single completion token the
/// way the original packs it for the kernel to hand back unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaToken {
    pub task_index: u32,
    pub queue_index: u32,
}

impl RdmaToken {
    pub fn encode(self, req_depth: u32) -> u32 {
        self.task_index * req_depth + self.queue_index
    }

    pub fn decode(token: u32, req_depth: u32) -> RdmaToken {
        RdmaToken { task_index: token / req_depth, queue_index: token % req_depth }
    }
}

/// Completion status for an outstanding RDMA op, carried back to the
/// requester in an [`crate::codec`] `RdmaCompletion` message. Values mirror
/// the kernel's `RDS_RDMA_*` status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaStatus {
    Success,
    RemoteError,
    Canceled,
    Dropped,
    OtherError,
}

impl RdmaStatus {
    pub fn from_i32(v: i32) -> RdmaStatus {
        match v {
            0 => RdmaStatus::Success,
            1 => RdmaStatus::RemoteError,
            2 => RdmaStatus::Canceled,
            3 => RdmaStatus::Dropped,
            _ => RdmaStatus::OtherError,
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            RdmaStatus::Success => 0,
            RdmaStatus::RemoteError => 1,
            RdmaStatus::Canceled => 2,
            RdmaStatus::Dropped => 3,
            RdmaStatus::OtherError => 4,
        }
    }

    pub fn is_err(self) -> bool {
        !matches!(self, RdmaStatus::Success)
    }

    pub fn message(self) -> &'static str {
        match self {
            RdmaStatus::Success => "success",
            RdmaStatus::RemoteError => "remote error",
            RdmaStatus::Canceled => "operation was cancelled",
            RdmaStatus::Dropped => "operation was dropped",
            RdmaStatus::OtherError => "other error",
        }
    }
}

/// Packs the `(send_seq, pid)` pattern the requester seeds its side of the
/// buffer with, so the corresponding compare on the other end has
/// something distinctive to look for.
pub fn rdma_pattern(send_seq: u32, pid: u32) -> u64 {
    ((send_seq as u64) << 32) | pid as u64
}

/// Picks which op a task issues next: the original alternates READ and
/// WRITE so both directions of the remote-memory path get exercised.
pub fn next_op(current: RdmaOp) -> RdmaOp {
    current.toggle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_nonzero() {
        let alloc = RdmaKeyAllocator::new();
        let a = alloc.get_key();
        let b = alloc.get_key();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(alloc.allocated(), 2);
        alloc.free_key(a);
        assert_eq!(alloc.allocated(), 1);
    }

    #[test]
    fn fill_then_compare_roundtrips() {
        let mut buf = vec![0u64; 8];
        fill_buffer(&mut buf, 0xdead_beef);
        assert_eq!(compare_buffer(&buf, 0xdead_beef), None);
        buf[3] = 0;
        assert_eq!(compare_buffer(&buf, 0xdead_beef), Some(3));
    }

    #[test]
    fn token_round_trips() {
        let depth = 4;
        let tok = RdmaToken { task_index: 7, queue_index: 2 };
        let encoded = tok.encode(depth);
        assert_eq!(RdmaToken::decode(encoded, depth), tok);
    }

    #[test]
    fn status_round_trips_through_wire_repr() {
        for s in [
            RdmaStatus::Success,
            RdmaStatus::RemoteError,
            RdmaStatus::Canceled,
            RdmaStatus::Dropped,
            RdmaStatus::OtherError,
        ] {
            assert_eq!(RdmaStatus::from_i32(s.to_i32()), s);
        }
    }

    #[test]
    fn rdma_op_toggles() {
        assert_eq!(next_op(RdmaOp::Read), RdmaOp::Write);
        assert_eq!(next_op(RdmaOp::Write), RdmaOp::Read);
    }
}
