//! The negotiated run parameters. This is the wire struct the active peer
//! sends over the bootstrap TCP channel so the passive peer picks up the
//! same sizes, depth, task count and feature flags without being told them
//! on its own command line.

use bytemuck::{Pod, Zeroable};

use crate::codec::BASIC_HEADER_SIZE;

/// Smallest legal message: a bare header with no RDMA annex and no payload
/// is still `BASIC_HEADER_SIZE` bytes, but the wire minimum tracks the full
/// (header + RDMA annex) struct, matching `MIN_MSG_BYTES` in the original.
pub const MIN_MSG_BYTES: u32 = std::mem::size_of::<crate::codec::Header>() as u32;

const _: () = assert!(BASIC_HEADER_SIZE < MIN_MSG_BYTES as usize);

/// Mirrors `struct options` field-for-field so it can be exchanged as raw
/// bytes between peers during bootstrap.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Options {
    pub req_depth: u32,
    pub req_size: u32,
    pub ack_size: u32,
    pub rdma_size: u32,
    pub send_addr: u32,
    pub receive_addr: u32,
    pub starting_port: u16,
    pub nr_tasks: u16,
    pub run_time: u32,
    pub summary_only: u8,
    pub rtprio: u8,
    pub tracing: u8,
    pub verify: u8,
    pub show_params: u8,
    pub show_perfdata: u8,
    pub use_cong_monitor: u8,
    pub rdma_use_once: u8,
    pub rdma_use_get_mr: u8,
    pub rdma_alignment: u32,
    pub connect_retries: u32,
    pub suppress_warnings: u8,
}

impl Options {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(buf: &[u8]) -> Options {
        *bytemuck::from_bytes(buf)
    }

    pub fn wire_size() -> usize {
        std::mem::size_of::<Options>()
    }

    pub fn uses_rdma(&self) -> bool {
        self.rdma_size != 0
    }

    pub fn bool_flag(v: u8) -> bool {
        v != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let opts = Options {
            req_depth: 4,
            req_size: 1024,
            ack_size: MIN_MSG_BYTES,
            rdma_size: 4096,
            send_addr: 0x0a00_0001,
            receive_addr: 0x0a00_0002,
            starting_port: 4000,
            nr_tasks: 8,
            run_time: 30,
            summary_only: 0,
            rtprio: 0,
            tracing: 1,
            verify: 1,
            show_params: 0,
            show_perfdata: 0,
            use_cong_monitor: 1,
            rdma_use_once: 1,
            rdma_use_get_mr: 0,
            rdma_alignment: 4096,
            connect_retries: 0,
            suppress_warnings: 0,
        };
        let bytes = opts.as_bytes().to_vec();
        let back = Options::from_bytes(&bytes);
        assert_eq!({ back.req_size }, 1024);
        assert_eq!({ back.nr_tasks }, 8);
        assert!(back.uses_rdma());
    }
}
