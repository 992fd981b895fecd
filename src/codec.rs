use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Message kind carried in [`Header::op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Request = 1,
    Ack = 2,
    /// Not present in the original wire format: stands in for the
    /// `RDS_CMSG_CONG_UPDATE` control message, which has no UDP equivalent
    /// (see `SPEC_FULL.md`'s congestion-monitor substitution).
    CongestionUpdate = 3,
    /// Stands in for `RDS_CMSG_RDMA_STATUS`, carrying back the token/status
    /// pair the kernel would otherwise deliver as a control message.
    RdmaCompletion = 4,
}

impl Op {
    pub fn from_u8(v: u8) -> Option<Op> {
        match v {
            1 => Some(Op::Request),
            2 => Some(Op::Ack),
            3 => Some(Op::CongestionUpdate),
            4 => Some(Op::RdmaCompletion),
            _ => None,
        }
    }
}

/// One-sided remote-memory operation kind, carried in the RDMA annex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaOp {
    Read = 1,
    Write = 2,
}

impl RdmaOp {
    pub fn from_u8(v: u8) -> Option<RdmaOp> {
        match v {
            1 => Some(RdmaOp::Read),
            2 => Some(RdmaOp::Write),
            _ => None,
        }
    }

    /// Read becomes write and vice versa.
    pub fn toggle(self) -> RdmaOp {
        match self {
            RdmaOp::Read => RdmaOp::Write,
            RdmaOp::Write => RdmaOp::Read,
        }
    }
}

/// Every datagram gets one of these so the receiver can verify it got what
/// was sent. Field order and widths are load-bearing: both peers must agree
/// on byte layout, so this is packed and transmitted network-byte-order for
/// the integer fields that cross the wire as such.
///
/// The verification prefix (everything `check()` compares unconditionally)
/// spans `seq` through `op`; the RDMA annex below it is only meaningful when
/// a remote-op is attached.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Header {
    pub seq: u32,
    pub from_addr: u32,
    pub to_addr: u32,
    pub from_port: u16,
    pub to_port: u16,
    pub index: u16,
    pub op: u8,

    pub rdma_op: u8,
    pub rdma_addr: u64,
    pub rdma_phyaddr: u64,
    pub rdma_pattern: u64,
    pub rdma_key: u64,
    pub rdma_size: u32,
}

/// Offset of `rdma_op`, i.e. the length of the verification prefix.
/// `rds-stress.c` computes this as `offsetof(struct header, rdma_op)`.
pub const BASIC_HEADER_SIZE: usize = 4 + 4 + 4 + 2 + 2 + 2 + 1;

const_assert_eq!(size_of::<Header>(), BASIC_HEADER_SIZE + 1 + 8 + 8 + 8 + 8 + 4);

impl Header {
    pub fn zeroed_with(op: Op) -> Header {
        let mut hdr: Header = Zeroable::zeroed();
        hdr.op = op as u8;
        hdr
    }

    pub fn has_rdma(&self) -> bool {
        self.rdma_op != 0
    }
}

/// Generates the deterministic byte pattern used for corruption detection.
///
/// `k_{i+1} = 41*(k_i + 3) + (i >> 8)`, `k_0 = 11`, byte-truncated. The
/// `i >> 8` term shifts the pattern by one in every successive 256-byte
/// block so that swapped blocks can be detected.
pub struct PatternGenerator {
    k: u32,
}

impl PatternGenerator {
    pub fn new() -> PatternGenerator {
        PatternGenerator { k: 11 }
    }

    /// Fills `buf` with `buf.len()` bytes of pattern starting at sequence
    /// index 0.
    pub fn fill(buf: &mut [u8]) {
        let mut k: u32 = 11;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = k as u8;
            k = 41u32.wrapping_mul(k.wrapping_add(3)).wrapping_add((i >> 8) as u32);
        }
    }
}

impl Default for PatternGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`check`]: `None` on a clean match, `Some(diff)` describing the
/// first mismatch found.
#[derive(Debug)]
pub enum Mismatch {
    Header(HeaderDiff),
    Payload { offset: usize, corrupted: usize, total: usize },
}

#[derive(Debug)]
pub struct HeaderDiff {
    pub expected: Header,
    pub got: Header,
}

impl std::fmt::Display for HeaderDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (e, g) = (self.expected, self.got);
        writeln!(f, "An incoming message had a header which")?;
        writeln!(f, "didn't contain the fields we expected:")?;
        writeln!(f, "    member        expected eq             got")?;
        macro_rules! bleh {
            ($field:ident, $name:literal) => {{
                let (ef, gf) = (e.$field, g.$field);
                writeln!(f, "{:>10} {:>15} {} {:>15}", $name, ef, if ef == gf { "=" } else { "!=" }, gf)?;
            }};
        }
        bleh!(seq, "seq");
        bleh!(from_addr, "from_addr");
        bleh!(from_port, "from_port");
        bleh!(to_addr, "to_addr");
        bleh!(to_port, "to_port");
        bleh!(index, "index");
        bleh!(op, "op");
        Ok(())
    }
}

/// Writes the fixed header followed by `size - header` bytes of pattern
/// (when `verify` is set) into `buf`. `buf` must be at least `size` bytes.
pub fn fill(buf: &mut [u8], size: usize, hdr: &Header, verify: bool) {
    let hdr_bytes = bytemuck::bytes_of(hdr);
    buf[..hdr_bytes.len()].copy_from_slice(hdr_bytes);
    if verify {
        PatternGenerator::fill(&mut buf[hdr_bytes.len()..size]);
    }
}

/// Compares the verification prefix of `message` against `hdr`'s, and, when
/// `verify` is set, compares the payload against the deterministic pattern.
/// Returns `None` on a clean match.
pub fn check(message: &[u8], size: usize, hdr: &Header, verify: bool) -> Option<Mismatch> {
    let got: Header = *bytemuck::from_bytes(&message[..size_of::<Header>()]);
    if message[..BASIC_HEADER_SIZE] != bytemuck::bytes_of(hdr)[..BASIC_HEADER_SIZE] {
        return Some(Mismatch::Header(HeaderDiff { expected: *hdr, got }));
    }

    if verify {
        let payload = &message[size_of::<Header>()..size];
        let mut pattern = vec![0u8; payload.len()];
        PatternGenerator::fill(&mut pattern);

        if payload != pattern.as_slice() {
            let mut offset = None;
            let mut count = 0usize;
            for (i, (a, b)) in payload.iter().zip(pattern.iter()).enumerate() {
                if a != b {
                    if offset.is_none() {
                        offset = Some(i);
                    }
                    count += 1;
                }
            }
            return Some(Mismatch::Payload {
                offset: offset.unwrap_or(0),
                corrupted: count,
                total: payload.len(),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_original_layout() {
        assert_eq!(size_of::<Header>(), 56);
        assert_eq!(BASIC_HEADER_SIZE, 19);
    }

    #[test]
    fn pattern_generator_is_deterministic() {
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        PatternGenerator::fill(&mut a);
        PatternGenerator::fill(&mut b);
        assert_eq!(a, b);
        // k_0 = 11, k_1 = 41*(11+3) = 574 -> truncated to u8 = 62
        assert_eq!(a[0], 11);
        assert_eq!(a[1], (41u32 * 14) as u8);
    }

    #[test]
    fn round_trip_matches() {
        let hdr = Header::zeroed_with(Op::Request);
        let size = size_of::<Header>() + 16;
        let mut buf = vec![0u8; size];
        fill(&mut buf, size, &hdr, true);
        assert!(check(&buf, size, &hdr, true).is_none());
    }

    #[test]
    fn round_trip_detects_header_tamper() {
        let hdr = Header::zeroed_with(Op::Request);
        let size = size_of::<Header>() + 16;
        let mut buf = vec![0u8; size];
        fill(&mut buf, size, &hdr, true);
        buf[0] ^= 0xff;
        let mut expected = hdr;
        expected.seq = 0xdead_beef;
        assert!(matches!(check(&buf, size, &expected, true), Some(Mismatch::Header(_))));
    }

    #[test]
    fn round_trip_detects_payload_corruption() {
        let hdr = Header::zeroed_with(Op::Request);
        let size = size_of::<Header>() + 16;
        let mut buf = vec![0u8; size];
        fill(&mut buf, size, &hdr, true);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        match check(&buf, size, &hdr, true) {
            Some(Mismatch::Payload { offset, corrupted, total }) => {
                assert_eq!(offset, 15);
                assert_eq!(corrupted, 1);
                assert_eq!(total, 16);
            }
            other => panic!("expected payload mismatch, got {other:?}"),
        }
    }

    #[test]
    fn zero_payload_is_accepted() {
        let hdr = Header::zeroed_with(Op::Ack);
        let size = size_of::<Header>();
        let mut buf = vec![0u8; size];
        fill(&mut buf, size, &hdr, true);
        assert!(check(&buf, size, &hdr, true).is_none());
    }
}
