//! TCP rendezvous that negotiates run parameters before the UDP traffic
//! starts. Mirrors `active_parent`/`passive_parent`'s socket setup and the
//! `peer_connect`/`peer_send`/`peer_recv` helpers in `rds-stress.c`.
//!
//! The active side binds a listening... no: it *connects* to the passive
//! side and sends its negotiated [`Options`] as raw bytes. Each side then
//! forks its own children (`start_children`), and only once those are up
//! do the two sides exchange a one-byte "go" handshake — so neither starts
//! sending UDP traffic before the other's task mesh actually exists. The
//! handshake is deliberately split into an options phase
//! (`active_handshake`/`passive_handshake`) and a go phase
//! (`active_go`/`passive_go`), with `start_children` run by the caller in
//! between, matching `active_parent`/`passive_parent`'s own ordering.

use std::io::{self, Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::options::Options;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("connect to {addr} failed after {retries} retries: {source}")]
    ConnectFailed { addr: SocketAddrV4, retries: u32, #[source] source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// `true` for the transient failure modes the original retries
/// (`ECONNREFUSED`, `EHOSTUNREACH`, `ENETUNREACH`); anything else is fatal
/// immediately.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
    )
}

/// Connects to `addr`, retrying up to `retries` times (one second apart) on
/// the transient errors above. Mirrors `peer_connect`.
pub fn connect_with_retry(addr: SocketAddrV4, retries: u32) -> Result<TcpStream, BootstrapError> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if is_retryable(&e) && attempt < retries => {
                attempt += 1;
                thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(BootstrapError::ConnectFailed { addr, retries: attempt, source: e }),
        }
    }
}

fn send_exact(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    stream.write_all(buf)
}

fn recv_exact(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
    stream.read_exact(buf)
}

/// The active side: connects to the passive peer and ships it our
/// negotiated `Options`. Mirrors the options-exchange portion of
/// `active_parent`, up to (but not including) `start_children`.
pub fn active_handshake(peer: SocketAddrV4, opts: &Options, connect_retries: u32) -> Result<TcpStream, BootstrapError> {
    let mut stream = connect_with_retry(peer, connect_retries)?;
    send_exact(&mut stream, bytemuck::bytes_of(opts))?;
    Ok(stream)
}

/// The passive side: listens once, accepts a single connection, and reads
/// back the peer's negotiated `Options` (with `send_addr`/`receive_addr`
/// swapped, since the active side described the connection from its own
/// point of view). Mirrors the options-exchange portion of `passive_parent`,
/// up to (but not including) `start_children`.
pub fn passive_handshake(listen_addr: SocketAddrV4) -> Result<(TcpStream, Options), BootstrapError> {
    let listener = TcpListener::bind(listen_addr)?;
    let (mut stream, _peer) = listener.accept()?;
    drop(listener);

    let mut raw = vec![0u8; std::mem::size_of::<Options>()];
    recv_exact(&mut stream, &mut raw)?;
    let mut remote: Options = *bytemuck::from_bytes(&raw);

    let their_send = remote.receive_addr;
    remote.receive_addr = u32::from(*listen_addr.ip());
    remote.send_addr = their_send;

    Ok((stream, remote))
}

/// The active side's half of the one-byte "go" handshake: send our "go"
/// first, then wait for the peer's. Must run after `start_children` so the
/// peer never gets a "go" before our own task mesh is up. Mirrors
/// `active_parent`'s `peer_send(&ok)` / `peer_recv(&ok)` pair, run right
/// before it closes the TCP socket.
pub fn active_go(stream: &mut TcpStream) -> io::Result<()> {
    let go = 1u8;
    send_exact(stream, &[go])?;
    let mut ack = [0u8];
    recv_exact(stream, &mut ack)?;
    Ok(())
}

/// The passive side's half of the one-byte "go" handshake: wait for the
/// initiating peer's "go" first, then send ours back. Must run after
/// `start_children`. Mirrors `passive_parent`'s `peer_recv(&ok)` /
/// `peer_send(&ok)` pair.
pub fn passive_go(stream: &mut TcpStream) -> io::Result<()> {
    let mut go = [0u8];
    recv_exact(stream, &mut go)?;
    send_exact(stream, &go)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_options(port: u16) -> Options {
        Options {
            req_depth: 2,
            req_size: 1040,
            ack_size: 32,
            rdma_size: 0,
            send_addr: u32::from(Ipv4Addr::new(10, 0, 0, 2)),
            receive_addr: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            starting_port: port,
            nr_tasks: 4,
            run_time: 30,
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
            suppress_warnings: 0,
        }
    }

    #[test]
    fn active_and_passive_exchange_options() {
        let listen_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 23_457);
        let opts = sample_options(23_457);

        let passive = thread::spawn(move || passive_handshake(listen_addr).unwrap());
        thread::sleep(Duration::from_millis(50));

        let stream = active_handshake(listen_addr, &opts, 0).unwrap();
        let (_passive_stream, received) = passive.join().unwrap();

        assert_eq!({ received.nr_tasks }, 4);
        assert_eq!({ received.req_size }, 1040);
        // addresses were swapped from the active side's point of view
        assert_eq!({ received.receive_addr }, u32::from(*listen_addr.ip()));
        assert_eq!({ received.send_addr }, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        drop(stream);
    }

    #[test]
    fn go_exchange_completes_after_options() {
        let listen_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 23_458);
        let opts = sample_options(23_458);

        let passive = thread::spawn(move || {
            let (mut stream, opts) = passive_handshake(listen_addr).unwrap();
            passive_go(&mut stream).unwrap();
            opts
        });
        thread::sleep(Duration::from_millis(50));

        let mut stream = active_handshake(listen_addr, &opts, 0).unwrap();
        active_go(&mut stream).unwrap();
        let received = passive.join().unwrap();

        assert_eq!({ received.nr_tasks }, 4);
    }

    #[test]
    fn connect_to_closed_port_fails_without_retry() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        let err = connect_with_retry(addr, 0);
        assert!(err.is_err());
    }
}
