//! The datagram transport contract: a kernel-provided, non-IP
//! socket family with node/port addressing and a well-known control port
//! that emits peer lifecycle events. The real transport (e.g. QRTR on a
//! coprocessor) is named out of core scope; this module defines the seam
//! a concrete backend plugs into and ships the UDP-based backend the test
//! suite already exercises.

use std::io;
use std::net::SocketAddr;

/// A lifecycle event delivered on the transport's control port, naming a
/// peer that has gone away, modeled on `QRTR_TYPE_BYE`/
/// `QRTR_TYPE_DEL_CLIENT` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// An entire remote node disconnected; every transfer belonging to it
    /// must be reaped.
    PeerBye { node: NodeId },
    /// A single client address was deregistered; only the transfer at that
    /// exact address is reaped.
    DelClient { addr: PeerAddr },
}

/// The transport-layer identity of a remote node.
pub type NodeId = std::net::IpAddr;

/// The full transport-layer identity of a coprocessor endpoint (node, port).
pub type PeerAddr = SocketAddr;

/// The well-known port on the service socket that carries [`ControlEvent`]s,
/// rather than ordinary TFTP traffic. Concrete transports publish a fixed
/// constant for this; port 0 is never a valid ephemeral client port, so it
/// is used here as the stand-in control port for the UDP backend.
pub const CONTROL_PORT: u16 = 0;

/// Classifies a datagram received on the well-known service socket as either
/// ordinary TFTP traffic or a control-channel event, based on its source
/// port.
pub fn classify(src: PeerAddr, buf: &[u8]) -> Classified {
    if src.port() == CONTROL_PORT {
        match decode_control(buf) {
            Some(ev) => Classified::Control(ev),
            None => Classified::Unrecognized,
        }
    } else {
        Classified::Data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Data,
    Control(ControlEvent),
    Unrecognized,
}

/// Decodes a control-port datagram. Wire format (chosen for this stand-in
/// backend, analogous to the real transport's control packets): a one-byte
/// tag (`0` = bye, `1` = del_client) followed by the encoded address.
fn decode_control(buf: &[u8]) -> Option<ControlEvent> {
    match buf.first()? {
        0 => {
            let node = parse_ip(&buf[1..])?;
            Some(ControlEvent::PeerBye { node })
        }
        1 => {
            let addr = parse_socket_addr(&buf[1..])?;
            Some(ControlEvent::DelClient { addr })
        }
        _ => None,
    }
}

fn parse_ip(buf: &[u8]) -> Option<NodeId> {
    std::str::from_utf8(buf).ok()?.parse().ok()
}

fn parse_socket_addr(buf: &[u8]) -> Option<PeerAddr> {
    std::str::from_utf8(buf).ok()?.parse().ok()
}

/// Encodes a [`ControlEvent`] using the wire format [`decode_control`]
/// expects. Used by tests to synthesize control traffic; a real backend
/// would instead decode whatever its kernel control port actually emits.
pub fn encode_control(ev: ControlEvent) -> Vec<u8> {
    match ev {
        ControlEvent::PeerBye { node } => {
            let mut v = vec![0u8];
            v.extend_from_slice(node.to_string().as_bytes());
            v
        }
        ControlEvent::DelClient { addr } => {
            let mut v = vec![1u8];
            v.extend_from_slice(addr.to_string().as_bytes());
            v
        }
    }
}

/// Returns whether `io::Error` is the transport's equivalent of
/// `ENETRESET`, which must be swallowed silently rather than
/// logged.
pub fn is_net_reset(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc_enetreset())
}

#[cfg(target_os = "linux")]
fn libc_enetreset() -> i32 {
    102
}

#[cfg(not(target_os = "linux"))]
fn libc_enetreset() -> i32 {
    -1
}
