//! The event loop and connection registry: a single-threaded, readiness-
//! driven `mio::Poll` loop with one token per connection plus the
//! well-known service socket(s).
//!
//! Grounded on `ServerImpl` (`handle_server_packet`,
//! `handle_connection_packet`, `generate_token`, `cancel_connection`,
//! `create_connection`, `run`), ported to the current `mio` 0.8 API with its
//! `mio_more::timer::Timer`-driven idle-timeout/retransmit machinery
//! removed: the core blocks on readiness with no timeout and never tears
//! a transfer down on its own.

use std::collections::HashMap;
use std::io;
use std::net::{self, IpAddr, SocketAddr};
use std::result;

use log::*;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::config::Config;
use crate::decompress::{Decompressor, ZstdDecompressor};
use crate::packet::{ErrorCode, Packet, PacketErr, MAX_PACKET_SIZE};
use crate::tftp_proto::{IOAdapter, ProtoError, Transfer, TftpServerProto};
use crate::transport::{self, Classified, ControlEvent};
use crate::translate::{PathTranslator, TranslateError};

#[derive(Debug)]
pub enum TftpError {
    Packet(PacketErr),
    Io(io::Error),
}

impl From<io::Error> for TftpError {
    fn from(err: io::Error) -> Self {
        TftpError::Io(err)
    }
}

impl From<PacketErr> for TftpError {
    fn from(err: PacketErr) -> Self {
        TftpError::Packet(err)
    }
}

pub type Result<T> = result::Result<T, TftpError>;

/// Adapts a [`PathTranslator`] to the protocol engine's [`IOAdapter`] seam,
/// enforcing the server's read-only policy at the last moment before a file
/// would be created.
pub struct FSAdapter<D: Decompressor> {
    translator: PathTranslator<D>,
    readonly: bool,
}

impl<D: Decompressor> IOAdapter for FSAdapter<D> {
    type R = std::fs::File;
    type W = std::fs::File;

    fn open_read(&self, name: &str) -> result::Result<(Self::R, Option<u64>), TranslateError> {
        let opened = self.translator.open_read(name)?;
        Ok((opened.file, opened.len))
    }

    fn create(&mut self, name: &str) -> result::Result<Self::W, TranslateError> {
        if self.readonly {
            return Err(TranslateError::PermissionDenied);
        }
        self.translator.open_write(name)
    }

    fn remove(&mut self, name: &str) -> result::Result<(), TranslateError> {
        self.translator.remove(name)
    }
}

/// An ongoing transfer's connection state: its dedicated socket, the
/// protocol state machine, and the peer it talks to.
struct Connection<IO: IOAdapter> {
    socket: UdpSocket,
    transfer: Transfer<IO>,
    remote: SocketAddr,
}

pub type TftpServer = ServerImpl<FSAdapter<ZstdDecompressor>>;

pub struct ServerImpl<IO: IOAdapter> {
    new_token: Token,
    poll: Poll,
    server_sockets: HashMap<Token, UdpSocket>,
    connections: HashMap<Token, Connection<IO>>,
    proto_handler: TftpServerProto<IO>,
    max_connections: Option<usize>,
}

impl ServerImpl<FSAdapter<ZstdDecompressor>> {
    /// Builds a server from a resolved [`Config`], wiring up the path
    /// translator and zstd decompressor.
    pub fn with_cfg(cfg: &Config) -> Result<Self> {
        let translator = PathTranslator::new(
            cfg.rules.clone(),
            cfg.compressed_suffix.clone(),
            ZstdDecompressor,
        );
        let adapter = FSAdapter {
            translator,
            readonly: cfg.readonly,
        };
        Self::new(cfg, adapter)
    }
}

impl<IO: IOAdapter> ServerImpl<IO> {
    /// Builds a server from a resolved [`Config`] and an already-constructed
    /// I/O adapter.
    pub fn new(cfg: &Config, io: IO) -> Result<Self> {
        if cfg.addrs.is_empty() {
            return Err(TftpError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address list empty; nothing to listen on",
            )));
        }

        let poll = Poll::new()?;

        let mut server_sockets = HashMap::new();
        let mut new_token = Token(0);
        for &(ip, port) in &cfg.addrs {
            let mut socket = make_bound_socket(ip, port)?;
            poll.registry()
                .register(&mut socket, new_token, Interest::READABLE)?;
            server_sockets.insert(new_token, socket);
            new_token.0 += 1;
        }

        info!(
            "listening on {:?}",
            server_sockets
                .values()
                .map(|socket| format!("{}", socket.local_addr().unwrap()))
                .collect::<Vec<_>>()
        );

        Ok(Self {
            new_token,
            poll,
            server_sockets,
            connections: HashMap::new(),
            proto_handler: TftpServerProto::new(io),
            max_connections: cfg.max_connections,
        })
    }

    fn generate_token(&mut self) -> Token {
        while self.server_sockets.contains_key(&self.new_token)
            || self.connections.contains_key(&self.new_token)
        {
            self.new_token.0 = self.new_token.0.wrapping_add(1);
        }
        self.new_token
    }

    fn cancel_connection(&mut self, token: Token) -> Result<()> {
        if let Some(mut conn) = self.connections.remove(&token) {
            debug!("closing connection {:?} ({})", token, conn.remote);
            self.poll.registry().deregister(&mut conn.socket)?;
        }
        Ok(())
    }

    /// Reaps every connection matching a control-channel event.
    fn handle_control_event(&mut self, ev: ControlEvent) -> Result<()> {
        let matches: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| matches_control_event(ev, conn.remote))
            .map(|(token, _)| *token)
            .collect();

        for token in matches {
            self.cancel_connection(token)?;
        }
        Ok(())
    }

    fn create_connection(
        &mut self,
        token: Token,
        socket: UdpSocket,
        transfer: Transfer<IO>,
        remote: SocketAddr,
    ) -> Result<()> {
        let mut socket = socket;
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;
        self.connections.insert(
            token,
            Connection {
                socket,
                transfer,
                remote,
            },
        );
        debug!("created connection {:?} with {}", token, remote);
        Ok(())
    }

    fn handle_token(&mut self, token: Token, buf: &mut [u8]) -> Result<()> {
        if self.server_sockets.contains_key(&token) {
            self.handle_server_packet(token, buf)
        } else {
            self.handle_connection_packet(token, buf)
        }
    }

    fn handle_server_packet(&mut self, token: Token, buf: &mut [u8]) -> Result<()> {
        let (local_ip, amt, src) = {
            let socket = match self.server_sockets.get(&token) {
                Some(socket) => socket,
                None => {
                    error!("invalid server token {:?}", token);
                    return Ok(());
                }
            };
            let (amt, src) = socket.recv_from(buf)?;
            (socket.local_addr()?.ip(), amt, src)
        };

        match transport::classify(src, &buf[..amt]) {
            Classified::Control(ev) => return self.handle_control_event(ev),
            Classified::Unrecognized => {
                debug!("unrecognized control-port datagram from {}", src);
                return Ok(());
            }
            Classified::Data => {}
        }

        let packet = match Packet::read(&buf[..amt]) {
            Ok(packet) => packet,
            Err(PacketErr::BadOption(name)) => {
                warn!("bad option {:?} from {}", name, src);
                let msg = Packet::from(ErrorCode::BadOption);
                self.reply_without_connection(local_ip, src, &msg, buf)?;
                return Ok(());
            }
            Err(e) => {
                warn!("malformed packet from {}: {:?}", src, e);
                return Ok(());
            }
        };

        if !matches!(packet, Packet::RRQ { .. } | Packet::WRQ { .. }) {
            debug!("ignoring non-initiating packet from {}", src);
            return Ok(());
        }

        if let Some(max) = self.max_connections {
            if self.connections.len() >= max {
                warn!("connection limit ({}) reached, rejecting {}", max, src);
                let msg = Packet::from(ErrorCode::NotDefined);
                self.reply_without_connection(local_ip, src, &msg, buf)?;
                return Ok(());
            }
        }

        let is_write = matches!(packet, Packet::WRQ { .. });
        let filename = initiating_filename(&packet).to_owned();

        let new_conn_token = self.generate_token();
        let (xfer, res) = self.proto_handler.rx_initial(packet);
        let reply_packet = match res {
            Err(ProtoError::NotInitiatingPacket) => unreachable!("checked above"),
            Err(ProtoError::UnsupportedMode) => {
                debug!("rejecting non-octet mode request from {}", src);
                return Ok(());
            }
            Err(ProtoError::NoReply) => {
                debug!("dropping write request from {} with no reply", src);
                return Ok(());
            }
            Ok(packet) => packet,
        };

        let mut socket = make_bound_socket(local_ip, None)?;
        if let Err(e) = socket.connect(src) {
            error!("failed to connect transfer socket to {}: {}", src, e);
            if is_write {
                if let Err(e) = self.proto_handler.remove(&filename) {
                    error!("failed to clean up {:?} after connect failure: {}", filename, e);
                }
            }
            return Ok(());
        }

        let amt_written = reply_packet.write_to_slice(buf)?;
        socket.send(&buf[..amt_written])?;

        if let Some(xfer) = xfer {
            self.create_connection(new_conn_token, socket, xfer, src)?;
        }

        Ok(())
    }

    /// Sends a one-off reply (bad option, out of resources) to a peer that
    /// will not get a registered connection.
    fn reply_without_connection(
        &self,
        local_ip: IpAddr,
        remote: SocketAddr,
        packet: &Packet,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut socket = make_bound_socket(local_ip, None)?;
        if socket.connect(remote).is_err() {
            return Ok(());
        }
        let amt_written = packet.write_to_slice(buf)?;
        socket.send(&buf[..amt_written])?;
        Ok(())
    }

    fn handle_connection_packet(&mut self, token: Token, buf: &mut [u8]) -> Result<()> {
        let conn = if let Some(conn) = self.connections.get_mut(&token) {
            conn
        } else {
            error!("no connection with token {:?}", token);
            return Ok(());
        };

        let (amt, src) = match conn.socket.recv_from(buf) {
            Ok(v) => v,
            Err(e) if transport::is_net_reset(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if conn.remote != src {
            debug!("discarding packet from unexpected source {} on {}'s connection", src, conn.remote);
            return Ok(());
        }

        let packet = match Packet::read(&buf[..amt]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("malformed packet from {}: {:?}", src, e);
                return Ok(());
            }
        };

        let response = conn.transfer.rx(packet);
        for packet in &response.packets {
            let amt_written = packet.write_to_slice(buf)?;
            conn.socket.send(&buf[..amt_written])?;
        }

        if response.done || conn.transfer.is_done() {
            self.cancel_connection(token)?;
        }

        Ok(())
    }

    /// Runs the server's event loop.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut scratch_buf = vec![0; MAX_PACKET_SIZE];

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match self.handle_token(event.token(), &mut scratch_buf) {
                    Ok(()) => {}
                    Err(TftpError::Io(e)) => {
                        debug!("swallowed io error: {}", e);
                    }
                    Err(TftpError::Packet(e)) => {
                        warn!("malformed packet: {:?}", e);
                    }
                }
            }
        }
    }

    /// Stores the local addresses in the provided vec.
    pub fn get_local_addrs(&self, bag: &mut Vec<SocketAddr>) -> Result<()> {
        for socket in self.server_sockets.values() {
            bag.push(socket.local_addr()?);
        }
        Ok(())
    }
}

fn matches_control_event(ev: ControlEvent, remote: SocketAddr) -> bool {
    match ev {
        ControlEvent::PeerBye { node } => remote.ip() == node,
        ControlEvent::DelClient { addr } => remote == addr,
    }
}

fn initiating_filename(packet: &Packet) -> &str {
    match packet {
        Packet::RRQ { filename, .. } | Packet::WRQ { filename, .. } => filename,
        _ => unreachable!("caller already checked packet is RRQ or WRQ"),
    }
}

fn make_bound_socket(ip: IpAddr, port: Option<u16>) -> Result<UdpSocket> {
    let socket = net::UdpSocket::bind((ip, port.unwrap_or(0)))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket))
}
