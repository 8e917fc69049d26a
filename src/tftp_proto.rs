//! The TFTP protocol engine: per-client read/write state machines, option
//! negotiation, and the rsize/seek/wsize extensions.
//!
//! Grounded on `Transfer`/`TransferTx`/`TransferRx` and the `Response`
//! reply model with its `rx_initial` option-draining step, generalized to
//! six negotiable options and to `rsize`/`seek` partial-read semantics.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::packet::{ErrorCode, Packet, TftpOption, TransferMode};
use crate::translate::TranslateError;

/// Injects filesystem I/O into the protocol engine, so the engine itself
/// never touches a concrete path — that's the translator's job.
pub trait IOAdapter {
    type R: Read + Seek;
    type W: Write;
    fn open_read(&self, name: &str) -> Result<(Self::R, Option<u64>), TranslateError>;
    fn create(&mut self, name: &str) -> Result<Self::W, TranslateError>;
    /// Removes a file previously returned by `create`. Used by the server
    /// loop to undo a WRQ's file creation when the per-transfer socket
    /// cannot be set up.
    fn remove(&mut self, name: &str) -> Result<(), TranslateError>;
}

#[derive(Debug, PartialEq)]
pub enum ProtoError {
    /// The packet received cannot be used to initiate a transfer.
    NotInitiatingPacket,
    /// `mode` was not (case-insensitively) `"octet"`. The request is
    /// logged and silently dropped rather than answered with an error packet.
    UnsupportedMode,
    /// The request is torn down with no reply at all (e.g. a WRQ whose
    /// destination file could not be opened or created).
    NoReply,
}

#[derive(Debug, Clone, Copy)]
struct TransferMeta {
    blocksize: u16,
    #[allow(dead_code)] // carried for the server loop's idle-teardown policy
    timeoutms: u32,
    window_size: u16,
    rsize: u64,
    seek: u64,
}

impl Default for TransferMeta {
    fn default() -> Self {
        Self {
            blocksize: 512,
            timeoutms: 1000,
            window_size: 1,
            rsize: 0,
            seek: 0,
        }
    }
}

/// A response to a received packet: zero or more packets to send, and
/// whether the transfer is now complete.
#[derive(Debug, Default)]
pub struct Response {
    pub packets: Vec<Packet>,
    pub done: bool,
}

impl From<Packet> for Response {
    fn from(p: Packet) -> Self {
        Self {
            packets: vec![p],
            done: false,
        }
    }
}

impl Response {
    fn done() -> Self {
        Self {
            packets: vec![],
            done: true,
        }
    }
    fn packet_then_done(p: Packet) -> Self {
        Self {
            packets: vec![p],
            done: true,
        }
    }
}

/// The protocol/translation handler: given a raw initiating packet, decides
/// whether a transfer can begin and what to send back.
pub struct TftpServerProto<IO: IOAdapter> {
    io: IO,
}

impl<IO: IOAdapter> TftpServerProto<IO> {
    pub fn new(io: IO) -> Self {
        Self { io }
    }

    /// Undoes a WRQ's file creation.
    pub fn remove(&mut self, name: &str) -> Result<(), TranslateError> {
        self.io.remove(name)
    }

    /// Handles the receipt of an RRQ or WRQ. On success, returns the
    /// `Transfer` to register plus the initial reply to send (either an
    /// `OACK` or the first `DATA`/`ACK`).
    pub fn rx_initial(
        &mut self,
        packet: Packet,
    ) -> (Option<Transfer<IO>>, Result<Packet, ProtoError>) {
        let (filename, mode, options, is_write) = match packet {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, false),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => (filename, mode, options, true),
            _ => return (None, Err(ProtoError::NotInitiatingPacket)),
        };

        if mode != TransferMode::Octet {
            return (None, Err(ProtoError::UnsupportedMode));
        }

        let mut meta = TransferMeta::default();
        let mut wants_tsize = false;
        for opt in &options {
            match *opt {
                TftpOption::Blocksize(size) => meta.blocksize = size,
                TftpOption::TimeoutMs(ms) => meta.timeoutms = ms,
                TftpOption::WindowSize(size) => meta.window_size = size,
                TftpOption::ReadSize(size) => meta.rsize = size,
                TftpOption::Seek(off) => meta.seek = off,
                TftpOption::TransferSize(_) => wants_tsize = true,
            }
        }
        // the client's tsize value is a request, not data; the server fills
        // in the real size below and only echoes what it actually knows
        let mut echoed: Vec<TftpOption> = options
            .into_iter()
            .filter(|o| !matches!(o, TftpOption::TransferSize(_)))
            .collect();

        if is_write {
            let fwrite = match self.io.create(&filename) {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("WRQ open failed for {:?}: {:?}", filename, e);
                    return (None, Err(ProtoError::NoReply));
                }
            };
            let xfer = TransferRx {
                fwrite,
                done: false,
            };
            let packet = if echoed.is_empty() {
                Packet::ACK(0)
            } else {
                Packet::OACK { options: echoed }
            };
            (Some(Transfer::Rx(xfer)), Ok(packet))
        } else {
            let (fread, len) = match self.io.open_read(&filename) {
                Ok(f) => f,
                Err(e) => return (None, Ok(Packet::from(ErrorCode::from(e)))),
            };
            if wants_tsize {
                if let Some(size) = len {
                    echoed.push(TftpOption::TransferSize(size));
                }
            }
            let mut xfer = TransferTx {
                fread,
                meta,
                sent_final: false,
                done: false,
            };
            if !echoed.is_empty() {
                let packet = Packet::OACK { options: echoed };
                (Some(Transfer::Tx(xfer)), Ok(packet))
            } else {
                match xfer.read_step(0) {
                    Ok(p) => (Some(Transfer::Tx(xfer)), Ok(p)),
                    Err(p) => (None, Ok(p)),
                }
            }
        }
    }
}

/// The state of an ongoing transfer with one client.
pub enum Transfer<IO: IOAdapter> {
    Tx(TransferTx<IO::R>),
    Rx(TransferRx<IO::W>),
}

impl<IO: IOAdapter> Transfer<IO> {
    pub fn is_done(&self) -> bool {
        match self {
            Transfer::Tx(tx) => tx.done,
            Transfer::Rx(rx) => rx.done,
        }
    }

    /// Processes a received packet and returns the reply/completion status.
    pub fn rx(&mut self, packet: Packet) -> Response {
        match (self, packet) {
            (Transfer::Tx(tx), Packet::ACK(n)) => tx.handle_ack(n),
            (Transfer::Tx(tx), Packet::ERROR { code, msg }) => {
                log::info!("peer reported error {:?} during read transfer: {}", code, msg);
                tx.done = true;
                Response::done()
            }
            (Transfer::Tx(tx), _) => {
                // any opcode other than ACK/ERROR is a protocol error; torn
                // down without a further reply
                tx.done = true;
                Response::done()
            }
            (Transfer::Rx(rx), Packet::DATA { block_num, data }) => {
                rx.handle_data(block_num, &data)
            }
            (Transfer::Rx(rx), Packet::ERROR { code, msg }) => {
                log::info!("peer reported error {:?} during write transfer: {}", code, msg);
                rx.done = true;
                Response::done()
            }
            (Transfer::Rx(rx), _) => {
                rx.done = true;
                Response::packet_then_done(Packet::ERROR {
                    code: ErrorCode::IllegalTFTP,
                    msg: "Expected DATA opcode".into(),
                })
            }
        }
    }
}

pub struct TransferTx<R: Read + Seek> {
    fread: R,
    meta: TransferMeta,
    sent_final: bool,
    done: bool,
}

impl<R: Read + Seek> TransferTx<R> {
    /// Handles `Ack(n)`: the lock-step windowing core of the read path. `n` is
    /// reused directly as the starting block index for the next window,
    /// no independent counter is kept — the engine trusts the peer's ack,
    /// since this is not a retransmission-tolerant design.
    fn handle_ack(&mut self, n: u16) -> Response {
        if self.sent_final {
            self.done = true;
            return Response::done();
        }

        let n = u64::from(n);
        let blksize = u64::from(self.meta.blocksize);
        if self.meta.rsize > 0 && n * blksize >= self.meta.rsize {
            self.done = true;
            return Response::done();
        }

        let mut packets = Vec::new();
        for k in n..n + u64::from(self.meta.window_size) {
            match self.read_step(k) {
                Ok(p) => packets.push(p),
                Err(err_packet) => {
                    self.done = true;
                    return Response {
                        packets: vec![err_packet],
                        done: true,
                    };
                }
            }
            if self.sent_final {
                break;
            }
        }
        Response {
            packets,
            done: false,
        }
    }

    /// Reads and frames the block at 0-based index `k`, applying `seek` and
    /// `rsize` truncation.
    fn read_step(&mut self, k: u64) -> Result<Packet, Packet> {
        let blksize = u64::from(self.meta.blocksize);
        let offset = self.meta.seek + k * blksize;

        let response_size = if self.meta.rsize > 0 && (k + 1) * blksize > self.meta.rsize {
            Some(self.meta.rsize % blksize)
        } else {
            None
        };

        self.fread
            .seek(SeekFrom::Start(offset))
            .map_err(|_| Packet::from(ErrorCode::NotDefined))?;

        let read_len = response_size.unwrap_or(blksize) as usize;
        let mut buf = vec![0u8; read_len];
        let mut total = 0usize;
        while total < buf.len() {
            match self.fread.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => return Err(Packet::from(ErrorCode::NotDefined)),
            }
        }
        buf.truncate(total);

        self.sent_final = response_size.is_some() || (total as u64) < blksize;

        let block_num = (k + 1) as u16;
        Ok(Packet::DATA {
            block_num,
            data: buf,
        })
    }
}

pub struct TransferRx<W: Write> {
    fwrite: W,
    done: bool,
}

impl<W: Write> TransferRx<W> {
    /// Handles a received `Data` block: append sequentially,
    /// ack it, and terminate on a short block.
    ///
    /// The short-block check deliberately uses the literal `512`, not the
    /// negotiated `blocksize`, reproducing a long-standing quirk of the
    /// reference writer bug-for-bug.
    fn handle_data(&mut self, block_num: u16, data: &[u8]) -> Response {
        if self.fwrite.write_all(data).is_err() {
            self.done = true;
            return Response::packet_then_done(ErrorCode::NotDefined.into());
        }

        const LEGACY_BLOCK_LEN: usize = 512;
        if data.len() < LEGACY_BLOCK_LEN {
            self.done = true;
            Response::packet_then_done(Packet::ACK(block_num))
        } else {
            Packet::ACK(block_num).into()
        }
    }
}
