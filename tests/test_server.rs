use assert_matches::*;

use std::borrow::BorrowMut;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tftp_server::packet::TransferMode::Octet;
use tftp_server::packet::{ErrorCode, Packet, TftpOption, MAX_PACKET_SIZE};
use tftp_server::{Config, RewriteRule, TftpError, TftpServer};

use crate::misc_utils::*;

type Result<T> = std::result::Result<T, TftpError>;

/// Starts a server rooted at `serve_dir`, with every logical name served
/// directly from that directory.
fn start_server(serve_dir: &Path, max_connections: Option<usize>) -> Result<Vec<SocketAddr>> {
    let mut cfg = Config {
        addrs: vec![],
        ..Config::default()
    };
    assert!(
        TftpServer::with_cfg(&cfg).is_err(),
        "server creation succeeded without addresses"
    );

    cfg.addrs = vec![
        ("127.0.0.1".parse().unwrap(), None),
        ("127.0.0.1".parse().unwrap(), None),
    ];
    cfg.rules = vec![RewriteRule::new("", serve_dir)];
    cfg.max_connections = max_connections;

    let mut server = TftpServer::with_cfg(&cfg)?;
    let mut addrs = vec![];
    server.get_local_addrs(&mut addrs)?;
    assert_eq!(addrs.len(), cfg.addrs.len(), "wrong number of addresses");
    thread::spawn(move || {
        if let Err(e) = server.run() {
            println!("server error: {:?}", e);
        }
    });

    Ok(addrs)
}

fn assert_files_identical(a: &Path, b: &Path) {
    let buf_a = fs::read(a).unwrap_or_else(|e| panic!("cannot read {:?}: {}", a, e));
    let buf_b = fs::read(b).unwrap_or_else(|e| panic!("cannot read {:?}: {}", b, e));
    assert_eq!(buf_a, buf_b);
}

struct WritingTransfer {
    socket: UdpSocket,
    file: File,
    block_num: u16,
    remote: Option<SocketAddr>,
    blocksize: u64,
}

impl WritingTransfer {
    fn start(
        local_file: &Path,
        server_addr: &SocketAddr,
        server_file: &str,
        options: Vec<TftpOption>,
    ) -> Self {
        let mut blocksize: u64 = 512;
        for opt in &options {
            if let TftpOption::Blocksize(size) = *opt {
                blocksize = u64::from(size);
            }
        }
        let xfer = Self {
            socket: create_socket(Some(Duration::from_secs(TEST_SOCKET_TIMEOUT))).unwrap(),
            file: File::open(local_file)
                .unwrap_or_else(|e| panic!("cannot open {:?}: {}", local_file, e)),
            block_num: 0,
            remote: None,
            blocksize,
        };
        let init_packet = Packet::WRQ {
            filename: server_file.into(),
            mode: Octet,
            options,
        };
        xfer.socket
            .send_to(init_packet.to_bytes().unwrap().as_slice(), server_addr)
            .expect("cannot send initial WRQ");
        xfer
    }

    fn step(&mut self, rx_buf: &mut [u8]) -> Option<()> {
        let (amt, src) = self.socket.recv_from(rx_buf).expect("cannot receive");
        if let Some(remote) = self.remote {
            assert_eq!(remote, src, "transfer source changed");
        } else {
            self.remote = Some(src);
        }
        let received = Packet::read(&rx_buf[0..amt]).unwrap();
        if let Packet::OACK { .. } = received {
            assert_eq!(self.block_num, 0);
        } else {
            assert_eq!(received, Packet::ACK(self.block_num));
        }
        self.block_num = self.block_num.wrapping_add(1);

        let mut data = Vec::with_capacity(self.blocksize as usize);
        let n = self
            .file
            .borrow_mut()
            .take(self.blocksize)
            .read_to_end(&mut data)
            .expect("error reading from local file");
        if n == 0 {
            return None;
        }
        let data_packet = Packet::DATA {
            block_num: self.block_num,
            data,
        };
        self.socket
            .send_to(data_packet.to_bytes().unwrap().as_slice(), &src)
            .expect("cannot send data packet");
        Some(())
    }
}

struct ReadingTransfer {
    socket: UdpSocket,
    file: File,
    block_num: u16,
    remote: Option<SocketAddr>,
    blocksize: u64,
}

impl ReadingTransfer {
    fn start(
        local_file: &Path,
        server_addr: &SocketAddr,
        server_file: &str,
        options: Vec<TftpOption>,
    ) -> Self {
        let mut blocksize: u64 = 512;
        for opt in &options {
            if let TftpOption::Blocksize(size) = *opt {
                blocksize = u64::from(size);
            }
        }
        let xfer = Self {
            socket: create_socket(Some(Duration::from_secs(TEST_SOCKET_TIMEOUT))).unwrap(),
            file: File::create(local_file)
                .unwrap_or_else(|e| panic!("cannot create {:?}: {}", local_file, e)),
            block_num: 1,
            remote: None,
            blocksize,
        };
        let init_packet = Packet::RRQ {
            filename: server_file.into(),
            mode: Octet,
            options,
        };
        xfer.socket
            .send_to(init_packet.to_bytes().unwrap().as_slice(), server_addr)
            .expect("cannot send initial RRQ");
        xfer
    }

    fn step(&mut self, rx_buf: &mut [u8]) -> Option<()> {
        let (amt, src) = self.socket.recv_from(rx_buf).expect("cannot receive");
        if let Some(remote) = self.remote {
            assert_eq!(remote, src, "transfer source changed");
        } else {
            self.remote = Some(src);
        }

        let received = Packet::read(&rx_buf[0..amt]).unwrap();
        match received {
            Packet::OACK { .. } => {
                assert_eq!(self.block_num, 1);
                let ack_packet = Packet::ACK(0);
                self.socket
                    .send_to(ack_packet.to_bytes().unwrap().as_slice(), &src)
                    .expect("cannot ack OACK");
            }
            Packet::DATA { block_num, data } => {
                assert_eq!(self.block_num, block_num);
                self.file.write_all(&data).expect("cannot write local file");

                let ack_packet = Packet::ACK(self.block_num);
                self.socket
                    .send_to(ack_packet.to_bytes().unwrap().as_slice(), &src)
                    .expect("cannot ack data");

                self.block_num = self.block_num.wrapping_add(1);
                if data.len() < self.blocksize as usize {
                    return None;
                }
            }
            other => panic!("unexpected reply packet: {:?}", other),
        }
        Some(())
    }
}

const FIXTURE: &[u8] = b"the quick brown fox jumps over the lazy dog\n";

fn wrq_whole_file_test(dir: &Path, server_addr: &SocketAddr, options: Vec<TftpOption>) {
    let local = dir.join("upload_src.txt");
    fs::write(&local, FIXTURE).unwrap();
    let remote_name = "uploaded.txt";

    let mut scratch_buf = [0; MAX_PACKET_SIZE];
    let mut tx = WritingTransfer::start(&local, server_addr, remote_name, options);
    while tx.step(&mut scratch_buf).is_some() {}

    // a stray packet after completion must not wedge the (already reaped) connection
    tx.socket.send_to(&[1, 2, 3], &tx.remote.unwrap()).unwrap();

    assert_files_identical(&local, &dir.join(remote_name));
}

fn rrq_whole_file_test(dir: &Path, server_addr: &SocketAddr, options: Vec<TftpOption>) {
    let remote_name = "download_src.txt";
    fs::write(dir.join(remote_name), FIXTURE).unwrap();
    let local = dir.join("downloaded.txt");

    let mut scratch_buf = [0; MAX_PACKET_SIZE];
    let mut rx = ReadingTransfer::start(&local, server_addr, remote_name, options);
    while rx.step(&mut scratch_buf).is_some() {}

    rx.socket.send_to(&[1, 2, 3], &rx.remote.unwrap()).unwrap();

    assert_files_identical(&local, &dir.join(remote_name));
}

fn rrq_file_not_found_test(server_addr: &SocketAddr) {
    let socket = create_socket(None).unwrap();
    let init_packet = Packet::RRQ {
        filename: "does-not-exist.bin".into(),
        mode: Octet,
        options: vec![],
    };
    socket
        .send_to(init_packet.into_bytes().unwrap().as_slice(), server_addr)
        .unwrap();

    let mut buf = [0; MAX_PACKET_SIZE];
    let amt = socket.recv(&mut buf).unwrap();
    let packet = Packet::read(&buf[0..amt]).unwrap();
    assert_matches!(
        packet,
        Packet::ERROR {
            code: ErrorCode::FileNotFound,
            ..
        }
    );
}

/// A WRQ for a name that already exists overwrites it rather than failing,
/// since the destination is opened non-exclusively.
fn wrq_overwrites_existing_file_test(dir: &Path, server_addr: &SocketAddr) {
    let remote_name = "overwrite_me.bin";
    fs::write(dir.join(remote_name), b"stale contents").unwrap();

    let local = dir.join("overwrite_src.bin");
    fs::write(&local, b"fresh contents").unwrap();

    let mut scratch_buf = [0; MAX_PACKET_SIZE];
    let mut tx = WritingTransfer::start(&local, server_addr, remote_name, vec![]);
    while tx.step(&mut scratch_buf).is_some() {}

    assert_eq!(fs::read(dir.join(remote_name)).unwrap(), b"fresh contents");
}

fn bad_option_rejected_test(server_addr: &SocketAddr) {
    let socket = create_socket(None).unwrap();
    let mut buf = vec![];
    buf.extend_from_slice(&1u16.to_be_bytes()); // RRQ
    buf.extend_from_slice(b"whatever.bin\0octet\0blksize\0not-a-number\0");
    socket.send_to(&buf, server_addr).unwrap();

    let mut buf = [0; MAX_PACKET_SIZE];
    let amt = socket.recv(&mut buf).unwrap();
    let packet = Packet::read(&buf[0..amt]).unwrap();
    assert_matches!(
        packet,
        Packet::ERROR {
            code: ErrorCode::BadOption,
            ..
        }
    );
}

/// Drives the blksize=8/wsize=2/rsize=20/seek=4 scenario directly, matching
/// the read-side engine's unit test but over the real server/socket stack.
fn windowed_rsize_seek_test(dir: &Path, server_addr: &SocketAddr) {
    let remote_name = "firmware.bin";
    fs::write(dir.join(remote_name), vec![b'A'; 100]).unwrap();

    let socket = create_socket(Some(Duration::from_secs(TEST_SOCKET_TIMEOUT))).unwrap();
    let init_packet = Packet::RRQ {
        filename: remote_name.into(),
        mode: Octet,
        options: vec![
            TftpOption::Blocksize(8),
            TftpOption::WindowSize(2),
            TftpOption::ReadSize(20),
            TftpOption::Seek(4),
        ],
    };
    socket
        .send_to(init_packet.to_bytes().unwrap().as_slice(), server_addr)
        .unwrap();

    let mut buf = [0; MAX_PACKET_SIZE];
    let (amt, src) = socket.recv_from(&mut buf).unwrap();
    assert_matches!(Packet::read(&buf[..amt]).unwrap(), Packet::OACK { .. });
    socket.send_to(&Packet::ACK(0).to_bytes().unwrap(), &src).unwrap();

    let (amt, _) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(
        Packet::read(&buf[..amt]).unwrap(),
        Packet::DATA {
            block_num: 1,
            data: vec![b'A'; 8],
        }
    );
    let (amt, _) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(
        Packet::read(&buf[..amt]).unwrap(),
        Packet::DATA {
            block_num: 2,
            data: vec![b'A'; 8],
        }
    );
    socket.send_to(&Packet::ACK(2).to_bytes().unwrap(), &src).unwrap();

    let (amt, _) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(
        Packet::read(&buf[..amt]).unwrap(),
        Packet::DATA {
            block_num: 3,
            data: vec![b'A'; 4],
        }
    );
    socket.send_to(&Packet::ACK(3).to_bytes().unwrap(), &src).unwrap();

    let deadman = DeadmanThread::start(
        Duration::from_secs(TEST_SOCKET_TIMEOUT + 2),
        "connection not reaped",
    );
    socket.send_to(&[9, 9, 9], &src).unwrap();
    let err = socket.recv_from(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    drop(deadman);
}

fn interleaved_read_read_same_file_test(dir: &Path, server_addr: &SocketAddr) {
    let remote_name = "shared.txt";
    fs::write(dir.join(remote_name), FIXTURE).unwrap();

    let mut scratch_buf = [0; MAX_PACKET_SIZE];
    let local_a = dir.join("read_a.txt");
    let local_b = dir.join("read_b.txt");
    let mut read_a = ReadingTransfer::start(&local_a, server_addr, remote_name, vec![]);
    let mut read_b = ReadingTransfer::start(&local_b, server_addr, remote_name, vec![]);
    loop {
        let res_a = read_a.step(&mut scratch_buf);
        let res_b = read_b.step(&mut scratch_buf);
        assert_eq!(res_a, res_b, "reads finished after a different number of steps");
        if res_a.is_none() {
            break;
        }
    }

    assert_files_identical(&local_a, &dir.join(remote_name));
    assert_files_identical(&local_a, &local_b);
}

fn max_connections_test(dir: &Path) {
    let addrs = start_server(dir, Some(1)).unwrap();
    let server_addr = addrs[0];

    fs::write(dir.join("cap_src.txt"), FIXTURE).unwrap();

    // Start (but never ack, never complete) a transfer to occupy the sole
    // connection slot: with no idle timeout in the core, it stays
    // registered until the client acks it to completion.
    let first = create_socket(Some(Duration::from_secs(TEST_SOCKET_TIMEOUT))).unwrap();
    let init_packet = Packet::RRQ {
        filename: "cap_src.txt".into(),
        mode: Octet,
        options: vec![],
    };
    first
        .send_to(init_packet.to_bytes().unwrap().as_slice(), &server_addr)
        .unwrap();
    let mut scratch_buf = [0; MAX_PACKET_SIZE];
    let amt = first.recv(&mut scratch_buf).unwrap();
    assert_matches!(Packet::read(&scratch_buf[..amt]).unwrap(), Packet::DATA { .. });

    let socket = create_socket(None).unwrap();
    let init_packet = Packet::RRQ {
        filename: "cap_src.txt".into(),
        mode: Octet,
        options: vec![],
    };
    socket
        .send_to(init_packet.into_bytes().unwrap().as_slice(), &server_addr)
        .unwrap();
    let mut buf = [0; MAX_PACKET_SIZE];
    let amt = socket.recv(&mut buf).unwrap();
    assert_matches!(
        Packet::read(&buf[..amt]).unwrap(),
        Packet::ERROR {
            code: ErrorCode::NotDefined,
            ..
        }
    );
}

fn main() {
    env_logger::init();

    let dir = tempfile::tempdir().expect("cannot create scratch directory");
    let addrs = start_server(dir.path(), None).unwrap();
    let server_addr = addrs[0];

    for addr in &addrs {
        wrq_whole_file_test(dir.path(), addr, vec![]);
        rrq_whole_file_test(dir.path(), addr, vec![]);
    }

    for blksize in [8u16, 512, 1428, 8192] {
        wrq_whole_file_test(dir.path(), &server_addr, vec![TftpOption::Blocksize(blksize)]);
        rrq_whole_file_test(dir.path(), &server_addr, vec![TftpOption::Blocksize(blksize)]);
    }

    rrq_file_not_found_test(&server_addr);
    wrq_overwrites_existing_file_test(dir.path(), &server_addr);
    bad_option_rejected_test(&server_addr);
    windowed_rsize_seek_test(dir.path(), &server_addr);
    interleaved_read_read_same_file_test(dir.path(), &server_addr);

    let cap_dir = tempfile::tempdir().expect("cannot create scratch directory");
    max_connections_test(cap_dir.path());

    println!("all tests passed");
}
