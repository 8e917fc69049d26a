use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tftp_server::{Config, RewriteRule, TftpServer};

/// A TFTP-derived file transfer server for coprocessor datagram transports.
#[derive(Parser, Debug)]
#[command(name = "tqftpd", version, about)]
struct Cli {
    /// Address[:port] to listen on; may be given more than once.
    #[arg(short = 'a', long = "address", value_name = "IPADDR[:PORT]")]
    address: Vec<String>,

    /// Rejects all write requests.
    #[arg(short = 'r', long)]
    readonly: bool,

    /// Directory to serve files from; shorthand for a single rewrite rule
    /// mapping the empty logical prefix onto this directory. Overridden by
    /// a `--rules` file's own rule table, if given.
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    dir: Option<PathBuf>,

    /// TOML file with path-translation rules and decompression settings.
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Maximum number of concurrent transfers.
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,
}

fn parse_addr(s: &str) -> (IpAddr, Option<u16>) {
    if let Ok(sk) = SocketAddr::from_str(s) {
        (sk.ip(), Some(sk.port()))
    } else if let Ok(ip) = IpAddr::from_str(s) {
        (ip, None)
    } else {
        panic!("error parsing argument \"{}\" as an ip address", s);
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let mut cfg = Config::default();
    if let Some(dir) = &cli.dir {
        cfg.rules = vec![RewriteRule::new("", dir.clone())];
    }
    if let Some(rules_path) = &cli.rules {
        cfg = cfg
            .merge_file(rules_path)
            .unwrap_or_else(|e| panic!("error loading {:?}: {}", rules_path, e));
    }
    cfg.readonly = cli.readonly;
    if let Some(max) = cli.max_connections {
        cfg.max_connections = Some(max);
    }
    if !cli.address.is_empty() {
        cfg.addrs = cli.address.iter().map(|s| parse_addr(s)).collect();
    }

    let mut server = TftpServer::with_cfg(&cfg).expect("error creating server");

    match server.run() {
        Ok(()) => {}
        Err(e) => eprintln!("server error: {:?}", e),
    }
}
