#![deny(clippy::all)]
#![deny(clippy::pedantic)]

mod config;
mod decompress;
mod options;
pub mod packet;
mod tftp_proto;
mod tftp_server;
mod transport;
mod translate;

pub use config::{Config, ConfigError};
pub use decompress::{Decompressor, ZstdDecompressor};
pub use tftp_server::{FSAdapter, ServerImpl, TftpError, TftpServer};
pub use transport::{ControlEvent, CONTROL_PORT};
pub use translate::{PathTranslator, RewriteRule, TranslateError};
