use std::io::{self, Write};

/// Largest `blksize` a single datagram on the transport is assumed to carry.
pub const MAX_BLOCKSIZE: u32 = 65_464;

/// Negotiable transfer options. Values are always decoded via
/// [`parse_decimal`], which mimics libc `atoi`: leading whitespace is
/// skipped, an optional sign is read, digits are consumed until the first
/// non-digit, and anything after that is silently ignored, for
/// compatibility with the coprocessor's option encoder.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum TftpOption {
    Blocksize(u16),
    TimeoutMs(u32),
    TransferSize(u64),
    WindowSize(u16),
    ReadSize(u64),
    Seek(u64),
}

impl TftpOption {
    pub fn write_to(&self, buf: &mut impl Write) -> io::Result<()> {
        use self::TftpOption::*;
        match *self {
            Blocksize(size) => write!(buf, "blksize\0{}\0", size),
            TimeoutMs(ms) => write!(buf, "timeoutms\0{}\0", ms),
            TransferSize(size) => write!(buf, "tsize\0{}\0", size),
            WindowSize(size) => write!(buf, "wsize\0{}\0", size),
            ReadSize(size) => write!(buf, "rsize\0{}\0", size),
            Seek(off) => write!(buf, "seek\0{}\0", off),
        }
    }

    /// Parses a single `name`/`value` option pair. Returns `Ok(None)` for
    /// unrecognized option names (ignored), and `Err` when the
    /// name is known but the decoded value is out of range for that option.
    pub fn try_from(name: &str, value: &str) -> Result<Option<Self>, BadOption> {
        let n = parse_decimal(value);
        if "blksize".eq_ignore_ascii_case(name) {
            let v = in_range(n, 8, u64::from(MAX_BLOCKSIZE))?;
            Ok(Some(TftpOption::Blocksize(v as u16)))
        } else if "timeoutms".eq_ignore_ascii_case(name) {
            let v = in_range(n, 1, u64::from(u32::MAX))?;
            Ok(Some(TftpOption::TimeoutMs(v as u32)))
        } else if "tsize".eq_ignore_ascii_case(name) {
            let v = in_range(n, 0, u64::MAX)?;
            Ok(Some(TftpOption::TransferSize(v)))
        } else if "wsize".eq_ignore_ascii_case(name) {
            let v = in_range(n, 1, u64::from(u16::MAX))?;
            Ok(Some(TftpOption::WindowSize(v as u16)))
        } else if "rsize".eq_ignore_ascii_case(name) {
            let v = in_range(n, 0, u64::MAX)?;
            Ok(Some(TftpOption::ReadSize(v)))
        } else if "seek".eq_ignore_ascii_case(name) {
            let v = in_range(n, 0, u64::MAX)?;
            Ok(Some(TftpOption::Seek(v)))
        } else {
            Ok(None)
        }
    }
}

/// An option name was recognized but its value fell outside the acceptable
/// range for that option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadOption;

fn in_range(n: Option<u64>, lo: u64, hi: u64) -> Result<u64, BadOption> {
    match n {
        Some(v) if v >= lo && v <= hi => Ok(v),
        _ => Err(BadOption),
    }
}

/// Permissive decimal parse matching libc `atoi`: skips leading ASCII
/// whitespace, reads an optional `+`/`-` sign, then consumes digits until a
/// non-digit is seen (trailing garbage is ignored, not an error). Returns
/// `None` when no digits were found at all, or the value does not fit a
/// `u64` (treated as out of range rather than wrapping).
fn parse_decimal(s: &str) -> Option<u64> {
    let s = s.trim_start();
    let mut chars = s.chars().peekable();
    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };

    let mut digits = String::new();
    for c in chars {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            break;
        }
    }
    if digits.is_empty() {
        return None;
    }
    if negative {
        // Every TFTP option here is non-negative; a negative literal
        // is out of range for all of them.
        return None;
    }
    digits.parse::<u64>().ok()
}
