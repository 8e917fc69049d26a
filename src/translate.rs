//! Path translation: rewrites the flat logical filenames a
//! coprocessor requests onto host filesystem paths via a configurable,
//! ordered set of prefix rewrites, with on-the-fly decompression of
//! compressed artifacts.
//!
//! Grounded on a `translate_open()`-style contract and an
//! `IOPolicyProxy`-style traversal check.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::decompress::Decompressor;

/// A single logical-prefix -> host-prefix rewrite, tried in the order given.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub logical_prefix: String,
    pub host_prefix: PathBuf,
}

impl RewriteRule {
    pub fn new(logical_prefix: impl Into<String>, host_prefix: impl Into<PathBuf>) -> Self {
        Self {
            logical_prefix: logical_prefix.into(),
            host_prefix: host_prefix.into(),
        }
    }

    fn rewrite(&self, logical_name: &str) -> Option<PathBuf> {
        let rest = logical_name.strip_prefix(&self.logical_prefix)?;
        Some(self.host_prefix.join(rest.trim_start_matches('/')))
    }
}

/// Failure modes distinguished so the engine can pick the right TFTP error
/// code.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("file not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<TranslateError> for crate::packet::ErrorCode {
    fn from(e: TranslateError) -> Self {
        use crate::packet::ErrorCode::*;
        match e {
            TranslateError::NotFound => FileNotFound,
            TranslateError::PermissionDenied => AccessViolation,
            TranslateError::Io(_) => NotDefined,
        }
    }
}

/// A file opened through the translator: either the host file directly, or
/// an anonymous temp file holding a decompressed artifact.
pub struct Opened {
    pub file: File,
    /// Known length, when cheaply available (always known for reads; used
    /// to answer `tsize`).
    pub len: Option<u64>,
}

pub struct PathTranslator<D: Decompressor> {
    rules: Vec<RewriteRule>,
    compressed_suffix: String,
    decompressor: D,
}

impl<D: Decompressor> PathTranslator<D> {
    pub fn new(rules: Vec<RewriteRule>, compressed_suffix: impl Into<String>, decompressor: D) -> Self {
        Self {
            rules,
            compressed_suffix: compressed_suffix.into(),
            decompressor,
        }
    }

    fn rewrite(&self, logical_name: &str) -> Result<PathBuf, TranslateError> {
        if is_unsafe(logical_name) {
            return Err(TranslateError::PermissionDenied);
        }
        self.rules
            .iter()
            .find_map(|rule| rule.rewrite(logical_name))
            .ok_or(TranslateError::NotFound)
    }

    /// Opens `logical_name` for reading. Falls back to decompressing a
    /// `<path>.<compressed_suffix>` sibling when the plain host path is
    /// absent.
    pub fn open_read(&self, logical_name: &str) -> Result<Opened, TranslateError> {
        let host_path = self.rewrite(logical_name)?;

        match File::open(&host_path) {
            Ok(file) => {
                let len = file.metadata().ok().map(|m| m.len());
                Ok(Opened { file, len })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let compressed = sibling_with_suffix(&host_path, &self.compressed_suffix);
                if compressed.exists() {
                    let (file, len) = self.decompressor.decompress(&compressed)?;
                    Ok(Opened {
                        file,
                        len: Some(len),
                    })
                } else {
                    Err(TranslateError::NotFound)
                }
            }
            Err(e) => Err(classify_io(e)),
        }
    }

    /// Opens `logical_name` for writing, creating it if needed and
    /// truncating if it already exists (`O_WRONLY | O_CREAT`, not an
    /// exclusive create — a WRQ overwrites whatever was there).
    pub fn open_write(&self, logical_name: &str) -> Result<File, TranslateError> {
        let host_path = self.rewrite(logical_name)?;
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).map_err(classify_io)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host_path)
            .map_err(classify_io)?;
        file.seek(io::SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Removes a just-created file. Used to clean up a WRQ's destination
    /// when the per-transfer socket cannot be connected after the file was
    /// opened.
    pub fn remove(&self, logical_name: &str) -> Result<(), TranslateError> {
        let host_path = self.rewrite(logical_name)?;
        fs::remove_file(&host_path).map_err(classify_io)
    }
}

fn classify_io(e: io::Error) -> TranslateError {
    match e.kind() {
        io::ErrorKind::NotFound => TranslateError::NotFound,
        io::ErrorKind::PermissionDenied => TranslateError::PermissionDenied,
        _ => TranslateError::Io(e),
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn is_unsafe(logical_name: &str) -> bool {
    let p = Path::new(logical_name);
    p.is_absolute()
        || p.components()
            .any(|c| matches!(c, Component::RootDir | Component::ParentDir))
}
