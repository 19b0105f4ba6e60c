//! Archive codecs for workspace snapshots.
//!
//! Every method owns one reserved file name inside a build's storage
//! directory, so a snapshot can be found again from the method alone.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod native;
pub mod tar;
pub mod zip;

pub use native::NativeTar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveMethod {
    Zip,
    #[default]
    TarGzip,
    TarPlain,
    NativeTar,
}

/// What gets archived: the tree root, the filtered file list and the
/// include that produced it.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSource<'a> {
    pub root: &'a Path,
    pub paths: &'a [String],
    pub include: &'a str,
}

impl ArchiveMethod {
    pub const ALL: [ArchiveMethod; 4] = [
        ArchiveMethod::Zip,
        ArchiveMethod::TarGzip,
        ArchiveMethod::TarPlain,
        ArchiveMethod::NativeTar,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ArchiveMethod::Zip => "workspace.zip",
            ArchiveMethod::TarGzip => "workspace.tar.gz",
            ArchiveMethod::TarPlain => "workspace.tar",
            ArchiveMethod::NativeTar => "workspace-native.tar",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveMethod::Zip => "ZIP",
            ArchiveMethod::TarGzip => "TAR",
            ArchiveMethod::TarPlain => "TARONLY",
            ArchiveMethod::NativeTar => "TAR-NATIVE",
        }
    }

    /// Archive `src` into `dest`. A failed write leaves no file at `dest`.
    pub fn write(self, native: &NativeTar, src: &ArchiveSource<'_>, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let res = match self {
            ArchiveMethod::Zip => zip::write(src.root, src.paths, dest),
            ArchiveMethod::TarGzip => tar::write(src.root, src.paths, dest, tar::Compression::Gzip),
            ArchiveMethod::TarPlain => tar::write(src.root, src.paths, dest, tar::Compression::None),
            ArchiveMethod::NativeTar => native.archive(src, dest).map_err(Error::into_io),
        };
        if res.is_err() {
            remove_partial(dest);
        }
        res
    }

    /// Extract `archive` into `dest_root`, creating it if needed.
    pub fn read(self, native: &NativeTar, archive: &Path, dest_root: &Path) -> Result<()> {
        if !archive.is_file() {
            return Err(Error::msg(format!(
                "snapshot archive missing: {}",
                archive.display()
            )));
        }
        fs::create_dir_all(dest_root)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest_root.display())))?;
        match self {
            ArchiveMethod::Zip => zip::read(archive, dest_root),
            ArchiveMethod::TarGzip => tar::read(archive, dest_root, tar::Compression::Gzip),
            ArchiveMethod::TarPlain => tar::read(archive, dest_root, tar::Compression::None),
            ArchiveMethod::NativeTar => native.extract(archive, dest_root).map_err(Error::into_io),
        }
    }
}

impl fmt::Display for ArchiveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        match norm.as_str() {
            "zip" => Ok(ArchiveMethod::Zip),
            "tar" | "tar-gzip" | "tar.gz" | "tgz" => Ok(ArchiveMethod::TarGzip),
            "taronly" | "tar-plain" | "tar-only" => Ok(ArchiveMethod::TarPlain),
            "tar-native" | "native-tar" => Ok(ArchiveMethod::NativeTar),
            _ => Err(Error::config(format!(
                "unknown archive method '{}' (expected ZIP, TAR, TARONLY or TAR-NATIVE)",
                s.trim()
            ))),
        }
    }
}

pub(crate) fn remove_partial(dest: &Path) {
    match fs::remove_file(dest) {
        Ok(()) => tracing::debug!(path = %dest.display(), "removed partial archive"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial archive")
        }
    }
}

/// Classify an error raised while decoding an archive.
pub(crate) fn decode_error(archive: &Path, e: io::Error, container_read: bool) -> Error {
    let corrupt = match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            true
        }
        io::ErrorKind::Other => container_read,
        _ => false,
    };
    if corrupt {
        Error::corrupt(format!("unreadable archive {}: {e}", archive.display()))
    } else {
        Error::msg(format!("failed to extract {}: {e}", archive.display()))
    }
}
