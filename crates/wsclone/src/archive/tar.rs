use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

pub fn write(root: &Path, paths: &[String], dest: &Path, compression: Compression) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::msg(format!("failed to create temp file in {}: {e}", dir.display())))?;

    {
        let out = BufWriter::new(tmp.as_file());
        match compression {
            Compression::None => {
                let mut w = append_all(::tar::Builder::new(out), root, paths)?;
                w.flush()
                    .map_err(|e| Error::msg(format!("failed to flush {}: {e}", dest.display())))?;
            }
            Compression::Gzip => {
                let enc = GzEncoder::new(out, flate2::Compression::default());
                let enc = append_all(::tar::Builder::new(enc), root, paths)?;
                let mut w = enc.finish().map_err(|e| {
                    Error::msg(format!("failed to finish gzip stream {}: {e}", dest.display()))
                })?;
                w.flush()
                    .map_err(|e| Error::msg(format!("failed to flush {}: {e}", dest.display())))?;
            }
        }
    }

    tmp.persist(dest)
        .map_err(|e| Error::msg(format!("failed to write {}: {}", dest.display(), e.error)))?;
    Ok(())
}

fn append_all<W: Write>(mut builder: ::tar::Builder<W>, root: &Path, paths: &[String]) -> Result<W> {
    for rel in paths {
        let src = root.join(rel);
        builder
            .append_path_with_name(&src, rel)
            .map_err(|e| Error::msg(format!("failed to add {} to tar: {e}", src.display())))?;
    }
    builder
        .into_inner()
        .map_err(|e| Error::msg(format!("failed to finish tar stream: {e}")))
}

pub fn read(archive: &Path, dest_root: &Path, compression: Compression) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
    let reader = BufReader::new(file);
    match compression {
        Compression::None => unpack(reader, archive, dest_root),
        Compression::Gzip => unpack(GzDecoder::new(reader), archive, dest_root),
    }
}

fn unpack<R: Read>(reader: R, archive: &Path, dest_root: &Path) -> Result<()> {
    let mut ar = ::tar::Archive::new(reader);
    let entries = ar
        .entries()
        .map_err(|e| super::decode_error(archive, e, true))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| super::decode_error(archive, e, true))?;
        let unpacked = entry
            .unpack_in(dest_root)
            .map_err(|e| super::decode_error(archive, e, false))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(Error::corrupt(format!(
                "tar entry '{}' in {} escapes the destination",
                name,
                archive.display()
            )));
        }
    }
    Ok(())
}
