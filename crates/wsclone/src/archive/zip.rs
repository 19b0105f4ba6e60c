use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

pub fn write(root: &Path, paths: &[String], dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::msg(format!("failed to create temp file in {}: {e}", dir.display())))?;

    let mut zip = ZipWriter::new(BufWriter::new(tmp.as_file()));
    for rel in paths {
        let src = root.join(rel);
        let mut options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if let Some(mode) = unix_mode(&src) {
            options = options.unix_permissions(mode);
        }
        zip.start_file(rel.as_str(), options)?;
        let mut f = File::open(&src)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", src.display())))?;
        io::copy(&mut f, &mut zip)
            .map_err(|e| Error::msg(format!("failed to add {} to zip: {e}", src.display())))?;
    }
    let mut out = zip.finish()?;
    out.flush()
        .map_err(|e| Error::msg(format!("failed to flush {}: {e}", dest.display())))?;
    drop(out);

    tmp.persist(dest)
        .map_err(|e| Error::msg(format!("failed to write {}: {}", dest.display(), e.error)))?;
    Ok(())
}

pub fn read(archive: &Path, dest_root: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(Error::corrupt(format!(
                "zip entry '{}' in {} escapes the destination",
                entry.name(),
                archive.display()
            )));
        };
        let out = dest_root.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let mut f = File::create(&out)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
        io::copy(&mut entry, &mut f).map_err(|e| super::decode_error(archive, e, false))?;
        if let Some(mode) = entry.unix_mode() {
            set_mode(&out, mode)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn unix_mode(p: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(p).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_p: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(p: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(p, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::msg(format!("failed to set permissions on {}: {e}", p.display())))
}

#[cfg(not(unix))]
fn set_mode(_p: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
