//! Snapshot creation and extraction through an external `tar` binary.
//!
//! The archive is produced as [`TEMP_ARCHIVE_NAME`] inside the working
//! directory and then moved to its destination; extraction copies the
//! archive back under that name and unpacks it in place. A file of that name
//! that already exists is never touched: the run is refused instead. The
//! temporary file is removed on every exit path.
//!
//! Selection is done by the glob filter, not by tar. When the filter kept
//! every file of a match-all include, tar archives `.`; otherwise it reads
//! the filtered list through `--files-from`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ArchiveSource;
use crate::error::{Error, Result};
use crate::glob::{MATCH_ALL, list_files};
use crate::process::{Launcher, SystemLauncher};

pub const TEMP_ARCHIVE_NAME: &str = "tmp.tar";
pub const DEFAULT_PROGRAM: &str = "tar";

/// What tar is asked to archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Members<'a> {
    /// The whole working directory, as `.`.
    WholeTree,
    /// NUL-separated relative paths read from this file.
    Listed(&'a Path),
}

#[derive(Clone)]
pub struct NativeTar {
    launcher: Arc<dyn Launcher>,
    program: String,
}

impl NativeTar {
    pub fn new(launcher: Arc<dyn Launcher>, program: impl Into<String>) -> Self {
        Self {
            launcher,
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Archive the selected files of `src.root` into `dest`.
    pub fn archive(&self, src: &ArchiveSource<'_>, dest: &Path) -> Result<()> {
        if src.paths.is_empty() {
            return Err(Error::msg("nothing to archive"));
        }
        let tmp = TempArchive::claim(src.root.join(TEMP_ARCHIVE_NAME))?;

        let whole_tree =
            src.include.trim() == MATCH_ALL && list_files(src.root)?.len() == src.paths.len();
        if whole_tree {
            self.run_archive(src.root, Members::WholeTree)?;
        } else {
            let list_dir = dest.parent().unwrap_or_else(|| Path::new("."));
            let list = write_member_list(list_dir, src.paths)?;
            let list_path = std::path::absolute(list.path()).map_err(|e| {
                Error::msg(format!("failed to resolve {}: {e}", list.path().display()))
            })?;
            self.run_archive(src.root, Members::Listed(&list_path))?;
        }
        move_file(tmp.path(), dest)?;
        Ok(())
    }

    /// Extract `archive` into `dest_root` using the external tool.
    pub fn extract(&self, archive: &Path, dest_root: &Path) -> Result<()> {
        let tmp = TempArchive::claim(dest_root.join(TEMP_ARCHIVE_NAME))?;
        fs::copy(archive, tmp.path()).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                archive.display(),
                tmp.path().display()
            ))
        })?;
        self.run_extract(dest_root)
    }

    /// `tar --anchored --exclude=./tmp.tar -cf tmp.tar MEMBERS`
    pub fn run_archive(&self, working_dir: &Path, members: Members<'_>) -> Result<()> {
        let args = archive_args(members);
        self.run(working_dir, &args, "archive")
    }

    /// `tar -xf tmp.tar`
    pub fn run_extract(&self, working_dir: &Path) -> Result<()> {
        let args = vec!["-xf".to_string(), TEMP_ARCHIVE_NAME.to_string()];
        self.run(working_dir, &args, "extract")
    }

    fn run(&self, working_dir: &Path, args: &[String], what: &str) -> Result<()> {
        if !working_dir.is_dir() {
            return Err(Error::process(format!(
                "working directory missing: {}",
                working_dir.display()
            )));
        }
        let code = self.launcher.launch(working_dir, &self.program, args)?;
        if code != 0 {
            return Err(Error::process(format!(
                "{} failed to {what} in {} (exit code {code})",
                self.program,
                working_dir.display()
            )));
        }
        Ok(())
    }
}

impl Default for NativeTar {
    fn default() -> Self {
        Self::new(Arc::new(SystemLauncher::default()), DEFAULT_PROGRAM)
    }
}

/// The self-exclusion is anchored, so only the top-level temp archive is
/// skipped and a nested `tmp.tar` is kept.
pub fn archive_args(members: Members<'_>) -> Vec<String> {
    let mut args = vec![
        "--anchored".to_string(),
        format!("--exclude=./{TEMP_ARCHIVE_NAME}"),
        "-cf".to_string(),
        TEMP_ARCHIVE_NAME.to_string(),
    ];
    match members {
        Members::WholeTree => {
            args.push("--".into());
            args.push(".".into());
        }
        Members::Listed(list) => {
            args.push("--null".into());
            args.push("--verbatim-files-from".into());
            args.push(format!("--files-from={}", list.display()));
        }
    }
    args
}

fn write_member_list(dir: &Path, paths: &[String]) -> Result<tempfile::NamedTempFile> {
    let mut list = tempfile::Builder::new()
        .prefix(".wsclone-members-")
        .tempfile_in(dir)
        .map_err(|e| Error::msg(format!("failed to create member list in {}: {e}", dir.display())))?;
    let mut body = Vec::new();
    for p in paths {
        body.extend_from_slice(p.as_bytes());
        body.push(0);
    }
    list.write_all(&body)
        .and_then(|()| list.flush())
        .map_err(|e| Error::msg(format!("failed to write member list: {e}")))?;
    Ok(list)
}

struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    /// Fails when something already sits at `path`; it belongs to the user.
    fn claim(path: PathBuf) -> Result<Self> {
        if fs::symlink_metadata(&path).is_ok() {
            return Err(Error::process(format!(
                "{} already exists, refusing to overwrite it",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temporary archive")
            }
        }
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if !from.is_file() {
        return Err(Error::msg(format!(
            "archiver produced no output at {}",
            from.display()
        )));
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-device: copy, the temp guard removes the source.
    fs::copy(from, to).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            from.display(),
            to.display()
        ))
    })?;
    Ok(())
}
