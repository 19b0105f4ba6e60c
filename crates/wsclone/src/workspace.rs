use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::glob::{GlobFilter, GlobResolution};

fn default_store_root() -> String {
    ".wsclone".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: default_store_root(),
        }
    }
}

impl StoreConfig {
    // Relative roots are taken from the directory holding the config file.
    pub fn resolve_root(&self, config_path: &Path) -> Result<PathBuf> {
        let base = match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?,
        };
        resolve_user_path(&base, &self.root_dir)
    }
}

/// Handle on a build's working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::msg(format!(
                "workspace directory missing: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `None` when the patterns select at least one file, otherwise the
    /// reason nothing was selected.
    pub fn validate_file_mask(
        &self,
        include: &str,
        exclude: Option<&str>,
        use_default_excludes: bool,
    ) -> Result<Option<String>> {
        let filter = GlobFilter::new(include, exclude, use_default_excludes)?;
        Ok(match filter.resolve(&self.root)? {
            GlobResolution::Matched(_) => None,
            GlobResolution::NoMatch(msg) => Some(msg),
        })
    }
}

pub fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

/// Check that a name can be used as a single directory component.
pub fn safe_component(kind: &str, raw: &str) -> Result<String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::config(format!("{kind} is empty")));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::config(format!(
            "{kind} '{}' contains invalid characters (allowed: a-zA-Z0-9._-)",
            s
        )));
    }
    let pb = Path::new(s);
    if pb
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::config(format!("{kind} '{}' is not a plain name", s)));
    }
    Ok(s.to_string())
}
