//! TOML configuration for the `wsclone` tool.
//!
//! A config file may pull in others: a root-level `extends = "base.toml"`
//! names a single parent, and any table may list `imports = [...]` whose
//! contents are merged underneath the local keys.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::archive::native::DEFAULT_PROGRAM;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotConfig;
use crate::workspace::StoreConfig;

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

/// `[snapshot]` as written by the user; validated by [`SnapshotConfig::from_section`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub include: String,
    pub exclude: Option<String>,
    pub criteria: Option<String>,
    pub archive_method: Option<String>,
    pub override_default_excludes: bool,
}

fn default_program() -> String {
    DEFAULT_PROGRAM.into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeTarSection {
    #[serde(default = "default_program")]
    pub program: String,
}

impl Default for NativeTarSection {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

/// Everything the CLI needs, resolved from a [`ConfigDoc`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_root: PathBuf,
    pub snapshot: SnapshotConfig,
    pub tar_program: String,
}

impl Settings {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let store: StoreConfig = doc.deserialize_path("store")?.unwrap_or_default();
        let section: SnapshotSection = doc.deserialize_path("snapshot")?.unwrap_or_default();
        let native: NativeTarSection = doc.deserialize_path("native_tar")?.unwrap_or_default();
        let program = native.program.trim();
        if program.is_empty() {
            return Err(Error::config("native_tar.program is empty"));
        }
        Ok(Self {
            store_root: store.resolve_root(&doc.path)?,
            snapshot: SnapshotConfig::from_section(&section)?,
            tar_program: program.to_string(),
        })
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::config(format!(
            "invalid imports in {} (expected array of strings)",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        if !s.trim().is_empty() {
            out.push(s.trim().to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value(&resolve_ref_path(file, &imp), stack)?;
            merge(&mut acc, loaded);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let parent = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .and_then(|v| v.as_str().map(ToOwned::to_owned));
    if let Some(ext) = parent {
        out = load_value(&resolve_ref_path(path, &ext), stack)?;
    }

    inline_imports(path, &mut value, stack)?;
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
