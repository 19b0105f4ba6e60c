//! Include/exclude file selection over a workspace tree.
//!
//! Patterns follow Ant fileset conventions: a pattern list is separated by
//! commas or whitespace, `*` stays inside one path segment, `**` spans any
//! number of directories, and a trailing `/` selects everything below that
//! directory. Matching is done on `/`-separated paths relative to the root.

use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::error::{Error, Result};

/// Include used when the configured include glob is empty.
pub const MATCH_ALL: &str = "**/*";

/// Ant's default excludes: editor leftovers and VCS metadata.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/*~",
    "**/#*#",
    "**/.#*",
    "**/%*%",
    "**/._*",
    "**/CVS",
    "**/CVS/**",
    "**/.cvsignore",
    "**/SCCS",
    "**/SCCS/**",
    "**/vssver.scc",
    "**/.svn",
    "**/.svn/**",
    "**/.DS_Store",
    "**/.git",
    "**/.git/**",
    "**/.gitattributes",
    "**/.gitignore",
    "**/.gitmodules",
    "**/.hg",
    "**/.hg/**",
    "**/.hgignore",
    "**/.hgsub",
    "**/.hgsubstate",
    "**/.hgtags",
    "**/.bzr",
    "**/.bzr/**",
    "**/.bzrignore",
];

const MATCH_OPTS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

const MATCH_OPTS_ANY_CASE: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Result of resolving a filter against a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobResolution {
    /// Relative paths, sorted.
    Matched(Vec<String>),
    /// Nothing selected; carries a message suitable for the build log.
    NoMatch(String),
}

#[derive(Debug, Clone)]
pub struct GlobFilter {
    include_raw: String,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

/// Split a pattern list on commas and whitespace, normalizing each entry.
pub fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_pattern)
        .collect()
}

fn normalize_pattern(p: &str) -> String {
    let mut s = p.replace('\\', "/");
    while let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }
    if s.ends_with('/') {
        s.push_str("**");
    }
    s
}

fn compile(p: &str) -> Result<Pattern> {
    Pattern::new(p).map_err(|e| Error::pattern(format!("invalid pattern '{}': {e}", p)))
}

impl GlobFilter {
    pub fn new(include: &str, exclude: Option<&str>, use_default_excludes: bool) -> Result<Self> {
        let include_raw = if include.trim().is_empty() {
            MATCH_ALL.to_string()
        } else {
            include.trim().to_string()
        };

        let includes = split_patterns(&include_raw)
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        if includes.is_empty() {
            return Err(Error::pattern(format!(
                "include pattern '{}' has no entries",
                include_raw
            )));
        }

        let mut excludes = Vec::new();
        if let Some(raw) = exclude {
            for p in split_patterns(raw) {
                excludes.push(compile(&p)?);
            }
        }
        if use_default_excludes {
            for p in DEFAULT_EXCLUDES {
                excludes.push(compile(p)?);
            }
        }

        Ok(Self {
            include_raw,
            includes,
            excludes,
        })
    }

    /// The effective include list as configured (after the empty default).
    pub fn include(&self) -> &str {
        &self.include_raw
    }

    pub fn is_included(&self, rel: &str) -> bool {
        self.includes.iter().any(|p| p.matches_with(rel, MATCH_OPTS))
    }

    pub fn is_excluded(&self, rel: &str) -> bool {
        self.excludes.iter().any(|p| p.matches_with(rel, MATCH_OPTS))
    }

    pub fn matches(&self, rel: &str) -> bool {
        self.is_included(rel) && !self.is_excluded(rel)
    }

    /// Every selected file below `root`, as sorted relative paths.
    pub fn scan(&self, root: &Path) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for rel in list_files(root)? {
            if self.matches(&rel) {
                out.push(rel);
            }
        }
        Ok(out)
    }

    pub fn resolve(&self, root: &Path) -> Result<GlobResolution> {
        let files = list_files(root)?;
        let matched: Vec<String> = files.iter().filter(|r| self.matches(r)).cloned().collect();
        if !matched.is_empty() {
            return Ok(GlobResolution::Matched(matched));
        }
        Ok(GlobResolution::NoMatch(self.no_match_message(&files)))
    }

    fn no_match_message(&self, files: &[String]) -> String {
        if files.iter().any(|r| self.is_included(r)) {
            return format!(
                "'{}' matches files, but all of them are excluded",
                self.include_raw
            );
        }
        let any_case = files.iter().find(|r| {
            self.includes
                .iter()
                .any(|p| p.matches_with(r, MATCH_OPTS_ANY_CASE))
        });
        match any_case {
            Some(hit) => format!(
                "'{}' doesn't match anything, but '{}' would match ignoring case",
                self.include_raw, hit
            ),
            None => format!("'{}' doesn't match anything", self.include_raw),
        }
    }
}

/// Resolve include/exclude patterns against the tree at `root`.
pub fn resolve(
    root: &Path,
    include: &str,
    exclude: Option<&str>,
    use_default_excludes: bool,
) -> Result<GlobResolution> {
    GlobFilter::new(include, exclude, use_default_excludes)?.resolve(root)
}

/// All regular files (and symlinks to files) below `root`, sorted, `/`-separated.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::msg(format!(
            "workspace directory missing: {}",
            root.display()
        )));
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        if entry.file_type().is_dir() || !p.is_file() {
            continue;
        }
        let rel = p
            .strip_prefix(root)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let mut parts = Vec::new();
        let mut lossy = false;
        for c in rel.components() {
            let os = c.as_os_str();
            match os.to_str() {
                Some(s) => parts.push(s.to_string()),
                None => {
                    lossy = true;
                    break;
                }
            }
        }
        if lossy {
            tracing::warn!(path = %p.display(), "skipping file with non UTF-8 name");
            continue;
        }
        out.push(parts.join("/"));
    }
    out.sort();
    Ok(out)
}
