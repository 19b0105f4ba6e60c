//! Snapshot orchestration: criterion gate, file selection, archiving into the
//! build's storage directory and pruning of the snapshot it supersedes.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveMethod, ArchiveSource, NativeTar};
use crate::config::SnapshotSection;
use crate::criteria::{BuildResult, Criterion};
use crate::error::{Error, Result};
use crate::expand::{VarExpander, expand_or_raw};
use crate::archive::remove_partial;
use crate::glob::{GlobFilter, GlobResolution, MATCH_ALL};
use crate::retention::{BuildSummary, find_previous_snapshot};
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId {
    pub job: String,
    pub number: u64,
}

impl BuildId {
    pub fn new(job: impl Into<String>, number: u64) -> Self {
        Self {
            job: job.into(),
            number,
        }
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

/// Finds the storage directory of a build.
pub trait BuildLocator {
    fn root_dir(&self, id: &BuildId) -> Result<PathBuf>;
}

/// The descriptor slot of build records.
///
/// A snapshot is attached before the one it supersedes is pruned, so a
/// failed attach never leaves the job without a usable snapshot.
pub trait SnapshotRegistry {
    fn attach(&self, descriptor: &SnapshotDescriptor) -> Result<()>;
    fn detach(&self, owner: &BuildId) -> Result<()>;
}

/// Marker attached to a build that holds a snapshot.
///
/// Everything needed to find the archive again is the owning build and the
/// method, so the descriptor can be persisted and rebuilt freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub owner: BuildId,
    pub method: ArchiveMethod,
}

impl SnapshotDescriptor {
    pub fn archive_path(&self, locator: &dyn BuildLocator) -> Result<PathBuf> {
        Ok(locator.root_dir(&self.owner)?.join(self.method.file_name()))
    }

    /// Unpack the snapshot into `dest`. Failures are returned to the caller.
    pub fn restore(&self, locator: &dyn BuildLocator, native: &NativeTar, dest: &Path) -> Result<()> {
        let archive = self.archive_path(locator)?;
        tracing::info!(
            owner = %self.owner,
            method = %self.method,
            dest = %dest.display(),
            "restoring workspace snapshot"
        );
        self.method.read(native, &archive, dest)
    }
}

/// User configuration of the snapshot step; fixed before any build runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    include: String,
    exclude: Option<String>,
    criterion: Criterion,
    method: ArchiveMethod,
    override_default_excludes: bool,
}

impl SnapshotConfig {
    pub fn new(
        include: &str,
        exclude: Option<&str>,
        criterion: Criterion,
        method: ArchiveMethod,
        override_default_excludes: bool,
    ) -> Self {
        Self {
            include: include.trim().to_string(),
            exclude: exclude
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            criterion,
            method,
            override_default_excludes,
        }
    }

    pub fn from_section(section: &SnapshotSection) -> Result<Self> {
        let criterion = match section.criteria.as_deref() {
            Some(raw) => raw.parse()?,
            None => Criterion::default(),
        };
        let method = match section.archive_method.as_deref() {
            Some(raw) => raw.parse()?,
            None => ArchiveMethod::default(),
        };
        Ok(Self::new(
            &section.include,
            section.exclude.as_deref(),
            criterion,
            method,
            section.override_default_excludes,
        ))
    }

    pub fn include(&self) -> &str {
        &self.include
    }

    pub fn exclude(&self) -> Option<&str> {
        self.exclude.as_deref()
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn method(&self) -> ArchiveMethod {
        self.method
    }

    pub fn override_default_excludes(&self) -> bool {
        self.override_default_excludes
    }
}

/// The build whose workspace is being snapshotted.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub id: BuildId,
    /// `None` while the build has not settled on a result.
    pub result: Option<BuildResult>,
    pub root_dir: PathBuf,
}

#[derive(Debug)]
pub enum SnapshotOutcome {
    /// The build result is below the configured criterion.
    Skipped { threshold: BuildResult },
    /// The include pattern selected no files.
    NoMatch { message: String },
    Archived {
        descriptor: SnapshotDescriptor,
        files: usize,
        /// Earlier build whose archive was deleted and descriptor detached.
        pruned: Option<BuildId>,
    },
    /// Archiving failed; logged, the build itself is not failed.
    Failed { error: Error },
}

pub struct SnapshotManager<'a> {
    config: &'a SnapshotConfig,
    native: &'a NativeTar,
    expander: &'a dyn VarExpander,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(
        config: &'a SnapshotConfig,
        native: &'a NativeTar,
        expander: &'a dyn VarExpander,
    ) -> Self {
        Self {
            config,
            native,
            expander,
        }
    }

    /// Snapshot the workspace of a completed build.
    ///
    /// `history` yields earlier builds of the same job, newest first. The new
    /// descriptor is attached through `registry` before the superseded
    /// snapshot is pruned and detached. Only an unavailable workspace, an
    /// invalid pattern or cancellation are returned as errors; archive and
    /// attach failures come back as [`SnapshotOutcome::Failed`].
    pub fn snapshot<H>(
        &self,
        build: &BuildContext,
        workspace: Option<&Workspace>,
        history: H,
        registry: &dyn SnapshotRegistry,
    ) -> Result<SnapshotOutcome>
    where
        H: IntoIterator<Item = BuildSummary>,
    {
        let include = if self.config.include.is_empty() {
            MATCH_ALL.to_string()
        } else {
            expand_or_raw(self.expander, &self.config.include)
        };
        let exclude = self
            .config
            .exclude
            .as_deref()
            .map(|raw| expand_or_raw(self.expander, raw));

        let criterion = self.config.criterion;
        if !criterion.accepts(build.result) {
            tracing::info!(
                build = %build.id,
                criteria = %criterion,
                threshold = %criterion.threshold(),
                "build result does not meet criteria, workspace not archived"
            );
            return Ok(SnapshotOutcome::Skipped {
                threshold: criterion.threshold(),
            });
        }

        tracing::info!(build = %build.id, method = %self.config.method, "archiving workspace");
        let Some(ws) = workspace else {
            return Err(Error::msg(format!(
                "workspace for {} is unavailable",
                build.id
            )));
        };

        let use_default_excludes = !self.config.override_default_excludes;
        let filter = GlobFilter::new(&include, exclude.as_deref(), use_default_excludes)?;
        let paths = match filter.resolve(ws.root()) {
            Ok(GlobResolution::Matched(paths)) => paths,
            Ok(GlobResolution::NoMatch(message)) => {
                tracing::warn!(build = %build.id, include = %include, "no files matched: {message}");
                return Ok(SnapshotOutcome::NoMatch { message });
            }
            Err(error) => return Ok(self.failed(build, &include, error)),
        };

        let src = ArchiveSource {
            root: ws.root(),
            paths: &paths,
            include: filter.include(),
        };
        let method = self.config.method;
        let dest = build.root_dir.join(method.file_name());
        if let Err(error) = method.write(self.native, &src, &dest) {
            if error.is_cancelled() {
                return Err(error);
            }
            return Ok(self.failed(build, &include, error));
        }
        tracing::info!(
            build = %build.id,
            files = paths.len(),
            archive = %dest.display(),
            "workspace archived"
        );

        let descriptor = SnapshotDescriptor {
            owner: build.id.clone(),
            method,
        };
        if let Err(error) = registry.attach(&descriptor) {
            remove_partial(&dest);
            return Ok(self.failed(build, &include, error));
        }

        let previous = history.into_iter().filter(|b| b.id != build.id);
        let pruned = find_previous_snapshot(previous, criterion, method)
            .and_then(|prev| prune(&prev, method));
        if let Some(old) = &pruned
            && let Err(e) = registry.detach(old)
        {
            tracing::warn!(build = %old, error = %e, "failed to detach pruned snapshot");
        }

        Ok(SnapshotOutcome::Archived {
            descriptor,
            files: paths.len(),
            pruned,
        })
    }

    pub fn restore(
        &self,
        descriptor: &SnapshotDescriptor,
        locator: &dyn BuildLocator,
        dest: &Path,
    ) -> Result<()> {
        descriptor.restore(locator, self.native, dest)
    }

    fn failed(&self, build: &BuildContext, include: &str, error: Error) -> SnapshotOutcome {
        tracing::error!(
            build = %build.id,
            include,
            kind = %error.kind(),
            error = %error,
            "failed to archive workspace"
        );
        SnapshotOutcome::Failed { error }
    }
}

// Best effort: a failed delete is logged and the snapshot is kept.
fn prune(prev: &BuildSummary, method: ArchiveMethod) -> Option<BuildId> {
    let path = prev.archive_path(method);
    tracing::info!(build = %prev.id, archive = %path.display(), "deleting old workspace snapshot");
    match fs::remove_file(&path) {
        Ok(()) => Some(prev.id.clone()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Some(prev.id.clone()),
        Err(e) => {
            tracing::error!(build = %prev.id, archive = %path.display(), error = %e, "failed to delete old snapshot");
            None
        }
    }
}
