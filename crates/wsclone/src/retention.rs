use std::path::PathBuf;

use crate::archive::ArchiveMethod;
use crate::criteria::{BuildResult, Criterion};
use crate::snapshot::BuildId;

/// What the retention walk needs to know about an earlier build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub id: BuildId,
    pub result: Option<BuildResult>,
    pub root_dir: PathBuf,
    pub snapshot: Option<ArchiveMethod>,
}

impl BuildSummary {
    pub fn has_snapshot(&self, method: ArchiveMethod) -> bool {
        self.snapshot == Some(method)
    }

    pub fn archive_path(&self, method: ArchiveMethod) -> PathBuf {
        self.root_dir.join(method.file_name())
    }
}

/// Find the most recent earlier build that meets `criterion` and still holds
/// a snapshot made with `method`.
///
/// `history` yields builds newest first, starting with the build just before
/// the current one. Iteration stops at the first hit.
pub fn find_previous_snapshot<I>(
    history: I,
    criterion: Criterion,
    method: ArchiveMethod,
) -> Option<BuildSummary>
where
    I: IntoIterator<Item = BuildSummary>,
{
    history
        .into_iter()
        .filter(|b| criterion.accepts(b.result))
        .find(|b| b.has_snapshot(method))
}
