//! File-backed build records.
//!
//! Layout under the store root:
//!
//! ```text
//! jobs/<job>/.job.lock
//! jobs/<job>/builds/<number>/build.json
//! jobs/<job>/builds/<number>/workspace.tar.gz   (one reserved name per method)
//! ```

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::archive::NativeTar;
use crate::criteria::BuildResult;
use crate::error::{Error, Result};
use crate::retention::BuildSummary;
use crate::snapshot::{BuildId, BuildLocator, SnapshotDescriptor, SnapshotRegistry};
use crate::workspace::safe_component;

const RECORD_VERSION: u32 = 1;
const RECORD_FILE: &str = "build.json";
const LOCK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub version: u32,
    pub job: String,
    pub number: u64,
    pub result: Option<BuildResult>,
    pub recorded_at: String,
    #[serde(default)]
    pub snapshot: Option<SnapshotDescriptor>,
    #[serde(default)]
    pub snapshot_sha256: Option<String>,
}

impl BuildRecord {
    pub fn id(&self) -> BuildId {
        BuildId::new(self.job.clone(), self.number)
    }
}

pub struct BuildStore {
    root: PathBuf,
}

/// Held while a job's records are being changed.
pub struct JobLock {
    path: PathBuf,
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl BuildStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job: &str) -> Result<PathBuf> {
        let job = safe_component("job name", job)?;
        Ok(self.root.join("jobs").join(job))
    }

    fn builds_dir(&self, job: &str) -> Result<PathBuf> {
        Ok(self.job_dir(job)?.join("builds"))
    }

    pub fn build_dir(&self, id: &BuildId) -> Result<PathBuf> {
        Ok(self.builds_dir(&id.job)?.join(id.number.to_string()))
    }

    pub fn lock_job(&self, job: &str) -> Result<JobLock> {
        let dir = self.job_dir(job)?;
        fs::create_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(".job.lock");
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(JobLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::msg(format!(
                            "timed out waiting for job lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire job lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// Create or update the record of a build. An existing snapshot
    /// reference is kept.
    pub fn record(&self, id: &BuildId, result: Option<BuildResult>) -> Result<BuildRecord> {
        let mut rec = match self.try_load(id)? {
            Some(existing) => existing,
            None => BuildRecord {
                version: RECORD_VERSION,
                job: id.job.clone(),
                number: id.number,
                result: None,
                recorded_at: String::new(),
                snapshot: None,
                snapshot_sha256: None,
            },
        };
        rec.result = result;
        rec.recorded_at = chrono::Utc::now().to_rfc3339();
        self.save(&rec)?;
        Ok(rec)
    }

    pub fn load(&self, id: &BuildId) -> Result<BuildRecord> {
        self.try_load(id)?
            .ok_or_else(|| Error::msg(format!("no record for build {id}")))
    }

    fn try_load(&self, id: &BuildId) -> Result<Option<BuildRecord>> {
        let p = self.build_dir(id)?.join(RECORD_FILE);
        if !p.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&p)
            .map_err(|e| Error::msg(format!("failed to read build record {}: {e}", p.display())))?;
        let rec = serde_json::from_str::<BuildRecord>(&raw).map_err(|e| {
            Error::msg(format!("failed to parse build record {}: {e}", p.display()))
        })?;
        Ok(Some(rec))
    }

    pub fn save(&self, rec: &BuildRecord) -> Result<()> {
        let p = self.build_dir(&rec.id())?.join(RECORD_FILE);
        let body = serde_json::to_string_pretty(rec)
            .map_err(|e| Error::msg(format!("failed to encode build record: {e}")))?;
        atomic_write_text(&p, &body)
    }

    pub fn attach_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<BuildRecord> {
        let mut rec = self.load(&descriptor.owner)?;
        let archive = self.build_dir(&descriptor.owner)?.join(descriptor.method.file_name());
        rec.snapshot_sha256 = Some(sha256_file(&archive)?);
        rec.snapshot = Some(descriptor.clone());
        self.save(&rec)?;
        Ok(rec)
    }

    pub fn detach_snapshot(&self, id: &BuildId) -> Result<()> {
        let Some(mut rec) = self.try_load(id)? else {
            return Ok(());
        };
        if rec.snapshot.is_none() {
            return Ok(());
        }
        rec.snapshot = None;
        rec.snapshot_sha256 = None;
        self.save(&rec)
    }

    /// Recorded build numbers of `job`, ascending.
    pub fn numbers(&self, job: &str) -> Result<Vec<u64>> {
        let dir = self.builds_dir(job)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let rd = fs::read_dir(&dir)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?;
        for entry in rd {
            let entry = entry.map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?;
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                out.push(n);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn builds(&self, job: &str) -> Result<Vec<BuildRecord>> {
        let mut out = Vec::new();
        for n in self.numbers(job)? {
            if let Some(rec) = self.try_load(&BuildId::new(job, n))? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Builds of the same job recorded before `id`, newest first. Records
    /// are read as the iterator advances; unreadable ones are skipped.
    pub fn history_before<'s>(
        &'s self,
        id: &BuildId,
    ) -> Result<impl Iterator<Item = BuildSummary> + 's> {
        let job = id.job.clone();
        let mut numbers = self.numbers(&job)?;
        numbers.retain(|n| *n < id.number);
        Ok(numbers.into_iter().rev().filter_map(move |n| {
            let bid = BuildId::new(job.clone(), n);
            match self.try_load(&bid) {
                Ok(Some(rec)) => Some(BuildSummary {
                    root_dir: self.build_dir(&bid).ok()?,
                    id: bid,
                    result: rec.result,
                    snapshot: rec.snapshot.map(|d| d.method),
                }),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(build = %bid, error = %e, "skipping unreadable build record");
                    None
                }
            }
        }))
    }

    /// Most recent build of `job` that still holds a snapshot.
    pub fn latest_snapshot(&self, job: &str) -> Result<Option<SnapshotDescriptor>> {
        for n in self.numbers(job)?.into_iter().rev() {
            if let Some(rec) = self.try_load(&BuildId::new(job, n))?
                && let Some(desc) = rec.snapshot
            {
                return Ok(Some(desc));
            }
        }
        Ok(None)
    }

    /// Restore a build's snapshot, checking the recorded checksum first.
    pub fn restore(&self, id: &BuildId, native: &NativeTar, dest: &Path) -> Result<SnapshotDescriptor> {
        let rec = self.load(id)?;
        let Some(desc) = rec.snapshot else {
            return Err(Error::msg(format!("build {id} has no workspace snapshot")));
        };
        let archive = desc.archive_path(self)?;
        if let Some(expected) = rec.snapshot_sha256.as_deref() {
            if !archive.is_file() {
                return Err(Error::msg(format!(
                    "snapshot archive missing: {}",
                    archive.display()
                )));
            }
            let actual = sha256_file(&archive)?;
            if actual != expected {
                return Err(Error::corrupt(format!(
                    "checksum mismatch for {} (expected {expected}, got {actual})",
                    archive.display()
                )));
            }
        }
        desc.restore(self, native, dest)?;
        Ok(desc)
    }
}

impl BuildLocator for BuildStore {
    fn root_dir(&self, id: &BuildId) -> Result<PathBuf> {
        self.build_dir(id)
    }
}

impl SnapshotRegistry for BuildStore {
    fn attach(&self, descriptor: &SnapshotDescriptor) -> Result<()> {
        self.attach_snapshot(descriptor).map(|_| ())
    }

    fn detach(&self, owner: &BuildId) -> Result<()> {
        self.detach_snapshot(owner)
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!("invalid file path for atomic write: {}", path.display()))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveMethod;

    #[test]
    fn record_and_reload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path());
        let id = BuildId::new("app", 7);
        store.record(&id, Some(BuildResult::Unstable)).expect("record");
        let rec = store.load(&id).expect("load");
        assert_eq!(rec.result, Some(BuildResult::Unstable));
        assert!(rec.snapshot.is_none());
    }

    #[test]
    fn history_is_newest_first_and_excludes_current() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path());
        for n in [1u64, 2, 10, 11] {
            store
                .record(&BuildId::new("app", n), Some(BuildResult::Success))
                .expect("record");
        }
        let got: Vec<u64> = store
            .history_before(&BuildId::new("app", 10))
            .expect("history")
            .map(|b| b.id.number)
            .collect();
        assert_eq!(got, vec![2, 1]);
    }

    #[test]
    fn attach_detach_and_latest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path());
        let id = BuildId::new("app", 3);
        store.record(&id, Some(BuildResult::Success)).expect("record");
        let archive = store.build_dir(&id).expect("dir").join(ArchiveMethod::Zip.file_name());
        fs::write(&archive, b"zip bytes").expect("archive");

        let desc = SnapshotDescriptor {
            owner: id.clone(),
            method: ArchiveMethod::Zip,
        };
        let rec = store.attach_snapshot(&desc).expect("attach");
        assert_eq!(rec.snapshot_sha256.as_deref().map(str::len), Some(64));
        assert_eq!(store.latest_snapshot("app").expect("latest"), Some(desc));

        store.detach_snapshot(&id).expect("detach");
        assert_eq!(store.latest_snapshot("app").expect("latest"), None);
    }

    #[test]
    fn restore_detects_tampered_archive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path().join("store"));
        let id = BuildId::new("app", 1);
        store.record(&id, Some(BuildResult::Success)).expect("record");
        let archive = store.build_dir(&id).expect("dir").join(ArchiveMethod::TarPlain.file_name());
        fs::write(&archive, b"first").expect("archive");
        store
            .attach_snapshot(&SnapshotDescriptor {
                owner: id.clone(),
                method: ArchiveMethod::TarPlain,
            })
            .expect("attach");
        fs::write(&archive, b"tampered").expect("tamper");

        let err = store
            .restore(&id, &NativeTar::default(), &tmp.path().join("dest"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
    }

    #[test]
    fn job_lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path());
        let lock = store.lock_job("app").expect("lock");
        assert!(tmp.path().join("jobs/app/.job.lock").is_file());
        drop(lock);
        assert!(!tmp.path().join("jobs/app/.job.lock").exists());
        let _again = store.lock_job("app").expect("relock");
    }

    #[test]
    fn rejects_unsafe_job_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BuildStore::open(tmp.path());
        assert!(store.record(&BuildId::new("../x", 1), None).is_err());
    }
}
