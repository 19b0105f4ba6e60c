use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use wsclone::archive::{ArchiveMethod, NativeTar};
use wsclone::criteria::{BuildResult, Criterion};
use wsclone::error::{Error, ErrorKind};
use wsclone::expand::MapExpander;
use wsclone::glob::list_files;
use wsclone::process::Launcher;
use wsclone::snapshot::{
    BuildContext, BuildId, SnapshotConfig, SnapshotDescriptor, SnapshotManager, SnapshotOutcome,
};
use wsclone::store::BuildStore;
use wsclone::workspace::Workspace;

/// Stands in for the system `tar`: honours `-cf`/`-xf` on `tmp.tar` using
/// the tar crate, or exits with a fixed code.
struct FakeTar {
    exit: i32,
}

impl Launcher for FakeTar {
    fn launch(&self, cwd: &Path, program: &str, args: &[String]) -> wsclone::Result<i32> {
        assert_eq!(program, "tar");
        if self.exit != 0 {
            return Ok(self.exit);
        }
        if args.iter().any(|a| a == "-cf") {
            let files = match args.iter().find_map(|a| a.strip_prefix("--files-from=")) {
                Some(list) => fs::read_to_string(list)?
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect(),
                None => list_files(cwd)?,
            };
            let mut builder = tar::Builder::new(Vec::new());
            for rel in files {
                builder.append_path_with_name(cwd.join(&rel), &rel)?;
            }
            let bytes = builder.into_inner()?;
            fs::write(cwd.join("tmp.tar"), bytes)?;
        } else {
            let f = fs::File::open(cwd.join("tmp.tar"))?;
            tar::Archive::new(f).unpack(cwd)?;
        }
        Ok(0)
    }
}

struct CancelledTar;

impl Launcher for CancelledTar {
    fn launch(&self, _cwd: &Path, _program: &str, _args: &[String]) -> wsclone::Result<i32> {
        Err(Error::cancelled())
    }
}

fn tree(root: &Path, files: &[&str]) {
    for f in files {
        let p = root.join(f);
        fs::create_dir_all(p.parent().expect("parent")).expect("mkdir");
        fs::write(&p, format!("contents of {f}")).expect("write");
    }
}

fn read_tree(root: &Path) -> BTreeMap<String, String> {
    list_files(root)
        .expect("list")
        .into_iter()
        .map(|rel| {
            let body = fs::read_to_string(root.join(&rel)).expect("read");
            (rel, body)
        })
        .collect()
}

struct Fixture {
    _tmp: tempfile::TempDir,
    ws: std::path::PathBuf,
    store: BuildStore,
    dest: std::path::PathBuf,
}

fn fixture(files: &[&str]) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = tmp.path().join("ws");
    fs::create_dir_all(&ws).expect("ws");
    tree(&ws, files);
    Fixture {
        store: BuildStore::open(tmp.path().join("store")),
        dest: tmp.path().join("restored"),
        ws,
        _tmp: tmp,
    }
}

fn snapshot(
    fx: &Fixture,
    config: &SnapshotConfig,
    native: &NativeTar,
    number: u64,
    result: BuildResult,
) -> wsclone::Result<SnapshotOutcome> {
    let id = BuildId::new("app", number);
    fx.store.record(&id, Some(result))?;
    let expander = MapExpander::default();
    let manager = SnapshotManager::new(config, native, &expander);
    let ws = Workspace::open(&fx.ws)?;
    let build = BuildContext {
        root_dir: fx.store.build_dir(&id)?,
        id: id.clone(),
        result: Some(result),
    };
    manager.snapshot(&build, Some(&ws), fx.store.history_before(&id)?, &fx.store)
}

/// The native codec relies on GNU options such as `--verbatim-files-from`.
fn gnu_tar_available() -> bool {
    std::process::Command::new("tar")
        .arg("--version")
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains("GNU tar"))
        .unwrap_or(false)
}

/// Launchers the native codec is checked with: the fake one always, the
/// system `tar` when it is GNU tar.
fn native_tars() -> Vec<(&'static str, NativeTar)> {
    let mut out = vec![("fake", NativeTar::new(Arc::new(FakeTar { exit: 0 }), "tar"))];
    if gnu_tar_available() {
        out.push(("system", NativeTar::default()));
    }
    out
}

fn config(include: &str, exclude: Option<&str>, method: ArchiveMethod) -> SnapshotConfig {
    SnapshotConfig::new(include, exclude, Criterion::Any, method, false)
}

#[test]
fn empty_include_round_trips_every_file() {
    for method in [ArchiveMethod::Zip, ArchiveMethod::TarGzip, ArchiveMethod::TarPlain] {
        let fx = fixture(&["a.txt", "sub/b.txt", "sub/deeper/c.bin"]);
        let out = snapshot(&fx, &config("", None, method), &NativeTar::default(), 1, BuildResult::Success)
            .expect("snapshot");
        assert!(
            matches!(out, SnapshotOutcome::Archived { files: 3, .. }),
            "{method}: {out:?}"
        );

        fx.store
            .restore(&BuildId::new("app", 1), &NativeTar::default(), &fx.dest)
            .expect("restore");
        assert_eq!(read_tree(&fx.dest), read_tree(&fx.ws), "{method}");
    }
}

#[test]
fn include_and_exclude_select_files() {
    let fx = fixture(&["a.log", "tmp/b.log", "c.txt"]);
    let cfg = config("**/*.log", Some("tmp/**"), ArchiveMethod::Zip);
    snapshot(&fx, &cfg, &NativeTar::default(), 1, BuildResult::Success).expect("snapshot");
    fx.store
        .restore(&BuildId::new("app", 1), &NativeTar::default(), &fx.dest)
        .expect("restore");
    let restored: Vec<String> = read_tree(&fx.dest).into_keys().collect();
    assert_eq!(restored, vec!["a.log".to_string()]);
}

#[test]
fn default_excludes_can_be_overridden() {
    let fx = fixture(&["src/main.rs", ".git/config", "notes.txt~"]);
    let cfg = config("", None, ArchiveMethod::TarGzip);
    snapshot(&fx, &cfg, &NativeTar::default(), 1, BuildResult::Success).expect("snapshot");
    fx.store
        .restore(&BuildId::new("app", 1), &NativeTar::default(), &fx.dest)
        .expect("restore");
    let restored: Vec<String> = read_tree(&fx.dest).into_keys().collect();
    assert_eq!(restored, vec!["src/main.rs".to_string()]);

    let keep_all = SnapshotConfig::new("", None, Criterion::Any, ArchiveMethod::TarGzip, true);
    snapshot(&fx, &keep_all, &NativeTar::default(), 2, BuildResult::Success).expect("snapshot");
    let dest = fx.dest.with_file_name("restored-all");
    fx.store
        .restore(&BuildId::new("app", 2), &NativeTar::default(), &dest)
        .expect("restore");
    assert_eq!(read_tree(&dest).len(), 3);
}

#[test]
fn unstable_build_is_not_archived_under_successful() {
    let fx = fixture(&["a.txt"]);
    let cfg = SnapshotConfig::new("", None, Criterion::Successful, ArchiveMethod::Zip, false);
    let out = snapshot(&fx, &cfg, &NativeTar::default(), 1, BuildResult::Unstable).expect("snapshot");
    assert!(matches!(out, SnapshotOutcome::Skipped { threshold: BuildResult::Success }));

    let dir = fx.store.build_dir(&BuildId::new("app", 1)).expect("dir");
    assert_eq!(list_files(&dir).expect("list"), vec!["build.json".to_string()]);
    assert!(fx.store.latest_snapshot("app").expect("latest").is_none());
}

#[test]
fn unmatched_include_reports_and_writes_nothing() {
    let fx = fixture(&["a.txt"]);
    let out = snapshot(
        &fx,
        &config("**/*.jar", None, ArchiveMethod::Zip),
        &NativeTar::default(),
        1,
        BuildResult::Success,
    )
    .expect("snapshot");
    match out {
        SnapshotOutcome::NoMatch { message } => assert!(message.contains("doesn't match anything")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let dir = fx.store.build_dir(&BuildId::new("app", 1)).expect("dir");
    assert!(!dir.join(ArchiveMethod::Zip.file_name()).exists());
}

#[test]
fn native_tar_round_trip_through_launcher() {
    for include in ["", "**/*.txt"] {
        let fx = fixture(&["a.txt", "sub/b.txt", "sub/c.dat"]);
        let native = NativeTar::new(Arc::new(FakeTar { exit: 0 }), "tar");
        let out = snapshot(&fx, &config(include, None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
            .expect("snapshot");
        assert!(matches!(out, SnapshotOutcome::Archived { .. }), "{out:?}");
        assert!(!fx.ws.join("tmp.tar").exists());

        fx.store
            .restore(&BuildId::new("app", 1), &native, &fx.dest)
            .expect("restore");
        assert!(!fx.dest.join("tmp.tar").exists());
        let restored = read_tree(&fx.dest);
        assert_eq!(restored.get("sub/b.txt").map(String::as_str), Some("contents of sub/b.txt"));
        assert_eq!(restored.contains_key("sub/c.dat"), include.is_empty());
    }
}

#[test]
fn native_tar_failure_is_soft_and_leaves_no_archive() {
    let fx = fixture(&["a.txt"]);
    let native = NativeTar::new(Arc::new(FakeTar { exit: 2 }), "tar");
    let out = snapshot(&fx, &config("", None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
        .expect("build must not fail");
    match out {
        SnapshotOutcome::Failed { error } => {
            assert_eq!(error.kind(), ErrorKind::Io);
            assert!(error.to_string().contains("exit code 2"), "{error}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let dir = fx.store.build_dir(&BuildId::new("app", 1)).expect("dir");
    assert!(!dir.join(ArchiveMethod::NativeTar.file_name()).exists());
    assert!(!fx.ws.join("tmp.tar").exists());
    assert!(fx.store.latest_snapshot("app").expect("latest").is_none());
}

#[test]
fn cancellation_propagates() {
    let fx = fixture(&["a.txt"]);
    let native = NativeTar::new(Arc::new(CancelledTar), "tar");
    let err = snapshot(&fx, &config("", None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn restore_of_missing_archive_is_io_error() {
    let fx = fixture(&["a.txt"]);
    snapshot(&fx, &config("", None, ArchiveMethod::TarPlain), &NativeTar::default(), 1, BuildResult::Success)
        .expect("snapshot");
    let id = BuildId::new("app", 1);
    let archive = fx
        .store
        .build_dir(&id)
        .expect("dir")
        .join(ArchiveMethod::TarPlain.file_name());
    fs::remove_file(&archive).expect("remove");

    let err = fx
        .store
        .restore(&id, &NativeTar::default(), &fx.dest)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn garbage_zip_is_corrupt() {
    let fx = fixture(&[]);
    let id = BuildId::new("app", 1);
    let dir = fx.store.build_dir(&id).expect("dir");
    fs::create_dir_all(&dir).expect("dir");
    fs::write(dir.join(ArchiveMethod::Zip.file_name()), vec![0x5a_u8; 512]).expect("write");

    let desc = SnapshotDescriptor {
        owner: id,
        method: ArchiveMethod::Zip,
    };
    let err = desc
        .restore(&fx.store, &NativeTar::default(), &fx.dest)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptArchive);
}

#[test]
fn system_tar_round_trip_when_available() {
    if !gnu_tar_available() {
        eprintln!("skipping: no GNU tar on PATH");
        return;
    }
    let fx = fixture(&["a.txt", "sub/b.txt"]);
    let native = NativeTar::default();
    let out = snapshot(&fx, &config("", None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
        .expect("snapshot");
    assert!(matches!(out, SnapshotOutcome::Archived { .. }), "{out:?}");
    fx.store
        .restore(&BuildId::new("app", 1), &native, &fx.dest)
        .expect("restore");
    assert_eq!(read_tree(&fx.dest), read_tree(&fx.ws));
}

#[test]
fn native_tar_selects_the_same_files_as_in_process_codecs() {
    let cases: [(&[&str], &str, &str, &[&str]); 2] = [
        (
            &["a.log", "x/tmp/b.log", "c.txt"],
            "**/*.log",
            "tmp/**",
            &["a.log", "x/tmp/b.log"],
        ),
        (&["a.txt", "sub/x.log"], "", "*.log", &["a.txt", "sub/x.log"]),
    ];
    for (files, include, exclude, expected) in cases {
        let fx = fixture(files);
        snapshot(
            &fx,
            &config(include, Some(exclude), ArchiveMethod::TarPlain),
            &NativeTar::default(),
            1,
            BuildResult::Success,
        )
        .expect("snapshot");
        let plain_dest = fx.dest.with_file_name("restored-plain");
        fx.store
            .restore(&BuildId::new("app", 1), &NativeTar::default(), &plain_dest)
            .expect("restore");
        let plain: Vec<String> = read_tree(&plain_dest).into_keys().collect();
        assert_eq!(plain, *expected, "{include} / {exclude}");

        for (n, (name, native)) in native_tars().into_iter().enumerate() {
            let number = 2 + n as u64;
            let out = snapshot(
                &fx,
                &config(include, Some(exclude), ArchiveMethod::NativeTar),
                &native,
                number,
                BuildResult::Success,
            )
            .expect("snapshot");
            assert!(matches!(out, SnapshotOutcome::Archived { .. }), "{name}: {out:?}");
            let dest = fx.dest.with_file_name(format!("restored-{name}"));
            fx.store
                .restore(&BuildId::new("app", number), &native, &dest)
                .expect("restore");
            let restored: Vec<String> = read_tree(&dest).into_keys().collect();
            assert_eq!(restored, plain, "{name}: {include} / {exclude}");
        }
    }
}

#[test]
fn workspace_file_named_like_the_temp_archive_is_left_alone() {
    let fx = fixture(&["a.txt"]);
    fs::write(fx.ws.join("tmp.tar"), "user data").expect("write");
    let native = NativeTar::new(Arc::new(FakeTar { exit: 0 }), "tar");
    let out = snapshot(&fx, &config("", None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
        .expect("build must not fail");
    match out {
        SnapshotOutcome::Failed { error } => {
            assert_eq!(error.kind(), ErrorKind::Io);
            assert!(error.to_string().contains("already exists"), "{error}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fs::read_to_string(fx.ws.join("tmp.tar")).expect("read"), "user data");
    let dir = fx.store.build_dir(&BuildId::new("app", 1)).expect("dir");
    assert!(!dir.join(ArchiveMethod::NativeTar.file_name()).exists());
}

#[test]
fn nested_temp_archive_name_is_archived() {
    for (name, native) in native_tars() {
        let fx = fixture(&["a.txt", "sub/tmp.tar"]);
        for include in ["", "**/*.tar"] {
            let number = if include.is_empty() { 1 } else { 2 };
            let out = snapshot(&fx, &config(include, None, ArchiveMethod::NativeTar), &native, number, BuildResult::Success)
                .expect("snapshot");
            assert!(matches!(out, SnapshotOutcome::Archived { .. }), "{name}: {out:?}");
            let dest = fx.dest.with_file_name(format!("restored-{number}"));
            fx.store
                .restore(&BuildId::new("app", number), &native, &dest)
                .expect("restore");
            let restored = read_tree(&dest);
            assert_eq!(
                restored.get("sub/tmp.tar").map(String::as_str),
                Some("contents of sub/tmp.tar"),
                "{name} include '{include}'"
            );
            assert!(!dest.join("tmp.tar").exists(), "{name}");
        }
    }
}

#[test]
fn restore_refuses_to_clobber_existing_temp_archive_name() {
    let fx = fixture(&["a.txt"]);
    let native = NativeTar::new(Arc::new(FakeTar { exit: 0 }), "tar");
    snapshot(&fx, &config("", None, ArchiveMethod::NativeTar), &native, 1, BuildResult::Success)
        .expect("snapshot");

    fs::create_dir_all(&fx.dest).expect("dest");
    fs::write(fx.dest.join("tmp.tar"), "keep me").expect("write");
    let err = fx
        .store
        .restore(&BuildId::new("app", 1), &native, &fx.dest)
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
    assert_eq!(fs::read_to_string(fx.dest.join("tmp.tar")).expect("read"), "keep me");
    assert!(!fx.dest.join("a.txt").exists());
}
