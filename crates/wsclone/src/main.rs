use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wsclone::Result;
use wsclone::archive::NativeTar;
use wsclone::config::Settings;
use wsclone::criteria::BuildResult;
use wsclone::error::Error;
use wsclone::expand::MapExpander;
use wsclone::glob::{GlobFilter, GlobResolution};
use wsclone::logging::{self, LogFormat};
use wsclone::process::SystemLauncher;
use wsclone::snapshot::{BuildContext, BuildId, SnapshotManager, SnapshotOutcome};
use wsclone::store::BuildStore;
use wsclone::workspace::Workspace;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a finished build and snapshot its workspace
    Snapshot {
        /// Path to a wsclone TOML config
        config: PathBuf,
        #[arg(long)]
        job: String,
        #[arg(long)]
        build: u64,
        /// Build result (SUCCESS, UNSTABLE, FAILURE, ABORTED, NOT_BUILT); omit while unsettled
        #[arg(long)]
        result: Option<BuildResult>,
        #[arg(long)]
        workspace: PathBuf,
        /// Extra variables for pattern expansion (KEY=VALUE)
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// Unpack a stored snapshot into a directory
    Restore {
        config: PathBuf,
        #[arg(long)]
        job: String,
        /// Build to restore from (default: most recent build holding a snapshot)
        #[arg(long)]
        build: Option<u64>,
        #[arg(long)]
        dest: PathBuf,
    },
    /// List recorded builds of a job
    List {
        config: PathBuf,
        #[arg(long)]
        job: String,
    },
    /// Show which files an include/exclude pair selects in a directory
    CheckGlob {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        include: String,
        #[arg(long)]
        exclude: Option<String>,
        #[arg(long)]
        no_default_excludes: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve { config: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    match args.cmd {
        Command::Snapshot {
            config,
            job,
            build,
            result,
            workspace,
            vars,
        } => cmd_snapshot(&config, &job, build, result, &workspace, &vars),
        Command::Restore {
            config,
            job,
            build,
            dest,
        } => cmd_restore(&config, &job, build, &dest),
        Command::List { config, job } => cmd_list(&config, &job),
        Command::CheckGlob {
            workspace,
            include,
            exclude,
            no_default_excludes,
        } => cmd_check_glob(&workspace, &include, exclude.as_deref(), !no_default_excludes),
        Command::Resolve { config } => cmd_resolve(&config),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let doc = wsclone::config::load(path)?;
    Settings::from_doc(&doc)
}

fn native_tar(settings: &Settings) -> NativeTar {
    NativeTar::new(
        Arc::new(SystemLauncher::default()),
        settings.tar_program.clone(),
    )
}

fn parse_var(raw: &str) -> Result<(String, String)> {
    let Some((k, v)) = raw.split_once('=') else {
        return Err(Error::config(format!("invalid --var '{raw}' (expected KEY=VALUE)")));
    };
    let k = k.trim();
    if k.is_empty() {
        return Err(Error::config(format!("invalid --var '{raw}' (empty key)")));
    }
    Ok((k.to_string(), v.to_string()))
}

fn cmd_snapshot(
    config: &Path,
    job: &str,
    number: u64,
    result: Option<BuildResult>,
    workspace: &Path,
    vars: &[String],
) -> Result<()> {
    let settings = load_settings(config)?;
    let store = BuildStore::open(&settings.store_root);
    let id = BuildId::new(job, number);
    let _lock = store.lock_job(job)?;
    store.record(&id, result)?;

    let mut expander = MapExpander::default();
    expander.set("JOB_NAME", job);
    expander.set("BUILD_NUMBER", number.to_string());
    expander.set("WORKSPACE", workspace.display().to_string());
    for raw in vars {
        let (k, v) = parse_var(raw)?;
        expander.set(k, v);
    }

    let ws = match Workspace::open(workspace) {
        Ok(ws) => Some(ws),
        Err(e) => {
            tracing::warn!(error = %e, "workspace not available");
            None
        }
    };
    let build = BuildContext {
        root_dir: store.build_dir(&id)?,
        id: id.clone(),
        result,
    };
    let native = native_tar(&settings);
    let manager = SnapshotManager::new(&settings.snapshot, &native, &expander);
    let outcome = manager.snapshot(&build, ws.as_ref(), store.history_before(&id)?, &store)?;

    match outcome {
        SnapshotOutcome::Skipped { threshold } => {
            println!("{id}: not archived (result below {threshold})");
        }
        SnapshotOutcome::NoMatch { message } => {
            println!("{id}: not archived ({message})");
        }
        SnapshotOutcome::Archived {
            descriptor,
            files,
            pruned,
        } => {
            if let Some(old) = pruned {
                println!("{id}: removed superseded snapshot of {old}");
            }
            println!("{id}: archived {files} file(s) with {}", descriptor.method);
        }
        SnapshotOutcome::Failed { error } => {
            eprintln!("warning: {id}: workspace not archived: {error}");
        }
    }
    Ok(())
}

fn cmd_restore(config: &Path, job: &str, build: Option<u64>, dest: &Path) -> Result<()> {
    let settings = load_settings(config)?;
    let store = BuildStore::open(&settings.store_root);
    let id = match build {
        Some(n) => BuildId::new(job, n),
        None => match store.latest_snapshot(job)? {
            Some(desc) => desc.owner,
            None => {
                return Err(Error::msg(format!("no build of '{job}' holds a snapshot")));
            }
        },
    };
    let desc = store.restore(&id, &native_tar(&settings), dest)?;
    println!(
        "restored {} ({}) into {}",
        desc.owner,
        desc.method,
        dest.display()
    );
    Ok(())
}

fn cmd_list(config: &Path, job: &str) -> Result<()> {
    let settings = load_settings(config)?;
    let store = BuildStore::open(&settings.store_root);
    for rec in store.builds(job)? {
        let result = rec.result.map(BuildResult::as_str).unwrap_or("-");
        let snapshot = rec
            .snapshot
            .as_ref()
            .map(|d| d.method.as_str())
            .unwrap_or("-");
        println!(
            "{:>6}  {:<10} {:<10}  {}",
            rec.number, result, snapshot, rec.recorded_at
        );
    }
    Ok(())
}

fn cmd_check_glob(
    workspace: &Path,
    include: &str,
    exclude: Option<&str>,
    use_default_excludes: bool,
) -> Result<()> {
    let ws = Workspace::open(workspace)?;
    let filter = GlobFilter::new(include, exclude, use_default_excludes)?;
    match filter.resolve(ws.root())? {
        GlobResolution::Matched(paths) => {
            for p in paths {
                println!("{p}");
            }
            Ok(())
        }
        GlobResolution::NoMatch(message) => Err(Error::pattern(message)),
    }
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = wsclone::config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}
