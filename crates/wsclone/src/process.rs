use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use crate::error::{Error, Result};

const MAX_LINE_CHARS: usize = 4096;
// Output without line breaks is forwarded in chunks of at most this size.
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Starts external programs on behalf of the archiver.
///
/// Implementations block until the child exits and return its exit code.
/// A child that could not be started, or that died without an exit code,
/// is a process error. A raised cancel signal is reported as
/// [`Error::cancelled`].
pub trait Launcher: Send + Sync {
    fn launch(&self, cwd: &Path, program: &str, args: &[String]) -> Result<i32>;
}

/// Runs real subprocesses, forwarding their output to the log.
#[derive(Clone, Default)]
pub struct SystemLauncher {
    cancel: Arc<AtomicBool>,
}

impl SystemLauncher {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, cwd: &Path, program: &str, args: &[String]) -> Result<i32> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);

        // Own process group, so cancellation takes down the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(format!("failed to spawn {program}: {e}")))?;
        let pgid = child.id();
        tracing::debug!(program, ?args, cwd = %cwd.display(), pid = pgid, "spawned");

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => {
                    let line = sanitize_output_line(&line);
                    if !line.is_empty() {
                        tracing::info!(program, "{line}");
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if self.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                let _ = child.wait();
                tracing::warn!(program, pid = pgid, "subprocess killed on cancel");
                return Err(Error::cancelled());
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::process(format!("wait for {program} failed: {e}")))?;
        match status.code() {
            Some(code) => Ok(code),
            None => Err(Error::process(format!("{program} terminated: {status}"))),
        }
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Strip terminal escape sequences and control characters from a line of
/// child output, capping its length.
pub fn sanitize_output_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters up to a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: terminated by BEL or ESC '\'.
                Some(']') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() || ('\u{202A}'..='\u{202E}').contains(&c) {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}
