//! Runs the wheel build tool against a fetched archive.
//!
//! Everything in this module blocks the calling thread until the build tool
//! exits. Async callers go through `tokio::task::spawn_blocking`.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::toolchain::ToolchainOverlay;

const WHEEL_EXTENSION: &str = "whl";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TRUNCATION_MARKER: &str = "\n[...truncated...]\n";

/// Environment every build starts from, before the toolchain overlay.
const PIP_ENV: &[(&str, &str)] = &[
    ("PIP_DISABLE_PIP_VERSION_CHECK", "1"),
    ("PIP_NO_INPUT", "1"),
    ("PIP_PROGRESS_BAR", "off"),
];

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed while waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` failed (code {code}):\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Exited {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("`{program}` did not finish within {}s and was killed", .after.as_secs())]
    TimedOut { program: String, after: Duration },
    #[error("build reported success but no .whl file was found in {}", .dir.display())]
    ArtifactNotFound { dir: PathBuf },
    #[error("build produced {} wheel candidates ({}); refusing to guess", .candidates.len(), .candidates.join(", "))]
    AmbiguousArtifacts { candidates: Vec<String> },
    #[error("failed to scan {} for build output: {source}", .dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("build worker stopped unexpectedly: {0}")]
    Worker(String),
}

impl BuildError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } | Self::Wait { .. } | Self::Worker(_) => "build_tool_unavailable",
            Self::Exited { .. } => "build_tool_failed",
            Self::TimedOut { .. } => "build_timed_out",
            Self::ArtifactNotFound { .. } => "artifact_not_found",
            Self::AmbiguousArtifacts { .. } => "ambiguous_artifacts",
            Self::Scan { .. } => "artifact_scan_failed",
        }
    }
}

/// The build frontend: a program plus the arguments placed before the
/// archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTool {
    pub program: String,
    pub args: Vec<String>,
}

impl BuildTool {
    /// `python -m pip wheel --no-deps --wheel-dir .` (one wheel, no resolution).
    #[must_use]
    pub fn pip_wheel(python: &str) -> Self {
        Self {
            program: python.to_string(),
            args: ["-m", "pip", "wheel", "--no-deps", "--wheel-dir", "."]
                .iter()
                .map(|arg| (*arg).to_string())
                .collect(),
        }
    }
}

/// How the workspace scan treats its candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactPolicy {
    /// Exactly one wheel must exist; zero or several are failures.
    #[default]
    ExactlyOne,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub tool: BuildTool,
    pub timeout: Option<Duration>,
    pub max_capture_bytes: usize,
    pub policy: ArtifactPolicy,
}

impl BuildOptions {
    #[must_use]
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            tool: BuildTool::pip_wheel(&config.python),
            timeout: config.timeout,
            max_capture_bytes: config.max_capture_bytes,
            policy: ArtifactPolicy::ExactlyOne,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    pub path: PathBuf,
    pub filename: String,
}

#[derive(Debug)]
struct RunOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

/// Builds `archive` inside `workspace` and returns the single wheel produced.
///
/// The child inherits the ambient environment with the pip defaults and then
/// `overlay` applied on top. Blocks until the tool exits or the timeout fires.
///
/// # Errors
/// Returns [`BuildError::Exited`] on a non-zero exit, [`BuildError::TimedOut`]
/// when the limit elapses, and [`BuildError::ArtifactNotFound`] or
/// [`BuildError::AmbiguousArtifacts`] when the scan does not find exactly one
/// wheel.
pub fn build(
    archive: &Path,
    workspace: &Path,
    overlay: &ToolchainOverlay,
    options: &BuildOptions,
) -> Result<BuiltArtifact, BuildError> {
    let mut command = Command::new(&options.tool.program);
    command
        .args(&options.tool.args)
        .arg(archive)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in PIP_ENV {
        command.env(key, value);
    }
    for (key, value) in overlay.iter() {
        command.env(key, value);
    }
    debug!(
        program = %options.tool.program,
        args = ?options.tool.args,
        archive = %archive.display(),
        overlay = !overlay.is_empty(),
        "starting build tool"
    );

    let output = run_captured(command, &options.tool.program, options)?;
    if output.code != 0 {
        return Err(BuildError::Exited {
            program: options.tool.program.clone(),
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    info!(
        "Successfully executed command {} {}",
        options.tool.args.join(" "),
        archive.display()
    );

    let exclude = archive.file_name().and_then(|name| name.to_str());
    find_artifact(workspace, exclude, options.policy)
}

fn run_captured(
    mut command: Command,
    program: &str,
    options: &BuildOptions,
) -> Result<RunOutput, BuildError> {
    // The tool leads its own process group; a timeout kills the whole group.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let deadline = options.timeout.map(|limit| Instant::now() + limit);
    let mut child = command.spawn().map_err(|source| BuildError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let limit = options.max_capture_bytes;
    let stdout = child.stdout.take().map(|pipe| spawn_capture(pipe, limit));
    let stderr = child.stderr.take().map(|pipe| spawn_capture(pipe, limit));

    let wait_error = |source| BuildError::Wait {
        program: program.to_string(),
        source,
    };
    let status = match deadline {
        Some(deadline) => match wait_until(&mut child, deadline).map_err(wait_error)? {
            Some(status) => status,
            None => return Err(abort(&mut child, program, options)),
        },
        None => child.wait().map_err(wait_error)?,
    };

    // Descendants that outlive the tool can hold the pipes open; the capture
    // wait shares the tool's deadline.
    let (Some(stdout), Some(stderr)) = (
        collect_capture(stdout, deadline),
        collect_capture(stderr, deadline),
    ) else {
        return Err(abort(&mut child, program, options));
    };

    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn abort(child: &mut Child, program: &str, options: &BuildOptions) -> BuildError {
    let after = options.timeout.unwrap_or_default();
    warn!(program, after_secs = after.as_secs(), "build tool timed out; killing its process group");
    kill_process_group(child);
    let _ = child.wait();
    BuildError::TimedOut {
        program: program.to_string(),
        after,
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        kill_direct(child);
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        if err != Errno::ESRCH {
            warn!(pgid, error = ?err, "SIGKILL to build process group failed");
            kill_direct(child);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    kill_direct(child);
}

fn kill_direct(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(%err, "failed to kill build tool");
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

type Captured = io::Result<(String, bool)>;

fn spawn_capture(pipe: impl Read + Send + 'static, limit: usize) -> Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_to_string_limited(pipe, limit));
    });
    rx
}

/// Waits for a reader thread; `None` means the deadline passed first.
fn collect_capture(rx: Option<Receiver<Captured>>, deadline: Option<Instant>) -> Option<String> {
    let Some(rx) = rx else {
        return Some(String::new());
    };
    let received = match deadline {
        Some(deadline) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(captured) => Ok(captured),
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => Err(()),
        },
        None => rx.recv().map_err(|_| ()),
    };
    Some(match received {
        Ok(Ok((mut text, truncated))) => {
            if truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            text
        }
        Ok(Err(err)) => format!("[output unavailable: {err}]"),
        Err(()) => "[output unavailable: reader thread stopped]".to_string(),
    })
}

fn read_to_string_limited(mut reader: impl Read, limit: usize) -> io::Result<(String, bool)> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        let room = limit.saturating_sub(buffer.len());
        if read > room {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..read.min(room)]);
    }
    Ok((String::from_utf8_lossy(&buffer).to_string(), truncated))
}

/// SHA-256 (hex) and size of a built wheel.
///
/// # Errors
/// Returns [`BuildError::Scan`] when the file cannot be read.
pub fn digest_artifact(path: &Path) -> Result<(String, u64), BuildError> {
    let scan_error = |source| BuildError::Scan {
        dir: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(scan_error)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 32 * 1024];
    let mut size = 0_u64;
    loop {
        let read = file.read(&mut buf).map_err(scan_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Scans the top level of `dir` for wheels, applying `policy`.
///
/// `exclude` names a file that never counts as a candidate (the input
/// archive).
///
/// # Errors
/// Returns [`BuildError::ArtifactNotFound`] for zero candidates and
/// [`BuildError::AmbiguousArtifacts`] for more than one.
pub fn find_artifact(
    dir: &Path,
    exclude: Option<&str>,
    policy: ArtifactPolicy,
) -> Result<BuiltArtifact, BuildError> {
    let scan_error = |source| BuildError::Scan {
        dir: dir.to_path_buf(),
        source,
    };
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).map_err(scan_error)? {
        let entry = entry.map_err(scan_error)?;
        let path = entry.path();
        let is_wheel = entry.file_type().map_err(scan_error)?.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(WHEEL_EXTENSION));
        if !is_wheel {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if Some(name) == exclude {
            continue;
        }
        candidates.push(BuiltArtifact {
            filename: name.to_string(),
            path: path.clone(),
        });
    }
    candidates.sort_by(|a, b| a.filename.cmp(&b.filename));

    match policy {
        ArtifactPolicy::ExactlyOne => match candidates.len() {
            0 => Err(BuildError::ArtifactNotFound {
                dir: dir.to_path_buf(),
            }),
            1 => Ok(candidates.remove(0)),
            _ => Err(BuildError::AmbiguousArtifacts {
                candidates: candidates.into_iter().map(|c| c.filename).collect(),
            }),
        },
    }
}
