//! External quantum chemistry engine invocation.
//!
//! The engine is treated as a black box: it consumes an input deck and
//! produces text output containing energies, gradients and coupling vectors.
//! The [`Engine`] trait captures exactly that capability so that the job
//! driver does not depend on how the engine is run.
//!
//! [`CommandEngine`] is the production implementation. For every frame it:
//!
//! 1. Creates a private scratch directory (`GEOM_<index>_*`)
//! 2. Writes the rendered deck into it
//! 3. Spawns the configured command with stdout/stderr redirected to files
//! 4. Waits for the child with a wall-clock limit, killing it on timeout
//! 5. Reads the engine output (stdout or a named output file)
//!
//! The scratch directory and the child process are both owned by guards, so
//! they are cleaned up on success, failure, timeout, and panic alike.
//!
//! Engine launchers are usually wrapper scripts that start the real program
//! as a grandchild. On Unix the child gets its own process group and a kill
//! is sent to the whole group, so nothing keeps computing in a scratch
//! directory that is about to be removed.

use crate::config::EngineConfig;
use crate::geometry::Frame;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failure of one frame's engine calculation.
///
/// Engine errors are isolated to their frame: they are recorded and never
/// abort sibling frames or batches.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("frame {frame_index}: {cause}")]
pub struct EngineError {
    /// Zero-based index of the failed frame
    pub frame_index: usize,
    /// What went wrong
    pub cause: EngineFailure,
}

/// Reason an engine calculation failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineFailure {
    /// Engine executable could not be started
    #[error("failed to start engine: {0}")]
    Spawn(String),
    /// Engine terminated with a non-zero status (`None` if killed by a signal)
    #[error("engine exited with status {code:?}")]
    Exit {
        /// Process exit code
        code: Option<i32>,
    },
    /// Engine exceeded its wall-clock limit and was killed
    #[error("engine exceeded the wall-clock limit of {seconds} s")]
    Timeout {
        /// Configured limit
        seconds: u64,
    },
    /// Engine finished but the expected output file is absent
    #[error("engine output file {0} not found")]
    MissingOutput(String),
    /// Scratch directory or file handling failed
    #[error("IO error: {0}")]
    Io(String),
}

/// Capability to compute one geometry with the quantum chemistry engine.
pub trait Engine: Send + Sync {
    /// Runs the engine on a rendered deck and returns its raw text output.
    fn compute(&self, frame: &Frame, deck: &str) -> Result<String, EngineError>;
}

/// Engine executed as a child process.
///
/// # Examples
///
/// ```no_run
/// use nacgen::config::EngineConfig;
/// use nacgen::engine::{CommandEngine, Engine};
/// use nacgen::geometry::Frame;
///
/// let engine = CommandEngine::new(EngineConfig::default());
/// let frame = Frame::new(0, vec!["H".to_string()], vec![0.0, 0.0, 0.0]);
/// let output = engine.compute(&frame, "$molecule\n0 2\nH 0 0 0\n$end\n");
/// ```
pub struct CommandEngine {
    config: EngineConfig,
    command: PathBuf,
}

impl CommandEngine {
    /// Creates an engine from its configuration.
    ///
    /// A command given as a relative path (e.g. `./run_engine.sh`) is made
    /// absolute here, because the child runs inside its scratch directory.
    pub fn new(config: EngineConfig) -> Self {
        let raw = PathBuf::from(&config.command);
        let command = if config.command.contains(std::path::MAIN_SEPARATOR) && raw.exists() {
            raw.canonicalize().unwrap_or(raw)
        } else {
            raw
        };
        Self { config, command }
    }

    /// Configuration this engine was built from
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn stem(&self) -> &str {
        Path::new(&self.config.deck_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("input")
    }

    fn expand(&self, template: &str) -> String {
        template
            .replace("{input}", &self.config.deck_name)
            .replace("{stem}", self.stem())
            .replace("{nprocs}", &self.config.nprocs.to_string())
            .replace("{mem}", &self.config.mem)
    }

    fn scratch_dir(&self, frame_index: usize) -> std::io::Result<tempfile::TempDir> {
        let prefix = format!("GEOM_{:05}_", frame_index);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.config.scratch_dir {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

impl Engine for CommandEngine {
    fn compute(&self, frame: &Frame, deck: &str) -> Result<String, EngineError> {
        let fail = |cause: EngineFailure| EngineError {
            frame_index: frame.index,
            cause,
        };
        let io_fail = |e: std::io::Error| fail(EngineFailure::Io(e.to_string()));

        let scratch = self.scratch_dir(frame.index).map_err(io_fail)?;
        let workdir = scratch.path();
        fs::write(workdir.join(&self.config.deck_name), deck).map_err(io_fail)?;

        let stdout_path = workdir.join("engine.stdout");
        let stderr_path = workdir.join("engine.stderr");
        let stdout = fs::File::create(&stdout_path).map_err(io_fail)?;
        let stderr = fs::File::create(&stderr_path).map_err(io_fail)?;

        let args: Vec<String> = self.config.args.iter().map(|a| self.expand(a)).collect();
        log::debug!(
            "frame {}: running {} {} in {}",
            frame.index,
            self.command.display(),
            args.join(" "),
            workdir.display()
        );

        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .map_err(|e| fail(EngineFailure::Spawn(format!("{}: {}", self.command.display(), e))))?;
        let mut child = ChildGuard(child);

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let status = match child.wait_timeout(timeout).map_err(io_fail)? {
            Some(status) => status,
            None => {
                child.kill();
                log::error!(
                    "frame {}: engine killed after {} s",
                    frame.index,
                    self.config.timeout_seconds
                );
                return Err(fail(EngineFailure::Timeout {
                    seconds: self.config.timeout_seconds,
                }));
            }
        };

        let output_path = match &self.config.output {
            Some(name) => workdir.join(self.expand(name)),
            None => stdout_path.clone(),
        };

        if !status.success() {
            // the scratch directory is deleted on return, so the log is the
            // only place the engine's complaint survives
            let log_path = if output_path.exists() { &output_path } else { &stderr_path };
            log::error!(
                "frame {}: engine exited with {}; last lines of {}:\n{}",
                frame.index,
                status,
                log_path.display(),
                tail(log_path, 20)
            );
            return Err(fail(EngineFailure::Exit {
                code: status.code(),
            }));
        }

        if !output_path.exists() {
            return Err(fail(EngineFailure::MissingOutput(
                output_path.display().to_string(),
            )));
        }
        let bytes = fs::read(&output_path).map_err(io_fail)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Owns a child process and kills it if dropped while still running.
///
/// On Unix the child leads its own process group and the whole group is
/// killed.
struct ChildGuard(Child);

impl ChildGuard {
    /// Waits for the child, returning `None` if `timeout` elapses first.
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        let mut interval = Duration::from_millis(20);
        loop {
            if let Some(status) = self.0.try_wait()? {
                return Ok(Some(status));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            thread::sleep(interval.min(timeout - elapsed));
            interval = (interval * 2).min(Duration::from_secs(1));
        }
    }

    fn kill(&mut self) {
        // the group id is the leader's pid, valid until the leader is reaped
        #[cfg(unix)]
        {
            let group = format!("-{}", self.0.id());
            let killed = Command::new("kill")
                .args(["-KILL", "--", &group])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(e) = killed {
                log::warn!("could not signal process group {}: {}", group, e);
            }
        }
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            self.kill();
        }
    }
}

fn tail(path: &Path, n: usize) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            lines[lines.len().saturating_sub(n)..].join("\n")
        }
        Err(e) => format!("<unreadable: {}>", e),
    }
}
