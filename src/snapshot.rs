//! Live hive snapshots through `reg save`.
//!
//! Live hives are locked by the OS, so they are copied to a flat file with the
//! system's snapshot command before decoding.

use crate::error::SnapshotError;
use log::debug;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Copies a live hive to a file
pub trait Snapshotter: Send + Sync {
    fn snapshot(&self, key_path: &str, destination: &Path) -> Result<(), SnapshotError>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `<program> [args...] save <key> <destination>`
#[derive(Debug, Clone)]
pub struct RegSave {
    program: OsString,
    leading_args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl Default for RegSave {
    fn default() -> Self {
        Self::new("reg")
    }
}

impl RegSave {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
        }
    }

    /// Arguments placed before `save <key> <destination>`
    #[cfg(test)]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Kill the command if it runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, key_path: &str, destination: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("save")
            .arg(key_path)
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn wait(&self, mut child: Child) -> Result<(ExitStatus, String), SnapshotError> {
        // Both pipes are read while the command runs
        let stderr = drain(child.stderr.take());
        let stdout = drain(child.stdout.take());

        let status = match self.timeout {
            None => child.wait(),
            Some(timeout) => {
                let started = Instant::now();
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) if started.elapsed() >= timeout => {
                            let _ = child.kill();
                            let _ = child.wait();
                            join_reader(stderr);
                            join_reader(stdout);
                            return Err(SnapshotError::TimedOut {
                                seconds: timeout.as_secs(),
                            });
                        }
                        Ok(None) => std::thread::sleep(POLL_INTERVAL),
                        Err(err) => break Err(err),
                    }
                }
            }
        }
        .map_err(|err| SnapshotError::UnknownCommandFailure {
            code: None,
            stderr: err.to_string(),
        })?;

        // reg writes its messages to either stream depending on version
        let output = [join_reader(stderr), join_reader(stdout)]
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Ok((status, output))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn join_reader(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}

impl Snapshotter for RegSave {
    fn snapshot(&self, key_path: &str, destination: &Path) -> Result<(), SnapshotError> {
        debug!("saving {} to {}", key_path, destination.display());
        let child = self.command(key_path, destination).spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                SnapshotError::CommandNotFound(self.program.to_string_lossy().into_owned())
            }
            ErrorKind::PermissionDenied => SnapshotError::AccessDenied(err.to_string()),
            _ => SnapshotError::UnknownCommandFailure {
                code: None,
                stderr: err.to_string(),
            },
        })?;

        let (status, output) = self.wait(child)?;
        if status.success() {
            Ok(())
        } else {
            Err(classify_failure(key_path, status.code(), output))
        }
    }
}

/// Map a failed run onto the snapshot error kinds
fn classify_failure(key_path: &str, code: Option<i32>, output: String) -> SnapshotError {
    let lowered = output.to_lowercase();
    if lowered.contains("access is denied") || lowered.contains("privilege") {
        SnapshotError::AccessDenied(output)
    } else if lowered.contains("unable to find") || lowered.contains("cannot find") {
        SnapshotError::KeyNotFound(key_path.to_string())
    } else {
        SnapshotError::UnknownCommandFailure { code, stderr: output }
    }
}
