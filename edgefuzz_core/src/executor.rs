use crate::constants::{MAP_SIZE, TRACE_FILE_ENV_VAR};
use log::{error, warn};
use std::io::{Read, Seek, SeekFrom, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Classified result of one target execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Ok,
    Timeout,
    /// The target crashed; the payload is the terminating signal or exit code.
    Crash(i32),
    /// The target could not be run at all.
    Error(String),
}

/// Runs the target once per call and reports its coverage.
///
/// Every call must return within roughly `timeout`; hang detection depends on it.
pub trait Executor {
    /// Executes the target on `input`.
    ///
    /// # Arguments
    /// * `input`: The test case bytes.
    /// * `timeout`: Wall-clock budget for this execution.
    /// * `trace`: Zeroed coverage map to be filled with this execution's raw
    ///   per-edge hit counts.
    ///
    /// # Returns
    /// The classified outcome.
    fn execute(&mut self, input: &[u8], timeout: Duration, trace: &mut [u8]) -> ExecStatus;

    /// Human-readable description of the target, used in reports.
    fn describe(&self) -> String {
        "in-process harness".to_string()
    }
}

/// Runs a Rust closure as the target.
///
/// The closure receives the input and the trace map. Panics are reported as
/// crashes (reason 6, as for an abort) and runs longer than the timeout as
/// timeouts.
pub struct InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut [u8]),
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut [u8]),
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

/// Crash reason reported for a panicking in-process harness.
pub const PANIC_CRASH_REASON: i32 = 6;

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut [u8]),
{
    fn execute(&mut self, input: &[u8], timeout: Duration, trace: &mut [u8]) -> ExecStatus {
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(input, trace);
        }));

        match result {
            Ok(()) if start.elapsed() > timeout => ExecStatus::Timeout,
            Ok(()) => ExecStatus::Ok,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                log::debug!("Harness panicked: {msg}");
                ExecStatus::Crash(PANIC_CRASH_REASON)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Write the input to a file and substitute its path for `template` in the
    /// command arguments (appended if no argument contains it).
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub working_dir: Option<PathBuf>,
    /// Treat a non-zero exit status as a crash.
    pub crash_on_nonzero_exit: bool,
}

/// Spawns the target as a child process for every execution.
///
/// Coverage is exchanged through a trace file whose path is exported in
/// `EDGEFUZZ_TRACE_FILE`; the target writes one hit counter byte per edge.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    input_file: Option<tempfile::NamedTempFile>,
    trace_file: tempfile::NamedTempFile,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> std::io::Result<Self> {
        let input_file = match config.input_delivery {
            InputDelivery::StdIn => None,
            InputDelivery::File(_) => Some(tempfile::NamedTempFile::new()?),
        };
        Ok(Self {
            config,
            input_file,
            trace_file: tempfile::NamedTempFile::new()?,
        })
    }

    fn run_and_wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<std::process::ExitStatus, ExecStatus> {
        let start_time = Instant::now();
        let poll = (timeout / 20).clamp(Duration::from_micros(200), Duration::from_millis(50));

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        if let Err(e) = child.kill() {
                            warn!("Failed to kill timed-out target: {e}");
                            return Err(ExecStatus::Error(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecStatus::Timeout);
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => {
                    error!("Error waiting for target process: {e}");
                    return Err(ExecStatus::Error(format!("Error waiting for child: {e}")));
                }
            }
        }
    }

    fn reset_trace_file(&mut self) -> std::io::Result<()> {
        let file = self.trace_file.as_file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn read_trace(&mut self, trace: &mut [u8]) -> std::io::Result<()> {
        let file = self.trace_file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let limit = trace.len().min(MAP_SIZE);
        let mut filled = 0;
        while filled < limit {
            let n = file.read(&mut trace[filled..limit])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(())
    }

    fn build_command(&self) -> Result<Command, ExecStatus> {
        let Some(program) = self.config.command.first() else {
            return Err(ExecStatus::Error("Empty target command".to_string()));
        };
        let mut cmd = Command::new(program);
        let args = &self.config.command[1..];

        match (&self.config.input_delivery, &self.input_file) {
            (InputDelivery::File(template), Some(file)) => {
                let path_str = file.path().to_str().ok_or_else(|| {
                    ExecStatus::Error("Temp file path is not valid UTF-8".to_string())
                })?;
                let mut substituted = false;
                for arg in args {
                    if arg.contains(template.as_str()) {
                        cmd.arg(arg.replace(template.as_str(), path_str));
                        substituted = true;
                    } else {
                        cmd.arg(arg);
                    }
                }
                if !substituted {
                    cmd.arg(path_str);
                }
                cmd.stdin(Stdio::null());
            }
            _ => {
                cmd.args(args);
                cmd.stdin(Stdio::piped());
            }
        }

        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.env(TRACE_FILE_ENV_VAR, self.trace_file.path());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        Ok(cmd)
    }
}

impl Executor for CommandExecutor {
    fn execute(&mut self, input: &[u8], timeout: Duration, trace: &mut [u8]) -> ExecStatus {
        if let Err(e) = self.reset_trace_file() {
            return ExecStatus::Error(format!("Failed to reset trace file: {e}"));
        }

        if let Some(file) = self.input_file.as_mut() {
            let f = file.as_file_mut();
            let written = f
                .set_len(0)
                .and_then(|_| f.seek(SeekFrom::Start(0)))
                .and_then(|_| f.write_all(input))
                .and_then(|_| f.flush());
            if let Err(e) = written {
                return ExecStatus::Error(format!(
                    "Failed to write to temp file {:?}: {}",
                    file.path(),
                    e
                ));
            }
        }

        let mut cmd = match self.build_command() {
            Ok(cmd) => cmd,
            Err(status) => return status,
        };

        let mut child_process = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg =
                    format!("Failed to spawn command '{:?}': {}", self.config.command, e);
                error!("{error_msg}");
                return ExecStatus::Error(error_msg);
            }
        };

        // Stdin is fed from a helper thread so a target that never drains the
        // pipe still runs under the timeout.
        let writer = if self.config.input_delivery == InputDelivery::StdIn {
            let Some(mut child_stdin) = child_process.stdin.take() else {
                let _ = child_process.kill();
                let _ = child_process.wait();
                return ExecStatus::Error(
                    "Child stdin was not available after piping.".to_string(),
                );
            };
            let data = input.to_vec();
            Some(std::thread::spawn(move || child_stdin.write_all(&data)))
        } else {
            None
        };

        let waited = self.run_and_wait_with_timeout(child_process, timeout);

        // A writer still blocked here belongs to a descendant holding the pipe
        // open; it finishes on its own once that process exits.
        if let Some(handle) = writer.filter(|h| h.is_finished()) {
            let written = handle
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            if let Err(e) = written {
                // The target may exit without reading all of its input.
                if e.kind() != std::io::ErrorKind::BrokenPipe && waited.is_ok() {
                    return ExecStatus::Error(format!("Failed to write to stdin: {e}"));
                }
            }
        }

        let status = match waited {
            Ok(status) => status,
            Err(ExecStatus::Timeout) => {
                // Keep the coverage recorded before the kill.
                if let Err(e) = self.read_trace(trace) {
                    return ExecStatus::Error(format!("Failed to read trace file: {e}"));
                }
                return ExecStatus::Timeout;
            }
            Err(status) => return status,
        };

        if let Err(e) = self.read_trace(trace) {
            return ExecStatus::Error(format!("Failed to read trace file: {e}"));
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExecStatus::Crash(signal);
            }
        }

        match status.code() {
            Some(0) => ExecStatus::Ok,
            Some(code) if self.config.crash_on_nonzero_exit => ExecStatus::Crash(code),
            Some(_) => ExecStatus::Ok,
            None => ExecStatus::Crash(0),
        }
    }

    fn describe(&self) -> String {
        self.config.command.join(" ")
    }
}
