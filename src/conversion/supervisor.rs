use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{CapturedOutput, ConversionFailure};
use crate::config::ConverterCommand;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long output readers may keep draining after the converter is gone.
/// Grandchildren can hold the pipes open past the converter's own exit.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How a converter process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEnd {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    Cancelled,
    /// Waiting on the child failed; its status is unknown.
    Lost(String),
}

#[derive(Debug)]
pub struct Finished {
    pub end: ProcessEnd,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

/// Spawns the configured converter and watches it until it exits, times out,
/// or is cancelled.
#[derive(Debug, Clone)]
pub struct Supervisor {
    command: ConverterCommand,
    timeout: Duration,
    max_output_bytes: usize,
}

impl Supervisor {
    pub fn new(command: ConverterCommand, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            max_output_bytes,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn spawn(&self, input: &Path, output: &Path) -> Result<RunningConverter, ConversionFailure> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args).arg(input).arg(output);
        cmd.envs(&self.command.env);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so timeouts also reach grandchildren
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ConversionFailure::StartError {
            message: format!("{}: {}", self.command.program, e),
        })?;
        let pid = child.id();
        info!(
            pid,
            program = %self.command.program,
            input = %input.display(),
            output = %output.display(),
            "converter started"
        );

        let stdout = OutputCapture::start(child.stdout.take(), self.max_output_bytes);
        let stderr = OutputCapture::start(child.stderr.take(), self.max_output_bytes);
        Ok(RunningConverter {
            child,
            pid,
            stdout,
            stderr,
        })
    }
}

pub struct RunningConverter {
    child: Child,
    pid: Option<u32>,
    stdout: OutputCapture,
    stderr: OutputCapture,
}

impl RunningConverter {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the process to exit. On timeout or cancellation the process
    /// is killed and reaped before returning.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Finished {
        let end = tokio::select! {
            status = self.child.wait() => match status {
                Ok(status) => exit_of(status),
                Err(e) => ProcessEnd::Lost(e.to_string()),
            },
            _ = tokio::time::sleep(timeout) => {
                self.kill().await;
                ProcessEnd::TimedOut
            }
            _ = cancel.cancelled() => {
                self.kill().await;
                ProcessEnd::Cancelled
            }
        };
        debug!(pid = self.pid, ?end, "converter stopped");

        let stdout = self.stdout.finish().await;
        let stderr = self.stderr.finish().await;
        Finished {
            end,
            stdout,
            stderr,
        }
    }

    async fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::{
                sys::signal::{killpg, Signal},
                unistd::Pid,
            };
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "failed to kill converter process group");
            }
        }
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "failed to kill converter");
        }
    }
}

fn exit_of(status: ExitStatus) -> ProcessEnd {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessEnd::Exited {
        code: status.code(),
        signal,
    }
}

#[derive(Debug, Default)]
struct BoundedBuffer {
    bytes: Vec<u8>,
    dropped: u64,
    limit: usize,
}

impl BoundedBuffer {
    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.dropped += (chunk.len() - kept) as u64;
    }

    fn into_output(self) -> CapturedOutput {
        CapturedOutput {
            text: String::from_utf8_lossy(&self.bytes).into_owned(),
            dropped_bytes: self.dropped,
        }
    }
}

fn lock(buffer: &Mutex<BoundedBuffer>) -> MutexGuard<'_, BoundedBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads a child stream to the end, keeping the first `limit` bytes and
/// counting the rest.
struct OutputCapture {
    buffer: Arc<Mutex<BoundedBuffer>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn start<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(BoundedBuffer {
            limit,
            ..Default::default()
        }));
        let task = reader.map(|mut reader| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; READ_CHUNK_SIZE];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => lock(&buffer).push(&chunk[..n]),
                        Err(e) => {
                            debug!(error = %e, "output capture ended");
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(self) -> CapturedOutput {
        if let Some(mut task) = self.task {
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        let buffer = std::mem::take(&mut *lock(&self.buffer));
        buffer.into_output()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::testing::shell_converter;

    async fn run(command: ConverterCommand, timeout: Duration, limit: usize) -> Finished {
        let supervisor = Supervisor::new(command, timeout, limit);
        let converter = supervisor
            .spawn(Path::new("/in/a.txt"), Path::new("/out/a.md"))
            .unwrap();
        converter.wait(timeout, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_paths_are_trailing_arguments() {
        let finished = run(
            shell_converter("printf '%s|%s' \"$1\" \"$2\""),
            Duration::from_secs(10),
            1024,
        )
        .await;
        assert_eq!(
            finished.end,
            ProcessEnd::Exited {
                code: Some(0),
                signal: None
            }
        );
        assert_eq!(finished.stdout.text, "/in/a.txt|/out/a.md");
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr() {
        let finished = run(
            shell_converter("echo 'cannot parse' >&2; exit 3"),
            Duration::from_secs(10),
            1024,
        )
        .await;
        assert_eq!(
            finished.end,
            ProcessEnd::Exited {
                code: Some(3),
                signal: None
            }
        );
        assert_eq!(finished.stderr.text, "cannot parse\n");
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let finished = run(
            shell_converter("printf '%0100d' 0"),
            Duration::from_secs(10),
            10,
        )
        .await;
        assert_eq!(finished.stdout.text.len(), 10);
        assert_eq!(finished.stdout.dropped_bytes, 90);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let finished = run(shell_converter("exec sleep 30"), Duration::from_millis(200), 1024).await;
        assert_eq!(finished.end, ProcessEnd::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let supervisor = Supervisor::new(shell_converter("exec sleep 30"), Duration::from_secs(60), 1024);
        let converter = supervisor
            .spawn(Path::new("/in/a.txt"), Path::new("/out/a.md"))
            .unwrap();
        assert!(converter.pid().is_some());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let finished = converter.wait(Duration::from_secs(60), &cancel).await;
        assert_eq!(finished.end, ProcessEnd::Cancelled);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        use nix::{sys::signal::kill, unistd::Pid};

        let temp_dir = tempfile::tempdir().unwrap();
        let pid_file = temp_dir.path().join("grandchild.pid");
        let supervisor = Supervisor::new(
            shell_converter("sleep 30 & echo $! > \"$2\"; wait"),
            Duration::from_millis(500),
            1024,
        );
        let converter = supervisor
            .spawn(Path::new("/in/a.txt"), &pid_file)
            .unwrap();
        let finished = converter
            .wait(Duration::from_millis(500), &CancellationToken::new())
            .await;
        assert_eq!(finished.end, ProcessEnd::TimedOut);

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let running = || {
            kill(Pid::from_raw(pid), None).is_ok() &&
                !std::fs::read_to_string(format!("/proc/{pid}/stat"))
                    .unwrap_or_default()
                    .split(") ")
                    .nth(1)
                    .is_some_and(|rest| rest.starts_with('Z'))
        };
        for _ in 0..100 {
            if !running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("grandchild {pid} survived the timeout");
    }

    #[tokio::test]
    async fn test_missing_program_is_start_error() {
        let supervisor = Supervisor::new(
            ConverterCommand {
                program: "/nonexistent/converter".to_string(),
                args: vec![],
                working_dir: None,
                env: HashMap::new(),
            },
            Duration::from_secs(1),
            1024,
        );
        let err = supervisor
            .spawn(Path::new("/in/a.txt"), Path::new("/out/a.md"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "start_error");
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut command = shell_converter("printf '%s %s' \"$CONVERTER_MODE\" \"$(pwd)\"");
        command.env.insert("CONVERTER_MODE".to_string(), "fast".to_string());
        command.working_dir = Some(temp_dir.path().to_path_buf());

        let finished = run(command, Duration::from_secs(10), 4096).await;
        let expected_dir = temp_dir.path().canonicalize().unwrap();
        assert_eq!(
            finished.stdout.text,
            format!("fast {}", expected_dir.display())
        );
    }
}
