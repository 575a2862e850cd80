//! Confined process execution
//!
//! Spawns one command inside a scratch directory, streams its output as it
//! arrives and enforces wall-clock, memory and output ceilings.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::outcome::{OutputChunk, OutputStream};
use crate::engine::sandbox::{sample_group_rss, Limits, SandboxConfig};

/// How often the memory watchdog samples the process
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for buffered output once the process is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Wall-clock limit exceeded, or CPU limit (SIGXCPU)
    TimeLimitExceeded,
    /// Memory watchdog fired
    MemoryLimitExceeded,
    /// Killed by signal
    Signaled(i32),
    /// Stopped because the caller cancelled
    Cancelled,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Execution status
    pub status: ExecutionStatus,
    /// Wall clock from spawn to exit or kill, in milliseconds
    pub time_ms: u64,
    /// Highest resident set size seen by the watchdog
    pub peak_memory_bytes: Option<u64>,
    pub stdout: String,
    pub stderr: String,
    /// Output went past the configured ceiling and was cut
    pub truncated: bool,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Exited(0))
    }

    /// Exit code, when the program exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExecutionStatus::Exited(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Wall-clock limit in milliseconds
    pub time_ms: u64,
    /// Resident memory ceiling in bytes
    pub memory_bytes: u64,
    /// Also cap the address space (at twice the memory ceiling)
    pub limit_address_space: bool,
    pub open_files: u64,
    pub fsize_bytes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_ms: 1000,
            memory_bytes: 256 * 1024 * 1024,
            limit_address_space: false,
            open_files: 256,
            fsize_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub work_dir: PathBuf,
    pub command: Vec<String>,
    pub limits: ExecutionLimits,
    pub stdin: Option<String>,
}

impl ExecutionSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command: vec![],
            limits: ExecutionLimits::default(),
            stdin: None,
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Run a command confined by `config` and `spec.limits`
///
/// `on_output` sees every captured chunk in the order it was read. `Err` means
/// the process could not be started at all.
pub async fn execute_sandboxed(
    spec: &ExecutionSpec,
    config: &SandboxConfig,
    on_output: &(dyn Fn(OutputChunk) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome> {
    let (program, args) = spec
        .command
        .split_first()
        .context("No command specified for execution")?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.work_dir)
        .env_clear()
        .env("PATH", &config.path)
        .env("HOME", &spec.work_dir)
        .env("TMPDIR", &spec.work_dir)
        .env("LANG", "C.UTF-8")
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    Limits {
        cpu_secs: Limits::cpu_secs_for(spec.limits.time_ms),
        address_space_bytes: spec
            .limits
            .limit_address_space
            .then(|| spec.limits.memory_bytes.saturating_mul(2)),
        open_files: spec.limits.open_files,
        fsize_bytes: spec.limits.fsize_bytes,
        network: config.network,
    }
    .install(&mut command);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", spec.command))?;
    let pid = child.id().context("Spawned process has no pid")?;
    debug!("Spawned {:?} as pid {}", spec.command, pid);

    if let (Some(mut stdin), Some(content)) = (child.stdin.take(), spec.stdin.clone()) {
        tokio::spawn(async move {
            // The program may exit without reading its input
            if let Err(e) = stdin.write_all(content.as_bytes()).await {
                debug!("Stdin not fully written: {}", e);
            }
        });
    }

    let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(64);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone())));
    }
    drop(tx);

    let mut capture = OutputCapture::new(config.max_output_bytes, on_output);
    let mut peak_memory_bytes = None;
    let mut stop_reason = None;
    let mut pipes_open = true;

    let deadline = tokio::time::sleep(Duration::from_millis(spec.limits.time_ms));
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);

    let (exit_status, time_ms) = loop {
        tokio::select! {
            status = child.wait() => {
                let elapsed = started.elapsed().as_millis() as u64;
                break (status.context("Failed to wait for process")?, elapsed);
            }
            _ = cancel.cancelled(), if stop_reason.is_none() => {
                debug!("Cancelling pid {}", pid);
                kill_group(pid, &mut child);
                stop_reason = Some(ExecutionStatus::Cancelled);
            }
            _ = &mut deadline, if stop_reason.is_none() => {
                debug!("Pid {} exceeded {} ms", pid, spec.limits.time_ms);
                kill_group(pid, &mut child);
                stop_reason = Some(ExecutionStatus::TimeLimitExceeded);
            }
            _ = ticker.tick(), if stop_reason.is_none() => {
                if let Some(rss) = sample_group_rss(pid).await {
                    peak_memory_bytes = peak_memory_bytes.max(Some(rss));
                    if rss > spec.limits.memory_bytes {
                        debug!("Process group {} reached {} bytes resident", pid, rss);
                        kill_group(pid, &mut child);
                        stop_reason = Some(ExecutionStatus::MemoryLimitExceeded);
                    }
                }
            }
            chunk = rx.recv(), if pipes_open => match chunk {
                Some((stream, data)) => capture.push(stream, data),
                None => pipes_open = false,
            },
        }
    };

    // Background children may still hold the pipes open
    kill_group(pid, &mut child);
    if pipes_open {
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some((stream, data)) = rx.recv().await {
                capture.push(stream, data);
            }
        })
        .await;
        if drained.is_err() {
            warn!("Output of pid {} not drained within grace period", pid);
        }
    }
    for reader in readers {
        reader.abort();
    }

    let status = stop_reason.unwrap_or_else(|| classify_exit(exit_status));
    let OutputCapture {
        stdout,
        stderr,
        truncated,
        ..
    } = capture;

    Ok(ExecutionOutcome {
        status,
        time_ms,
        peak_memory_bytes,
        stdout,
        stderr,
        truncated,
    })
}

fn classify_exit(status: ExitStatus) -> ExecutionStatus {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return ExecutionStatus::Exited(code);
    }
    match status.signal() {
        Some(sig) if sig == Signal::SIGXCPU as i32 => ExecutionStatus::TimeLimitExceeded,
        Some(sig) => ExecutionStatus::Signaled(sig),
        None => ExecutionStatus::Exited(-1),
    }
}

/// SIGKILL the whole process group; falls back to the direct child
fn kill_group(pid: u32, child: &mut Child) {
    if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_err() {
        let _ = child.start_kill();
    }
}

/// Read a pipe to EOF, forwarding text cut on UTF-8 boundaries
async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read from {:?} failed: {}", stream, e);
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8_prefix(&mut pending);
        if !text.is_empty() && tx.send((stream, text)).await.is_err() {
            return;
        }
    }

    if !pending.is_empty() {
        let _ = tx
            .send((stream, String::from_utf8_lossy(&pending).into_owned()))
            .await;
    }
}

/// Remove and return the longest decodable prefix of `pending`
///
/// Invalid sequences become U+FFFD; an incomplete trailing sequence stays
/// behind for the next read.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    None => {
                        pending.drain(..valid);
                        return text;
                    }
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + len);
                    }
                }
            }
        }
    }
}

/// Accumulates output up to a shared ceiling for both streams
struct OutputCapture<'a> {
    stdout: String,
    stderr: String,
    captured: usize,
    limit: usize,
    truncated: bool,
    on_output: &'a (dyn Fn(OutputChunk) + Send + Sync),
}

impl<'a> OutputCapture<'a> {
    fn new(limit: usize, on_output: &'a (dyn Fn(OutputChunk) + Send + Sync)) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            captured: 0,
            limit,
            truncated: false,
            on_output,
        }
    }

    fn push(&mut self, stream: OutputStream, mut data: String) {
        if self.truncated {
            return;
        }
        let remaining = self.limit - self.captured;
        if data.len() > remaining {
            let mut cut = remaining;
            while !data.is_char_boundary(cut) {
                cut -= 1;
            }
            data.truncate(cut);
            self.truncated = true;
        }
        if data.is_empty() {
            return;
        }

        self.captured += data.len();
        match stream {
            OutputStream::Stdout => self.stdout.push_str(&data),
            OutputStream::Stderr => self.stderr.push_str(&data),
        }
        (self.on_output)(OutputChunk { stream, data });
    }
}
