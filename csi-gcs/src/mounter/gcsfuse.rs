use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{MountError, MountRequest, MountState, Mounter};
use crate::platform;

pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UNMOUNT_TIMEOUT: Duration = Duration::from_secs(2);

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Stderr lines kept for classifying an early exit.
const STDERR_TAIL_LINES: usize = 20;
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const USAGE_EXIT_CODE: i32 = 2;

/// Spawns and supervises `gcsfuse --foreground`.
#[derive(Debug, Clone)]
pub struct GcsFuseMounter {
    binary: PathBuf,
    mount_timeout: Duration,
    unmount_timeout: Duration,
}

impl GcsFuseMounter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            unmount_timeout: DEFAULT_UNMOUNT_TIMEOUT,
        }
    }

    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    pub fn with_unmount_timeout(mut self, timeout: Duration) -> Self {
        self.unmount_timeout = timeout;
        self
    }

    /// Helper argument vector for `request`.
    pub fn build_args(request: &MountRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(request.flags.len() + 6);
        if let Some(key_file) = &request.key_file {
            args.push(format!("--key-file={}", key_file.display()));
        }
        args.push("-o=allow_other".to_string());
        args.push("--foreground".to_string());
        args.extend(request.flags.iter().map(|flag| format!("-o={}", flag)));
        if request.read_only {
            args.push("-o=ro".to_string());
        }
        args.push(request.bucket.clone());
        args.push(request.target.display().to_string());
        args
    }
}

impl Default for GcsFuseMounter {
    fn default() -> Self {
        Self::new("gcsfuse")
    }
}

/// Forward helper stdout to the log.
fn drain_stdout<R>(reader: R, bucket: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(bucket = %bucket, "{}", line);
        }
    })
}

/// Forward helper stderr to the log, returning the last lines at EOF.
fn drain_stderr<R>(reader: R, bucket: String) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(bucket = %bucket, "{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into()
    })
}

/// Turn an early helper exit into a mount error.
fn classify_exit(code: Option<i32>, stderr: &str) -> MountError {
    let lower = stderr.to_lowercase();
    let detail = match code {
        Some(code) => format!("gcsfuse exited with code {}: {}", code, stderr),
        None => format!("gcsfuse was terminated by a signal: {}", stderr),
    };

    const PERMISSION_SIGNALS: [&str; 6] = [
        "permission denied",
        "403",
        "401",
        "forbidden",
        "unauthorized",
        "does not have",
    ];
    if PERMISSION_SIGNALS.iter().any(|s| lower.contains(s)) {
        return MountError::PermissionDenied(detail);
    }
    if code == Some(USAGE_EXIT_CODE) || lower.contains("invalid") || lower.contains("usage:") {
        return MountError::InvalidArgument(detail);
    }
    MountError::HelperFailed(detail)
}

#[tonic::async_trait]
impl Mounter for GcsFuseMounter {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        platform::ensure_directory(&request.target)?;

        let args = Self::build_args(request);
        info!(
            bucket = %request.bucket,
            target = %request.target.display(),
            read_only = request.read_only,
            "Mounting bucket"
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!(error = %e, binary = %self.binary.display(), "Failed to start gcsfuse");
                MountError::HelperFailed(format!(
                    "failed to start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if let Some(stdout) = child.stdout.take() {
            drain_stdout(stdout, request.bucket.clone());
        }
        let mut stderr_task = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, request.bucket.clone()));

        // The helper outlives this call; a waiter task owns it and reports
        // its exit, or kills it when asked to.
        let (exit_tx, mut exit_rx) = oneshot::channel::<std::io::Result<ExitStatus>>();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let bucket = request.bucket.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = cancel_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(bucket = %bucket, error = %e, "Failed to kill gcsfuse");
                    }
                    child.wait().await
                }
            };
            match &status {
                Ok(status) => info!(bucket = %bucket, status = %status, "gcsfuse exited"),
                Err(e) => warn!(bucket = %bucket, error = %e, "Failed to wait for gcsfuse"),
            }
            let _ = exit_tx.send(status);
        });

        let deadline = Instant::now() + self.mount_timeout;
        let mut interval = tokio::time::interval(MOUNT_POLL_INTERVAL);
        let result: Result<(), MountError> = async {
            loop {
                interval.tick().await;

                match exit_rx.try_recv() {
                    Ok(status) => {
                        let tail = match stderr_task.as_mut() {
                            Some(task) => tokio::time::timeout(STDERR_FLUSH_TIMEOUT, task)
                                .await
                                .ok()
                                .and_then(Result::ok)
                                .unwrap_or_default(),
                            None => Vec::new(),
                        };
                        let code = status.map_err(MountError::Io)?.code();
                        let err = classify_exit(code, &tail.join("\n"));
                        error!(bucket = %request.bucket, error = %err, "gcsfuse exited before mounting");
                        return Err(err);
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    Err(oneshot::error::TryRecvError::Closed) => {
                        return Err(MountError::HelperFailed(
                            "gcsfuse supervisor stopped unexpectedly".to_string(),
                        ));
                    }
                }

                if platform::mount_state(&request.target)? == MountState::Mounted {
                    info!(
                        bucket = %request.bucket,
                        target = %request.target.display(),
                        "Bucket mounted"
                    );
                    return Ok(());
                }

                if Instant::now() >= deadline {
                    error!(
                        bucket = %request.bucket,
                        target = %request.target.display(),
                        "Timed out waiting for mount"
                    );
                    return Err(MountError::Timeout {
                        target: request.target.display().to_string(),
                        after: self.mount_timeout,
                    });
                }
            }
        }
        .await;

        // A helper that is still running after a failed mount has no owner
        if result.is_err() {
            let _ = cancel_tx.send(());
        }
        result
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if platform::mount_state(target)? == MountState::Stale {
            // The helper is gone; only the kernel side is left.
            return platform::unmount_lazy(target).await;
        }
        let helper = platform::find_process_by_cmdline(target);
        platform::unmount(target).await?;

        if let Some(pid) = helper {
            debug!(pid, target = %target.display(), "Waiting for gcsfuse to exit");
            platform::wait_for_process_exit(pid, target, self.unmount_timeout).await?;
        }
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(platform::is_mounted(target)?)
    }

    async fn probe(&self, target: &Path) -> Result<MountState, MountError> {
        Ok(platform::mount_state(target)?)
    }
}
