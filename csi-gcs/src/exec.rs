//! Running external tools.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A finished tool invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Builder for a single tool run.
pub struct Invocation<'a> {
    command: Command,
    stdin: Option<&'a [u8]>,
    timeout: Option<Duration>,
    display: String,
}

impl<'a> Invocation<'a> {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let display = program.as_ref().to_string_lossy().into_owned();
        let mut command = Command::new(program);
        command.kill_on_drop(true);
        Self {
            command,
            stdin: None,
            timeout: None,
            display,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.display.push(' ');
            self.display.push_str(&arg.as_ref().to_string_lossy());
            self.command.arg(arg);
        }
        self
    }

    pub fn env(mut self, key: &str, value: impl AsRef<OsStr>) -> Self {
        self.command.env(key, value);
        self
    }

    /// Point gcloud at a key file instead of its configured account.
    pub fn credential_file(self, key_file: Option<&Path>) -> Self {
        match key_file {
            Some(path) => self.env("CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE", path),
            None => self,
        }
    }

    pub fn stdin(mut self, data: &'a [u8]) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run to completion. A non-zero exit is not an error here; callers
    /// inspect [`CommandOutput::success`] and classify stderr themselves.
    pub async fn run(mut self) -> io::Result<CommandOutput> {
        debug!(command = %self.display, "Running command");

        let stdin = if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self
            .command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(data), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            // Closing stdin lets the tool see EOF
            drop(pipe);
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("'{}' did not finish within {:?}", self.display, limit),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(output.into())
    }
}
