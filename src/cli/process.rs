//! mirrord process spawning and control.
//!
//! This module provides a builder for the mirrord command line and
//! environment, and a handle that owns the spawned process for the lifetime
//! of a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Environment variable that switches the binary to line-delimited JSON progress.
pub const PROGRESS_MODE_ENV: &str = "MIRRORD_PROGRESS_MODE";

/// Variables copied from the driver's own environment when set.
const PASSTHROUGH_ENV: &[&str] = &["MIRRORD_IMPERSONATED_TARGET", "RUST_LOG"];

/// Error type for process launch operations.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    /// The binary was not found.
    #[error("mirrord binary not found: {}", .0.display())]
    NotFound(PathBuf),
    /// Permission denied when spawning.
    #[error("Permission denied executing {}", .0.display())]
    PermissionDenied(PathBuf),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    /// Create a `LaunchError` from an I/O error, classifying common cases.
    fn from_io(binary: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(binary.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(binary.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}

/// Builder for a mirrord invocation: subcommand, flags and environment.
#[derive(Debug, Clone, Default)]
pub struct MirrordCommand {
    command: String,
    target: Option<String>,
    config_file: Option<String>,
    executable: Option<String>,
    output: Option<String>,
    extra_args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl MirrordCommand {
    /// Create a builder for an arbitrary subcommand.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// `mirrord ext`: prepare the environment for a process the IDE launches.
    #[must_use]
    pub fn ext() -> Self {
        Self::new("ext")
    }

    /// `mirrord ls -o json`: list the available targets.
    #[must_use]
    pub fn ls() -> Self {
        Self::new("ls").output("json")
    }

    /// `mirrord verify-config --ide <path>`.
    #[must_use]
    pub fn verify_config(path: impl Into<String>) -> Self {
        Self::new("verify-config").arg("--ide").arg(path)
    }

    /// Set the target to impersonate.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the mirrord configuration file.
    #[must_use]
    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Set the executable the environment is prepared for.
    #[must_use]
    pub fn executable(mut self, path: impl Into<String>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Set the output format.
    #[must_use]
    pub fn output(mut self, format: impl Into<String>) -> Self {
        self.output = Some(format.into());
        self
    }

    /// Append a trailing argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Set an environment variable for the mirrord process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables for the mirrord process.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the working directory for the mirrord process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the subcommand.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![self.command.clone()];

        if let Some(target) = &self.target {
            args.push("-t".to_string());
            args.push(target.clone());
        }

        if let Some(path) = &self.config_file {
            args.push("-f".to_string());
            args.push(path.clone());
        }

        if let Some(path) = &self.executable {
            args.push("-e".to_string());
            args.push(path.clone());
        }

        if let Some(format) = &self.output {
            args.push("-o".to_string());
            args.push(format.clone());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Build the environment passed to the process.
    ///
    /// Explicit variables win over the ones copied from the driver's own
    /// environment; the progress mode is always JSON.
    #[must_use]
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = PASSTHROUGH_ENV
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
            .collect();

        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(PROGRESS_MODE_ENV.to_string(), "json".to_string());
        env
    }
}

/// Forced termination of a supervised process.
#[async_trait]
pub trait Terminate: Send {
    /// Kill the process. Calling this on a process that already exited is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be delivered.
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// A running mirrord process.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    command_line: String,
}

impl SupervisedProcess {
    /// Launch `binary` with the given arguments and environment.
    ///
    /// Stdout and stderr are piped; the process is killed if the handle is
    /// dropped while it is still running.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError` if the OS cannot start the process.
    pub fn launch(
        binary: impl AsRef<Path>,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, LaunchError> {
        Self::launch_in(binary.as_ref(), args, env, None)
    }

    /// Launch `binary` with the invocation described by `command`.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError` if the OS cannot start the process.
    pub fn spawn(binary: impl AsRef<Path>, command: &MirrordCommand) -> Result<Self, LaunchError> {
        Self::launch_in(
            binary.as_ref(),
            &command.build_args(),
            &command.build_env(),
            command.get_working_dir().map(PathBuf::as_path),
        )
    }

    fn launch_in(
        binary: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
    ) -> Result<Self, LaunchError> {
        let command_line = render_command_line(binary, args);

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_io(binary, e))?;

        tracing::info!(pid = ?child.id(), command = %command_line, "Launched mirrord");

        Ok(Self {
            child,
            command_line,
        })
    }

    /// Shell-quoted command line, for logs.
    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Wait up to `timeout` for the process to exit on its own.
    ///
    /// Returns `None` if it is still running when the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Let the process exit on its own within `grace`, then terminate it
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn release(&mut self, grace: Duration) -> std::io::Result<()> {
        if self.wait_timeout(grace).await?.is_some() {
            return Ok(());
        }
        tracing::debug!(pid = ?self.id(), "mirrord still running after grace period");
        self.graceful_terminate(grace).await
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.graceful_terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.kill_running().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, timeout: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.id() else {
            return Ok(());
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        let _ = kill(nix_pid, Signal::SIGTERM);

        if self.wait_timeout(timeout).await?.is_some() {
            Ok(())
        } else {
            self.kill_running().await
        }
    }

    async fn kill_running(&mut self) -> std::io::Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Terminate for SupervisedProcess {
    async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(status) = self.child.try_wait()? {
            tracing::debug!(%status, "mirrord already exited");
            return Ok(());
        }
        tracing::debug!(pid = ?self.id(), "Killing mirrord");
        self.kill_running().await
    }
}

fn render_command_line(binary: &Path, args: &[String]) -> String {
    std::iter::once(binary.to_string_lossy())
        .chain(args.iter().map(|arg| std::borrow::Cow::Borrowed(arg.as_str())))
        .map(|part| shell_escape::escape(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
