//! Managed process abstraction and process-control primitives

use indexmap::IndexMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};

/// Interval between two polls of a pidfile, a socket or a dying process
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a process gets to exit after SIGTERM before it is killed
pub const STOP_BUDGET: Duration = Duration::from_secs(5);

/// Upper bound for a single readiness connect attempt
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is pending start
    Pending,
    /// Process is running
    Running,
    /// Process has stopped with exit code
    Stopped(Option<i32>),
    /// Process failed to start
    Failed,
}

impl ProcessStatus {
    /// Check if process is running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone
    AlreadyExited,
    /// The process exited after SIGTERM
    Graceful,
    /// The process ignored SIGTERM for the whole budget and was killed
    Forced,
}

/// Configuration for spawning a process
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path or name looked up in `PATH`
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables added on top of the inherited environment
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// File receiving stdout (inherited when absent)
    pub stdout: Option<PathBuf>,
    /// File receiving stderr (inherited when absent)
    pub stderr: Option<PathBuf>,
    /// Keep the parent's stdin instead of `/dev/null`
    pub inherit_stdin: bool,
}

impl ProcessConfig {
    /// Build a configuration from an argv-style command line
    pub fn from_argv(name: impl Into<String>, argv: &[String]) -> Result<Self, ProcessError> {
        let name = name.into();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProcessError::EmptyCommand(name.clone()))?;
        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            ..Default::default()
        })
    }

    /// Create the tokio command for this configuration
    ///
    /// The child gets default dispositions for the signals the
    /// orchestrator handles and an empty signal mask.
    pub fn command(&self) -> Result<Command, ProcessError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if !self.inherit_stdin {
            cmd.stdin(Stdio::null());
        }

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let stdout = self.stdout.as_deref().map(|p| self.open_log(p)).transpose()?;
        let stderr = match (&self.stderr, &self.stdout, &stdout) {
            // Same file for both streams: share one descriptor so lines interleave
            (Some(err), Some(out), Some(file)) if err == out => {
                Some(file.try_clone().map_err(|e| self.log_error(err, e))?)
            }
            (Some(err), _, _) => Some(self.open_log(err)?),
            (None, _, _) => None,
        };
        if let Some(file) = stdout {
            cmd.stdout(Stdio::from(file));
        }
        if let Some(file) = stderr {
            cmd.stderr(Stdio::from(file));
        }

        reset_child_signals(&mut cmd);
        Ok(cmd)
    }

    fn open_log(&self, path: &Path) -> Result<File, ProcessError> {
        File::create(path).map_err(|e| self.log_error(path, e))
    }

    fn log_error(&self, path: &Path, source: std::io::Error) -> ProcessError {
        ProcessError::LogFile {
            name: self.name.clone(),
            path: path.to_path_buf(),
            source,
        }
    }
}

fn reset_child_signals(cmd: &mut Command) {
    let hook = || {
        use nix::sys::signal::{sigprocmask, signal, SigHandler, SigSet, SigmaskHow};
        for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
            // SAFETY: restoring the default disposition installs no handler
            unsafe { signal(sig, SigHandler::SigDfl) }.map_err(std::io::Error::from)?;
        }
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
            .map_err(std::io::Error::from)?;
        Ok(())
    };
    // SAFETY: the hook only calls async-signal-safe functions
    // (sigaction and sigprocmask) between fork and exec.
    unsafe {
        cmd.pre_exec(hook);
    }
}

/// A managed child process
///
/// The tracked pid is either the spawned child's own pid or, for daemons
/// that report through a pidfile, the pid read from that file.
pub struct ManagedProcess {
    /// Process configuration
    pub config: ProcessConfig,
    /// Current status
    pub status: ProcessStatus,
    /// Tracked process ID (if running)
    pub pid: Option<u32>,
    /// Start time
    pub started_at: Option<Instant>,
    /// Child process handle
    child: Option<Child>,
    /// Whether `pid` came from a pidfile rather than from the spawned child
    adopted: bool,
}

impl ManagedProcess {
    /// Create a new managed process
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            status: ProcessStatus::Pending,
            pid: None,
            started_at: None,
            child: None,
            adopted: false,
        }
    }

    /// Start the process, returning its pid
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if self.status.is_running() {
            return Err(ProcessError::AlreadyRunning(self.config.name.clone()));
        }

        log::info!(
            "[{}] Starting: {} {}",
            self.config.name,
            self.config.program,
            self.config.args.join(" ")
        );

        let mut cmd = self.config.command()?;
        // A session torn down by a panic must not leak children
        cmd.kill_on_drop(true);

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                self.pid = Some(pid);
                self.status = ProcessStatus::Running;
                self.started_at = Some(Instant::now());
                self.child = Some(child);
                log::debug!("[{}] Spawned with PID {}", self.config.name, pid);
                Ok(pid)
            }
            Err(e) => {
                self.status = ProcessStatus::Failed;
                log::error!("[{}] Failed to spawn process: {}", self.config.name, e);
                Err(ProcessError::SpawnFailed {
                    name: self.config.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Track the pid a daemon writes to `pidfile` instead of the spawned child
    pub async fn adopt_pidfile(
        &mut self,
        pidfile: &Path,
        timeout: Duration,
    ) -> Result<u32, ProcessError> {
        match wait_for_pidfile(pidfile, timeout).await {
            Some(pid) => {
                log::debug!(
                    "[{}] Pidfile {} reports PID {}",
                    self.config.name,
                    pidfile.display(),
                    pid
                );
                self.pid = Some(pid);
                self.adopted = true;
                self.status = ProcessStatus::Running;
                Ok(pid)
            }
            None => Err(ProcessError::PidfileTimeout {
                name: self.config.name.clone(),
                path: pidfile.to_path_buf(),
                timeout,
            }),
        }
    }

    /// Check whether the tracked process still exists
    pub fn is_running(&mut self) -> bool {
        // Always reap the spawned child so it does not linger as a zombie
        if let Some(child) = &mut self.child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.child = None;
                    if !self.adopted {
                        self.status = ProcessStatus::Stopped(status.code());
                        self.pid = None;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!(
                        "[{}] Error checking process status: {}",
                        self.config.name,
                        e
                    );
                }
            }
        }

        match self.pid {
            Some(pid) if pid_alive(pid) => true,
            Some(_) => {
                self.pid = None;
                if self.status.is_running() {
                    self.status = ProcessStatus::Stopped(None);
                }
                false
            }
            None => false,
        }
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL once `budget` is spent)
    pub async fn stop(&mut self, budget: Duration) -> Result<StopOutcome, ProcessError> {
        if !self.is_running() {
            return Ok(StopOutcome::AlreadyExited);
        }
        let Some(pid) = self.pid else {
            return Ok(StopOutcome::AlreadyExited);
        };

        log::info!("[{}] Stopping process {}...", self.config.name, pid);
        let deadline = Instant::now() + budget;

        while Instant::now() < deadline {
            self.signal(pid, Signal::SIGTERM)?;
            tokio::time::sleep(POLL_INTERVAL).await;
            if !self.is_running() {
                log::info!("[{}] Process exited", self.config.name);
                return Ok(StopOutcome::Graceful);
            }
        }

        log::warn!(
            "[{}] Process did not exit gracefully, forcing kill",
            self.config.name
        );
        self.signal(pid, Signal::SIGKILL)?;

        if let Some(mut child) = self.child.take() {
            if !self.adopted {
                let _ = child.wait().await;
            } else {
                let _ = child.start_kill();
            }
        }
        self.status = ProcessStatus::Stopped(None);
        self.pid = None;
        Ok(StopOutcome::Forced)
    }

    /// Wait for the spawned child to exit
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NotStarted(self.config.name.clone()));
        };
        let status = child.wait().await.map_err(|e| ProcessError::SpawnFailed {
            name: self.config.name.clone(),
            source: e,
        })?;
        self.child = None;
        self.pid = None;
        self.status = ProcessStatus::Stopped(status.code());
        Ok(status)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                name: self.config.name.clone(),
                pid,
                source: e,
            }),
        }
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

/// Poll `pidfile` until it holds a pid or `timeout` elapses
pub async fn wait_for_pidfile(pidfile: &Path, timeout: Duration) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(content) = tokio::fs::read_to_string(pidfile).await {
            if let Some(pid) = content.lines().next().and_then(|l| l.trim().parse().ok()) {
                return Some(pid);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Whether a process with this pid exists and can be signalled
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Address a server accepts connections on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`
    Tcp(String),
    /// Unix socket path
    Unix(PathBuf),
}

impl Address {
    /// `host:port` when the part after the last colon is a port number,
    /// a Unix socket path otherwise
    pub fn parse(s: &str) -> Self {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Address::Tcp(s.to_string())
            }
            _ => Address::Unix(PathBuf::from(s)),
        }
    }

    /// TCP address from separate host and port
    pub fn tcp(host: &str, port: &str) -> Self {
        Address::Tcp(format!("{}:{}", host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "{}", addr),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Connect to `address` and close the connection right away
pub async fn probe_address(address: &Address) -> bool {
    match address {
        Address::Tcp(addr) => matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr.as_str())).await,
            Ok(Ok(_))
        ),
        Address::Unix(path) => matches!(
            tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await,
            Ok(Ok(_))
        ),
    }
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Process '{0}' was never started")]
    NotStarted(String),

    #[error("Process '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Failed to open log file '{}' for '{name}': {source}", path.display())]
    LogFile {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server {name} didn't start (pidfile {}) in {} seconds", path.display(), timeout.as_secs_f64())]
    PidfileTimeout {
        name: String,
        path: PathBuf,
        timeout: Duration,
    },

    #[error("Failed to signal process '{name}' (PID {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
}
