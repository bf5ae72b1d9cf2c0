//! Server lifecycle contract
//!
//! Every managed unit goes through `prepare → start → wait_ready → fill`
//! on the way up and `stop` on the way down. [`ServerCore`] carries the
//! state and default behavior shared by all adapters; an adapter embeds one
//! and overrides only the steps its technology needs.

use crate::config::{CommandLine, Scalar, ServerSpec};
use crate::runtime::process::{
    probe_address, Address, ManagedProcess, ProcessConfig, ProcessError, StopOutcome,
    POLL_INTERVAL, STOP_BUDGET,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Seconds a server gets to become ready unless configured otherwise
pub const DEFAULT_START_TIMEOUT: f64 = 5.0;

/// Session facts a server needs at construction time
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Directory containing the configuration file
    pub confdir: PathBuf,
    /// Session working root
    pub basedir: PathBuf,
}

impl ServerContext {
    pub fn new(confdir: impl Into<PathBuf>, basedir: impl Into<PathBuf>) -> Self {
        Self {
            confdir: confdir.into(),
            basedir: basedir.into(),
        }
    }

    /// Resolve a user-supplied path against the config directory
    pub fn confpath(&self, path: impl AsRef<Path>) -> PathBuf {
        self.confdir.join(path)
    }

    /// Private working directory of server `name`
    pub fn server_dir(&self, name: &str) -> PathBuf {
        self.basedir.join(name)
    }
}

/// Options understood by every server type
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonOptions {
    /// Seconds to wait for the pidfile and for readiness
    #[serde(default)]
    pub start_timeout: Option<f64>,
    /// File the daemon writes its pid to, relative to the server dir
    #[serde(default)]
    pub pidfile: Option<String>,
    /// Address probed for readiness (`host:port` or a socket path)
    #[serde(default)]
    pub address: Option<String>,
    /// Stdout log file, relative to the server dir
    #[serde(default)]
    pub stdout: Option<String>,
    /// Stderr log file, relative to the server dir
    #[serde(default)]
    pub stderr: Option<String>,
    /// Extra environment for the server process
    #[serde(default)]
    pub environ: IndexMap<String, Scalar>,
}

/// State shared by every server implementation
pub struct ServerCore {
    /// Server name, also the name of its directory
    pub name: String,
    /// Servers this one starts after
    pub after: Vec<String>,
    /// Session context
    pub context: ServerContext,
    /// Private working directory
    pub basedir: PathBuf,
    /// Command line, set at construction or during prepare
    pub command: Vec<String>,
    /// Environment added on top of the inherited one
    pub environ: IndexMap<String, String>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub address: Option<Address>,
    pub start_timeout: Duration,
    process: Option<ManagedProcess>,
}

impl ServerCore {
    /// Build the shared state from a spec and its common options
    pub fn new(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
        common: CommonOptions,
    ) -> Result<Self, ServerError> {
        let basedir = context.server_dir(name);
        let start_timeout = common.start_timeout.unwrap_or(DEFAULT_START_TIMEOUT);
        let start_timeout = Duration::try_from_secs_f64(start_timeout).map_err(|_| {
            ServerError::config(name, format!("invalid start_timeout {}", start_timeout))
        })?;
        let log_name = format!("{}.log", name);

        Ok(Self {
            name: name.to_string(),
            after: spec.after.names(),
            context: context.clone(),
            stdout: Some(basedir.join(common.stdout.as_deref().unwrap_or(&log_name))),
            stderr: Some(basedir.join(common.stderr.as_deref().unwrap_or(&log_name))),
            pidfile: common.pidfile.as_deref().map(|p| basedir.join(p)),
            address: common.address.as_deref().map(Address::parse),
            environ: common
                .environ
                .into_iter()
                .map(|(k, v)| (k, v.into_string()))
                .collect(),
            start_timeout,
            basedir,
            command: Vec::new(),
            process: None,
        })
    }

    /// Resolve a path against the server directory
    pub fn basepath(&self, path: impl AsRef<Path>) -> PathBuf {
        self.basedir.join(path)
    }

    /// Resolve a path against the config directory
    pub fn confpath(&self, path: impl AsRef<Path>) -> PathBuf {
        self.context.confpath(path)
    }

    /// Resolve the program of a command line
    ///
    /// Relative paths with a directory component are taken relative to the
    /// config directory; bare names are left for `PATH` lookup.
    pub fn resolve_program(&self, program: &str) -> String {
        if program.contains('/') && Path::new(program).is_relative() {
            self.confpath(program).display().to_string()
        } else {
            program.to_string()
        }
    }

    /// Default prepare step: create the private working directory
    pub fn create_workdir(&self) -> Result<(), ServerError> {
        std::fs::create_dir_all(&self.basedir)
            .map_err(|e| ServerError::io(&self.name, format!("creating {}", self.basedir.display()), e))
    }

    /// Spawn the command and, for pidfile daemons, wait for the pidfile
    pub async fn launch(&mut self) -> Result<(), ServerError> {
        let mut config = ProcessConfig::from_argv(&self.name, &self.command)?;
        config.env = self.environ.clone();
        config.working_dir = Some(self.basedir.clone());
        config.stdout = self.stdout.clone();
        config.stderr = self.stderr.clone();

        let process = self.process.insert(ManagedProcess::new(config));
        process.start()?;
        if let Some(pidfile) = &self.pidfile {
            process.adopt_pidfile(pidfile, self.start_timeout).await?;
        }
        Ok(())
    }

    /// Default readiness probe: connect to the address, if any
    pub async fn probe(&self) -> bool {
        match &self.address {
            Some(address) => probe_address(address).await,
            None => true,
        }
    }

    /// Tracked pid, once started
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Whether the tracked process still exists
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ManagedProcess::is_running)
    }

    /// Terminate the tracked process
    pub async fn stop(&mut self) -> Result<StopOutcome, ServerError> {
        let Some(process) = self.process.as_mut() else {
            return Ok(StopOutcome::AlreadyExited);
        };
        if let Some(uptime) = process.uptime() {
            log::debug!("[{}] Stopping after {:.1}s", self.name, uptime.as_secs_f64());
        }
        Ok(process.stop(STOP_BUDGET).await?)
    }

    /// Deserialize type-specific options from the spec
    pub fn options<T: DeserializeOwned>(name: &str, spec: &ServerSpec) -> Result<T, ServerError> {
        spec.options_as()
            .map_err(|e| ServerError::config(name, e.to_string()))
    }

    /// Split a configured command line
    pub fn argv(&self, command: &CommandLine) -> Result<Vec<String>, ServerError> {
        let mut argv = command
            .argv()
            .map_err(|e| ServerError::config(&self.name, e))?;
        match argv.first_mut() {
            Some(program) => *program = self.resolve_program(program),
            None => return Err(ServerError::config(&self.name, "command should not be empty")),
        }
        Ok(argv)
    }
}

/// Lifecycle operations of one managed server
#[async_trait]
pub trait Server: Send + Sync {
    fn core(&self) -> &ServerCore;

    fn core_mut(&mut self) -> &mut ServerCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    /// Servers this one starts after
    fn after(&self) -> &[String] {
        &self.core().after
    }

    /// Create the working directory and any generated files
    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core().create_workdir()
    }

    /// Launch the process
    async fn start(&mut self) -> Result<(), ServerError> {
        self.core_mut().launch().await
    }

    /// Cheap readiness probe, never blocking longer than one connect attempt
    async fn is_ready(&self) -> bool {
        self.core().probe().await
    }

    /// Poll [`Server::is_ready`] until it succeeds or the start timeout elapses
    async fn wait_ready(&self) -> Result<(), ServerError> {
        let timeout = self.core().start_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ServerError::NotReady {
                    name: self.name().to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One-time provisioning once the server is ready
    async fn fill(&mut self) -> Result<(), ServerError> {
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.core_mut().is_running()
    }

    async fn stop(&mut self) -> Result<StopOutcome, ServerError> {
        self.core_mut().stop().await
    }
}

/// Errors reported by server implementations
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server '{name}': {message}")]
    Config { name: String, message: String },

    #[error("Server '{name}' has unknown type '{kind}'")]
    UnknownType { name: String, kind: String },

    #[error("Server '{name}': failed {context}: {source}")]
    Io {
        name: String,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Server {name} didn't get ready in {} seconds", timeout.as_secs_f64())]
    NotReady { name: String, timeout: Duration },

    #[error("Server '{name}': {tool} exited with {status}")]
    ToolFailed {
        name: String,
        tool: String,
        status: String,
    },
}

impl ServerError {
    pub fn config(name: &str, message: impl Into<String>) -> Self {
        ServerError::Config {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn io(name: &str, context: impl Into<String>, source: std::io::Error) -> Self {
        ServerError::Io {
            name: name.to_string(),
            context: context.into(),
            source,
        }
    }

    /// Whether the error is a configuration problem rather than a runtime one
    pub fn is_configuration(&self) -> bool {
        matches!(self, ServerError::Config { .. } | ServerError::UnknownType { .. })
    }
}

/// Run a helper tool to completion, failing on a non-zero exit
pub async fn run_tool(
    server: &ServerCore,
    argv: Vec<String>,
    stdin: Option<std::fs::File>,
) -> Result<(), ServerError> {
    let tool = argv.first().cloned().unwrap_or_default();
    let tool_name = Path::new(&tool)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| tool.clone());

    let mut config = ProcessConfig::from_argv(&server.name, &argv)?;
    config.working_dir = Some(server.basedir.clone());
    let log = server.basepath(format!("{}.log", tool_name));
    config.stdout = Some(log.clone());
    config.stderr = Some(log);

    let mut cmd = config.command()?;
    if let Some(file) = stdin {
        cmd.stdin(std::process::Stdio::from(file));
    }

    log::info!("[{}] Running {}", server.name, argv.join(" "));
    let status = cmd.status().await.map_err(|e| ProcessError::SpawnFailed {
        name: server.name.clone(),
        source: e,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(ServerError::ToolFailed {
            name: server.name.clone(),
            tool,
            status: status.to_string(),
        })
    }
}
