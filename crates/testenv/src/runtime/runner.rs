//! Session runner - provisions servers, runs the command, tears everything down

use crate::config::{
    BasedirPolicy, ConfigDocument, ConfigError, TestenvConfig, VariableError, VariableResolver,
    VariableTable,
};
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::ports::PortPool;
use crate::runtime::process::{ManagedProcess, ProcessConfig, ProcessError, StopOutcome, STOP_BUDGET};
use crate::runtime::server::{Server, ServerContext, ServerError};
use crate::runtime::signals::ShutdownListener;
use crate::servers::ServerRegistry;
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Exit code reported when the session fails before the command finishes
pub const ORCHESTRATION_FAILURE_EXIT: i32 = 125;

/// Environment marker set for the user command
pub const SESSION_MARKER: &str = "TESTENV";

/// Command run when none is given
pub const DEFAULT_COMMAND: &str = "env";

/// Lifecycle notifications, tagged with the server name on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Prepared,
    Started { pid: Option<u32> },
    Ready,
    Filled,
    Stopped(StopOutcome),
    StopFailed(String),
}

/// Startup step a server was in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Start,
    WaitReady,
    Fill,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Prepare => "prepare",
            Phase::Start => "start",
            Phase::WaitReady => "wait_ready",
            Phase::Fill => "fill",
        })
    }
}

type EventSender = mpsc::UnboundedSender<(String, ServerEvent)>;

/// Session working root
enum Workdir {
    /// Temporary directory, removed on drop or cleanup
    Ephemeral(TempDir),
    /// Fixed directory under the config directory
    Fixed { path: PathBuf, cleanup: bool },
}

impl Workdir {
    fn path(&self) -> &Path {
        match self {
            Workdir::Ephemeral(dir) => dir.path(),
            Workdir::Fixed { path, .. } => path,
        }
    }
}

/// One testenv session
///
/// [`Runner::run`] goes through create basedir → resolve variables →
/// create servers → start servers → run command, and always finishes with
/// stopping the started servers and cleaning the basedir.
pub struct Runner {
    /// Loaded, unresolved configuration
    document: ConfigDocument,
    /// Server type lookup
    registry: ServerRegistry,
    /// Port reservations
    ports: PortPool,
    /// User command
    command: Vec<String>,
    /// Session working root, once created
    workdir: Option<Workdir>,
    /// Path of the working root, kept after cleanup
    basedir: Option<PathBuf>,
    /// Resolved configuration
    resolved: Option<TestenvConfig>,
    /// Resolved variables
    variables: VariableTable,
    /// Server instances, in document order
    servers: IndexMap<String, Box<dyn Server>>,
    /// Start order, once servers are created
    graph: Option<DependencyGraph>,
    /// Lifecycle event channel
    event_tx: Option<EventSender>,
}

impl Runner {
    /// Create a runner for `document`; an empty `command` runs `env`
    pub fn new(document: ConfigDocument, command: Vec<String>) -> Self {
        Self {
            document,
            registry: ServerRegistry::builtin(),
            ports: PortPool::process(),
            command,
            workdir: None,
            basedir: None,
            resolved: None,
            variables: VariableTable::new(),
            servers: IndexMap::new(),
            graph: None,
            event_tx: None,
        }
    }

    /// Use a custom server registry
    pub fn with_registry(mut self, registry: ServerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use a custom port pool
    pub fn with_ports(mut self, ports: PortPool) -> Self {
        self.ports = ports;
        self
    }

    /// Send lifecycle events to `tx`
    ///
    /// The sender is dropped when [`Runner::run`] returns.
    pub fn with_event_sender(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Session working root, once created
    pub fn basedir(&self) -> Option<&Path> {
        self.basedir.as_deref()
    }

    /// Resolved variables
    pub fn variables(&self) -> &VariableTable {
        &self.variables
    }

    /// Resolved configuration, once placeholders are expanded
    pub fn resolved_config(&self) -> Option<&TestenvConfig> {
        self.resolved.as_ref()
    }

    /// Check server types and ordering without touching the filesystem
    ///
    /// Returns the start order. Placeholders are left unresolved, so
    /// adapter-specific options are only checked by [`Runner::run`].
    pub fn plan(&self) -> Result<Vec<String>, RunnerError> {
        let servers = &self.document.config.servers;
        let known: Vec<&str> = self.registry.kinds().collect();
        for (name, spec) in servers {
            if !known.contains(&spec.kind.as_str()) {
                return Err(ServerError::UnknownType {
                    name: name.clone(),
                    kind: spec.kind.clone(),
                }
                .into());
            }
        }

        let edges: IndexMap<String, Vec<String>> = servers
            .iter()
            .map(|(name, spec)| (name.clone(), spec.after.names()))
            .collect();
        let graph = DependencyGraph::build(&edges)?;
        Ok(graph.launch_order().map(String::from).collect())
    }

    /// Run the whole session and return the command's exit code
    ///
    /// Started servers are stopped and the basedir is cleaned whatever
    /// happens before, including a shutdown request at any point.
    pub async fn run(&mut self, mut shutdown: ShutdownListener) -> Result<i32, RunnerError> {
        let result = self.execute(&mut shutdown).await;
        if let Err(e) = &result {
            log::error!("{}", e);
        }
        self.stop_servers().await;
        self.cleanup();
        // Session over: close the event channel
        self.event_tx = None;
        result
    }

    async fn execute(&mut self, shutdown: &mut ShutdownListener) -> Result<i32, RunnerError> {
        self.create_basedir()?;
        self.parametrize_config()?;
        self.create_servers()?;
        self.start_servers(shutdown).await?;
        self.run_command(shutdown).await
    }

    fn create_basedir(&mut self) -> Result<(), RunnerError> {
        let workdir = match self.document.config.basedir_policy(&self.document.confdir) {
            BasedirPolicy::Ephemeral => {
                let dir = tempfile::Builder::new()
                    .prefix("testenv-")
                    .tempdir()
                    .map_err(|e| RunnerError::Workdir {
                        path: std::env::temp_dir(),
                        source: e,
                    })?;
                Workdir::Ephemeral(dir)
            }
            BasedirPolicy::Fixed { path, cleanup } => {
                if path.exists() {
                    log::info!("Removing stale basedir {}", path.display());
                    std::fs::remove_dir_all(&path).map_err(|e| RunnerError::Workdir {
                        path: path.clone(),
                        source: e,
                    })?;
                }
                std::fs::create_dir_all(&path).map_err(|e| RunnerError::Workdir {
                    path: path.clone(),
                    source: e,
                })?;
                Workdir::Fixed { path, cleanup }
            }
        };

        log::info!("Basedir: {}", workdir.path().display());
        self.basedir = Some(workdir.path().to_path_buf());
        self.workdir = Some(workdir);
        Ok(())
    }

    fn parametrize_config(&mut self) -> Result<(), RunnerError> {
        let basedir = self.basedir.clone().unwrap_or_default();
        let extra = &self.document.config.extra;

        let mut resolver = VariableResolver::new(&self.document.confdir, &basedir, self.ports.clone())
            .with_extra(extra);
        let resolved = resolver.resolve(self.document.raw.clone())?;
        let config = TestenvConfig::from_value(resolved)?;
        resolver.merge_extra(&config.extra);

        self.variables = resolver.into_table();
        for (name, value) in &self.variables {
            log::debug!("Variable {} = {}", name, value);
        }
        self.resolved = Some(config);
        Ok(())
    }

    fn create_servers(&mut self) -> Result<(), RunnerError> {
        let Some(config) = &self.resolved else {
            return Ok(());
        };
        let context = ServerContext::new(
            &self.document.confdir,
            self.basedir.clone().unwrap_or_default(),
        );

        for (name, spec) in &config.servers {
            let server = self.registry.create(&context, name, spec)?;
            self.servers.insert(name.clone(), server);
        }

        let edges: IndexMap<String, Vec<String>> = self
            .servers
            .iter()
            .map(|(name, server)| (name.clone(), server.after().to_vec()))
            .collect();
        let graph = DependencyGraph::build(&edges)?;

        log::info!(
            "Launch order: {}",
            graph.launch_order().collect::<Vec<_>>().join(", ")
        );
        self.graph = Some(graph);
        Ok(())
    }

    async fn start_servers(&mut self, shutdown: &mut ShutdownListener) -> Result<(), RunnerError> {
        let Some(graph) = &self.graph else {
            return Ok(());
        };
        let events = self.event_tx.clone();

        for name in graph.launch_order() {
            let Some(server) = self.servers.get_mut(name) else {
                continue;
            };

            log::info!("[{}] Preparing", name);
            step(shutdown, name, Phase::Prepare, server.prepare()).await?;
            emit(&events, name, ServerEvent::Prepared);

            step(shutdown, name, Phase::Start, server.start()).await?;
            emit(&events, name, ServerEvent::Started { pid: server.core().pid() });

            step(shutdown, name, Phase::WaitReady, server.wait_ready()).await?;
            log::info!("[{}] Ready", name);
            emit(&events, name, ServerEvent::Ready);

            step(shutdown, name, Phase::Fill, server.fill()).await?;
            emit(&events, name, ServerEvent::Filled);
        }

        log::info!("All {} servers started", graph.len());
        Ok(())
    }

    /// Environment handed to the user command on top of the inherited one
    fn command_environment(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::with_capacity(self.variables.len() + 1);
        env.insert(SESSION_MARKER.to_string(), "1".to_string());
        for (name, value) in &self.variables {
            if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
                log::warn!("Variable '{}' cannot be exported to the environment", name);
                continue;
            }
            env.insert(name.clone(), value.clone());
        }
        env
    }

    async fn run_command(&mut self, shutdown: &mut ShutdownListener) -> Result<i32, RunnerError> {
        let argv = if self.command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            self.command.clone()
        };

        let mut config = ProcessConfig::from_argv("command", &argv).map_err(RunnerError::Command)?;
        config.env = self.command_environment();
        config.inherit_stdin = true;

        let mut process = ManagedProcess::new(config);
        process.start().map_err(RunnerError::Command)?;

        let finished = tokio::select! {
            biased;
            reason = shutdown.wait() => Err(reason),
            status = process.wait() => Ok(status),
        };

        match finished {
            Ok(status) => {
                let status = status.map_err(RunnerError::Command)?;
                let code = match (status.code(), status.signal()) {
                    (Some(code), _) => code,
                    (None, Some(signal)) => 128 + signal,
                    (None, None) => ORCHESTRATION_FAILURE_EXIT,
                };
                log::info!("Command exited with code {}", code);
                Ok(code)
            }
            Err(reason) => {
                log::info!("Stopping command ({})", reason);
                if let Err(e) = process.stop(STOP_BUDGET).await {
                    log::error!("Failed to stop command: {}", e);
                }
                Err(RunnerError::Interrupted(reason))
            }
        }
    }

    /// Stop every running server in reverse start order, best effort
    async fn stop_servers(&mut self) {
        let Some(graph) = &self.graph else {
            return;
        };
        let events = self.event_tx.clone();

        for name in graph.shutdown_order() {
            let Some(server) = self.servers.get_mut(name) else {
                continue;
            };
            if !server.is_running() {
                continue;
            }
            match server.stop().await {
                Ok(outcome) => {
                    log::info!("[{}] Stopped ({:?})", name, outcome);
                    emit(&events, name, ServerEvent::Stopped(outcome));
                }
                Err(e) => {
                    log::error!("[{}] Failed to stop: {}", name, e);
                    emit(&events, name, ServerEvent::StopFailed(e.to_string()));
                }
            }
        }
    }

    fn cleanup(&mut self) {
        match self.workdir.take() {
            Some(Workdir::Ephemeral(dir)) => {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
            Some(Workdir::Fixed { path, cleanup: true }) => {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
            Some(workdir @ Workdir::Fixed { cleanup: false, .. }) => {
                log::info!("Keeping basedir {}", workdir.path().display());
                self.workdir = Some(workdir);
            }
            None => {}
        }
    }
}

/// Await one startup step unless a shutdown request comes first
async fn step<T>(
    shutdown: &mut ShutdownListener,
    server: &str,
    phase: Phase,
    fut: impl Future<Output = Result<T, ServerError>>,
) -> Result<T, RunnerError> {
    tokio::select! {
        biased;
        reason = shutdown.wait() => Err(RunnerError::Interrupted(reason)),
        result = fut => result.map_err(|source| RunnerError::Startup {
            server: server.to_string(),
            phase,
            source,
        }),
    }
}

fn emit(events: &Option<EventSender>, name: &str, event: ServerEvent) {
    if let Some(tx) = events {
        let _ = tx.send((name.to_string(), event));
    }
}

/// Errors that abort a session
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Failed to set up basedir '{}': {source}", path.display())]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server '{server}' failed during {phase}: {source}")]
    Startup {
        server: String,
        phase: Phase,
        #[source]
        source: ServerError,
    },

    #[error("Command failed: {0}")]
    Command(#[source] ProcessError),

    #[error("Interrupted by {0}")]
    Interrupted(&'static str),
}

impl RunnerError {
    /// Whether the configuration was rejected before anything was started
    pub fn is_configuration(&self) -> bool {
        match self {
            RunnerError::Config(_) | RunnerError::Variable(_) | RunnerError::Dependency(_) => true,
            RunnerError::Server(e) => e.is_configuration(),
            _ => false,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        ORCHESTRATION_FAILURE_EXIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::signals::shutdown_channel;

    fn runner(yaml: &str, confdir: &Path, command: &[&str]) -> Runner {
        let doc = ConfigDocument::from_yaml(yaml, confdir).unwrap();
        Runner::new(doc, command.iter().map(|s| s.to_string()).collect())
            .with_ports(PortPool::new())
    }

    #[test]
    fn test_plan() {
        let yaml = r#"
servers:
  app: {type: generic, command: "x", after: [db, cache]}
  db: {type: generic, command: "x"}
  cache: {type: memcached, ip: $cache_ip$, port: $cache_port$}
"#;
        let session = runner(yaml, Path::new("/srv"), &[]);
        assert_eq!(session.plan().unwrap(), vec!["db", "cache", "app"]);
        assert!(session.basedir().is_none());

        let session = runner("servers:\n  a: {type: redis}\n", Path::new("/srv"), &[]);
        assert!(session.plan().unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_exit_code_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, listener) = shutdown_channel();
        let mut runner = runner("basedir: TEMP\n", dir.path(), &["sh", "-c", "exit 7"]);
        assert_eq!(runner.run(listener).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_killed_command_reports_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, listener) = shutdown_channel();
        let mut runner = runner("basedir: TEMP\n", dir.path(), &["sh", "-c", "kill -9 $$"]);
        assert_eq!(runner.run(listener).await.unwrap(), 128 + 9);
    }

    #[tokio::test]
    async fn test_command_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, listener) = shutdown_channel();
        let out = dir.path().join("env.txt");
        let script = format!(
            "echo \"$TESTENV $mode $confdir $web_port\" > {}",
            out.display()
        );
        let yaml = "basedir: TEMP\nextra:\n  mode: test\n  url: http://$web_addr$/\n";
        let mut runner = runner(yaml, dir.path(), &["sh", "-c", &script]);
        assert_eq!(runner.run(listener).await.unwrap(), 0);

        let port = &runner.variables()["web_port"];
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            text.trim(),
            format!("1 test {} {}", dir.path().display(), port)
        );
        assert_eq!(
            runner.variables()["url"],
            format!("http://{}/", runner.variables()["web_addr"])
        );
    }

    #[tokio::test]
    async fn test_fixed_basedir_is_wiped_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("tenv/stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        let (_trigger, listener) = shutdown_channel();
        let mut runner = runner("{}", dir.path(), &["true"]);
        assert_eq!(runner.run(listener).await.unwrap(), 0);
        assert!(dir.path().join("tenv").is_dir());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_fixed_basedir_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, listener) = shutdown_channel();
        let mut runner = runner(
            "basedir: work\nbasedir_cleanup: true\n",
            dir.path(),
            &["true"],
        );
        runner.run(listener).await.unwrap();
        assert_eq!(runner.basedir(), Some(dir.path().join("work").as_path()));
        assert!(!dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, listener) = shutdown_channel();
        let yaml = "basedir: TEMP\nservers:\n  a: {type: generic, command: \"x $a_bogus$\"}\n";
        let mut runner = runner(yaml, dir.path(), &["true"]);
        let err = runner.run(listener).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("a_bogus"));
        assert_eq!(err.exit_code(), ORCHESTRATION_FAILURE_EXIT);
        assert!(!runner.basedir().unwrap().exists());
    }

    #[tokio::test]
    async fn test_shutdown_stops_command() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, listener) = shutdown_channel();
        let mut runner = runner("basedir: TEMP\n", dir.path(), &["sleep", "30"]);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.trigger("SIGTERM");
        });
        let started = std::time::Instant::now();
        let err = runner.run(listener).await.unwrap_err();
        stopper.await.unwrap();

        assert!(matches!(err, RunnerError::Interrupted("SIGTERM")));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
