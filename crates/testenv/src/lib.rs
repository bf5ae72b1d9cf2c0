//! Disposable server fleets for integration tests
//!
//! A testenv session reads a YAML config describing servers, expands the
//! `$name$` and `$service_kind$` placeholders in it, starts the servers in
//! dependency order, runs a user command with every resolved variable in
//! its environment, and always stops the servers and removes the session
//! directory afterwards.
//!
//! # Example config
//!
//! ```yaml
//! basedir: TEMP
//!
//! servers:
//!   cache:
//!     type: memcached
//!     ip: $cache_ip$
//!     port: $cache_port$
//!
//!   app:
//!     type: generic
//!     after: cache
//!     command: "bin/app --cache $cache_addr$ --logs $logs_dir$"
//!     address: $app_addr$
//!
//! extra:
//!   mode: test
//! ```
//!
//! `testenv --config testenv.yml pytest -x` then runs `pytest -x` with
//! `cache_addr`, `app_addr`, `logs_dir`, `mode`, `confdir`, `basedir` and
//! `TESTENV=1` exported.

#[cfg(not(unix))]
compile_error!("testenv manages processes with Unix signals and only supports Unix targets");

pub mod cli;
pub mod config;
pub mod logging;
pub mod mock;
pub mod runtime;
pub mod servers;

pub use cli::{MockArgs, TestenvArgs};
pub use config::{ConfigDocument, ConfigError, TestenvConfig, VariableError, VariableResolver};
pub use runtime::{
    install_signal_handlers, shutdown_channel, DependencyError, DependencyGraph, PortPool,
    Runner, RunnerError, Server, ServerContext, ServerCore, ServerError, ServerEvent,
    ShutdownListener, ShutdownTrigger, ORCHESTRATION_FAILURE_EXIT,
};
pub use servers::ServerRegistry;
