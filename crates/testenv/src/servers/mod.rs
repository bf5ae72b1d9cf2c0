//! Built-in server types and the registry that instantiates them

mod generic;
mod http_mock;
mod memcached;
mod mysql;
mod tarantool;
mod uwsgi;

pub use generic::{ConfigType, GenericServer};
pub use http_mock::HttpMock;
pub use memcached::Memcached;
pub use mysql::MySql;
pub use tarantool::Tarantool;
pub use uwsgi::Uwsgi;

use crate::config::ServerSpec;
use crate::runtime::server::{Server, ServerContext, ServerError};
use std::collections::BTreeMap;

/// Builds a server instance from its resolved spec
pub type ServerConstructor =
    fn(&ServerContext, &str, &ServerSpec) -> Result<Box<dyn Server>, ServerError>;

/// Maps `type` names to server constructors
#[derive(Clone, Default)]
pub struct ServerRegistry {
    constructors: BTreeMap<String, ServerConstructor>,
}

impl ServerRegistry {
    /// Registry without any type
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in type
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register("generic", GenericServer::create)
            .register("memcached", Memcached::create)
            .register("mysql", MySql::create)
            .register("tarantool", Tarantool::create)
            .register("uwsgi", Uwsgi::create)
            .register("http_mock", HttpMock::create);
        registry
    }

    /// Add or replace a type
    pub fn register(&mut self, kind: impl Into<String>, constructor: ServerConstructor) -> &mut Self {
        self.constructors.insert(kind.into(), constructor);
        self
    }

    /// Registered type names, sorted
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Instantiate server `name` from `spec`
    pub fn create(
        &self,
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let constructor =
            self.constructors
                .get(&spec.kind)
                .ok_or_else(|| ServerError::UnknownType {
                    name: name.to_string(),
                    kind: spec.kind.clone(),
                })?;
        log::debug!("[{}] Creating {} server", name, spec.kind);
        constructor(context, name, spec)
    }
}
