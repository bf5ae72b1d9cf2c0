//! HTTP mock serving canned responses through `testenv-mock`

use crate::config::writers::write_yaml;
use crate::config::{Scalar, ServerSpec};
use crate::mock::MockRoutes;
use crate::runtime::process::Address;
use crate::runtime::server::{CommonOptions, Server, ServerContext, ServerCore, ServerError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

/// Name of the mock executable installed next to `testenv`
pub const MOCK_BIN: &str = "testenv-mock";

#[derive(Debug, Deserialize)]
struct HttpMockOptions {
    ip: Scalar,
    port: Scalar,
    #[serde(default)]
    routes: MockRoutes,
    #[serde(default)]
    mock_bin: Option<String>,
    #[serde(flatten)]
    common: CommonOptions,
}

pub struct HttpMock {
    core: ServerCore,
    routes_file: PathBuf,
    routes: MockRoutes,
}

impl HttpMock {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let options: HttpMockOptions = ServerCore::options(name, spec)?;
        let mut core = ServerCore::new(context, name, spec, options.common)?;

        let port: u16 = options
            .port
            .as_str()
            .parse()
            .map_err(|_| ServerError::config(name, format!("invalid port '{}'", options.port)))?;
        let listen = Address::tcp(options.ip.as_str(), &port.to_string());

        let bin = match &options.mock_bin {
            Some(bin) => core.resolve_program(bin),
            None => locate_mock_bin(),
        };
        let routes_file = core.basepath("routes.yaml");
        core.command = vec![
            bin,
            "--config".to_string(),
            routes_file.display().to_string(),
            "--listen".to_string(),
            listen.to_string(),
        ];
        if core.address.is_none() {
            core.address = Some(listen);
        }

        Ok(Box::new(Self {
            core,
            routes_file,
            routes: options.routes,
        }))
    }
}

/// `testenv-mock` next to the running executable (or one level up, for
/// test binaries under `deps/`), else whatever `PATH` provides
fn locate_mock_bin() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| {
            let dir = exe.parent()?.to_path_buf();
            [dir.join(MOCK_BIN), dir.parent()?.join(MOCK_BIN)]
                .into_iter()
                .find(|candidate| candidate.is_file())
        })
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| MOCK_BIN.to_string())
}

#[async_trait]
impl Server for HttpMock {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core.create_workdir()?;
        let routes = serde_yaml::to_value(&self.routes)
            .map_err(|e| ServerError::config(&self.core.name, e.to_string()))?;
        write_yaml(&self.routes_file, &routes).map_err(|e| {
            ServerError::io(
                &self.core.name,
                format!("writing {}", self.routes_file.display()),
                e,
            )
        })
    }
}
