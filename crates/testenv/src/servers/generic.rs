//! Arbitrary command with an optional generated config file

use crate::config::writers::{write_ini, write_yaml};
use crate::config::{CommandLine, ServerSpec};
use crate::runtime::server::{CommonOptions, Server, ServerContext, ServerCore, ServerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

/// Format of a generated config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Ini,
    Yaml,
}

#[derive(Debug, Deserialize)]
struct GenericOptions {
    command: CommandLine,
    #[serde(default)]
    config: Option<Mapping>,
    #[serde(default)]
    configfile: Option<String>,
    #[serde(default)]
    configtype: Option<ConfigType>,
    #[serde(flatten)]
    common: CommonOptions,
}

/// Runs `command` as is
pub struct GenericServer {
    core: ServerCore,
    config: Option<(PathBuf, ConfigType, Mapping)>,
}

impl GenericServer {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let options: GenericOptions = ServerCore::options(name, spec)?;
        let mut core = ServerCore::new(context, name, spec, options.common)?;
        core.command = core.argv(&options.command)?;

        let config = match (options.config, options.configfile, options.configtype) {
            (None, _, _) => None,
            (Some(config), Some(file), Some(kind)) => Some((core.basepath(file), kind, config)),
            (Some(_), None, _) => {
                return Err(ServerError::config(name, "config requires configfile option"))
            }
            (Some(_), _, None) => {
                return Err(ServerError::config(name, "config requires configtype option"))
            }
        };

        Ok(Box::new(Self { core, config }))
    }
}

#[async_trait]
impl Server for GenericServer {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core.create_workdir()?;
        if let Some((path, kind, config)) = &self.config {
            let written = match kind {
                ConfigType::Ini => write_ini(path, config),
                ConfigType::Yaml => write_yaml(path, &Value::Mapping(config.clone())),
            };
            written.map_err(|e| {
                ServerError::io(&self.core.name, format!("writing {}", path.display()), e)
            })?;
        }
        Ok(())
    }
}
