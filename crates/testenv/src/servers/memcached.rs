//! memcached server

use crate::config::{Scalar, ServerSpec};
use crate::runtime::process::Address;
use crate::runtime::server::{CommonOptions, Server, ServerContext, ServerCore, ServerError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct MemcachedOptions {
    ip: Scalar,
    port: Scalar,
    #[serde(default = "default_bin")]
    memcached_bin: String,
    #[serde(flatten)]
    common: CommonOptions,
}

fn default_bin() -> String {
    "memcached".to_string()
}

pub struct Memcached {
    core: ServerCore,
}

impl Memcached {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let options: MemcachedOptions = ServerCore::options(name, spec)?;
        let mut core = ServerCore::new(context, name, spec, options.common)?;

        let bin = core.resolve_program(&options.memcached_bin);
        core.command = vec![
            bin,
            "-l".to_string(),
            options.ip.to_string(),
            "-p".to_string(),
            options.port.to_string(),
        ];
        if core.address.is_none() {
            core.address = Some(Address::tcp(options.ip.as_str(), options.port.as_str()));
        }

        Ok(Box::new(Self { core }))
    }
}

impl Server for Memcached {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }
}
