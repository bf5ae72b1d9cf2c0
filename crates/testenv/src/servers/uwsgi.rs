//! uWSGI application server

use crate::config::writers::{merge_all, scalar_text, write_ini};
use crate::config::ServerSpec;
use crate::runtime::process::Address;
use crate::runtime::server::{CommonOptions, Server, ServerContext, ServerCore, ServerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

/// Config keys a listening address may come from, in order of preference
const LISTEN_KEYS: [&str; 3] = ["http", "http-socket", "socket"];

#[derive(Debug, Deserialize)]
struct UwsgiOptions {
    config: Mapping,
    #[serde(default = "default_bin")]
    uwsgi_bin: String,
    #[serde(flatten)]
    common: CommonOptions,
}

fn default_bin() -> String {
    "uwsgi".to_string()
}

pub struct Uwsgi {
    core: ServerCore,
    configfile: PathBuf,
    config: Mapping,
}

impl Uwsgi {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let options: UwsgiOptions = ServerCore::options(name, spec)?;
        let mut core = ServerCore::new(context, name, spec, options.common)?;

        let wsgi_file = options
            .config
            .get("wsgi-file")
            .and_then(scalar_text)
            .ok_or_else(|| ServerError::config(name, "uwsgi server requires wsgi-file"))?;
        let wsgi_file = core.confpath(wsgi_file);
        if !wsgi_file.exists() {
            return Err(ServerError::config(
                name,
                format!("wsgi-file {} does not exist", wsgi_file.display()),
            ));
        }

        let configfile = core.basepath("uwsgi.ini");
        let pidfile = core.basepath("uwsgi.pid");
        let chdir = wsgi_file.parent().unwrap_or(Path::new("/"));

        let defaults = Mapping::from_iter([
            ("threads".into(), 2.into()),
            ("chdir".into(), Value::String(chdir.display().to_string())),
        ]);
        let forced = Mapping::from_iter([
            ("wsgi-file".into(), Value::String(wsgi_file.display().to_string())),
            ("pidfile".into(), Value::String(pidfile.display().to_string())),
        ]);
        let Value::Mapping(config) = merge_all([
            Value::Mapping(defaults),
            Value::Mapping(options.config),
            Value::Mapping(forced),
        ]) else {
            return Err(ServerError::config(name, "config should be a mapping"));
        };

        if core.address.is_none() {
            core.address = LISTEN_KEYS
                .iter()
                .find_map(|key| config.get(*key).and_then(scalar_text))
                .map(|listen| match listen.strip_prefix(':') {
                    Some(port) => Address::tcp("127.0.0.1", port),
                    None => Address::parse(&listen),
                });
        }
        core.pidfile = Some(pidfile);
        core.command = vec![
            core.resolve_program(&options.uwsgi_bin),
            "--ini".to_string(),
            configfile.display().to_string(),
        ];

        Ok(Box::new(Self {
            core,
            configfile,
            config,
        }))
    }
}

#[async_trait]
impl Server for Uwsgi {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core.create_workdir()?;
        let ini = Mapping::from_iter([("uwsgi".into(), Value::Mapping(self.config.clone()))]);
        write_ini(&self.configfile, &ini).map_err(|e| {
            ServerError::io(
                &self.core.name,
                format!("writing {}", self.configfile.display()),
                e,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;

    #[tokio::test]
    async fn test_prepare_writes_ini() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "def application(env, start): pass\n").unwrap();
        let doc = ConfigDocument::from_yaml(
            "servers:\n  web:\n    type: uwsgi\n    config: {wsgi-file: app.py, http: ':9090', threads: 4}\n",
            dir.path(),
        )
        .unwrap();
        let context = ServerContext::new(dir.path(), dir.path().join("tenv"));
        let mut server = Uwsgi::create(&context, "web", &doc.config.servers["web"]).unwrap();

        let workdir = dir.path().join("tenv/web");
        assert_eq!(server.core().pidfile, Some(workdir.join("uwsgi.pid")));
        assert_eq!(server.core().address, Some(Address::Tcp("127.0.0.1:9090".into())));
        assert_eq!(server.core().command[1], "--ini");

        server.prepare().await.unwrap();
        let ini = std::fs::read_to_string(workdir.join("uwsgi.ini")).unwrap();
        assert!(ini.starts_with("[uwsgi]\n"));
        assert!(ini.contains("threads = 4\n"));
        assert!(ini.contains(&format!("chdir = {}\n", dir.path().display())));
        assert!(ini.contains(&format!("pidfile = {}\n", workdir.join("uwsgi.pid").display())));
    }

    #[test]
    fn test_wsgi_file_must_exist() {
        let doc = ConfigDocument::from_yaml(
            "servers:\n  web: {type: uwsgi, config: {wsgi-file: missing.py}}\n",
            "/nonexistent",
        )
        .unwrap();
        let context = ServerContext::new("/nonexistent", "/nonexistent/tenv");
        let err = Uwsgi::create(&context, "web", &doc.config.servers["web"])
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing.py"));

        let doc =
            ConfigDocument::from_yaml("servers:\n  web: {type: uwsgi, config: {}}\n", "/tmp").unwrap();
        assert!(Uwsgi::create(&context, "web", &doc.config.servers["web"]).is_err());
    }
}
