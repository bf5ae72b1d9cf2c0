//! Tarantool server bootstrapped from a generated Lua file

use crate::config::writers::merge_all;
use crate::config::ServerSpec;
use crate::runtime::process::Address;
use crate::runtime::server::{CommonOptions, Server, ServerContext, ServerCore, ServerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const START_TIMEOUT: f64 = 50.0;

#[derive(Debug, Deserialize)]
struct TarantoolOptions {
    config: Mapping,
    lua_script: String,
    #[serde(default)]
    lua_path: Option<String>,
    #[serde(default = "default_bin")]
    tarantool_bin: String,
    #[serde(flatten)]
    common: CommonOptions,
}

fn default_bin() -> String {
    "tarantool".to_string()
}

fn default_config() -> Value {
    let mut config = Mapping::new();
    config.insert("background".into(), true.into());
    config.insert("log_level".into(), 5.into());
    config.insert("slab_alloc_arena".into(), 0.03.into());
    config.insert("snapshot_period".into(), (3 * 3600).into());
    config.insert("snapshot_count".into(), 2.into());
    Value::Mapping(config)
}

pub struct Tarantool {
    core: ServerCore,
    configfile: PathBuf,
    config: Mapping,
    listen: String,
    lua_script: PathBuf,
    lua_path: String,
}

impl Tarantool {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        let mut options: TarantoolOptions = ServerCore::options(name, spec)?;
        options.common.start_timeout.get_or_insert(START_TIMEOUT);
        let mut core = ServerCore::new(context, name, spec, options.common)?;

        let pidfile = core.basepath("tarantool.pid");
        let configfile = core.basepath("tarantool.lua");
        let forced = Mapping::from_iter([
            ("pid_file".into(), path_value(&pidfile)),
            ("logger".into(), path_value(&core.basepath("tarantool.log"))),
            ("work_dir".into(), path_value(&core.basedir)),
        ]);
        let merged = merge_all([
            default_config(),
            Value::Mapping(forced),
            Value::Mapping(options.config),
        ]);
        let Value::Mapping(mut config) = merged else {
            return Err(ServerError::config(name, "config should be a mapping"));
        };

        let listen = match config.remove("listen") {
            Some(Value::String(listen)) => listen,
            Some(Value::Number(port)) => port.to_string(),
            _ => return Err(ServerError::config(name, "listen option missed")),
        };

        let lua_script = core.confpath(&options.lua_script);
        let lua_path = match &options.lua_path {
            Some(path) => core.confpath(path).display().to_string(),
            None => lua_script
                .parent()
                .unwrap_or(Path::new("/"))
                .join("?.lua")
                .display()
                .to_string(),
        };

        core.address = Some(listen_address(&listen));
        core.pidfile = Some(pidfile);
        core.command = vec![
            core.resolve_program(&options.tarantool_bin),
            configfile.display().to_string(),
        ];

        Ok(Box::new(Self {
            core,
            configfile,
            config,
            listen,
            lua_script,
            lua_path,
        }))
    }

    /// Lua bootstrap: configure the box, run the script, then start listening
    fn render(&self) -> String {
        let mut lua = String::new();
        let _ = writeln!(lua, "package.path = '{};' .. package.path", self.lua_path);
        lua.push_str("box.cfg({\n");
        for (key, value) in &self.config {
            let key = key.as_str().unwrap_or_default();
            let _ = writeln!(lua, "{} = {},", key, lua_literal(value));
        }
        lua.push_str("})\n");
        let _ = writeln!(lua, "dofile('{}')", self.lua_script.display());
        let _ = writeln!(lua, "box.cfg({{ listen = {} }})", quoted(&self.listen));
        lua
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.display().to_string())
}

/// `listen` is either a port or `host:port`
fn listen_address(listen: &str) -> Address {
    if listen.parse::<u16>().is_ok() {
        Address::tcp("127.0.0.1", listen)
    } else {
        Address::parse(listen)
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn lua_literal(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quoted(s),
        Value::Null => "nil".to_string(),
        other => quoted(&crate::config::writers::scalar_text(other).unwrap_or_default()),
    }
}

#[async_trait]
impl Server for Tarantool {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core.create_workdir()?;
        std::fs::write(&self.configfile, self.render()).map_err(|e| {
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
    use std::time::Duration;

    fn create(yaml: &str) -> Result<Box<dyn Server>, ServerError> {
        let doc = ConfigDocument::from_yaml(yaml, "/srv/app").unwrap();
        let context = ServerContext::new("/srv/app", "/srv/app/tenv");
        Tarantool::create(&context, "tnt", &doc.config.servers["tnt"])
    }

    #[test]
    fn test_defaults() {
        let server = create(
            r#"
servers:
  tnt:
    type: tarantool
    lua_script: lua/init.lua
    config: {listen: "127.0.0.1:3301", log_level: 6}
"#,
        )
        .unwrap();
        let core = server.core();
        assert_eq!(core.start_timeout, Duration::from_secs(50));
        assert_eq!(core.pidfile, Some(PathBuf::from("/srv/app/tenv/tnt/tarantool.pid")));
        assert_eq!(core.address, Some(Address::Tcp("127.0.0.1:3301".into())));
        assert_eq!(
            core.command,
            vec!["tarantool", "/srv/app/tenv/tnt/tarantool.lua"]
        );
    }

    #[tokio::test]
    async fn test_prepare_renders_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let doc = ConfigDocument::from_yaml(
            r#"
servers:
  tnt:
    type: tarantool
    lua_script: /opt/lua/init.lua
    start_timeout: 3
    config: {listen: 3301, log_level: 6, custom: 'say "hi"'}
"#,
            "/srv/app",
        )
        .unwrap();
        let context = ServerContext::new("/srv/app", dir.path());
        let mut server = Tarantool::create(&context, "tnt", &doc.config.servers["tnt"]).unwrap();
        assert_eq!(server.core().start_timeout, Duration::from_secs(3));
        assert_eq!(server.core().address, Some(Address::Tcp("127.0.0.1:3301".into())));

        server.prepare().await.unwrap();
        let lua = std::fs::read_to_string(dir.path().join("tnt/tarantool.lua")).unwrap();
        let workdir = dir.path().join("tnt");

        assert!(lua.starts_with("package.path = '/opt/lua/?.lua;' .. package.path\n"));
        assert!(lua.contains("background = true,\n"));
        assert!(lua.contains("log_level = 6,\n"));
        assert!(lua.contains(&format!("work_dir = \"{}\",\n", workdir.display())));
        assert!(lua.contains("custom = \"say \\\"hi\\\"\",\n"));
        assert!(!lua.contains("listen = 3301,"));
        assert!(lua.contains("dofile('/opt/lua/init.lua')\n"));
        assert!(lua.ends_with("box.cfg({ listen = \"3301\" })\n"));
    }

    #[test]
    fn test_listen_is_required() {
        let err = create(
            "servers:\n  tnt: {type: tarantool, lua_script: a.lua, config: {log_level: 5}}\n",
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("listen"));

        assert!(create("servers:\n  tnt: {type: tarantool, config: {listen: 1}}\n").is_err());
    }
}
