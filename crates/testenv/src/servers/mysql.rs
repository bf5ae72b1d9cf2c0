//! MySQL server with a private datadir
//!
//! `prepare` writes `my.cnf` and an `init.sql` that creates the configured
//! databases and users, then initializes the datadir. `fill` loads each
//! database's scheme files once the server accepts connections.

use crate::config::writers::{merge_all, scalar_text, write_ini};
use crate::config::ServerSpec;
use crate::runtime::process::Address;
use crate::runtime::server::{
    run_tool, CommonOptions, Server, ServerContext, ServerCore, ServerError,
};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::LazyLock;

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").unwrap());

/// First version shipping `mysqld --initialize`
const INITIALIZE_SINCE: (u32, u32, u32) = (5, 7, 6);

const DEFAULT_CONFIG: &str = r#"
client: {}
mysqld:
  tmpdir: /tmp
  lc-messages-dir: /usr/share/mysql
  skip-external-locking: 1
  key_buffer_size: 2M
  max_allowed_packet: 2M
  thread_stack: 192K
  thread_cache_size: 4
  max_connections: 100
  general_log: 1
  slow_query_log: 1
  long_query_time: 1
  log-queries-not-using-indexes: 1
innodb:
  innodb_buffer_pool_size: 8M
  innodb_read_io_threads: 2
  innodb_write_io_threads: 2
  innodb_io_capacity: 300
  innodb_log_file_size: 16M
  innodb_flush_log_at_trx_commit: 2
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SchemeFiles {
    One(String),
    Many(Vec<String>),
}

impl SchemeFiles {
    fn files(&self) -> Vec<String> {
        match self {
            SchemeFiles::One(file) => vec![file.clone()],
            SchemeFiles::Many(files) => files.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Database {
    name: String,
    #[serde(default)]
    scheme: Option<SchemeFiles>,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    name: String,
    #[serde(rename = "pass", default)]
    password: String,
    /// Database the user gets all privileges on
    grant: String,
}

#[derive(Debug, Deserialize)]
struct MySqlOptions {
    config: Mapping,
    #[serde(default = "default_mysqld")]
    mysqld_bin: String,
    #[serde(default = "default_install_db")]
    mysql_install_db_bin: String,
    #[serde(default = "default_mysql")]
    mysql_bin: String,
    #[serde(default)]
    databases: Vec<Database>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(flatten)]
    common: CommonOptions,
}

fn default_mysqld() -> String {
    "mysqld".to_string()
}

fn default_install_db() -> String {
    "mysql_install_db".to_string()
}

fn default_mysql() -> String {
    "mysql".to_string()
}

pub struct MySql {
    core: ServerCore,
    configfile: PathBuf,
    config: Mapping,
    datadir: PathBuf,
    mysqld_bin: String,
    mysql_install_db_bin: String,
    mysql_bin: String,
    databases: Vec<Database>,
    users: Vec<User>,
}

impl MySql {
    pub fn create(
        context: &ServerContext,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<Box<dyn Server>, ServerError> {
        Ok(Box::new(Self::build(context, name, spec)?))
    }

    fn build(context: &ServerContext, name: &str, spec: &ServerSpec) -> Result<Self, ServerError> {
        let options: MySqlOptions = ServerCore::options(name, spec)?;
        let mut core = ServerCore::new(context, name, spec, options.common)?;

        let configfile = core.basepath("my.cnf");
        let datadir = core.basepath("data");
        let path = |p: PathBuf| Value::String(p.display().to_string());
        let forced = Mapping::from_iter([(
            "mysqld".into(),
            Value::Mapping(Mapping::from_iter([
                ("user".into(), whoami::username().into()),
                ("datadir".into(), path(datadir.clone())),
                ("general_log_file".into(), path(core.basepath("mysql.log"))),
                ("log_error".into(), path(core.basepath("error.log"))),
                ("slow_query_log_file".into(), path(core.basepath("slow.log"))),
                ("init-file".into(), path(core.basepath("init.sql"))),
            ])),
        )]);
        let defaults: Value = serde_yaml::from_str(DEFAULT_CONFIG)
            .map_err(|e| ServerError::config(name, e.to_string()))?;

        let Value::Mapping(mut config) =
            merge_all([defaults, Value::Mapping(options.config), Value::Mapping(forced)])
        else {
            return Err(ServerError::config(name, "config should be a mapping"));
        };

        // Other servers and scripts may need the socket, so a configured one wins
        let mut mysqld = take_section(&mut config, "mysqld");
        let socket = match mysqld.get("socket").and_then(scalar_text) {
            Some(socket) if !socket.is_empty() => socket,
            _ => core.basepath("mysql.sock").display().to_string(),
        };
        mysqld.insert("socket".into(), socket.clone().into());

        let mut client = take_section(&mut config, "client");
        client.insert("socket".into(), socket.clone().into());
        if let Some(port) = mysqld.get("port") {
            client.insert("port".into(), port.clone());
        }
        config.insert("mysqld".into(), Value::Mapping(mysqld));
        config.insert("client".into(), Value::Mapping(client));

        if core.address.is_none() {
            core.address = Some(Address::Unix(PathBuf::from(socket)));
        }
        let mysqld_bin = core.resolve_program(&options.mysqld_bin);
        core.command = vec![
            mysqld_bin.clone(),
            format!("--defaults-file={}", configfile.display()),
        ];

        Ok(Self {
            mysql_install_db_bin: core.resolve_program(&options.mysql_install_db_bin),
            mysql_bin: core.resolve_program(&options.mysql_bin),
            core,
            configfile,
            config,
            datadir,
            mysqld_bin,
            databases: options.databases,
            users: options.users,
        })
    }

    fn init_sql(&self) -> String {
        let mut sql = String::new();
        for db in &self.databases {
            let _ = writeln!(
                sql,
                "CREATE DATABASE `{}` DEFAULT CHARACTER SET 'utf8';",
                db.name
            );
        }
        for user in &self.users {
            let _ = writeln!(
                sql,
                "CREATE USER '{}'@'localhost' IDENTIFIED BY '{}';",
                user.name, user.password
            );
            let _ = writeln!(
                sql,
                "GRANT ALL PRIVILEGES ON {}.* TO '{}'@'localhost';",
                user.grant, user.name
            );
            sql.push_str("FLUSH PRIVILEGES;\n");
        }
        sql
    }

    /// Credentials used to load a database's schemes
    fn credentials(&self) -> HashMap<&str, (&str, &str)> {
        self.users
            .iter()
            .map(|u| (u.grant.as_str(), (u.name.as_str(), u.password.as_str())))
            .collect()
    }

    async fn mysqld_version(&self) -> Result<Option<(u32, u32, u32)>, ServerError> {
        let output = tokio::process::Command::new(&self.mysqld_bin)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ServerError::io(&self.core.name, format!("running {}", self.mysqld_bin), e))?;
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    fn defaults_file(&self) -> String {
        format!("--defaults-file={}", self.configfile.display())
    }

    fn io_error(&self, what: &std::path::Path, e: std::io::Error) -> ServerError {
        ServerError::io(&self.core.name, format!("writing {}", what.display()), e)
    }
}

/// Detach a section of the config, replacing anything that is not a mapping
fn take_section(config: &mut Mapping, name: &str) -> Mapping {
    match config.get_mut(name).map(std::mem::take) {
        Some(Value::Mapping(section)) => section,
        _ => Mapping::new(),
    }
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_PATTERN.captures(text)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

#[async_trait]
impl Server for MySql {
    fn core(&self) -> &ServerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    async fn prepare(&mut self) -> Result<(), ServerError> {
        self.core.create_workdir()?;
        std::fs::create_dir_all(&self.datadir).map_err(|e| self.io_error(&self.datadir, e))?;
        write_ini(&self.configfile, &self.config).map_err(|e| self.io_error(&self.configfile, e))?;

        let init_file = self.core.basepath("init.sql");
        std::fs::write(&init_file, self.init_sql()).map_err(|e| self.io_error(&init_file, e))?;

        let version = self.mysqld_version().await?;
        log::debug!("[{}] mysqld version {:?}", self.core.name, version);
        let argv = match version {
            Some(version) if version >= INITIALIZE_SINCE => vec![
                self.mysqld_bin.clone(),
                self.defaults_file(),
                "--initialize-insecure".to_string(),
            ],
            _ => vec![self.mysql_install_db_bin.clone(), self.defaults_file()],
        };
        run_tool(&self.core, argv, None).await
    }

    async fn fill(&mut self) -> Result<(), ServerError> {
        let credentials = self.credentials();
        for db in &self.databases {
            let Some(scheme) = &db.scheme else {
                continue;
            };
            let (user, password) = credentials.get(db.name.as_str()).copied().unwrap_or(("", ""));
            for file in scheme.files() {
                let path = self.core.confpath(&file);
                let input = std::fs::File::open(&path).map_err(|e| {
                    ServerError::io(&self.core.name, format!("opening {}", path.display()), e)
                })?;
                let argv = vec![
                    self.mysql_bin.clone(),
                    self.defaults_file(),
                    format!("--user={}", user),
                    format!("--password={}", password),
                    db.name.clone(),
                ];
                run_tool(&self.core, argv, Some(input)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use crate::config::writers::render_ini;
    use std::path::Path;

    const CONFIG: &str = r#"
servers:
  db:
    type: mysql
    config:
      mysqld: {port: 33060, max_connections: 10}
    databases:
      - {name: shop, scheme: [shop.sql, data.sql]}
      - {name: logs}
    users:
      - {name: app, pass: secret, grant: shop}
"#;

    fn build(basedir: &Path, yaml: &str) -> Result<MySql, ServerError> {
        let doc = ConfigDocument::from_yaml(yaml, "/srv").unwrap();
        let context = ServerContext::new("/srv", basedir);
        MySql::build(&context, "db", &doc.config.servers["db"])
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("mysqld  Ver 8.0.36 for Linux on x86_64"),
            Some((8, 0, 36))
        );
        assert_eq!(parse_version("mysqld  Ver 5.5.62-log"), Some((5, 5, 62)));
        assert!(parse_version("nothing").is_none());
        assert!((5, 7, 6) >= INITIALIZE_SINCE);
        assert!((5, 6, 40) < INITIALIZE_SINCE);
    }

    #[test]
    fn test_forced_paths_and_socket() {
        let server = build(Path::new("/srv/tenv"), CONFIG).unwrap();
        assert_eq!(
            server.core.address,
            Some(Address::Unix(PathBuf::from("/srv/tenv/db/mysql.sock")))
        );
        assert_eq!(
            server.core.command,
            vec!["mysqld", "--defaults-file=/srv/tenv/db/my.cnf"]
        );

        let cnf = render_ini(&server.config);
        assert!(cnf.contains("datadir = /srv/tenv/db/data\n"));
        assert!(cnf.contains("init-file = /srv/tenv/db/init.sql\n"));
        assert!(cnf.contains("max_connections = 10\n"));
        assert!(cnf.contains("innodb_io_capacity = 300\n"));
        // Client section mirrors the server's socket and port
        let client = server.config["client"].as_mapping().unwrap();
        assert_eq!(client["socket"], "/srv/tenv/db/mysql.sock");
        assert_eq!(client["port"], 33060);
    }

    #[test]
    fn test_configured_socket_wins() {
        let yaml = "servers:\n  db:\n    type: mysql\n    config:\n      mysqld: {socket: /run/my.sock}\n";
        let server = build(Path::new("/srv/tenv"), yaml).unwrap();
        assert_eq!(
            server.core.address,
            Some(Address::Unix(PathBuf::from("/run/my.sock")))
        );
        assert!(!server.config["client"].as_mapping().unwrap().contains_key("port"));
    }

    #[test]
    fn test_config_section_is_required() {
        let err = build(Path::new("/srv/tenv"), "servers:\n  db: {type: mysql}\n")
            .err()
            .unwrap();
        assert!(err.to_string().contains("config"));
    }

    #[test]
    fn test_init_sql_and_credentials() {
        let server = build(Path::new("/srv/tenv"), CONFIG).unwrap();
        assert_eq!(
            server.init_sql(),
            "CREATE DATABASE `shop` DEFAULT CHARACTER SET 'utf8';\n\
             CREATE DATABASE `logs` DEFAULT CHARACTER SET 'utf8';\n\
             CREATE USER 'app'@'localhost' IDENTIFIED BY 'secret';\n\
             GRANT ALL PRIVILEGES ON shop.* TO 'app'@'localhost';\n\
             FLUSH PRIVILEGES;\n"
        );
        assert_eq!(server.credentials()["shop"], ("app", "secret"));
        assert_eq!(
            server.databases[0].scheme.as_ref().unwrap().files(),
            vec!["shop.sql", "data.sql"]
        );
    }

    #[tokio::test]
    async fn test_prepare_fails_without_mysqld() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "servers:\n  db:\n    type: mysql\n    mysqld_bin: /nonexistent/mysqld\n    config: {}\n";
        let mut server = build(dir.path(), yaml).unwrap();
        assert!(server.prepare().await.is_err());
        // Files are written before the datadir is initialized
        assert!(dir.path().join("db/my.cnf").is_file());
        assert!(dir.path().join("db/init.sql").is_file());
        assert!(dir.path().join("db/data").is_dir());
    }
}
