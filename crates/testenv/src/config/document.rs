//! Testenv configuration document schema

use super::writers::shell_split;
use indexmap::IndexMap;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// `basedir` value selecting a throwaway temporary directory
pub const EPHEMERAL_BASEDIR: &str = "TEMP";

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestenvConfig {
    /// Session working directory, relative to the config directory,
    /// or `TEMP` for an ephemeral one
    #[serde(default = "default_basedir")]
    pub basedir: String,

    /// Remove a fixed basedir at the end of the session
    #[serde(default)]
    pub basedir_cleanup: bool,

    /// Orchestrator log destination (stderr when absent)
    #[serde(default)]
    pub log: Option<String>,

    /// Server definitions (ordered map for deterministic startup order)
    #[serde(default)]
    pub servers: IndexMap<String, ServerSpec>,

    /// Literal variable bindings exported to the user command
    #[serde(default)]
    pub extra: IndexMap<String, Value>,
}

fn default_basedir() -> String {
    "tenv".to_string()
}

/// Declarative description of one managed server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Adapter type name, looked up in the server registry
    #[serde(rename = "type")]
    pub kind: String,

    /// Servers that must be started before this one
    #[serde(default)]
    pub after: AfterSpec,

    /// Type-specific options, deserialized by the adapter
    #[serde(flatten)]
    pub options: Mapping,
}

impl ServerSpec {
    /// Deserialize the type-specific options into an adapter's option struct
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, serde_yaml::Error> {
        serde_yaml::from_value(Value::Mapping(self.options.clone()))
    }
}

/// `after` accepts either one server name or a list of names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AfterSpec {
    Single(String),
    List(Vec<String>),
}

impl Default for AfterSpec {
    fn default() -> Self {
        AfterSpec::List(Vec::new())
    }
}

impl AfterSpec {
    /// Names of the servers this one starts after
    pub fn names(&self) -> Vec<String> {
        match self {
            AfterSpec::Single(name) => vec![name.clone()],
            AfterSpec::List(names) => names.clone(),
        }
    }
}

/// A scalar option read as text
///
/// Placeholders resolve to strings while hand-written values are often
/// numbers (`port: 11211`), so both are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scalar(pub String);

impl Scalar {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Scalar(s)),
            Value::Number(n) => Ok(Scalar(n.to_string())),
            Value::Bool(b) => Ok(Scalar(b.to_string())),
            other => Err(de::Error::custom(format!(
                "expected a scalar value, found {:?}",
                other
            ))),
        }
    }
}

/// A command given as one shell-like string or as an argument list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<Scalar>),
}

impl CommandLine {
    /// Command words, splitting the string form with shell quoting rules
    pub fn argv(&self) -> Result<Vec<String>, String> {
        match self {
            CommandLine::Line(line) => shell_split(line),
            CommandLine::Argv(words) => Ok(words.iter().map(|w| w.0.clone()).collect()),
        }
    }
}

/// Where the session keeps its per-server directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasedirPolicy {
    /// Fresh temporary directory, always removed at the end
    Ephemeral,
    /// Fixed path, wiped at start and optionally removed at the end
    Fixed { path: PathBuf, cleanup: bool },
}

impl TestenvConfig {
    /// Deserialize and validate a configuration tree
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: TestenvConfig = serde_yaml::from_value(value).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate server names and `after` references
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, spec) in &self.servers {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(ConfigError::Validation(format!(
                    "Server name '{}' cannot be used as a directory name",
                    name
                )));
            }

            if spec.kind.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Server '{}': 'type' must not be empty",
                    name
                )));
            }

            for dep in spec.after.names() {
                if !self.servers.contains_key(&dep) {
                    return Err(ConfigError::Validation(format!(
                        "Server '{}': starts after unknown server '{}'",
                        name, dep
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the basedir setting against the config directory
    pub fn basedir_policy(&self, confdir: &Path) -> BasedirPolicy {
        if self.basedir == EPHEMERAL_BASEDIR {
            BasedirPolicy::Ephemeral
        } else {
            BasedirPolicy::Fixed {
                path: confdir.join(&self.basedir),
                cleanup: self.basedir_cleanup,
            }
        }
    }

    /// Resolve the log destination against the config directory
    pub fn log_path(&self, confdir: &Path) -> Option<PathBuf> {
        self.log.as_ref().map(|log| confdir.join(log))
    }
}

/// A configuration file as read from disk
///
/// Keeps the raw tree around because placeholder resolution walks the
/// whole document, not just the typed view of it.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    /// Directory containing the configuration file
    pub confdir: PathBuf,
    /// Unresolved document tree
    pub raw: Value,
    /// Typed view of the unresolved tree
    pub config: TestenvConfig,
}

impl ConfigDocument {
    /// Load a configuration document from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path = std::path::absolute(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        if !path.is_file() {
            return Err(ConfigError::Validation(format!(
                "not a file: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let confdir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_yaml(&content, confdir)
    }

    /// Parse a configuration document from a YAML string
    pub fn from_yaml(content: &str, confdir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let raw: Value = serde_yaml::from_str(content).map_err(ConfigError::Parse)?;
        let raw = match raw {
            // An empty file is an empty configuration
            Value::Null => Value::Mapping(Mapping::new()),
            Value::Mapping(_) => raw,
            _ => {
                return Err(ConfigError::Validation(
                    "configuration root should be a mapping".to_string(),
                ))
            }
        };
        let config = TestenvConfig::from_value(raw.clone())?;
        Ok(Self {
            confdir: confdir.into(),
            raw,
            config,
        })
    }
}

/// Errors that can occur when loading a configuration document
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
basedir: TEMP
servers:
  cache:
    type: memcached
    ip: $cache_ip$
    port: $cache_port$
  app:
    type: generic
    after: cache
    command: "bin/app --listen $app_addr$"
extra:
  mode: test
"#;
        let doc = ConfigDocument::from_yaml(yaml, "/etc/project").unwrap();
        let config = &doc.config;
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["app"].after.names(), vec!["cache"]);
        assert_eq!(config.servers["cache"].kind, "memcached");
        assert!(config.servers["cache"].options.contains_key("port"));
        assert!(!config.servers["cache"].options.contains_key("type"));
        assert_eq!(config.basedir_policy(&doc.confdir), BasedirPolicy::Ephemeral);
    }

    #[test]
    fn test_defaults() {
        let doc = ConfigDocument::from_yaml("", "/srv").unwrap();
        assert_eq!(doc.config.basedir, "tenv");
        assert!(!doc.config.basedir_cleanup);
        assert!(doc.config.servers.is_empty());
        assert_eq!(
            doc.config.basedir_policy(Path::new("/srv")),
            BasedirPolicy::Fixed {
                path: PathBuf::from("/srv/tenv"),
                cleanup: false
            }
        );
    }

    #[test]
    fn test_after_list() {
        let yaml = r#"
servers:
  a: { type: generic, command: "true" }
  b: { type: generic, command: "true" }
  c:
    type: generic
    command: "true"
    after: [a, b]
"#;
        let doc = ConfigDocument::from_yaml(yaml, "/tmp").unwrap();
        assert_eq!(doc.config.servers["c"].after.names(), vec!["a", "b"]);
        assert!(doc.config.servers["a"].after.names().is_empty());
    }

    #[test]
    fn test_validation_unknown_after() {
        let yaml = r#"
servers:
  app:
    type: generic
    after: db
"#;
        let result = ConfigDocument::from_yaml(yaml, "/tmp");
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("'db'")));
    }

    #[test]
    fn test_validation_missing_type() {
        let yaml = r#"
servers:
  app:
    command: "true"
"#;
        assert!(matches!(
            ConfigDocument::from_yaml(yaml, "/tmp"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_scalar_and_command_options() {
        #[derive(Deserialize)]
        struct Options {
            port: Scalar,
            command: CommandLine,
        }

        let yaml = r#"
servers:
  a: { type: generic, port: 4000, command: "app --name 'my app'" }
  b: { type: generic, port: "$b_port$", command: [app, -p, 80] }
  c: { type: generic, port: [1], command: app }
"#;
        let doc = ConfigDocument::from_yaml(yaml, "/tmp").unwrap();
        let a: Options = doc.config.servers["a"].options_as().unwrap();
        assert_eq!(a.port.as_str(), "4000");
        assert_eq!(a.command.argv().unwrap(), vec!["app", "--name", "my app"]);

        let b: Options = doc.config.servers["b"].options_as().unwrap();
        assert_eq!(b.port.to_string(), "$b_port$");
        assert_eq!(b.command.argv().unwrap(), vec!["app", "-p", "80"]);

        assert!(doc.config.servers["c"].options_as::<Options>().is_err());
    }

    #[test]
    fn test_root_must_be_mapping() {
        assert!(ConfigDocument::from_yaml("- a\n- b\n", "/tmp").is_err());
    }
}
