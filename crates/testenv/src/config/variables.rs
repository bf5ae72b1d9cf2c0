//! Placeholder resolution for `$name$` and `$service_kind$` tokens
//!
//! Every string leaf of the configuration tree is scanned twice: first for
//! compound tokens (`$db_addr$`, `$logs_dir$`, `$HOME_env$`), then for bare
//! names (`$confdir$`). Each resolved name is memoized in the variable table,
//! so the same token always expands to the same value within a session.

use crate::runtime::ports::PortPool;
use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Compound token: `$<service>_<kind>$`, the kind being the last segment
static COMPOUND_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\w+_(\w+))\$").unwrap());

/// Bare token: `$<name>$`
static BARE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$(\w+)\$").unwrap());

/// Resolved variable bindings, in resolution order
pub type VariableTable = IndexMap<String, String>;

/// Facet of a service a compound token refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Addr,
    Ip,
    Port,
    Dir,
    Sock,
    Env,
}

impl TokenKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "addr" => Some(TokenKind::Addr),
            "ip" => Some(TokenKind::Ip),
            "port" => Some(TokenKind::Port),
            "dir" => Some(TokenKind::Dir),
            "sock" => Some(TokenKind::Sock),
            "env" => Some(TokenKind::Env),
            _ => None,
        }
    }
}

/// Expands placeholders and owns the session variable table
#[derive(Debug)]
pub struct VariableResolver {
    basedir: PathBuf,
    table: VariableTable,
    extra: VariableTable,
    ports: PortPool,
}

impl VariableResolver {
    /// Create a resolver seeded with `confdir` and `basedir`
    pub fn new(confdir: &Path, basedir: &Path, ports: PortPool) -> Self {
        let mut table = VariableTable::new();
        table.insert("confdir".to_string(), confdir.display().to_string());
        table.insert("basedir".to_string(), basedir.display().to_string());
        Self {
            basedir: basedir.to_path_buf(),
            table,
            extra: VariableTable::new(),
            ports,
        }
    }

    /// Make literal `extra` bindings available to bare tokens
    ///
    /// They are only consulted when the walk has no binding of its own.
    pub fn with_extra(mut self, extra: &IndexMap<String, Value>) -> Self {
        self.extra = scalar_bindings(extra);
        self
    }

    /// Current variable table
    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    /// Consume the resolver, returning the variable table
    pub fn into_table(self) -> VariableTable {
        self.table
    }

    /// Resolve every string leaf of `tree`
    pub fn resolve(&mut self, tree: Value) -> Result<Value, VariableError> {
        let mut trail = Vec::new();
        self.walk(tree, &mut trail)
    }

    /// Merge extra bindings into the table without overwriting walk results
    pub fn merge_extra(&mut self, extra: &IndexMap<String, Value>) {
        for (name, value) in scalar_bindings(extra) {
            self.table.entry(name).or_insert(value);
        }
    }

    fn walk(&mut self, node: Value, trail: &mut Vec<String>) -> Result<Value, VariableError> {
        match node {
            Value::Mapping(mapping) => {
                let mut resolved = serde_yaml::Mapping::with_capacity(mapping.len());
                for (key, value) in mapping {
                    trail.push(key_label(&key));
                    let value = self.walk(value, trail)?;
                    trail.pop();
                    resolved.insert(key, value);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    trail.push(i.to_string());
                    resolved.push(self.walk(item, trail)?);
                    trail.pop();
                }
                Ok(Value::Sequence(resolved))
            }
            Value::String(s) => Ok(Value::String(self.substitute(&s, trail)?)),
            Value::Tagged(tagged) => {
                let TaggedValue { tag, value } = *tagged;
                let value = self.walk(value, trail)?;
                Ok(Value::Tagged(Box::new(TaggedValue { tag, value })))
            }
            other => Ok(other),
        }
    }

    /// Substitute all tokens in a single string
    pub fn substitute(&mut self, input: &str, trail: &[String]) -> Result<String, VariableError> {
        let pass = self.substitute_pass(&COMPOUND_PATTERN, input, trail)?;
        self.substitute_pass(&BARE_PATTERN, &pass, trail)
    }

    fn substitute_pass(
        &mut self,
        pattern: &Regex,
        input: &str,
        trail: &[String],
    ) -> Result<String, VariableError> {
        let mut error: Option<VariableError> = None;

        let result = pattern.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve_capture(caps, trail) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    fn resolve_capture(&mut self, caps: &Captures, trail: &[String]) -> Result<String, VariableError> {
        let name = &caps[1];

        if let Some(value) = self.table.get(name) {
            return Ok(value.clone());
        }

        let Some(kind) = caps.get(2) else {
            // Bare names without a binding pass through as the name itself
            return Ok(self
                .resolve_extra(name, trail)?
                .unwrap_or_else(|| name.to_string()));
        };

        let kind_str = kind.as_str();
        let service = &name[..name.len() - kind_str.len() - 1];

        match TokenKind::parse(kind_str) {
            Some(kind) => self.bind(service, kind),
            None => match self.resolve_extra(name, trail)? {
                Some(value) => Ok(value),
                None => Err(VariableError::UnknownKind {
                    token: caps[0].to_string(),
                    path: trail.join("/"),
                }),
            },
        }
    }

    /// Expand the `extra` binding `name` and memoize the result
    ///
    /// The binding is taken out of `extra` while it expands, so a value
    /// referring back to itself passes through instead of recursing.
    fn resolve_extra(
        &mut self,
        name: &str,
        trail: &[String],
    ) -> Result<Option<String>, VariableError> {
        let Some(raw) = self.extra.shift_remove(name) else {
            return Ok(None);
        };
        let value = self.substitute(&raw, trail)?;
        self.table.insert(name.to_string(), value.clone());
        Ok(Some(value))
    }

    /// Create and memoize the binding for `<service>_<kind>`
    fn bind(&mut self, service: &str, kind: TokenKind) -> Result<String, VariableError> {
        let name = match kind {
            TokenKind::Addr => format!("{}_addr", service),
            TokenKind::Ip => format!("{}_ip", service),
            TokenKind::Port => format!("{}_port", service),
            TokenKind::Dir => format!("{}_dir", service),
            TokenKind::Sock => format!("{}_sock", service),
            TokenKind::Env => format!("{}_env", service),
        };

        match kind {
            TokenKind::Addr | TokenKind::Ip | TokenKind::Port => {
                let endpoint = self
                    .ports
                    .reserve_endpoint()
                    .ok_or_else(|| VariableError::PortsExhausted(service.to_string()))?;
                log::debug!("Allocated {} for service '{}'", endpoint, service);
                self.table
                    .insert(format!("{}_ip", service), endpoint.ip().to_string());
                self.table
                    .insert(format!("{}_port", service), endpoint.port().to_string());
                self.table.insert(format!("{}_addr", service), endpoint.to_string());
            }
            TokenKind::Dir => {
                let dir = self.basedir.join(&name);
                std::fs::create_dir_all(&dir).map_err(|e| VariableError::Io {
                    path: dir.display().to_string(),
                    source: e,
                })?;
                self.table.insert(name.clone(), dir.display().to_string());
            }
            TokenKind::Sock => {
                let sock = self.basedir.join(format!("{}.sock", name));
                self.table.insert(name.clone(), sock.display().to_string());
            }
            TokenKind::Env => {
                let value = std::env::var(service).unwrap_or_default();
                self.table.insert(name.clone(), value);
            }
        }

        Ok(self.table[&name].clone())
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => scalar_to_string(other).unwrap_or_else(|| "?".to_string()),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_bindings(extra: &IndexMap<String, Value>) -> VariableTable {
    let mut bindings = VariableTable::new();
    for (name, value) in extra {
        match scalar_to_string(value) {
            Some(s) => {
                bindings.insert(name.clone(), s);
            }
            None => log::warn!("Ignoring non-scalar extra binding '{}'", name),
        }
    }
    bindings
}

/// Errors that can occur during placeholder resolution
#[derive(Debug, thiserror::Error)]
pub enum VariableError {
    #[error("Unexpected pattern {token} in {path}")]
    UnknownKind { token: String, path: String },

    #[error("No free port left for service '{0}'")]
    PortsExhausted(String),

    #[error("Failed to create directory '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(basedir: &Path) -> VariableResolver {
        VariableResolver::new(Path::new("/etc/project"), basedir, PortPool::new())
    }

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_addr_is_memoized_across_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let tree = r
            .resolve(yaml(
                r#"
servers:
  db:
    listen: $db_addr$
  app:
    args: ["--db", "$db_addr$"]
"#,
            ))
            .unwrap();

        let listen = tree["servers"]["db"]["listen"].as_str().unwrap();
        let arg = tree["servers"]["app"]["args"][1].as_str().unwrap();
        assert_eq!(listen, arg);
        assert_eq!(r.table()["db_addr"], listen);
    }

    #[test]
    fn test_ip_port_addr_are_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let s = r.substitute("$db_port$ $db_ip$ $db_addr$", &[]).unwrap();
        let parts: Vec<&str> = s.split(' ').collect();
        assert_eq!(parts[2], format!("{}:{}", parts[1], parts[0]));
        assert_eq!(parts[1], "127.0.0.1");
    }

    #[test]
    fn test_distinct_services_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let a = r.substitute("$a_port$", &[]).unwrap();
        let b = r.substitute("$b_port$", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_dir_and_sock() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let logs = r.substitute("$logs_dir$", &[]).unwrap();
        assert_eq!(PathBuf::from(&logs), dir.path().join("logs_dir"));
        assert!(dir.path().join("logs_dir").is_dir());
        // Resolving again is a table hit, not a second mkdir
        assert_eq!(r.substitute("$logs_dir$/x", &[]).unwrap(), format!("{}/x", logs));

        let sock = r.substitute("$mysql_sock$", &[]).unwrap();
        assert_eq!(PathBuf::from(&sock), dir.path().join("mysql_sock.sock"));
        assert!(!PathBuf::from(&sock).exists());
    }

    #[test]
    fn test_env_lookup_defaults_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let s = r
            .substitute("[$TESTENV_SURELY_MISSING_VAR_env$]", &[])
            .unwrap();
        assert_eq!(s, "[]");
        assert_eq!(r.table()["TESTENV_SURELY_MISSING_VAR_env"], "");

        let path = r.substitute("$PATH_env$", &[]).unwrap();
        assert_eq!(path, std::env::var("PATH").unwrap_or_default());
    }

    #[test]
    fn test_bare_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        assert_eq!(
            r.substitute("$confdir$/schema.sql", &[]).unwrap(),
            "/etc/project/schema.sql"
        );
        assert_eq!(r.substitute("$unbound$", &[]).unwrap(), "unbound");
    }

    #[test]
    fn test_unknown_kind_reports_token_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let err = r
            .resolve(yaml("servers:\n  app:\n    args: [ok, \"$unknown_kind$\"]\n"))
            .unwrap_err();
        match err {
            VariableError::UnknownKind { token, path } => {
                assert_eq!(token, "$unknown_kind$");
                assert_eq!(path, "servers/app/args/1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extra_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let extra: IndexMap<String, Value> = serde_yaml::from_str(
            "db_name: shop\nretries: 3\ncache_port: \"1\"\nnested: {a: b}\n",
        )
        .unwrap();
        let mut r = resolver(dir.path()).with_extra(&extra);

        // Unknown kinds fall back to literal extras
        assert_eq!(r.substitute("$db_name$", &[]).unwrap(), "shop");
        let port = r.substitute("$cache_port$", &[]).unwrap();
        assert_ne!(port, "1");

        r.merge_extra(&extra);
        let table = r.into_table();
        assert_eq!(table["retries"], "3");
        assert_eq!(table["db_name"], "shop");
        // The walk binding wins over the literal
        assert_eq!(table["cache_port"], port);
        assert!(!table.contains_key("nested"));
    }

    #[test]
    fn test_extra_placeholders_expand_once() {
        let dir = tempfile::tempdir().unwrap();
        let raw = yaml(
            "servers:\n  app:\n    url: $base_url$\n    home: $site$/index\n\
             extra:\n  base_url: http://$web_addr$/\n  site: $base_url$site\n",
        );
        let extra: IndexMap<String, Value> =
            serde_yaml::from_value(raw["extra"].clone()).unwrap();
        let mut r = resolver(dir.path()).with_extra(&extra);

        let tree = r.resolve(raw).unwrap();
        let resolved_extra: IndexMap<String, Value> =
            serde_yaml::from_value(tree["extra"].clone()).unwrap();
        r.merge_extra(&resolved_extra);
        let table = r.into_table();

        let url = format!("http://{}/", table["web_addr"]);
        assert_eq!(tree["servers"]["app"]["url"].as_str().unwrap(), url);
        assert_eq!(table["base_url"], url);
        assert_eq!(tree["extra"]["base_url"].as_str().unwrap(), url);
        assert_eq!(table["site"], format!("{}site", url));
        assert_eq!(
            tree["servers"]["app"]["home"].as_str().unwrap(),
            format!("{}site/index", url)
        );

        // A self reference passes through as its name
        let looped: IndexMap<String, Value> = serde_yaml::from_str("loop: a$loop$\n").unwrap();
        let mut r = resolver(dir.path()).with_extra(&looped);
        assert_eq!(r.substitute("$loop$", &[]).unwrap(), "aloop");
    }

    #[test]
    fn test_non_strings_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = resolver(dir.path());
        let tree = r.resolve(yaml("a: 1\nb: true\nc: ~\nd: [2.5]\n")).unwrap();
        assert_eq!(tree, yaml("a: 1\nb: true\nc: ~\nd: [2.5]\n"));
        assert_eq!(r.table().len(), 2);
    }
}
