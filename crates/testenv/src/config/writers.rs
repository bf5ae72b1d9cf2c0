//! Helpers for materializing server configuration files

use serde_yaml::{Mapping, Value};
use std::fmt::Write as _;
use std::path::Path;

/// Deep-merge `overlay` into `base`
///
/// Mappings merge key by key, sequences are concatenated and any other
/// value from `overlay` replaces the one in `base`.
pub fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (Value::Sequence(mut base), Value::Sequence(overlay)) => {
            base.extend(overlay);
            Value::Sequence(base)
        }
        (_, overlay) => overlay,
    }
}

/// Merge several layers, later layers winning
pub fn merge_all(layers: impl IntoIterator<Item = Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Mapping(Mapping::new()), merge)
}

/// Render a scalar the way it should appear in a flat config file
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Tagged(tagged) => scalar_text(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => {
            Some(serde_yaml::to_string(value).unwrap_or_default().trim().to_string())
        }
    }
}

/// Render a mapping as INI text
///
/// Top-level scalars become `key = value` lines, nested mappings become
/// `[section]` blocks and null values are written as bare keys.
pub fn render_ini(ini: &Mapping) -> String {
    fn line(out: &mut String, key: &Value, value: &Value) {
        let key = scalar_text(key).unwrap_or_default();
        match scalar_text(value) {
            Some(value) => {
                let _ = writeln!(out, "{} = {}", key, value);
            }
            None => {
                let _ = writeln!(out, "{}", key);
            }
        }
    }

    let mut out = String::new();
    for (key, value) in ini {
        if let Value::Mapping(section) = value {
            let _ = writeln!(out, "[{}]", scalar_text(key).unwrap_or_default());
            for (key, value) in section {
                line(&mut out, key, value);
            }
        } else {
            line(&mut out, key, value);
        }
    }
    out
}

/// Write a mapping as an INI file
pub fn write_ini(path: &Path, ini: &Mapping) -> std::io::Result<()> {
    std::fs::write(path, render_ini(ini))
}

/// Write a value as a YAML file
pub fn write_yaml(path: &Path, value: &Value) -> std::io::Result<()> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, text)
}

/// Split a command line into words, honoring single and double quotes
/// and backslash escapes outside single quotes
pub fn shell_split(command: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(format!("unterminated quote in '{}'", command)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(format!("unterminated quote in '{}'", command)),
                        },
                        Some(c) => word.push(c),
                        None => return Err(format!("unterminated quote in '{}'", command)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => return Err(format!("trailing backslash in '{}'", command)),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}
