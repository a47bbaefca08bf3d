use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;
use toml::value::Table;

use crate::error::{Error, Result};

/// Top-level tables a project definition may contain.
pub const KNOWN_TABLES: &[&str] = &["project", "board", "toolchain", "firmware", "mergebin"];

/// A fully resolved project definition (after `extends` and `imports`).
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    /// Parse an in-memory document. Imports are not followed.
    pub fn from_toml_str(path: impl Into<PathBuf>, data: &str) -> Result<Self> {
        let value: Value = toml::from_str(data)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Deserialize a section, falling back to its `Default` when absent.
    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        Ok(self.deserialize_path(path)?.unwrap_or_default())
    }

    pub fn ensure_known_tables(&self) -> Result<()> {
        let Some(root) = self.value.as_table() else {
            return Err(Error::msg(format!(
                "{} is not a TOML table",
                self.path.display()
            )));
        };
        for (key, v) in root {
            if v.is_table() && !KNOWN_TABLES.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "config table '{}' is not supported; expected one of: {}",
                    key,
                    KNOWN_TABLES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Deep-merge `overlay` into `base`; tables merge key by key, anything else is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn sibling_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(arr) = raw else {
        return Err(Error::msg(format!(
            "'imports' in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file_path, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Table::new());
        for imp in imports {
            let loaded = load_value(&sibling_path(file_path, &imp), stack)?;
            merge(&mut acc, loaded);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), "loaded config file");

    let parent = match value.as_table_mut().and_then(|t| t.remove("extends")) {
        Some(Value::String(ext)) => Some(ext),
        Some(_) => {
            return Err(Error::msg(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        }
        None => None,
    };
    let mut out = match parent {
        Some(ext) => load_value(&sibling_path(path, &ext), stack)?,
        None => Value::Table(Table::new()),
    };

    inline_imports(path, &mut value, stack)?;
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
