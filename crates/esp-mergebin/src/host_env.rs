use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::error::{Error, Result};

/// Overrides the merged image output path.
pub const MERGED_BIN_PATH: &str = "MERGED_BIN_PATH";
pub const PLATFORMIO_CORE_DIR: &str = "PLATFORMIO_CORE_DIR";
pub const PYTHONEXE: &str = "PYTHONEXE";
pub const HOME: &str = "HOME";

const CAPTURED: &[&str] = &[MERGED_BIN_PATH, PLATFORMIO_CORE_DIR, PYTHONEXE, HOME];

/// Process environment, read once at start-up and passed around explicitly.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    pub fn capture() -> Result<Self> {
        let env = Self::from_os_pairs(
            CAPTURED
                .iter()
                .filter_map(|k| std::env::var_os(k).map(|v| (*k, v))),
        )?;
        tracing::debug!(vars = ?env.vars.keys().collect::<Vec<_>>(), "captured host environment");
        Ok(env)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    // Every captured value ends up in a path or an argv, so a value that is not
    // valid UTF-8 is rejected rather than silently dropped.
    pub fn from_os_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<OsString>,
    {
        let mut vars = BTreeMap::new();
        for (k, v) in pairs {
            let k = k.into();
            let v = v.into().into_string().map_err(|raw| {
                Error::msg(format!(
                    "environment variable {k} is not valid UTF-8: {}",
                    raw.to_string_lossy()
                ))
            })?;
            vars.insert(k, v);
        }
        Ok(Self { vars })
    }

    // Blank values count as unset; anything else is returned untouched.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}
