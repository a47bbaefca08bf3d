use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::config::{self, ConfigDoc};
use crate::error::{Error, Result};
use crate::project::ProjectPaths;

pub const DEFAULT_MCU: &str = "esp32";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct BoardSection {
    manifest: Option<String>,
}

/// Board configuration: a PlatformIO board manifest overlaid with inline `[board]` values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    value: Value,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            value: Value::Object(Default::default()),
        }
    }
}

impl BoardConfig {
    pub fn from_json(value: Value) -> Self {
        Self { value }
    }

    pub fn load(doc: &ConfigDoc, paths: &ProjectPaths) -> Result<Self> {
        let section: BoardSection = doc.section("board")?;

        let mut merged = toml::Value::Table(Default::default());
        if let Some(raw) = section.manifest.as_deref() {
            let path = paths.expand_path(raw)?;
            merged = read_manifest(&path)?;
            tracing::debug!(manifest = %path.display(), "loaded board manifest");
        }

        if let Some(inline) = doc.table_path("board") {
            let mut inline = inline.clone();
            inline.remove("manifest");
            config::merge(&mut merged, toml::Value::Table(inline));
        }

        Ok(Self {
            value: serde_json::to_value(&merged)?,
        })
    }

    /// Dotted lookup, e.g. `build.mcu`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(&self.value, |cur, seg| cur.as_object()?.get(seg))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn mcu(&self) -> &str {
        self.get_str("build.mcu").unwrap_or(DEFAULT_MCU)
    }
}

// Manifests are JSON; go through toml::Value so they can be deep-merged with the inline table.
fn read_manifest(path: &Path) -> Result<toml::Value> {
    let data = fs::read_to_string(path).map_err(|e| {
        Error::msg(format!(
            "failed to read board manifest {}: {e}",
            path.display()
        ))
    })?;
    let json: Value = serde_json::from_str(&data).map_err(|e| {
        Error::msg(format!(
            "invalid board manifest {}: {e}",
            path.display()
        ))
    })?;
    let json = strip_nulls(json);
    serde_json::from_value(json).map_err(|e| {
        Error::msg(format!(
            "unsupported board manifest {}: {e}",
            path.display()
        ))
    })
}

fn strip_nulls(v: Value) -> Value {
    match v {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().filter(|v| !v.is_null()).map(strip_nulls).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn paths(root: PathBuf) -> ProjectPaths {
        ProjectPaths {
            build_dir: root.join("build"),
            packages_dir: root.join("packages"),
            root,
            name: "firmware".into(),
        }
    }

    #[test]
    fn mcu_defaults_to_esp32() {
        assert_eq!(BoardConfig::default().mcu(), "esp32");
        let blank = BoardConfig::from_json(json!({ "build": { "mcu": "" } }));
        assert_eq!(blank.mcu(), "esp32");
    }

    #[test]
    fn inline_values_override_manifest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("esp32dev.json"),
            r#"{"build": {"mcu": "esp32", "f_cpu": "240000000L", "extra": null}, "name": "Espressif ESP32 Dev Module"}"#,
        )
        .unwrap();
        let doc = ConfigDoc::from_toml_str(
            "<mem>",
            r#"
[board]
manifest = "esp32dev.json"

[board.build]
mcu = "esp32s3"
"#,
        )
        .unwrap();

        let board = BoardConfig::load(&doc, &paths(tmp.path().to_path_buf())).expect("load");
        assert_eq!(board.mcu(), "esp32s3");
        assert_eq!(board.get_str("build.f_cpu"), Some("240000000L"));
        assert_eq!(board.get_str("name"), Some("Espressif ESP32 Dev Module"));
        assert!(board.get("manifest").is_none());
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc =
            ConfigDoc::from_toml_str("<mem>", "[board]\nmanifest = \"nope.json\"\n").unwrap();
        let err = BoardConfig::load(&doc, &paths(tmp.path().to_path_buf()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("nope.json"), "unexpected err: {err}");
    }
}
