use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::host_env::{self, HostEnv};

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable reference pattern must compile")
});

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    ".pio/build".into()
}

fn default_name() -> String {
    "firmware".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    pub packages_dir: Option<String>,
    /// Program name; the firmware image is `<name>.bin`.
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            packages_dir: None,
            name: default_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub packages_dir: PathBuf,
    pub name: String,
}

impl ProjectPaths {
    pub fn vars(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("PROJECT_DIR", self.root.display().to_string()),
            ("BUILD_DIR", self.build_dir.display().to_string()),
            ("PACKAGES_DIR", self.packages_dir.display().to_string()),
            ("PROGNAME", self.name.clone()),
        ])
    }

    /// Substitute `${NAME}` / `$NAME` references with project variables.
    pub fn expand(&self, template: &str) -> Result<String> {
        let vars = self.vars();
        let mut missing = None::<String>;
        let out = VAR_REF.replace_all(template, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match vars.get(name) {
                Some(v) => v.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        if let Some(name) = missing {
            let known = vars.keys().copied().collect::<Vec<_>>().join(", ");
            return Err(Error::msg(format!(
                "unknown variable '{}' in '{}' (known: {})",
                name, template, known
            )));
        }
        Ok(out.into_owned())
    }

    /// Expand a template and root relative results at the project root.
    pub fn expand_path(&self, template: &str) -> Result<PathBuf> {
        let expanded = self.expand(template)?;
        let expanded = expanded.trim();
        if expanded.is_empty() {
            return Err(Error::msg(format!("path '{}' expands to nothing", template)));
        }
        let pb = PathBuf::from(expanded);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }
}

pub fn load_paths(cfg: &ProjectConfig, env: &HostEnv) -> Result<ProjectPaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let packages_dir = match cfg.packages_dir.as_deref() {
        Some(p) => resolve_user_path(&root, p)?,
        None => default_packages_dir(&root, env),
    };

    let name = cfg.name.trim();
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(Error::msg(format!(
            "invalid project.name '{}' (must be a plain file stem)",
            cfg.name
        )));
    }

    Ok(ProjectPaths {
        root,
        build_dir,
        packages_dir,
        name: name.to_string(),
    })
}

fn default_packages_dir(root: &Path, env: &HostEnv) -> PathBuf {
    if let Some(core) = env.get(host_env::PLATFORMIO_CORE_DIR) {
        return PathBuf::from(core).join("packages");
    }
    if let Some(home) = env.get(host_env::HOME) {
        return PathBuf::from(home).join(".platformio").join("packages");
    }
    let fallback = root.join(".platformio").join("packages");
    tracing::warn!(
        path = %fallback.display(),
        "neither PLATFORMIO_CORE_DIR nor HOME is set; using project-local packages dir"
    );
    fallback
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty project dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid project dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty project path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> ProjectPaths {
        ProjectPaths {
            root: PathBuf::from("/work/fw"),
            build_dir: PathBuf::from("/work/fw/.pio/build/esp32dev"),
            packages_dir: PathBuf::from("/opt/pio/packages"),
            name: "firmware".into(),
        }
    }

    #[test]
    fn expands_braced_and_bare_references() {
        let p = paths();
        assert_eq!(
            p.expand("${BUILD_DIR}/${PROGNAME}.bin").unwrap(),
            "/work/fw/.pio/build/esp32dev/firmware.bin"
        );
        assert_eq!(
            p.expand("$PACKAGES_DIR/tool-esptoolpy/esptool.py").unwrap(),
            "/opt/pio/packages/tool-esptoolpy/esptool.py"
        );
        assert_eq!(p.expand("plain.bin").unwrap(), "plain.bin");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = paths().expand("${OBJCOPY}").unwrap_err().to_string();
        assert!(err.contains("OBJCOPY"), "unexpected err: {err}");
    }

    #[test]
    fn relative_results_are_rooted_at_project() {
        let p = paths();
        assert_eq!(
            p.expand_path("out/merged.bin").unwrap(),
            PathBuf::from("/work/fw/out/merged.bin")
        );
        assert_eq!(
            p.expand_path("/tmp/merged.bin").unwrap(),
            PathBuf::from("/tmp/merged.bin")
        );
    }

    #[test]
    fn packages_dir_defaults_from_environment() {
        let cfg = ProjectConfig {
            root_dir: "/work/fw".into(),
            ..ProjectConfig::default()
        };
        let core = HostEnv::from_pairs([(host_env::PLATFORMIO_CORE_DIR, "/opt/pio")]);
        assert_eq!(
            load_paths(&cfg, &core).unwrap().packages_dir,
            PathBuf::from("/opt/pio/packages")
        );

        let home = HostEnv::from_pairs([(host_env::HOME, "/home/dev")]);
        assert_eq!(
            load_paths(&cfg, &home).unwrap().packages_dir,
            PathBuf::from("/home/dev/.platformio/packages")
        );
    }

    #[test]
    fn build_dir_with_parent_component_is_rejected() {
        let cfg = ProjectConfig {
            root_dir: "/work/fw".into(),
            build_dir: "../elsewhere".into(),
            ..ProjectConfig::default()
        };
        assert!(load_paths(&cfg, &HostEnv::default()).is_err());
    }
}
