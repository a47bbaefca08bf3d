//! The image merge step: one `esptool merge_bin` invocation built from the flash layout.

use std::path::PathBuf;

use serde::Deserialize;

use crate::board::BoardConfig;
use crate::error::Result;
use crate::host_env::{self, HostEnv};
use crate::layout::{self, FlashLayout};

pub const MERGE_SUBCOMMAND: &str = "merge_bin";
pub const FLASH_MODE: &str = "dio";
pub const FLASH_FREQ: &str = "80m";
pub const FLASH_SIZE: &str = "4MB";

const DEFAULT_PYTHON: &str = "python3";

fn default_esptool() -> String {
    "${PACKAGES_DIR}/tool-esptoolpy/esptool.py".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub python: Option<String>,
    #[serde(default = "default_esptool")]
    pub esptool: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python: None,
            esptool: default_esptool(),
        }
    }
}

/// What the merge step needs from the build host.
pub trait BuildEnv {
    /// Expand a path template (`${BUILD_DIR}/...`) to a concrete path.
    fn resolve_path(&self, template: &str) -> Result<PathBuf>;
    /// Run `argv[0]` with the remaining arguments; a non-zero exit is an error.
    fn execute(&self, argv: &[String]) -> Result<()>;
}

/// Everything the merge invocation depends on, resolved once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSettings {
    pub python: String,
    pub esptool: String,
    pub chip: String,
    /// Output path template.
    pub output: String,
    pub flash_mode: &'static str,
    pub flash_freq: &'static str,
    pub flash_size: &'static str,
}

impl MergeSettings {
    pub fn resolve(board: &BoardConfig, toolchain: &ToolchainConfig, env: &HostEnv) -> Self {
        let python = toolchain
            .python
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| env.get(host_env::PYTHONEXE))
            .unwrap_or(DEFAULT_PYTHON)
            .to_string();
        let output = env
            .get(host_env::MERGED_BIN_PATH)
            .unwrap_or(layout::MERGED_BIN)
            .to_string();

        Self {
            python,
            esptool: toolchain.esptool.trim().to_string(),
            chip: board.mcu().to_string(),
            output,
            flash_mode: FLASH_MODE,
            flash_freq: FLASH_FREQ,
            flash_size: FLASH_SIZE,
        }
    }
}

// Bare program names are left for PATH lookup; anything path-like is resolved.
fn program_arg(env: &dyn BuildEnv, raw: &str) -> Result<String> {
    if raw.contains(['/', '\\', '$']) {
        Ok(env.resolve_path(raw)?.display().to_string())
    } else {
        Ok(raw.to_string())
    }
}

pub fn command_line(
    settings: &MergeSettings,
    layout: &FlashLayout,
    env: &dyn BuildEnv,
) -> Result<Vec<String>> {
    let mut argv = vec![
        program_arg(env, &settings.python)?,
        program_arg(env, &settings.esptool)?,
        "--chip".to_string(),
        settings.chip.clone(),
        MERGE_SUBCOMMAND.to_string(),
        "-o".to_string(),
        env.resolve_path(&settings.output)?.display().to_string(),
        "--flash_mode".to_string(),
        settings.flash_mode.to_string(),
        "--flash_freq".to_string(),
        settings.flash_freq.to_string(),
        "--flash_size".to_string(),
        settings.flash_size.to_string(),
    ];
    for image in layout.images() {
        argv.push(image.offset_arg());
        argv.push(env.resolve_path(image.source)?.display().to_string());
    }
    Ok(argv)
}

pub fn merge(settings: &MergeSettings, layout: &FlashLayout, env: &dyn BuildEnv) -> Result<()> {
    let argv = command_line(settings, layout, env)?;
    tracing::info!(
        chip = %settings.chip,
        output = %argv[6],
        images = layout.images().len(),
        "merging flash images"
    );
    env.execute(&argv)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::error::Error;

    struct RecordingEnv {
        build_dir: &'static str,
        packages_dir: &'static str,
        calls: RefCell<Vec<Vec<String>>>,
        fail_with: Option<i32>,
    }

    impl RecordingEnv {
        fn new() -> Self {
            Self {
                build_dir: "/p/.pio/build/esp32dev",
                packages_dir: "/opt/pio/packages",
                calls: RefCell::new(Vec::new()),
                fail_with: None,
            }
        }
    }

    impl BuildEnv for RecordingEnv {
        fn resolve_path(&self, template: &str) -> Result<PathBuf> {
            let s = template
                .replace("${BUILD_DIR}", self.build_dir)
                .replace("${PACKAGES_DIR}", self.packages_dir)
                .replace("${PROGNAME}", "firmware");
            let pb = PathBuf::from(s);
            Ok(if pb.is_absolute() {
                pb
            } else {
                PathBuf::from("/p").join(pb)
            })
        }

        fn execute(&self, argv: &[String]) -> Result<()> {
            self.calls.borrow_mut().push(argv.to_vec());
            match self.fail_with {
                Some(code) => Err(Error::exited(
                    format!("command failed: exit status: {code}"),
                    Some(code),
                )),
                None => Ok(()),
            }
        }
    }

    fn settings(env: &HostEnv) -> MergeSettings {
        MergeSettings::resolve(&BoardConfig::default(), &ToolchainConfig::default(), env)
    }

    #[test]
    fn command_has_fixed_prefix_and_pairs_in_layout_order() {
        let env = RecordingEnv::new();
        let argv = command_line(
            &settings(&HostEnv::default()),
            &FlashLayout::esp32(),
            &env,
        )
        .unwrap();

        assert_eq!(
            argv,
            [
                "python3",
                "/opt/pio/packages/tool-esptoolpy/esptool.py",
                "--chip",
                "esp32",
                "merge_bin",
                "-o",
                "/p/.pio/build/esp32dev/firmware-merged.bin",
                "--flash_mode",
                "dio",
                "--flash_freq",
                "80m",
                "--flash_size",
                "4MB",
                "0x0000",
                "/p/.pio/build/esp32dev/bootloader.bin",
                "0x8000",
                "/p/.pio/build/esp32dev/partitions.bin",
                "0x10000",
                "/p/.pio/build/esp32dev/firmware.bin",
                "0x290000",
                "/p/.pio/build/esp32dev/spiffs.bin",
            ]
        );
        assert!(!argv.iter().any(|a| a.contains("boot_app0")));
    }

    #[test]
    fn merged_bin_path_overrides_output() {
        let host = HostEnv::from_pairs([(host_env::MERGED_BIN_PATH, "/tmp/out/combined.bin")]);
        let s = settings(&host);
        assert_eq!(s.output, "/tmp/out/combined.bin");

        let argv = command_line(&s, &FlashLayout::esp32(), &RecordingEnv::new()).unwrap();
        assert_eq!(argv[5], "-o");
        assert_eq!(argv[6], "/tmp/out/combined.bin");
    }

    #[test]
    fn chip_follows_board_mcu() {
        let board = BoardConfig::from_json(json!({ "build": { "mcu": "esp32c3" } }));
        let s = MergeSettings::resolve(&board, &ToolchainConfig::default(), &HostEnv::default());
        assert_eq!(s.chip, "esp32c3");
        assert_eq!(settings(&HostEnv::default()).chip, "esp32");
    }

    #[test]
    fn python_prefers_config_then_pythonexe() {
        let host = HostEnv::from_pairs([(host_env::PYTHONEXE, "/usr/bin/python3.12")]);
        assert_eq!(settings(&host).python, "/usr/bin/python3.12");

        let toolchain = ToolchainConfig {
            python: Some("${PACKAGES_DIR}/python/bin/python".into()),
            ..ToolchainConfig::default()
        };
        let s = MergeSettings::resolve(&BoardConfig::default(), &toolchain, &host);
        let argv = command_line(&s, &FlashLayout::esp32(), &RecordingEnv::new()).unwrap();
        assert_eq!(argv[0], "/opt/pio/packages/python/bin/python");
    }

    #[test]
    fn tool_failure_is_returned_unchanged() {
        let env = RecordingEnv {
            fail_with: Some(2),
            ..RecordingEnv::new()
        };
        let err = merge(&settings(&HostEnv::default()), &FlashLayout::esp32(), &env).unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(env.calls.borrow().len(), 1);
    }
}
