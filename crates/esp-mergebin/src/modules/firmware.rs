use std::process::Command;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::layout;
use crate::modules::Module;
use crate::planner::{Plan, Task};

pub const BUILD_TASK_ID: &str = "firmware.build";
/// Provided once the application image exists.
pub const FIRMWARE_ARTIFACT: &str = "artifact:firmware";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// When false the build command is skipped; the image must already exist.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub build_command: Vec<String>,
    pub working_dir: Option<String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            build_command: Vec::new(),
            working_dir: None,
        }
    }
}

pub struct FirmwareModule;

impl Module for FirmwareModule {
    fn id(&self) -> &'static str {
        "firmware"
    }

    // Planned unconditionally: the merge target always depends on the firmware image.
    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: FirmwareConfig = doc.section("firmware")?;
        if cfg.build_command.first().is_some_and(|p| p.trim().is_empty()) {
            return Err(Error::msg("firmware.build_command has an empty program"));
        }

        plan.add(Task {
            id: BUILD_TASK_ID.into(),
            label: cfg.label.unwrap_or_else(|| "Build firmware".into()),
            description: Some("Build the application image".into()),
            module: self.id().into(),
            phase: "build".into(),
            after: vec!["core.init".into()],
            provides: vec![FIRMWARE_ARTIFACT.into(), "target:firmware".into()],
        })?;
        Ok(())
    }
}

impl ModuleExec for FirmwareModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(BUILD_TASK_ID, exec_build)
    }
}

fn exec_build(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(BUILD_TASK_ID);
    let cfg: FirmwareConfig = doc.section("firmware")?;
    let paths = ctx.project_paths(doc)?;

    if cfg.enabled && !cfg.build_command.is_empty() {
        let argv = cfg
            .build_command
            .iter()
            .map(|a| paths.expand(a))
            .collect::<Result<Vec<_>>>()?;
        let cwd = match cfg.working_dir.as_deref() {
            Some(dir) => paths.expand_path(dir)?,
            None => paths.root.clone(),
        };
        ctx.log(&format!("building firmware in {}", cwd.display()));
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(cwd);
        ctx.run_cmd(cmd)?;
    }

    if ctx.dry_run {
        return Ok(());
    }
    let image = paths.expand_path(layout::FIRMWARE_BIN)?;
    if !image.is_file() {
        return Err(Error::msg(format!(
            "firmware image {} not found (build it first or set firmware.build_command)",
            image.display()
        )));
    }
    ctx.log(&format!("firmware image {}", image.display()));
    Ok(())
}
