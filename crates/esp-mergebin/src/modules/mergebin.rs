use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;

use crate::board::BoardConfig;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::layout::FlashLayout;
use crate::merge::{self, BuildEnv, MergeSettings, ToolchainConfig};
use crate::modules::Module;
use crate::modules::firmware::FIRMWARE_ARTIFACT;
use crate::planner::{Plan, Task};
use crate::project::ProjectPaths;

pub const MERGE_TASK_ID: &str = "mergebin.merge";
pub const TARGET_NAME: &str = "mergebin";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergebinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Default for MergebinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            description: None,
        }
    }
}

pub struct MergebinModule;

impl Module for MergebinModule {
    fn id(&self) -> &'static str {
        "mergebin"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: MergebinConfig = doc.section("mergebin")?;
        if !cfg.enabled {
            return Ok(());
        }

        plan.add(Task {
            id: MERGE_TASK_ID.into(),
            label: cfg.label.unwrap_or_else(|| "Merge binary".into()),
            description: Some(
                cfg.description
                    .unwrap_or_else(|| "Build combined image".into()),
            ),
            module: self.id().into(),
            phase: "merge".into(),
            after: vec![FIRMWARE_ARTIFACT.into()],
            provides: vec![
                format!("target:{TARGET_NAME}"),
                "artifact:merged".into(),
            ],
        })?;
        Ok(())
    }
}

impl ModuleExec for MergebinModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(MERGE_TASK_ID, exec_merge)
    }
}

/// Executor-backed host: paths come from the project, commands go through `ExecCtx::run_cmd`.
pub struct ProjectEnv<'a> {
    paths: ProjectPaths,
    ctx: &'a ExecCtx,
}

impl<'a> ProjectEnv<'a> {
    pub fn new(doc: &ConfigDoc, ctx: &'a ExecCtx) -> Result<Self> {
        Ok(Self {
            paths: ctx.project_paths(doc)?,
            ctx,
        })
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }
}

impl BuildEnv for ProjectEnv<'_> {
    fn resolve_path(&self, template: &str) -> Result<PathBuf> {
        self.paths.expand_path(template)
    }

    fn execute(&self, argv: &[String]) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::msg("empty command"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.paths.root);
        self.ctx.run_cmd(cmd)
    }
}

pub fn merge_settings(doc: &ConfigDoc, env: &ProjectEnv<'_>) -> Result<MergeSettings> {
    let board = BoardConfig::load(doc, env.paths())?;
    let toolchain: ToolchainConfig = doc.section("toolchain")?;
    Ok(MergeSettings::resolve(&board, &toolchain, env.ctx.env()))
}

/// The argv `mergebin` would run, without running it.
pub fn preview_command(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Vec<String>> {
    let env = ProjectEnv::new(doc, ctx)?;
    let settings = merge_settings(doc, &env)?;
    merge::command_line(&settings, &FlashLayout::esp32(), &env)
}

fn exec_merge(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(MERGE_TASK_ID);
    let env = ProjectEnv::new(doc, ctx)?;
    let settings = merge_settings(doc, &env)?;
    merge::merge(&settings, &FlashLayout::esp32(), &env)
}
