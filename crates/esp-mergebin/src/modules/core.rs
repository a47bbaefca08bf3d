use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::Module;
use crate::planner::{Plan, Task};

pub const INIT_TASK_ID: &str = "core.init";

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        doc.ensure_known_tables()?;

        plan.add(Task {
            id: INIT_TASK_ID.into(),
            label: "Init".into(),
            description: None,
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })?;
        Ok(())
    }
}

impl ModuleExec for CoreModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(INIT_TASK_ID, exec_init)
    }
}

fn exec_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(INIT_TASK_ID);
    let paths = ctx.project_paths(doc)?;
    ctx.log(&format!("config = {}", doc.path.display()));
    for (name, value) in paths.vars() {
        ctx.log(&format!("{name} = {value}"));
    }
    if !paths.build_dir.is_dir() {
        ctx.log(&format!(
            "build dir {} does not exist yet",
            paths.build_dir.display()
        ));
    }
    Ok(())
}
