use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::host_env::HostEnv;
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;
use crate::project::{ProjectConfig, ProjectPaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    failed_tasks: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => println!("[{id}] {line}"),
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok += 1;
                    } else {
                        s.failed_tasks.push(id.clone());
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: ok={} failed={}",
                    s.tasks_ok,
                    s.failed_tasks.len()
                );
                println!("  elapsed: {}ms", wall.as_millis());
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    env: Arc<HostEnv>,
    project_paths: Arc<Mutex<Option<ProjectPaths>>>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>, env: HostEnv) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            env: Arc::new(env),
            project_paths: Arc::new(Mutex::new(None)),
        }
    }

    pub fn env(&self) -> &HostEnv {
        &self.env
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_project_paths(&self, paths: ProjectPaths) {
        if let Ok(mut g) = self.project_paths.lock() {
            *g = Some(paths);
        }
    }

    // core.init normally fills this in; tasks run in isolation resolve it on demand.
    pub fn project_paths(&self, doc: &ConfigDoc) -> Result<ProjectPaths> {
        if let Some(p) = self.project_paths.lock().ok().and_then(|g| g.clone()) {
            return Ok(p);
        }
        let cfg: ProjectConfig = doc.section("project")?;
        let paths = crate::project::load_paths(&cfg, &self.env)?;
        self.set_project_paths(paths.clone());
        Ok(paths)
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    // Runs a subprocess to completion, forwarding its output line by line.
    // A non-zero exit becomes an error carrying the child's exit code.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        tracing::debug!(command = ?cmd, "spawning");

        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn of '{program}' failed: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::exited(
                format!("command failed: {status}"),
                status.code(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task of `plan` in dependency order, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    crate::modules::core::CoreModule::register_tasks(&mut reg)?;
    crate::modules::firmware::FirmwareModule::register_tasks(&mut reg)?;
    crate::modules::mergebin::MergebinModule::register_tasks(&mut reg)?;
    Ok(reg)
}

const MAX_PENDING_BYTES: usize = 16 * 1024;

// Length of the longest prefix of `pending` that does not end inside a UTF-8 sequence.
fn char_boundary(pending: &[u8]) -> usize {
    match std::str::from_utf8(pending) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => pending.len(),
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>, upto: usize| {
        if upto > 0 {
            let _ = tx.send(String::from_utf8_lossy(&pending[..upto]).into_owned());
            pending.drain(..upto);
        }
    };

    // esptool redraws progress with bare '\r', so both terminators end a line.
    while let Ok(n) = r.read(&mut buf) {
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                let len = pending.len();
                flush(&mut pending, len);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let upto = char_boundary(&pending);
                    flush(&mut pending, upto);
                }
            }
        }
    }
    let len = pending.len();
    flush(&mut pending, len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Task;

    fn ok_task(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        ctx.log("hello");
        Ok(())
    }

    fn failing_task(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Err(Error::exited("command failed: exit status: 3", Some(3)))
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            description: None,
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: vec![],
        }
    }

    #[test]
    fn stops_at_first_failure_and_keeps_exit_code() {
        let doc = ConfigDoc::from_toml_str("<mem>", "").unwrap();
        let mut plan = Plan::default();
        plan.add(task("t.a", &[])).unwrap();
        plan.add(task("t.b", &["t.a"])).unwrap();
        plan.add(task("t.c", &["t.b"])).unwrap();

        let mut reg = TaskRegistry::default();
        reg.add("t.a", ok_task).unwrap();
        reg.add("t.b", failing_task).unwrap();
        reg.add("t.c", ok_task).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)), HostEnv::default());
        let err = execute_plan(&doc, &plan, &reg, &mut ctx).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().starts_with("task 't.b' failed"));

        drop(ctx);
        let started: Vec<String> = rx
            .iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskStarted { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(started, ["t.a", "t.b"]);
    }

    #[test]
    fn missing_executor_is_an_error() {
        let doc = ConfigDoc::from_toml_str("<mem>", "").unwrap();
        let mut plan = Plan::default();
        plan.add(task("t.a", &[])).unwrap();
        let mut ctx = ExecCtx::new(true, Arc::new(StdoutSink::default()), HostEnv::default());
        let err = execute_plan(&doc, &plan, &TaskRegistry::default(), &mut ctx)
            .unwrap_err()
            .to_string();
        assert!(err.contains("no executor registered"), "unexpected err: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn run_cmd_forwards_output_and_exit_code() {
        let (tx, rx) = mpsc::channel();
        let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)), HostEnv::default());

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 4"]);
        let err = ctx.run_cmd(cmd).unwrap_err();
        assert_eq!(err.exit_code(), Some(4));

        drop(ctx);
        let mut lines: Vec<String> = rx
            .iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        lines.sort();
        assert_eq!(lines, ["err", "out"]);
    }

    #[test]
    fn long_lines_split_on_char_boundaries() {
        let mut input = vec![b'a'; MAX_PENDING_BYTES - 1];
        input.extend_from_slice("é\n".as_bytes());

        let (tx, rx) = mpsc::channel();
        read_output_stream(&input[..], tx);
        let lines: Vec<String> = rx.iter().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "a".repeat(MAX_PENDING_BYTES - 1));
        assert_eq!(lines[1], "é");
    }

    #[test]
    fn dry_run_does_not_spawn() {
        let (tx, rx) = mpsc::channel();
        let ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)), HostEnv::default());
        ctx.run_cmd(Command::new("/definitely/not/a/program")).unwrap();
        drop(ctx);
        let logs: Vec<ExecEvent> = rx.iter().collect();
        assert!(matches!(&logs[..], [ExecEvent::TaskLog { line, .. }] if line.starts_with("DRY-RUN")));
    }
}
