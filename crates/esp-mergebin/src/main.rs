use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use esp_mergebin::Result;
use esp_mergebin::config::ConfigDoc;
use esp_mergebin::executor::{ExecCtx, StdoutSink};
use esp_mergebin::host_env::HostEnv;
use esp_mergebin::layout::FlashLayout;
use esp_mergebin::modules::mergebin::{self, ProjectEnv};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit diagnostics (MERGEBIN_LOG) as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the project definition and print the target plan
    Plan {
        /// Path to a project definition TOML
        config: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Build the selected target and everything it depends on
    Run {
        /// Path to a project definition TOML
        config: PathBuf,
        /// Target name or task id
        #[arg(long, default_value = mergebin::TARGET_NAME)]
        target: String,
        /// Print what would run without spawning anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a project definition TOML
        config: PathBuf,
    },
    /// Print the merge command without running it
    Command {
        /// Path to a project definition TOML
        config: PathBuf,
    },
    /// Print the flash layout with resolved image paths
    Layout {
        /// Path to a project definition TOML
        config: PathBuf,
    },
}

fn main() {
    // A missing .env is fine.
    let _ = dotenv::dotenv();
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Err(e) = HostEnv::capture().and_then(|env| dispatch(args.cmd, env)) {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code().filter(|c| *c != 0).unwrap_or(1));
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("MERGEBIN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn dispatch(cmd: Command, env: HostEnv) -> Result<()> {
    match cmd {
        Command::Plan { config, dot } => cmd_plan(&config, dot),
        Command::Run {
            config,
            target,
            dry_run,
        } => cmd_run(&config, &target, dry_run, env),
        Command::Resolve { config } => cmd_resolve(&config),
        Command::Command { config } => cmd_command(&config, env),
        Command::Layout { config } => cmd_layout(&config, env),
    }
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = esp_mergebin::config::load(path)?;
    let plan = esp_mergebin::modules::plan_all(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<10} {:<8}  {:<16} {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label,
            task.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = esp_mergebin::config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, target: &str, dry_run: bool, env: HostEnv) -> Result<()> {
    let doc = esp_mergebin::config::load(path)?;
    let plan = esp_mergebin::modules::plan_all(&doc)?.select(target)?;

    let reg = esp_mergebin::executor::builtin_registry()?;
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink, env);
    esp_mergebin::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

fn quiet_ctx(env: HostEnv) -> ExecCtx {
    ExecCtx::new(true, Arc::new(StdoutSink::default()), env)
}

fn cmd_command(path: &Path, env: HostEnv) -> Result<()> {
    let doc = esp_mergebin::config::load(path)?;
    doc.ensure_known_tables()?;
    let argv = mergebin::preview_command(&doc, &quiet_ctx(env))?;
    println!("{}", display_argv(&argv));
    Ok(())
}

fn cmd_layout(path: &Path, env: HostEnv) -> Result<()> {
    let doc: ConfigDoc = esp_mergebin::config::load(path)?;
    doc.ensure_known_tables()?;
    let ctx = quiet_ctx(env);
    let project = ProjectEnv::new(&doc, &ctx)?;
    for (image, merged) in FlashLayout::esp32().catalog() {
        let resolved = project.paths().expand_path(image.source)?;
        println!(
            "{:>10}  {:<11} {:<9} {}",
            image.offset_arg(),
            image.name,
            if merged { "merged" } else { "excluded" },
            resolved.display()
        );
    }
    let settings = mergebin::merge_settings(&doc, &project)?;
    println!("output: {}", project.paths().expand_path(&settings.output)?.display());
    Ok(())
}

// For display only; the command itself is spawned from the argv, never through a shell.
fn display_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
