//! Crucible CLI
//!
//! Operator tool for the sandbox and the handoff review gate.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crucible::handoff::{ArtifactStore, HandoffProtocol, ReviewResult, WorkspaceMutator};
use crucible::reflection::{ReflectionLoop, ReflectionTask};
use crucible::sandbox::{Sandbox, SandboxManager};
use crucible::{CommandRunner, CrucibleConfig, EventSink, NullSink, Result, ShellRunner, Validate};

const USAGE: &str = "\
Usage: crucible <command> [args]

Commands:
  status                          Show the sandbox state
  start                           Create or resume the sandbox
  stop                            Stop the sandbox, keeping its volume
  destroy                         Remove the sandbox and its volume
  reflect <objective> [--context FILE] [--target PATH]... [--max-iterations N]
                                  Apply changes from FILE and validate them in the sandbox
  artifacts                       List handoff artifacts
  approve <id> [reviewer]         Approve a pending artifact
  reject <id> [reviewer]          Reject a pending artifact
  execute <id> [--force]          Apply an artifact to the workspace
  rollback <id>                   Restore the files an execution changed

Environment variables:
  CRUCIBLE_CONFIG=PATH            Config file (default: crucible.toml)";

/// Services wired together from configuration.
struct App {
    manager: Arc<SandboxManager>,
    reflection: ReflectionLoop,
    handoff: HandoffProtocol,
}

impl App {
    fn new(config: CrucibleConfig) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ShellRunner::new(config.sandbox.operation_timeout()));
        let events: Arc<dyn EventSink> = Arc::new(NullSink);

        let manager = Arc::new(SandboxManager::new(
            config.sandbox.clone(),
            &config.state_dir,
            runner.clone(),
            events.clone(),
        )?);
        let sandbox: Arc<dyn Sandbox> = manager.clone();

        let reflection = ReflectionLoop::new(sandbox.clone(), events.clone(), config.reflection.clone())
            .with_trail(config.state_dir.join("reflections.jsonl"));

        let mutator = WorkspaceMutator::new(
            config.sandbox.workspace_root.clone(),
            config.backup_dir(),
            config.handoff.production_test_command.clone(),
            runner,
        )
        .with_test_timeout(config.sandbox.operation_timeout());
        let handoff = HandoffProtocol::new(
            config.handoff.clone(),
            ArtifactStore::new(config.artifacts_dir()),
            sandbox,
            Arc::new(mutator),
            events,
        );

        Ok(Self {
            manager,
            reflection,
            handoff,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{}", USAGE);
        return ExitCode::FAILURE;
    }

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<CrucibleConfig> {
    let path = std::env::var("CRUCIBLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("crucible.toml"));
    let config = CrucibleConfig::load(&path)?;
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "configuration warning");
    }
    Ok(config)
}

async fn run(args: &[String]) -> Result<()> {
    let app = App::new(load_config()?)?;
    let command = args[0].as_str();
    let rest = &args[1..];

    match command {
        "status" => {
            let state = app.manager.status().await;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        "start" => {
            let state = app.manager.start().await?;
            println!("Sandbox {} running on branch {}", state.id, state.branch.unwrap_or_default());
        }
        "stop" => {
            app.manager.stop().await?;
            println!("Sandbox stopped");
        }
        "destroy" => {
            app.manager.destroy().await?;
            println!("Sandbox destroyed");
        }
        "reflect" => reflect(&app, rest).await?,
        "artifacts" => {
            for artifact in app.handoff.list()? {
                println!(
                    "{}  {:<9}  {} file(s)  expires {}  {}",
                    artifact.id,
                    artifact.status.to_string(),
                    artifact.files.len(),
                    artifact.expires_at.format("%Y-%m-%d %H:%M"),
                    artifact.objective
                );
            }
        }
        "approve" | "reject" => {
            let id = required(rest, 0, "artifact id")?;
            let reviewer = rest.get(1).cloned().unwrap_or_else(default_reviewer);
            let review = if command == "approve" {
                ReviewResult::approve(reviewer)
            } else {
                ReviewResult::reject(reviewer)
            };
            let artifact = app.handoff.review(id, review).await?;
            println!("Artifact {} is now {}", artifact.id, artifact.status);
        }
        "execute" => {
            let id = required(rest, 0, "artifact id")?;
            let force = rest.iter().any(|a| a == "--force");
            let result = app.handoff.execute(id, force).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                return Err(crucible::Error::PartialApplyFailure {
                    path: result.files_failed.join(", "),
                    reason: result.errors.join("; "),
                });
            }
        }
        "rollback" => {
            let id = required(rest, 0, "artifact id")?;
            let result = app.handoff.rollback(id).await?;
            println!(
                "Restored {}/{} file(s){}",
                result.restored,
                result.expected,
                result
                    .revert_commit
                    .map(|c| format!(", revert commit {}", c))
                    .unwrap_or_default()
            );
        }
        other => {
            eprintln!("{}", USAGE);
            return Err(crucible::Error::Config(format!("unknown command '{}'", other)));
        }
    }
    Ok(())
}

async fn reflect(app: &App, args: &[String]) -> Result<()> {
    let objective = required(args, 0, "objective")?;
    let mut task = ReflectionTask::new(objective.clone());
    let mut targets = Vec::new();

    let mut iter = args[1..].iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| crucible::Error::Config(format!("{} needs a value", flag)))?;
        match flag.as_str() {
            "--context" => task = task.with_context(std::fs::read_to_string(value)?),
            "--target" => targets.push(value.clone()),
            "--max-iterations" => {
                let max = value
                    .parse()
                    .map_err(|_| crucible::Error::Config(format!("invalid iteration count '{}'", value)))?;
                task = task.with_max_iterations(max);
            }
            other => return Err(crucible::Error::Config(format!("unknown flag '{}'", other))),
        }
    }
    let task = task.with_target_files(targets);

    let result = app.reflection.run(task).await;
    println!("{}: {}", result.status, result.summary);

    if result.ready_for_promotion {
        let artifact = app.handoff.prepare(&result).await?;
        println!(
            "Prepared artifact {} with {} file(s); review with `crucible approve {}`",
            artifact.id,
            artifact.files.len(),
            artifact.id
        );
    }
    Ok(())
}

fn required<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a String> {
    args.get(index)
        .ok_or_else(|| crucible::Error::Config(format!("missing {}", what)))
}

fn default_reviewer() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}
