//! `forge`: turn a PRD into tested code by driving a coding agent.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use forge::active::ActiveTasks;
use forge::cancel::CancelToken;
use forge::core::types::{IterationRecord, PrdRequest, TaskRow};
use forge::exit_codes;
use forge::io::config::{Backend, ForgeConfig, load_config};
use forge::io::events::{EventPublisher, JsonlPublisher, NoopPublisher};
use forge::io::executor::build_executor;
use forge::io::init::{ForgePaths, InitOptions, init_forge};
use forge::io::oracle::CommandOracle;
use forge::io::prompt::PromptEngine;
use forge::io::store::{InteractionStore, SqliteStore, UnavailableStore};
use forge::io::validator::ShellTestValidator;
use forge::logging;
use forge::mine::run_mining;
use forge::orchestrate::{
    Collaborators, OrchestrationResult, RunOptions, RunSettings, RunStatus, now_rfc3339,
    orchestrate,
};

#[derive(Parser)]
#[command(
    name = "forge",
    version,
    about = "Drive a coding agent from a PRD to passing tests"
)]
struct Cli {
    /// Project root containing `.forge/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.forge/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Orchestrate one PRD (JSON or TOML file) and print the result as JSON.
    Run {
        /// PRD file; `.toml` is parsed as TOML, anything else as JSON.
        #[arg(long)]
        prd: PathBuf,
        /// Stop once the spec is written and hand it to an external agent.
        #[arg(long)]
        handoff: bool,
        /// Use the stub executor instead of the configured backend.
        #[arg(long)]
        stub: bool,
        /// Override `max_iterations` from config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Project directory the agent works in (overrides the PRD's `project_path`).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Do not append phase events to `.forge/events.jsonl`.
        #[arg(long)]
        no_events: bool,
    },
    /// Recompute playbooks from the task history.
    Mine,
    /// List stored playbooks as JSON.
    Playbooks,
    /// Show a task and its iterations as JSON.
    History {
        task_id: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let paths = ForgePaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            let paths = init_forge(&cli.root, &InitOptions { force })?;
            println!("{}", paths.config_path.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            prd,
            handoff,
            stub,
            max_iterations,
            project,
            no_events,
        } => cmd_run(
            &paths,
            &prd,
            &RunFlags {
                handoff,
                stub,
                max_iterations,
                project,
                no_events,
            },
        ),
        Command::Mine => {
            let cfg = load_config(&paths.config_path)?;
            let store = SqliteStore::open(&paths.store_path(&cfg))?;
            let playbooks = run_mining(&store, &cfg.mining.topics, &now_rfc3339())?;
            print_json(&playbooks)?;
            Ok(exit_codes::OK)
        }
        Command::Playbooks => {
            let cfg = load_config(&paths.config_path)?;
            let store = SqliteStore::open(&paths.store_path(&cfg))?;
            print_json(&store.playbooks()?)?;
            Ok(exit_codes::OK)
        }
        Command::History { task_id } => {
            let cfg = load_config(&paths.config_path)?;
            let store = SqliteStore::open(&paths.store_path(&cfg))?;
            let task = store
                .task(&task_id)?
                .ok_or_else(|| anyhow!("unknown task {task_id}"))?;
            let iterations = store.iterations(&task_id)?;
            print_json(&TaskHistoryView { task, iterations })?;
            Ok(exit_codes::OK)
        }
    }
}

#[derive(Serialize)]
struct TaskHistoryView {
    task: TaskRow,
    iterations: Vec<IterationRecord>,
}

struct RunFlags {
    handoff: bool,
    stub: bool,
    max_iterations: Option<u32>,
    project: Option<PathBuf>,
    no_events: bool,
}

fn cmd_run(paths: &ForgePaths, prd_path: &Path, flags: &RunFlags) -> Result<i32> {
    let mut cfg = load_config(&paths.config_path)?;
    if flags.stub {
        cfg.executor.backend = Backend::Stub;
    }
    if let Some(max) = flags.max_iterations {
        cfg.max_iterations = max;
    }
    cfg.validate()?;

    let mut prd = read_prd(prd_path)?;
    if flags.project.is_some() {
        prd.project_path.clone_from(&flags.project);
    }

    let store = open_store(paths, &cfg);
    let executor = build_executor(&cfg.executor)?;
    let oracle = CommandOracle::new(cfg.oracle.clone());
    let events: Box<dyn EventPublisher> = if flags.no_events {
        Box::new(NoopPublisher)
    } else {
        Box::new(JsonlPublisher::new(&paths.events_path))
    };
    let prompts = PromptEngine::new()?;
    let active = ActiveTasks::new();
    let cancel = CancelToken::new();
    if let Err(err) = cancel.cancel_on_signals() {
        warn!(err = %format!("{err:#}"), "signal handlers unavailable, Ctrl-C will not abort cleanly");
    }
    let collaborators = Collaborators {
        oracle: &oracle,
        executor: executor.as_ref(),
        validator: &ShellTestValidator,
        store: store.as_ref(),
        events: events.as_ref(),
        active: &active,
        prompts: &prompts,
    };

    let result = orchestrate(
        &prd,
        &collaborators,
        &RunSettings::from_config(&cfg, paths),
        &RunOptions {
            handoff: flags.handoff,
            cancel: Some(cancel),
        },
    );
    print_json(&result)?;
    Ok(exit_code(&result))
}

fn open_store(paths: &ForgePaths, cfg: &ForgeConfig) -> Box<dyn InteractionStore> {
    let path = paths.store_path(cfg);
    match SqliteStore::open(&path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "interaction store unavailable, running without history");
            Box::new(UnavailableStore::new(format!("{err:#}")))
        }
    }
}

fn read_prd(path: &Path) -> Result<PrdRequest> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read PRD {}", path.display()))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let prd: PrdRequest = if is_toml {
        toml::from_str(&contents).with_context(|| format!("parse PRD {}", path.display()))?
    } else {
        serde_json::from_str(&contents).with_context(|| format!("parse PRD {}", path.display()))?
    };
    Ok(prd)
}

fn exit_code(result: &OrchestrationResult) -> i32 {
    if result.needs_clarification {
        return exit_codes::NEEDS_CLARIFICATION;
    }
    match result.status {
        Some(RunStatus::Success | RunStatus::Handoff) => exit_codes::OK,
        Some(RunStatus::Escalated) | None => exit_codes::ESCALATED,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "forge",
            "run",
            "--prd",
            "prd.json",
            "--stub",
            "--handoff",
            "--max-iterations",
            "2",
        ]);
        match cli.command {
            Command::Run {
                prd,
                handoff,
                stub,
                max_iterations,
                project,
                no_events,
            } => {
                assert_eq!(prd, PathBuf::from("prd.json"));
                assert!(handoff && stub);
                assert_eq!(max_iterations, Some(2));
                assert!(project.is_none());
                assert!(!no_events);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_history_with_global_root() {
        let cli = Cli::parse_from(["forge", "history", "task-1", "--root", "/tmp/p"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/p"));
        assert!(matches!(cli.command, Command::History { task_id } if task_id == "task-1"));
    }

    #[test]
    fn read_prd_accepts_toml_and_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let toml_path = temp.path().join("prd.toml");
        fs::write(
            &toml_path,
            "title = \"Add health endpoint\"\ndescription = \"GET /health\"\nacceptance_criteria = [\"200\"]\n",
        )
        .expect("write");
        let json_path = temp.path().join("prd.json");
        fs::write(&json_path, r#"{"title": "Add health endpoint", "description": "GET /health"}"#)
            .expect("write");

        assert_eq!(read_prd(&toml_path).expect("toml").acceptance_criteria, vec!["200"]);
        assert!(read_prd(&json_path).expect("json").acceptance_criteria.is_empty());
        assert!(read_prd(&temp.path().join("missing.json")).is_err());
    }

    #[test]
    fn exit_codes_follow_outcome() {
        let mut result: OrchestrationResult = serde_json::from_str(
            r#"{"success": false, "message": "m", "needsClarification": true, "questions": ["q"]}"#,
        )
        .expect("parse");
        assert_eq!(exit_code(&result), exit_codes::NEEDS_CLARIFICATION);
        result.needs_clarification = false;
        result.status = Some(RunStatus::Handoff);
        assert_eq!(exit_code(&result), exit_codes::OK);
        result.status = Some(RunStatus::Escalated);
        assert_eq!(exit_code(&result), exit_codes::ESCALATED);
    }
}
