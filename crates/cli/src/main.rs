use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opflow_core::engine::Engine;
use opflow_core::job::{JobBackend, JobSpec, JOB_SPEC_ENV};
use opflow_core::{BlobHash, DagSpec, RunId, Schedule, WorkflowId};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod config;

use config::OpflowConfig;

const CONFIG_ENV: &str = "OPFLOW_CONFIG";
const DATA_DIR_ENV: &str = "OPFLOW_DATA_DIR";

#[derive(Parser, Debug)]
#[command(name = "opflow")]
#[command(about = "DAG workflow orchestration engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "opflow.toml", env = CONFIG_ENV)]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = DATA_DIR_ENV)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a workflow (or a new DAG version of it) from a JSON DAG file
    Register {
        dag: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Cron expression to run the workflow on
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Run a registered workflow to completion
    Execute {
        workflow_id: WorkflowId,
        /// Parameter override, as NAME=VALUE
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Run a DAG file without persisting anything and print its results
    Preview { dag: PathBuf },
    /// Start a run of a registered workflow in the background
    Trigger {
        workflow_id: WorkflowId,
        #[arg(long, default_value = "manual")]
        name: String,
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Set a recurring schedule; the daemon installs it
    Schedule {
        workflow_id: WorkflowId,
        period: String,
        #[arg(long, default_value = "scheduled")]
        name: String,
    },
    /// Change or pause a workflow's schedule
    EditSchedule {
        workflow_id: WorkflowId,
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        paused: bool,
    },
    /// Remove a workflow's schedule
    Unschedule { workflow_id: WorkflowId },
    /// Keep the schedules of all registered workflows firing
    Daemon {
        /// Seconds between two reloads of registered schedules
        #[arg(long, default_value = "30")]
        sync_interval: u64,
    },
    /// List runs, most recent first, or show one run with its recorded results
    Runs {
        #[arg(long)]
        workflow_id: Option<WorkflowId>,
        #[arg(long, conflicts_with = "workflow_id")]
        id: Option<RunId>,
    },
    /// Write the stored content of an artifact to stdout
    Artifact { hash: BlobHash },
    /// List registered workflows
    Workflows,
    /// Execute the workflow job passed in the job spec environment variable
    #[command(hide = true)]
    RunJob,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid NAME=VALUE: no `=` found in `{}`", s))
}

fn read_dag(path: &Path) -> Result<DagSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read DAG file {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse DAG file")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn engine(config: &OpflowConfig) -> Result<Engine> {
    Ok(config
        .engine(config.scheduler()?)?
        .with_scheduled_time(config.orchestrator.time_config()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opflow=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    let config = OpflowConfig::load(&args.config, args.data_dir.clone())?;
    let time = config.orchestrator.time_config();

    match args.command {
        Command::Register {
            dag,
            name,
            description,
            schedule,
        } => {
            let schedule = schedule.map(Schedule::periodic).unwrap_or_default();
            let record = engine(&config)?
                .register_workflow(&name, description, read_dag(&dag)?, schedule)
                .await?;
            println!("{}", record.id);
        }
        Command::Execute {
            workflow_id,
            params,
        } => {
            let status = engine(&config)?
                .execute_workflow(workflow_id, time, params.into_iter().collect())
                .await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Preview { dag } => {
            let result = engine(&config)?.preview_workflow(&read_dag(&dag)?, time).await?;
            print_json(&result)?;
        }
        Command::Trigger {
            workflow_id,
            name,
            params,
        } => {
            // The background job reopens the same configuration
            std::env::set_var(CONFIG_ENV, &args.config);
            std::env::set_var(DATA_DIR_ENV, &args.data_dir);
            let status = engine(&config)?
                .trigger_workflow(workflow_id, &name, time, params.into_iter().collect())
                .await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Schedule {
            workflow_id,
            period,
            name,
        } => {
            engine(&config)?
                .schedule_workflow(workflow_id, &name, &period)
                .await?;
        }
        Command::EditSchedule {
            workflow_id,
            period,
            paused,
        } => {
            engine(&config)?
                .edit_schedule(
                    workflow_id,
                    Schedule {
                        cron_schedule: period,
                        paused,
                    },
                )
                .await?;
        }
        Command::Unschedule { workflow_id } => {
            engine(&config)?.unschedule_workflow(workflow_id).await?;
        }
        Command::Daemon { sync_interval } => {
            std::env::set_var(CONFIG_ENV, &args.config);
            std::env::set_var(DATA_DIR_ENV, &args.data_dir);
            daemon(&config, Duration::from_secs(sync_interval)).await?;
        }
        Command::Runs {
            id: Some(run_id), ..
        } => {
            let Some((run, events)) = engine(&config)?.run_details(run_id).await? else {
                bail!("run {} not found", run_id);
            };
            print_json(&serde_json::json!({ "run": run, "events": events }))?;
        }
        Command::Runs {
            workflow_id,
            id: None,
        } => {
            let runs: Vec<_> = engine(&config)?
                .list_runs()
                .await?
                .into_iter()
                .filter(|run| workflow_id.map_or(true, |id| run.workflow_id == id))
                .collect();
            print_json(&runs)?;
        }
        Command::Artifact { hash } => {
            let Some(content) = engine(&config)?.artifact_content(&hash).await? else {
                bail!("no stored content for {}", hash);
            };
            std::io::stdout().write_all(&content)?;
        }
        Command::Workflows => {
            print_json(&engine(&config)?.list_workflows().await?)?;
        }
        Command::RunJob => run_job(&config).await?,
    }

    Ok(())
}

/// Install every registered schedule on one long-lived backend and follow later edits
async fn daemon(config: &OpflowConfig, sync_interval: Duration) -> Result<()> {
    let scheduler = config.scheduler()?;
    let mut applied: HashMap<WorkflowId, Schedule> = HashMap::new();
    let mut ticker = tokio::time::interval(sync_interval);

    tracing::info!("Starting opflow daemon");
    tracing::info!("Data directory: {}", config.data_dir.display());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down opflow daemon");
                return Ok(());
            }
        }

        if let Err(e) = sync_schedules(config, &scheduler, &mut applied).await {
            tracing::error!("Unable to sync schedules, retrying in {:?}: {:#}", sync_interval, e);
        }
    }
}

/// Install the schedules that changed since the last sync
async fn sync_schedules(
    config: &OpflowConfig,
    scheduler: &Arc<dyn JobBackend>,
    applied: &mut HashMap<WorkflowId, Schedule>,
) -> Result<()> {
    let engine = config
        .engine(scheduler.clone())?
        .with_scheduled_time(config.orchestrator.time_config());
    for record in engine.list_workflows().await? {
        if applied.get(&record.id).cloned().unwrap_or_default() == record.schedule {
            continue;
        }
        match engine.edit_schedule(record.id, record.schedule.clone()).await {
            Ok(()) => {
                applied.insert(record.id, record.schedule);
            }
            Err(e) => tracing::error!("Unable to install schedule of {}: {}", record.name, e),
        }
    }
    Ok(())
}

async fn run_job(config: &OpflowConfig) -> Result<()> {
    let encoded = std::env::var(JOB_SPEC_ENV)
        .with_context(|| format!("{} is not set", JOB_SPEC_ENV))?;
    let JobSpec::Workflow(job) = JobSpec::decode(&encoded)? else {
        bail!("run-job only executes workflow jobs");
    };

    tracing::info!("Running job {} for workflow {}", job.job_name, job.workflow_id);
    let status = engine(config)?
        .execute_workflow(job.workflow_id, job.time_config, job.parameters)
        .await?;
    tracing::info!("Job {} finished with status {:?}", job.job_name, status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("country=\"NL\"").unwrap(),
            ("country".to_string(), "\"NL\"".to_string())
        );
        assert_eq!(
            parse_key_val("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("country").is_err());
    }

    #[test]
    fn test_args_parse() {
        let id = WorkflowId::new();
        let args = Args::try_parse_from([
            "opflow",
            "execute",
            &id.to_string(),
            "-p",
            "limit=10",
        ])
        .unwrap();
        match args.command {
            Command::Execute {
                workflow_id,
                params,
            } => {
                assert_eq!(workflow_id, id);
                assert_eq!(params, vec![("limit".to_string(), "10".to_string())]);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from(["opflow", "execute", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_runs_filters_are_exclusive() {
        let run_id = RunId::new();
        let args = Args::try_parse_from(["opflow", "runs", "--id", &run_id.to_string()]).unwrap();
        assert!(matches!(args.command, Command::Runs { id: Some(id), workflow_id: None } if id == run_id));

        let workflow_id = WorkflowId::new();
        assert!(Args::try_parse_from([
            "opflow",
            "runs",
            "--id",
            &run_id.to_string(),
            "--workflow-id",
            &workflow_id.to_string(),
        ])
        .is_err());

        assert!(Args::try_parse_from(["opflow", "artifact", "not-a-hash"]).is_err());
    }

    #[tokio::test]
    async fn test_sync_failure_is_recoverable() {
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let config = OpflowConfig::load(&dir.path().join("opflow.toml"), data_dir.clone()).unwrap();
        let scheduler = config.scheduler().unwrap();
        let mut applied = HashMap::new();

        // A file where the event log directory should be
        std::fs::write(config.event_log_path(), "").unwrap();
        assert!(sync_schedules(&config, &scheduler, &mut applied).await.is_err());

        std::fs::remove_file(config.event_log_path()).unwrap();
        sync_schedules(&config, &scheduler, &mut applied).await.unwrap();
        assert!(applied.is_empty());
    }
}
