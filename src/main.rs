//! `steward` - a single-household multi-agent operating system.
//!
//! This binary wires the nine core components (`steward-core`) into a
//! CLI and, via `serve`, a long-running Supervisor plus WebSocket facade.

mod cli;
mod server;

use clap::Parser;
use cli::{ApprovalsAction, AuditAction, Cli, Commands, JobsAction, StatusModeArg};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use steward_core::bus::EventBus;
use steward_core::config::EnvConfig;
use steward_core::connectors::{ConnectorRegistry, StubMailConnector, StubPriceFeedConnector};
use steward_core::policy::PolicyRuntime;
use steward_core::scheduler::{Frequency, JobAction, JobSchedule, JobStore, ScheduledJob, SchedulerDaemon, ShellAction};
use steward_core::agent_runtime::AgentRuntime;
use steward_core::store::entities::{ApprovalStatus, PolicyAllowlists, PolicySnapshot, PolicyThresholds, QuietHoursSpec};
use steward_core::store::Store;
use steward_core::supervisor::{StatusMode, Supervisor};
use steward_core::{Result, StewardError};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn load_config() -> Result<EnvConfig> {
    EnvConfig::from_map(&std::env::vars().collect::<HashMap<_, _>>())
}

/// Builds the full component graph (spec.md §4), installing a default
/// policy snapshot from the environment config on first run.
fn build(cfg: &EnvConfig) -> (Arc<Store>, Arc<Supervisor>) {
    let store = Arc::new(Store::new(cfg));
    if store.current_policy().is_none() {
        store.install_policy(PolicySnapshot {
            version: 1,
            thresholds: PolicyThresholds {
                cost_auto_cap: cfg.cost_auto_cap,
                cost_confirm_cap: cfg.cost_confirm_cap,
            },
            allowlists: PolicyAllowlists::default(),
            quiet_hours: QuietHoursSpec {
                start_hour: cfg.quiet_hours.start_hour,
                end_hour: cfg.quiet_hours.end_hour,
            },
        });
    }

    let bus = Arc::new(EventBus::new(cfg.bus_queue_size));
    let mut connectors = ConnectorRegistry::new(Arc::clone(&bus));
    connectors.register(Arc::new(StubMailConnector::new()));
    connectors.register(Arc::new(StubPriceFeedConnector::new()));
    let connectors = Arc::new(connectors);

    let policy = Arc::new(PolicyRuntime::new(Arc::clone(&store), Arc::clone(&bus)));
    let agents = Arc::new(AgentRuntime::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&policy)));
    let job_store = JobStore::new(&cfg.data_root);
    let scheduler = Arc::new(SchedulerDaemon::new(job_store, Arc::clone(&store), Arc::clone(&bus)));

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        bus,
        connectors,
        agents,
        scheduler,
        policy,
    ));
    (store, supervisor)
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = load_config()?;
    let (store, supervisor) = build(&cfg);

    match cli.command {
        Commands::Serve => {
            supervisor.startup().await?;
            log::info!("steward listening on {}:{}", cfg.bind_host, cfg.api_port);
            server::run(cfg.clone(), Arc::clone(&supervisor)).await?;
            supervisor.shutdown().await?;
        }

        Commands::Startup => {
            let started = supervisor.startup().await?;
            println!("{}", serde_json::json!({"success": true, "already_running": !started}));
        }

        Commands::Shutdown => {
            let stopped = supervisor.shutdown().await?;
            println!("{}", serde_json::json!({"success": true, "already_stopped": !stopped}));
        }

        Commands::Status { mode } => {
            let report = supervisor.status(to_status_mode(mode)).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Jobs { action } => handle_jobs(&cfg, &supervisor, action).await?,

        Commands::Approvals { action } => handle_approvals(&store, &supervisor, action).await?,

        Commands::Audit { action } => match action {
            AuditAction::Tail { n } => {
                let records = steward_core::audit::AuditLog::new(Arc::clone(&store)).tail(n);
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            AuditAction::Trace { correlation_id } => {
                let steps = supervisor.audit_trace(correlation_id);
                println!("{}", serde_json::to_string_pretty(&steps)?);
            }
        },
    }

    Ok(())
}

fn to_status_mode(mode: StatusModeArg) -> StatusMode {
    match mode {
        StatusModeArg::Quick => StatusMode::Quick,
        StatusModeArg::Full => StatusMode::Full,
        StatusModeArg::AuditTrace => StatusMode::AuditTrace,
    }
}

async fn handle_jobs(cfg: &EnvConfig, supervisor: &Supervisor, action: JobsAction) -> Result<()> {
    let job_store = JobStore::new(&cfg.data_root);

    match action {
        JobsAction::List => {
            let jobs_file = job_store.load_jobs().map_err(StewardError::from)?;
            println!("{}", serde_json::to_string_pretty(&jobs_file.jobs)?);
        }
        JobsAction::Create { name, frequency, program, arg } => {
            let frequency = match frequency.as_str() {
                "hourly" => Frequency::Hourly,
                "daily" => Frequency::Daily,
                "weekly" => Frequency::Weekly,
                "monthly" => Frequency::Monthly,
                "once" => Frequency::Once,
                other => {
                    return Err(StewardError::Validation {
                        message: format!("unknown frequency: {other}"),
                    })
                }
            };
            let job = ScheduledJob::new_now(
                name,
                JobSchedule::Frequency(frequency),
                JobAction::Shell(ShellAction { program, args: arg, timeout_secs: Some(300) }),
            );
            let mut jobs_file = job_store.load_jobs().map_err(StewardError::from)?;
            jobs_file.jobs.push(job.clone());
            job_store.save_jobs(&jobs_file).map_err(StewardError::from)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsAction::Run { job_id } => {
            supervisor.scheduler().run_now(job_id).await?;
            println!("{}", serde_json::json!({"job_id": job_id, "ran": true}));
        }
        JobsAction::Enable { job_id } => {
            supervisor.scheduler().set_enabled(job_id, true)?;
            println!("{}", serde_json::json!({"job_id": job_id, "enabled": true}));
        }
        JobsAction::Disable { job_id } => {
            supervisor.scheduler().set_enabled(job_id, false)?;
            println!("{}", serde_json::json!({"job_id": job_id, "enabled": false}));
        }
    }
    Ok(())
}

async fn handle_approvals(store: &Arc<Store>, supervisor: &Arc<Supervisor>, action: ApprovalsAction) -> Result<()> {
    match action {
        ApprovalsAction::List => {
            let pending = store.list_approvals_by_status(ApprovalStatus::Pending);
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        ApprovalsAction::Resolve { approval_id, approve, deny } => {
            if !approve && !deny {
                return Err(StewardError::Validation { message: "specify --approve or --deny".into() });
            }
            let approval = supervisor.resolve_approval(approval_id, approve, "cli").await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
    }
    Ok(())
}
