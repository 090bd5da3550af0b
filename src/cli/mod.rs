//! CLI surface (spec.md §6): mirrors the HTTP control-plane surface with
//! commands grouped by area. Exit codes are derived from `StewardError`
//! via `steward_core::error::StewardError::exit_code`.

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "A single-household multi-agent operating system")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the Supervisor and WebSocket facade until interrupted.
    Serve,
    /// Reports agent/connector/approval state.
    Status {
        #[arg(long, value_enum, default_value = "quick")]
        mode: StatusModeArg,
    },
    /// Starts connectors, agents, and the scheduler (idempotent).
    Startup,
    /// Stops the scheduler, agents, and connectors (idempotent).
    Shutdown,
    /// Scheduled job management.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Pending/resolved approval management.
    Approvals {
        #[command(subcommand)]
        action: ApprovalsAction,
    },
    /// Audit/cost telemetry.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum StatusModeArg {
    Quick,
    Full,
    AuditTrace,
}

#[derive(Subcommand, Debug)]
pub enum JobsAction {
    List,
    Create {
        name: String,
        /// `hourly`, `daily`, `weekly`, `monthly`, or `once`.
        #[arg(long, default_value = "daily")]
        frequency: String,
        /// Shell program to run, e.g. `bash`.
        #[arg(long)]
        program: String,
        /// Arguments, space separated.
        #[arg(long, num_args = 0..)]
        arg: Vec<String>,
    },
    Run {
        job_id: Uuid,
    },
    Enable {
        job_id: Uuid,
    },
    Disable {
        job_id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
pub enum ApprovalsAction {
    List,
    Resolve {
        approval_id: Uuid,
        #[arg(long, conflicts_with = "deny")]
        approve: bool,
        #[arg(long, conflicts_with = "approve")]
        deny: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    Tail {
        #[arg(default_value_t = 20)]
        n: usize,
    },
    /// Reconstructs the causal chain `directive → intent → approval? →
    /// effect → completion` for one correlation id.
    Trace {
        correlation_id: Uuid,
    },
}
