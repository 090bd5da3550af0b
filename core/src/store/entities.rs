//! Entity types of the data model (spec.md §3).
//!
//! Storage layout is an implementation detail of [`super::Store`]; these are
//! plain, serde-able Rust types shared by every component that touches the
//! Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every persisted entity carries a monotonically increasing `version` used
/// by `update_if_version` for optimistic concurrency (spec.md §4.1).
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! impl_versioned {
    ($ty:ty) => {
        impl Versioned for $ty {
            fn version(&self) -> u64 {
                self.version
            }
            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Offline,
    Idle,
    Running,
    Error,
    Stopped,
}

/// The nine fixed agent kinds coordinated by the Supervisor (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Manager,
    Finance,
    Maintenance,
    Contractors,
    Projects,
    Security,
    Janitor,
    Backup,
    MailSkill,
}

impl AgentKind {
    pub const ALL: [AgentKind; 9] = [
        AgentKind::Manager,
        AgentKind::Finance,
        AgentKind::Maintenance,
        AgentKind::Contractors,
        AgentKind::Projects,
        AgentKind::Security,
        AgentKind::Janitor,
        AgentKind::Backup,
        AgentKind::MailSkill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Manager => "manager",
            AgentKind::Finance => "finance",
            AgentKind::Maintenance => "maintenance",
            AgentKind::Contractors => "contractors",
            AgentKind::Projects => "projects",
            AgentKind::Security => "security",
            AgentKind::Janitor => "janitor",
            AgentKind::Backup => "backup",
            AgentKind::MailSkill => "mail_skill",
        }
    }

    /// Bus topics this agent's worker subscribes to (spec.md §4.2, §4.7
    /// "per-agent FIFO on the inbox"): the agent's own inbox topic (its
    /// `as_str()`, for directly-addressed events) plus the cross-cutting
    /// topics relevant to its household role.
    pub fn topics(&self) -> Vec<&'static str> {
        let mut topics = vec![self.as_str()];
        match self {
            AgentKind::Manager => topics.push("incident.opened"),
            AgentKind::Finance => topics.push("budget.warning"),
            AgentKind::Maintenance => topics.push("scheduler.job.failed"),
            AgentKind::Security => {
                topics.push("security.alert");
                topics.push("incident.opened");
            }
            AgentKind::Janitor => topics.push("scheduler.tick"),
            AgentKind::Backup => topics.push("scheduler.job.failed"),
            AgentKind::MailSkill => topics.push("inbox.message"),
            AgentKind::Contractors | AgentKind::Projects => {}
        }
        topics
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentKind,
    pub state: AgentState,
    pub enabled: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u32,
    pub pending_tasks: u32,
    pub version: u64,
}

impl_versioned!(Agent);

impl Agent {
    pub fn new(id: AgentKind, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: AgentState::Offline,
            enabled: true,
            last_heartbeat: now,
            error_count: 0,
            pending_tasks: 0,
            version: 0,
        }
    }

    /// Invariant from spec.md §3: `running ⇒ last_heartbeat ≤ now −
    /// heartbeat_timeout` is false, else the agent transitions to `error`.
    pub fn heartbeat_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.state == AgentState::Running && now - self.last_heartbeat > timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_agent: AgentKind,
    pub title: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub category: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub evidence: Option<String>,
    pub evidence_required: bool,
    pub version: u64,
}

impl_versioned!(Task);

impl Task {
    pub fn new(
        owner_agent: AgentKind,
        title: impl Into<String>,
        priority: Priority,
        category: impl Into<String>,
        evidence_required: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_agent,
            title: title.into(),
            priority,
            status: TaskStatus::Pending,
            category: category.into(),
            due_at: None,
            created_at: now,
            evidence: None,
            evidence_required,
            version: 0,
        }
    }

    /// Completion requires non-null `evidence` when `evidence_required`
    /// (spec.md §3, §8 "Completion evidence").
    pub fn try_complete(&mut self, evidence: Option<String>) -> crate::error::Result<()> {
        if self.evidence_required && evidence.is_none() && self.evidence.is_none() {
            return Err(crate::error::StewardError::InvariantViolation {
                message: format!("task {} requires evidence to complete", self.id),
            });
        }
        if let Some(e) = evidence {
            self.evidence = Some(e);
        }
        self.status = TaskStatus::Completed;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reversibility {
    Reversible,
    Irreversible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub requester_agent: AgentKind,
    pub intent_summary: String,
    pub cost_estimate: f64,
    pub reversibility: Reversibility,
    pub risk_tags: Vec<String>,
    pub status: ApprovalStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub version: u64,
}

impl_versioned!(Approval);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: String,
    pub severity: Severity,
    pub source: String,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action_id: u64,
    pub actor_agent: AgentKind,
    pub action: String,
    pub inputs_hash: String,
    pub outputs_hash: Option<String>,
    pub model: Option<String>,
    pub tokens: Option<u64>,
    pub cost_estimate: Option<f64>,
    pub cost_actual: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Staged,
    Applied,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeEditBackup {
    pub id: Uuid,
    pub target_path: String,
    pub original_digest: String,
    pub new_digest: String,
    pub timestamp: DateTime<Utc>,
    pub applied_by: AgentKind,
    pub status: BackupStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyThresholds {
    pub cost_auto_cap: f64,
    pub cost_confirm_cap: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyAllowlists {
    pub egress_hosts: Vec<String>,
    pub contact_channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursSpec {
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Versioned, immutable-once-published policy bundle (spec.md §3). Never
/// mutated in place — installing a new policy replaces the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub version: u64,
    pub thresholds: PolicyThresholds,
    pub allowlists: PolicyAllowlists,
    pub quiet_hours: QuietHoursSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_completion_requires_evidence() {
        let now = Utc::now();
        let mut task = Task::new(AgentKind::Finance, "Pay bill", Priority::High, "bills", true, now);
        assert!(task.try_complete(None).is_err());
        assert!(task.try_complete(Some("receipt.pdf".to_string())).is_ok());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn task_completion_without_requirement_allows_no_evidence() {
        let now = Utc::now();
        let mut task = Task::new(AgentKind::Janitor, "Tidy up", Priority::Low, "chores", false, now);
        assert!(task.try_complete(None).is_ok());
    }

    #[test]
    fn agent_heartbeat_staleness() {
        let now = Utc::now();
        let mut agent = Agent::new(AgentKind::Manager, now - chrono::Duration::seconds(120));
        agent.state = AgentState::Running;
        assert!(agent.heartbeat_stale(now, chrono::Duration::seconds(30)));
        agent.last_heartbeat = now;
        assert!(!agent.heartbeat_stale(now, chrono::Duration::seconds(30)));
    }
}
