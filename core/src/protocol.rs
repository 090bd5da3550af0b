//! WebSocket wire protocol for the steward facade (spec.md §4.8 "external
//! surface"). Keeps the teacher's `MessageEnvelope<T>` + tagged-enum
//! idiom: every frame is a versioned envelope around a `ClientMessage` or
//! `ServerMessage`, addressed by `request_id`/`event_id` rather than an
//! implicit ordering.

use crate::audit::TraceStep;
use crate::store::entities::{AgentKind, AgentState, ApprovalStatus, AuditRecord};
use crate::supervisor::Incident;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageEnvelope<T> {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub request_id: Option<Uuid>,
    pub event_id: Option<u64>,
    pub payload: T,
}

impl<T> MessageEnvelope<T> {
    pub fn request(msg_type: impl Into<String>, request_id: Uuid, payload: T) -> Self {
        Self { v: 1, msg_type: msg_type.into(), request_id: Some(request_id), event_id: None, payload }
    }

    pub fn event(msg_type: impl Into<String>, event_id: u64, payload: T) -> Self {
        Self { v: 1, msg_type: msg_type.into(), request_id: None, event_id: Some(event_id), payload }
    }
}

/// Requests a connected client can send. Mirrors the household vocabulary
/// in spec.md §6 (`status`, `startup`, `shutdown`, `jobs`, `approvals`,
/// `audit`) rather than a chat/session vocabulary.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { client: ClientInfo },
    Status { mode: StatusModeWire },
    Startup,
    Shutdown,
    Delegate { agent: AgentKind, task_title: String },
    JobsList,
    JobRun { job_id: Uuid },
    JobEnable { job_id: Uuid },
    JobDisable { job_id: Uuid },
    ApprovalsList,
    ApprovalResolve { approval_id: Uuid, approve: bool },
    AuditTail { n: usize },
    AuditTrace { correlation_id: Uuid },
    OpenIncident { reason: String },
    CloseIncident,
    /// Subscribes this connection to live bus events on the given topics.
    Monitor { topics: Vec<String> },
    Ping,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusModeWire {
    Quick,
    Full,
    AuditTrace,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Frames a connected client receives, either as a direct reply
/// (`request_id` set) or a pushed live event (`event_id` set).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HelloAck { server: ServerInfo },
    StatusReport {
        running: bool,
        agents: Vec<(AgentKind, AgentState)>,
        pending_approvals: Option<usize>,
        incidents: Option<Vec<Incident>>,
        audit_tail: Option<Vec<AuditRecord>>,
    },
    Started { already_running: bool },
    Stopped { already_stopped: bool },
    Delegated { correlation_id: Uuid },
    Jobs { jobs: Vec<serde_json::Value> },
    JobUpdated { job_id: Uuid },
    Approvals { approvals: Vec<ApprovalSummary> },
    ApprovalResolved { approval_id: Uuid, status: ApprovalStatus },
    AuditTail { records: Vec<AuditRecord> },
    AuditTrace { steps: Vec<TraceStep> },
    IncidentOpened,
    IncidentClosed,
    /// A live bus event forwarded to a connection subscribed via `Monitor`.
    LiveEvent { topic: String, severity: String, payload: serde_json::Value, correlation_id: Uuid },
    Error { code: String, message: String },
    Pong,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApprovalSummary {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub requested_by: AgentKind,
    pub intent_summary: String,
    pub cost_estimate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}
