//! WebSocket control-plane facade (spec.md §6 / SPEC_FULL.md §2.5). Grounded
//! on the teacher's `server/mod.rs`: an accept loop spawning one task per
//! connection, a channel carrying outbound frames to a dedicated send task,
//! and a receive loop parsing `MessageEnvelope<ClientMessage>` off the wire.
//! Unlike the teacher, this facade holds no session/agent state of its own
//! - every request is translated straight into a Supervisor/Store call; the
//! handler is a thin adapter, never business logic.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use steward_core::bus::EventBus;
use steward_core::config::EnvConfig;
use steward_core::protocol::{
    ApprovalSummary, ClientMessage, MessageEnvelope, ServerInfo, ServerMessage, StatusModeWire,
};
use steward_core::store::entities::ApprovalStatus;
use steward_core::supervisor::{StatusMode, Supervisor};
use steward_core::{Result, StewardError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub async fn run(cfg: EnvConfig, supervisor: Arc<Supervisor>) -> Result<()> {
    let addr = format!("{}:{}", cfg.bind_host, cfg.api_port);
    let listener = TcpListener::bind(&addr).await.map_err(StewardError::Io)?;
    log::info!("steward facade listening on ws://{addr}");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if let Ok(ws_stream) = accept_async(stream).await {
                handle_connection(ws_stream, supervisor).await;
            }
        });
    }
}

async fn handle_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    supervisor: Arc<Supervisor>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope<ServerMessage>>();
    let event_id = Arc::new(AtomicU64::new(0));

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&envelope) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut monitor_topics: Vec<String> = Vec::new();
    let mut monitor_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else { continue };
        let envelope: MessageEnvelope<ClientMessage> = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("dropping unparseable client frame: {e}");
                continue;
            }
        };

        if let ClientMessage::Monitor { topics } = &envelope.payload {
            monitor_topics = topics.clone();
            if let Some(handle) = monitor_task.take() {
                handle.abort();
            }
            monitor_task = Some(spawn_monitor(Arc::clone(supervisor.bus()), monitor_topics.clone(), tx.clone()));
            continue;
        }

        let reply = handle_client_message(envelope.payload, &supervisor).await;
        let seq = event_id.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(match envelope.request_id {
            Some(id) => MessageEnvelope::request("reply", id, reply),
            None => MessageEnvelope::event("reply", seq, reply),
        });
    }

    if let Some(handle) = monitor_task {
        handle.abort();
    }
    send_task.abort();
}

/// Bridges live bus events to a `Monitor`-subscribed connection. The Event
/// Bus (C2) has no notion of WebSocket connections; this task is the only
/// place that translates one into the other. An empty `topics` list
/// subscribes to every topic, matching [`EventBus::subscribe`]'s wildcard.
fn spawn_monitor(
    bus: Arc<EventBus>,
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<MessageEnvelope<ServerMessage>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let name = format!("monitor-{}", uuid::Uuid::new_v4());
        let mut subscription = bus.subscribe(name, topics);
        let mut seq = 0u64;
        loop {
            match subscription.recv().await {
                Some(event) => {
                    seq += 1;
                    let msg = ServerMessage::LiveEvent {
                        topic: event.topic.clone(),
                        severity: format!("{:?}", event.severity),
                        payload: event.payload.clone(),
                        correlation_id: event.correlation_id,
                    };
                    if tx.send(MessageEnvelope::event("live_event", seq, msg)).is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    })
}

async fn handle_client_message(msg: ClientMessage, supervisor: &Arc<Supervisor>) -> ServerMessage {
    match msg {
        ClientMessage::Hello { client } => {
            log::debug!("hello from {} {}", client.name, client.version);
            ServerMessage::HelloAck {
                server: ServerInfo { name: "steward".to_string(), version: env!("CARGO_PKG_VERSION").to_string() },
            }
        }
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::Status { mode } => {
            let report = supervisor.status(from_wire_mode(mode)).await;
            ServerMessage::StatusReport {
                running: report.running,
                agents: report.agents,
                pending_approvals: report.pending_approvals,
                incidents: report.incidents,
                audit_tail: report.audit_tail,
            }
        }
        ClientMessage::Startup => match supervisor.startup().await {
            Ok(started) => ServerMessage::Started { already_running: !started },
            Err(e) => error_message(&e),
        },
        ClientMessage::Shutdown => match supervisor.shutdown().await {
            Ok(stopped) => ServerMessage::Stopped { already_stopped: !stopped },
            Err(e) => error_message(&e),
        },
        ClientMessage::Delegate { agent, task_title } => match supervisor.delegate(agent, task_title).await {
            Ok(correlation_id) => ServerMessage::Delegated { correlation_id },
            Err(e) => error_message(&e),
        },
        ClientMessage::JobsList => match supervisor.scheduler().job_store().load_jobs() {
            Ok(jobs_file) => {
                let jobs = jobs_file.jobs.iter().filter_map(|j| serde_json::to_value(j).ok()).collect();
                ServerMessage::Jobs { jobs }
            }
            Err(e) => error_message(&StewardError::from(e)),
        },
        ClientMessage::JobRun { job_id } => match supervisor.scheduler().run_now(job_id).await {
            Ok(()) => ServerMessage::JobUpdated { job_id },
            Err(e) => error_message(&e),
        },
        ClientMessage::JobEnable { job_id } => match supervisor.scheduler().set_enabled(job_id, true) {
            Ok(()) => ServerMessage::JobUpdated { job_id },
            Err(e) => error_message(&e),
        },
        ClientMessage::JobDisable { job_id } => match supervisor.scheduler().set_enabled(job_id, false) {
            Ok(()) => ServerMessage::JobUpdated { job_id },
            Err(e) => error_message(&e),
        },
        ClientMessage::ApprovalsList => {
            let approvals = supervisor
                .store()
                .list_approvals_by_status(ApprovalStatus::Pending)
                .into_iter()
                .map(|a| ApprovalSummary {
                    id: a.id,
                    status: a.status,
                    requested_by: a.requester_agent,
                    intent_summary: a.intent_summary,
                    cost_estimate: a.cost_estimate,
                })
                .collect();
            ServerMessage::Approvals { approvals }
        }
        ClientMessage::ApprovalResolve { approval_id, approve } => {
            match supervisor.resolve_approval(approval_id, approve, "facade").await {
                Ok(approval) => ServerMessage::ApprovalResolved { approval_id, status: approval.status },
                Err(e) => error_message(&e),
            }
        }
        ClientMessage::AuditTail { n } => {
            let records = steward_core::audit::AuditLog::new(supervisor.store().clone()).tail(n);
            ServerMessage::AuditTail { records }
        }
        ClientMessage::AuditTrace { correlation_id } => {
            ServerMessage::AuditTrace { steps: supervisor.audit_trace(correlation_id) }
        }
        ClientMessage::OpenIncident { reason } => match supervisor.open_incident(reason).await {
            Ok(()) => ServerMessage::IncidentOpened,
            Err(e) => error_message(&e),
        },
        ClientMessage::CloseIncident => {
            supervisor.close_incident();
            ServerMessage::IncidentClosed
        }
        ClientMessage::Monitor { .. } => unreachable!("handled by the caller before dispatch"),
    }
}

fn from_wire_mode(mode: StatusModeWire) -> StatusMode {
    match mode {
        StatusModeWire::Quick => StatusMode::Quick,
        StatusModeWire::Full => StatusMode::Full,
        StatusModeWire::AuditTrace => StatusMode::AuditTrace,
    }
}

fn error_message(e: &StewardError) -> ServerMessage {
    let (code, message, _) = e.structured();
    ServerMessage::Error { code: code.to_string(), message }
}
