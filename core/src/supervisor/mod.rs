//! Supervisor / Manager (C8, spec.md §4.8).
//!
//! Grounded on `agent/factory.rs` (constructs and wires the full agent
//! graph at startup) and `agent/v2/orchestrator/*` (an `EventBus`-driven
//! coordinator holding workers behind an id-keyed map rather than direct
//! references). `steward` keeps that "owns lifecycle, delegates all actual
//! work" shape: the Supervisor never performs domain work itself, only
//! starts/stops/delegates to the components it holds.

use crate::agent_runtime::AgentRuntime;
use crate::bus::{EventBus, Priority as BusPriority};
use crate::connectors::ConnectorRegistry;
use crate::error::Result;
use crate::policy::PolicyRuntime;
use crate::scheduler::SchedulerDaemon;
use crate::store::entities::{AgentKind, AgentState, Approval, Severity};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// Agent states + scheduler due count only.
    Quick,
    /// Quick plus pending approvals, connector health, and recent incidents.
    Full,
    /// Full plus the most recent audit tail.
    AuditTrace,
}

/// A recorded incident (spec.md §4.8): opened when the Supervisor freezes
/// auto-approval, either manually (`OpenIncident`) or automatically off a
/// critical bus event or an agent entering `error`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Incident {
    pub id: Uuid,
    pub reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub agents: Vec<(AgentKind, AgentState)>,
    pub pending_approvals: Option<usize>,
    pub connector_health: Option<std::collections::HashMap<String, crate::connectors::Health>>,
    pub incidents: Option<Vec<Incident>>,
    pub audit_tail: Option<Vec<crate::store::entities::AuditRecord>>,
}

pub struct Supervisor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    connectors: Arc<ConnectorRegistry>,
    agents: Arc<AgentRuntime>,
    scheduler: Arc<SchedulerDaemon>,
    policy: Arc<PolicyRuntime>,
    incidents: Arc<parking_lot::RwLock<Vec<Incident>>>,
    running: AtomicBool,
    scheduler_cancel: parking_lot::Mutex<Option<CancellationToken>>,
    incident_watch_cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        connectors: Arc<ConnectorRegistry>,
        agents: Arc<AgentRuntime>,
        scheduler: Arc<SchedulerDaemon>,
        policy: Arc<PolicyRuntime>,
    ) -> Self {
        Self {
            store,
            bus,
            connectors,
            agents,
            scheduler,
            policy,
            incidents: Arc::new(parking_lot::RwLock::new(Vec::new())),
            running: AtomicBool::new(false),
            scheduler_cancel: parking_lot::Mutex::new(None),
            incident_watch_cancel: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<SchedulerDaemon> {
        &self.scheduler
    }

    pub fn policy(&self) -> &Arc<PolicyRuntime> {
        &self.policy
    }

    /// Dependency-ordered startup: Store (already live) -> Bus (already
    /// live) -> Connectors -> Agents -> Scheduler -> incident watcher.
    /// Idempotent: a second call reports `already_running` rather than
    /// double-starting.
    pub async fn startup(&self) -> Result<bool> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        self.connectors.start_all().await?;
        self.agents.start_all().await;

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(&self.scheduler);
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            let _ = scheduler.run_loop(&cancel_clone).await;
        });
        *self.scheduler_cancel.lock() = Some(cancel);

        let watch_cancel = CancellationToken::new();
        let watch_cancel_clone = watch_cancel.clone();
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let policy = Arc::clone(&self.policy);
        let incidents = Arc::clone(&self.incidents);
        tokio::spawn(async move {
            watch_critical_events(store, bus, policy, incidents, watch_cancel_clone).await;
        });
        *self.incident_watch_cancel.lock() = Some(watch_cancel);

        self.store.append_event(
            "system.startup",
            Severity::Normal,
            "supervisor",
            serde_json::json!({}),
            Uuid::new_v4(),
        );
        Ok(true)
    }

    /// Reverse-order shutdown: incident watcher -> Scheduler -> Agents ->
    /// Connectors. Idempotent.
    pub async fn shutdown(&self) -> Result<bool> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        if let Some(cancel) = self.incident_watch_cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.scheduler_cancel.lock().take() {
            cancel.cancel();
        }
        self.agents.stop_all().await;
        self.connectors.stop_all().await?;

        self.store.append_event(
            "system.shutdown",
            Severity::Normal,
            "supervisor",
            serde_json::json!({}),
            Uuid::new_v4(),
        );
        Ok(true)
    }

    /// Delegates a task to an agent outside of the bus, stamping a fresh
    /// correlation id so the resulting events/audit trail can be joined
    /// back to this delegation.
    pub async fn delegate(&self, agent: AgentKind, task_title: impl Into<String>) -> Result<Uuid> {
        let correlation_id = Uuid::new_v4();
        if let Some(worker) = self.agents.worker(agent) {
            worker.delegate(task_title.into(), correlation_id).await?;
        }
        Ok(correlation_id)
    }

    /// Resolves a pending approval through the Policy / Approval Gate (C5),
    /// the only path that checks `Pending`/TTL and emits `approval.resolved`
    /// (spec.md §105, §213). Every entrypoint that lets an operator
    /// approve/deny must call this rather than writing the Store directly.
    pub async fn resolve_approval(
        &self,
        approval_id: Uuid,
        approve: bool,
        resolved_by: impl Into<String>,
    ) -> Result<Approval> {
        self.policy.resolve(approval_id, approve, resolved_by).await
    }

    /// `GET /audit/trace/{cid}` (spec.md §143, §216): the full causal chain
    /// for one correlation id, delegated to the Audit/Cost Telemetry (C9)
    /// log rather than the unfiltered `AuditTrace` status mode.
    pub fn audit_trace(&self, correlation_id: Uuid) -> Vec<crate::audit::TraceStep> {
        crate::audit::AuditLog::new(Arc::clone(&self.store)).trace(correlation_id)
    }

    pub async fn status(&self, mode: StatusMode) -> StatusReport {
        let agents = AgentKind::ALL
            .iter()
            .map(|k| (*k, self.store.get_agent(*k).map(|a| a.state).unwrap_or(AgentState::Offline)))
            .collect();

        let pending_approvals = matches!(mode, StatusMode::Full | StatusMode::AuditTrace).then(|| {
            self.store
                .list_approvals_by_status(crate::store::entities::ApprovalStatus::Pending)
                .len()
        });

        let connector_health = if matches!(mode, StatusMode::Full | StatusMode::AuditTrace) {
            Some(self.connectors.poll_health().await)
        } else {
            None
        };

        let incidents =
            matches!(mode, StatusMode::Full | StatusMode::AuditTrace).then(|| self.incidents.read().clone());

        let audit_tail = matches!(mode, StatusMode::AuditTrace).then(|| self.store.audit_tail(50));

        StatusReport {
            running: self.is_running(),
            agents,
            pending_approvals,
            connector_health,
            incidents,
            audit_tail,
        }
    }

    /// Incident handling (spec.md §4.8): freezes auto-approval, records the
    /// incident on the event stream, and emits `incident.opened` on the
    /// bus at `Critical` priority.
    pub async fn open_incident(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.policy.freeze();
        let correlation_id = Uuid::new_v4();
        self.incidents.write().push(Incident {
            id: Uuid::new_v4(),
            reason: reason.clone(),
            opened_at: Utc::now(),
            closed_at: None,
        });
        self.store.append_event(
            "incident.opened",
            Severity::Critical,
            "supervisor",
            serde_json::json!({"reason": reason}),
            correlation_id,
        );
        self.bus
            .publish(
                "incident.opened",
                BusPriority::Critical,
                Severity::Critical,
                serde_json::json!({"reason": reason}),
                correlation_id,
                None,
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }

    pub fn close_incident(&self) {
        self.policy.unfreeze();
        if let Some(incident) = self.incidents.write().iter_mut().rev().find(|i| i.closed_at.is_none()) {
            incident.closed_at = Some(Utc::now());
        }
    }
}

/// Background watcher started by [`Supervisor::startup`]: subscribes to
/// every bus topic and opens an incident the moment a `Critical`-severity
/// event arrives that didn't itself come from incident handling, matching
/// spec.md §4.8 ("when any subscriber reports error or a critical event
/// arrives ... the Supervisor freezes auto-approval ... records an
/// incident, and emits `incident.opened`").
async fn watch_critical_events(
    store: Arc<Store>,
    bus: Arc<EventBus>,
    policy: Arc<PolicyRuntime>,
    incidents: Arc<parking_lot::RwLock<Vec<Incident>>>,
    cancel: CancellationToken,
) {
    let mut subscription = bus.subscribe(format!("supervisor-incident-watch-{}", Uuid::new_v4()), vec![]);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = subscription.recv() => event,
        };
        let Some(event) = event else { return };
        if event.severity != Severity::Critical || event.topic == "incident.opened" {
            continue;
        }

        policy.freeze();
        let reason = format!("critical event on {}", event.topic);
        incidents.write().push(Incident {
            id: Uuid::new_v4(),
            reason: reason.clone(),
            opened_at: Utc::now(),
            closed_at: None,
        });
        store.append_event(
            "incident.opened",
            Severity::Critical,
            "supervisor",
            serde_json::json!({"reason": reason, "source_topic": event.topic}),
            event.correlation_id,
        );
        let _ = bus
            .publish(
                "incident.opened",
                BusPriority::Critical,
                Severity::Critical,
                serde_json::json!({"reason": reason}),
                event.correlation_id,
                None,
                Duration::from_secs(5),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::store::entities::{PolicyAllowlists, PolicySnapshot, PolicyThresholds, QuietHoursSpec};
    use std::collections::HashMap;

    fn build() -> Supervisor {
        let mut vars = HashMap::new();
        vars.insert(
            "DATA_ROOT".to_string(),
            std::env::temp_dir().join(format!("steward-supervisor-{}", Uuid::new_v4())).to_string_lossy().into_owned(),
        );
        let cfg = EnvConfig::from_map(&vars).unwrap();
        let store = Arc::new(Store::new(&cfg));
        store.install_policy(PolicySnapshot {
            version: 1,
            thresholds: PolicyThresholds { cost_auto_cap: 1.0, cost_confirm_cap: 25.0 },
            allowlists: PolicyAllowlists::default(),
            quiet_hours: QuietHoursSpec { start_hour: 22, end_hour: 7 },
        });
        let bus = Arc::new(EventBus::new(64));
        let connectors = Arc::new(ConnectorRegistry::new(Arc::clone(&bus)));
        let policy = Arc::new(PolicyRuntime::new(Arc::clone(&store), Arc::clone(&bus)));
        let agents = Arc::new(AgentRuntime::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&policy)));
        let job_store = crate::scheduler::JobStore::new(&cfg.data_root);
        let scheduler = Arc::new(SchedulerDaemon::new(job_store, Arc::clone(&store), Arc::clone(&bus)));
        Supervisor::new(store, bus, connectors, agents, scheduler, policy)
    }

    #[tokio::test]
    async fn startup_is_idempotent() {
        let sup = build();
        assert!(sup.startup().await.unwrap());
        assert!(!sup.startup().await.unwrap());
        sup.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_startup_is_a_noop() {
        let sup = build();
        assert!(!sup.shutdown().await.unwrap());
    }

    #[tokio::test]
    async fn incident_freezes_auto_approval_and_is_recorded() {
        let sup = build();
        sup.startup().await.unwrap();
        assert!(!sup.policy.is_frozen());
        sup.open_incident("gas leak suspected").await.unwrap();
        assert!(sup.policy.is_frozen());
        let report = sup.status(StatusMode::Full).await;
        assert_eq!(report.incidents.unwrap().len(), 1);
        sup.close_incident();
        assert!(!sup.policy.is_frozen());
        sup.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn critical_bus_event_opens_an_incident_automatically() {
        let sup = build();
        sup.startup().await.unwrap();
        sup.bus
            .publish(
                "security.alert",
                BusPriority::Critical,
                Severity::Critical,
                serde_json::json!({}),
                Uuid::new_v4(),
                None,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.policy.is_frozen());
        assert!(!sup.incidents.read().is_empty());
        sup.shutdown().await.unwrap();
    }
}
