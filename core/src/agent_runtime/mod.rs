//! Agent Runtime (C7, spec.md §4.7).

pub mod journal;
pub mod worker;

pub use journal::ActivityJournal;
pub use worker::{AgentWorker, Handler, HandlerContext, WorkItem};

use crate::bus::EventBus;
use crate::policy::PolicyRuntime;
use crate::store::entities::AgentKind;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default handler: routes every work item into the Task list for its
/// agent, the simplest faithful implementation of "an agent has pending
/// tasks" for roles that have not been given bespoke cognition. Concrete
/// deployments register a richer [`Handler`] per [`AgentKind`] in its
/// place via [`AgentRuntime::register`].
pub struct TaskIntakeHandler(pub AgentKind);

#[async_trait::async_trait]
impl Handler for TaskIntakeHandler {
    fn kind(&self) -> AgentKind {
        self.0
    }

    async fn handle(&self, item: WorkItem, ctx: &HandlerContext) -> crate::error::Result<()> {
        use crate::store::entities::{Priority, Task};

        let (title, correlation_id) = match item {
            WorkItem::Event(event) => (
                format!("{}: {}", event.topic, event.payload),
                event.correlation_id,
            ),
            WorkItem::Delegation { task_title, correlation_id } => (task_title, correlation_id),
        };

        let task = Task::new(self.0, title, Priority::Medium, "inbound", false, chrono::Utc::now());
        ctx.store.insert_task(task);
        ctx.store.append_event(
            "agent.task.created",
            crate::store::entities::Severity::Low,
            self.0.as_str(),
            serde_json::json!({"agent": self.0}),
            correlation_id,
        );
        Ok(())
    }
}

/// Owns every agent worker's lifecycle. The Supervisor (C8) drives this as
/// one phase of system startup/shutdown.
pub struct AgentRuntime {
    workers: HashMap<AgentKind, Arc<AgentWorker>>,
    tasks: parking_lot::Mutex<HashMap<AgentKind, JoinHandle<()>>>,
    cancels: parking_lot::Mutex<HashMap<AgentKind, CancellationToken>>,
    store: Arc<Store>,
}

impl AgentRuntime {
    /// Builds one worker per [`AgentKind::ALL`], each running
    /// [`TaskIntakeHandler`] unless replaced via [`Self::register`] before
    /// [`Self::start_all`].
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, policy: Arc<PolicyRuntime>) -> Self {
        let mut workers = HashMap::new();
        for kind in AgentKind::ALL {
            let handler: Arc<dyn Handler> = Arc::new(TaskIntakeHandler(kind));
            workers.insert(
                kind,
                Arc::new(AgentWorker::new(handler, Arc::clone(&store), Arc::clone(&bus), Arc::clone(&policy))),
            );
        }
        Self {
            workers,
            tasks: parking_lot::Mutex::new(HashMap::new()),
            cancels: parking_lot::Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Swaps in a bespoke handler for `kind`. Must be called before
    /// [`Self::start_all`]; has no effect on an already-running worker.
    pub fn register(&mut self, handler: Arc<dyn Handler>, store: Arc<Store>, bus: Arc<EventBus>, policy: Arc<PolicyRuntime>) {
        let kind = handler.kind();
        self.workers.insert(kind, Arc::new(AgentWorker::new(handler, store, bus, policy)));
    }

    pub fn worker(&self, kind: AgentKind) -> Option<Arc<AgentWorker>> {
        self.workers.get(&kind).cloned()
    }

    /// `offline -> idle`: spawns one task per agent, serialized internally,
    /// parallel across agents (spec.md §5), plus a periodic heartbeat task
    /// per agent so one sitting idle with no events still reports health.
    pub async fn start_all(&self) {
        for (kind, worker) in &self.workers {
            let cancel = CancellationToken::new();
            let worker = Arc::clone(worker);
            let cancel_clone = cancel.clone();
            let handle = tokio::spawn(async move {
                let _ = worker.run(cancel_clone).await;
            });

            let heartbeat_worker = Arc::clone(&self.workers[kind]);
            let heartbeat_cancel = cancel.clone();
            tokio::spawn(async move {
                heartbeat_worker.heartbeat_loop(heartbeat_cancel).await;
            });

            self.tasks.lock().insert(*kind, handle);
            self.cancels.lock().insert(*kind, cancel);
        }
    }

    /// `* -> stopped`: cancels every worker and awaits its task. Idempotent:
    /// calling on an already-stopped runtime is a no-op.
    pub async fn stop_all(&self) {
        let cancels: Vec<_> = self.cancels.lock().drain().collect();
        for (_, cancel) in &cancels {
            cancel.cancel();
        }
        let handles: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in handles {
            let _ = handle.await;
        }
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.workers.keys().copied().collect()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::store::entities::{AgentState, PolicyAllowlists, PolicySnapshot, PolicyThresholds, QuietHoursSpec};
    use std::collections::HashMap as StdHashMap;

    fn runtime() -> (Arc<Store>, AgentRuntime) {
        let mut vars = StdHashMap::new();
        vars.insert(
            "DATA_ROOT".to_string(),
            std::env::temp_dir().join(format!("steward-agents-{}", uuid::Uuid::new_v4())).to_string_lossy().into_owned(),
        );
        let cfg = EnvConfig::from_map(&vars).unwrap();
        let store = Arc::new(Store::new(&cfg));
        store.install_policy(PolicySnapshot {
            version: 1,
            thresholds: PolicyThresholds {
                cost_auto_cap: 1.0,
                cost_confirm_cap: 25.0,
            },
            allowlists: PolicyAllowlists::default(),
            quiet_hours: QuietHoursSpec { start_hour: 22, end_hour: 7 },
        });
        let bus = Arc::new(EventBus::new(64));
        let policy = Arc::new(PolicyRuntime::new(Arc::clone(&store), Arc::clone(&bus)));
        let runtime = AgentRuntime::new(Arc::clone(&store), bus, policy);
        (store, runtime)
    }

    #[tokio::test]
    async fn start_all_then_stop_all_transitions_every_agent_to_stopped() {
        let (store, runtime) = runtime();
        runtime.start_all().await;
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        runtime.stop_all().await;
        for kind in AgentKind::ALL {
            let agent = store.get_agent(kind).expect("agent row");
            assert_eq!(agent.state, AgentState::Stopped);
        }
    }

    #[tokio::test]
    async fn delegation_creates_a_task_for_the_target_agent() {
        let (store, runtime) = runtime();
        let worker = runtime.worker(AgentKind::Janitor).unwrap();
        worker
            .delegate("sweep the kitchen".to_string(), uuid::Uuid::new_v4())
            .await
            .unwrap();
        let tasks = store.list_tasks_by_owner(AgentKind::Janitor);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].title.contains("sweep the kitchen"));
    }
}
