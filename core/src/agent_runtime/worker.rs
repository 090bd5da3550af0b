//! Per-agent worker (spec.md §4.7): the runtime half of the kernel/runtime
//! split. Grounded on `agent/contract/kernel.rs`'s `AgencyKernel` (a pure,
//! deterministic decision step) paired with an async driver that executes
//! the decisions and feeds observations back — `steward` keeps that split
//! but narrows the kernel to a fixed `Handler` per household role instead
//! of an LLM-backed cognition loop, and drives it from the Event Bus (C2)
//! rather than a chat transport.

use crate::agent_runtime::journal::ActivityJournal;
use crate::bus::{DomainEvent, EventBus};
use crate::error::{Result, StewardError};
use crate::store::entities::{Agent, AgentKind, AgentState, Severity};
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// A consecutive-failure streak within [`FAILURE_WINDOW`] pushes the agent
/// into `error` (spec.md §4.7).
pub const FAILURE_THRESHOLD: u32 = 3;
pub const FAILURE_WINDOW: chrono::Duration = chrono::Duration::seconds(60);
/// Default per-handler execution deadline.
pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(30);
/// How often an idle agent (no events, no delegations) still heartbeats
/// (spec.md §4.7).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// One unit of work delivered to a worker: either a bus event it
/// subscribed to, or a direct delegation from the Supervisor.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Event(DomainEvent),
    Delegation { task_title: String, correlation_id: uuid::Uuid },
}

/// The pure decision step for one agent role. Implementors hold no I/O
/// handles; everything they need to act on the world is threaded through
/// [`HandlerContext`] by the worker loop, matching the teacher's
/// kernel-is-pure / runtime-executes split.
#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn handle(&self, item: WorkItem, ctx: &HandlerContext) -> Result<()>;
}

/// Everything a handler is allowed to touch, injected by the worker.
pub struct HandlerContext {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub policy: Arc<crate::policy::PolicyRuntime>,
}

/// Owns one agent's lifecycle: bus subscription, serial handler execution,
/// heartbeat, activity journal, and the `offline -> idle -> running ->
/// {idle|error}` state machine (spec.md §3, §4.7). `stopped` is a
/// Supervisor-only sink the worker never assigns itself.
pub struct AgentWorker {
    kind: AgentKind,
    handler: Arc<dyn Handler>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    policy: Arc<crate::policy::PolicyRuntime>,
    journal: ActivityJournal,
    handler_deadline: Duration,
}

impl AgentWorker {
    pub fn new(
        handler: Arc<dyn Handler>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        policy: Arc<crate::policy::PolicyRuntime>,
    ) -> Self {
        Self {
            kind: handler.kind(),
            handler,
            store,
            bus,
            policy,
            journal: ActivityJournal::default(),
            handler_deadline: DEFAULT_HANDLER_DEADLINE,
        }
    }

    pub fn journal(&self) -> &ActivityJournal {
        &self.journal
    }

    /// Transitions `offline -> idle` and begins draining the agent's bus
    /// subscription, one item at a time, until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.set_state(AgentState::Idle)?;
        self.journal.record("worker started");

        let topics = self.kind.topics().into_iter().map(String::from).collect();
        let mut subscription = self.bus.subscribe(self.kind.as_str(), topics);
        let mut recent_failures: Vec<chrono::DateTime<Utc>> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => {
                    match event {
                        Some(event) => self.process(WorkItem::Event(event), &mut recent_failures, &cancel).await,
                        None => break,
                    }
                }
            }
        }

        self.set_state(AgentState::Stopped)?;
        self.journal.record("worker stopped");
        Ok(())
    }

    /// Supervisor-driven direct delegation, bypassing the bus.
    pub async fn delegate(&self, task_title: String, correlation_id: uuid::Uuid) -> Result<()> {
        let mut recent_failures = Vec::new();
        let cancel = CancellationToken::new();
        self.process(
            WorkItem::Delegation { task_title, correlation_id },
            &mut recent_failures,
            &cancel,
        )
        .await;
        Ok(())
    }

    async fn process(
        &self,
        item: WorkItem,
        recent_failures: &mut Vec<chrono::DateTime<Utc>>,
        cancel: &CancellationToken,
    ) {
        self.set_state(AgentState::Running).ok();
        self.heartbeat().await;

        let ctx = HandlerContext {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            policy: Arc::clone(&self.policy),
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(self.handler_deadline, self.handler.handle(item, &ctx)) => {
                match res {
                    Ok(inner) => inner,
                    Err(_) => Err(StewardError::Timeout {
                        what: format!("{} handler", self.kind.as_str()),
                        duration: self.handler_deadline,
                    }),
                }
            }
            _ = cancel.cancelled() => Err(StewardError::Internal {
                message: "cancelled".to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                recent_failures.clear();
                self.journal.record("handled item");
                self.set_state(AgentState::Idle).ok();
            }
            Err(e) => {
                let now = Utc::now();
                recent_failures.retain(|t| now - *t < FAILURE_WINDOW);
                recent_failures.push(now);
                self.journal.record(format!("handler error: {e}"));
                self.store.append_event(
                    "agent.handler.failed",
                    Severity::High,
                    self.kind.as_str(),
                    serde_json::json!({"agent": self.kind, "error": e.to_string()}),
                    uuid::Uuid::new_v4(),
                );
                if recent_failures.len() as u32 >= FAILURE_THRESHOLD {
                    self.set_state(AgentState::Error).ok();
                } else {
                    self.set_state(AgentState::Idle).ok();
                }
            }
        }
    }

    /// Refreshes `last_heartbeat` and publishes `system.health` (spec.md
    /// §4.7's 5s heartbeat). Called once per handled item from [`Self::process`]
    /// and, for agents sitting idle with no events, from the periodic timer
    /// [`super::AgentRuntime::start_all`] drives per worker.
    pub async fn heartbeat(&self) {
        if let Some(mut agent) = self.store.get_agent(self.kind) {
            let expected = agent.version;
            agent.last_heartbeat = Utc::now();
            let state = agent.state;
            if self.store.update_agent_if_version(agent, expected).is_ok() {
                let _ = self
                    .bus
                    .publish(
                        "system.health",
                        crate::bus::Priority::Low,
                        Severity::Low,
                        serde_json::json!({"agent": self.kind, "state": state}),
                        uuid::Uuid::new_v4(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await;
            }
        }
    }

    /// Periodic heartbeat for agents with no incoming events: ticks every
    /// [`HEARTBEAT_INTERVAL`] until `cancel` fires. Run alongside
    /// [`Self::run`] by [`super::AgentRuntime::start_all`].
    pub async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => self.heartbeat().await,
            }
        }
    }

    fn set_state(&self, state: AgentState) -> Result<()> {
        let mut agent = self.store.get_agent(self.kind).unwrap_or_else(|| Agent::new(self.kind, Utc::now()));
        let expected = agent.version;
        agent.state = state;
        agent.last_heartbeat = Utc::now();
        if state == AgentState::Error {
            agent.error_count += 1;
        }
        match self.store.update_agent_if_version(agent.clone(), expected) {
            Ok(()) => Ok(()),
            Err(StewardError::Conflict { .. }) => {
                // Lost a race with a concurrent writer (e.g. Supervisor
                // disabling the agent mid-transition); re-read and retry
                // once against the fresh version.
                if let Some(mut fresh) = self.store.get_agent(self.kind) {
                    let expected = fresh.version;
                    fresh.state = state;
                    fresh.last_heartbeat = Utc::now();
                    self.store.update_agent_if_version(fresh, expected)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }
}
