//! Audit / Cost Telemetry (C9, spec.md §4.9).
//!
//! Grounded on `memory/journal.rs` (append-only, timestamped entries) and
//! `memory/scribe.rs` (observe/recall split over a journal + durable
//! store). `steward` keeps the "append raw, derive views on demand" split:
//! [`append`] writes through to the Store's audit stream (C1);
//! [`aggregate`] is a set of pure functions over an `&[AuditRecord]` slice
//! that can be rebuilt from scratch at any time.

pub mod aggregate;

use crate::store::entities::{AgentKind, AuditRecord};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// One step of a causal chain reconstructed by [`AuditLog::trace`]: either a
/// bus/Store event or an audit record, unified so the whole chain can be
/// sorted by timestamp regardless of source.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceStep {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub source: String,
    pub payload: serde_json::Value,
}

pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Appends one record per Intent decision, effect, or handler
    /// completion (spec.md §4.9). `cost_actual` is typically unknown at
    /// this point and backfilled later via [`Self::backfill_cost`].
    pub fn append(
        &self,
        actor_agent: AgentKind,
        action: impl Into<String>,
        inputs_hash: impl Into<String>,
        outputs_hash: Option<String>,
        cost_estimate: Option<f64>,
        correlation_id: Uuid,
    ) -> AuditRecord {
        self.store
            .append_audit(actor_agent, action, inputs_hash, outputs_hash, cost_estimate, correlation_id)
    }

    /// Backfills the realized cost of a previously appended record on
    /// `cost.actual` (spec.md §4.9).
    pub fn backfill_cost(&self, action_id: u64, cost_actual: f64) -> crate::error::Result<()> {
        self.store.backfill_audit_cost(action_id, cost_actual)
    }

    pub fn tail(&self, n: usize) -> Vec<AuditRecord> {
        self.store.audit_tail(n)
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.store.audit_records()
    }

    /// Reconstructs the full causal chain for `correlation_id` (spec.md
    /// §4.9, §143, §216): every Event and every Audit Record sharing the id,
    /// merged and ordered by timestamp so the result reads `directive →
    /// intent → approval? → effect → completion` end to end.
    pub fn trace(&self, correlation_id: Uuid) -> Vec<TraceStep> {
        let mut steps: Vec<TraceStep> = self
            .store
            .events_by_correlation(correlation_id)
            .into_iter()
            .map(|e| TraceStep {
                timestamp: e.timestamp,
                kind: e.kind,
                source: e.source,
                payload: e.payload,
            })
            .chain(
                self.store
                    .audit_by_correlation(correlation_id)
                    .into_iter()
                    .map(|r| TraceStep {
                        timestamp: r.timestamp,
                        kind: r.action,
                        source: r.actor_agent.as_str().to_string(),
                        payload: serde_json::json!({
                            "inputs_hash": r.inputs_hash,
                            "outputs_hash": r.outputs_hash,
                            "cost_estimate": r.cost_estimate,
                            "cost_actual": r.cost_actual,
                        }),
                    }),
            )
            .collect();
        steps.sort_by_key(|s| s.timestamp);
        steps
    }
}
