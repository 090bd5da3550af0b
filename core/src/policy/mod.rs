//! Policy / Approval Gate (C5, spec.md §4.5).

pub mod gate;

pub use gate::{Decision, Intent, PolicyGate, CRITICAL_SAFETY_TAG, PROHIBITED_TAGS, RESTRICTED_SIDE_EFFECTS};

use crate::bus::{EventBus, Priority as BusPriority};
use crate::error::{Result, StewardError};
use crate::store::entities::{Approval, ApprovalStatus, Severity};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

/// Pending approvals expire after this long unresolved (spec.md §4.5).
pub const APPROVAL_TTL: chrono::Duration = chrono::Duration::hours(24);

/// Runtime home of the gate: evaluates intents against the Store's current
/// [`crate::store::entities::PolicySnapshot`] and persists/resolves
/// approvals through the Store (C1), replacing the teacher's single
/// in-memory `oneshot` slot with one row per pending approval so multiple
/// intents can be in flight at once.
pub struct PolicyRuntime {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    /// Set by the Supervisor while handling an incident (spec.md §4.8):
    /// forces every intent that would otherwise auto-approve to instead
    /// require confirmation until cleared.
    frozen: AtomicBool,
}

impl PolicyRuntime {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            frozen: AtomicBool::new(false),
        }
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Evaluates `intent` and, for `require_confirm`, creates a pending
    /// [`Approval`] row. `auto` and `deny` never create one. The ordering
    /// guarantee (an Intent never produces an effect before its Approval
    /// resolves) is upheld by the caller: it must not proceed past a
    /// `RequireConfirm` result until [`PolicyRuntime::resolve`] reports
    /// `Approved`.
    pub async fn evaluate(
        &self,
        intent: Intent,
        requester: crate::store::entities::AgentKind,
        correlation_id: Uuid,
    ) -> Result<(Decision, Option<Approval>)> {
        let snapshot = self.store.current_policy().ok_or_else(|| StewardError::InvariantViolation {
            message: "no policy snapshot installed".to_string(),
        })?;

        let mut decision = PolicyGate::evaluate(&intent, &snapshot, Utc::now());
        if self.is_frozen() && decision == Decision::Auto {
            decision = Decision::RequireConfirm;
        }

        self.store.append_event(
            "policy.intent.evaluated",
            decision.severity(),
            "policy",
            serde_json::json!({"action": intent.action, "agent": intent.agent, "decision": decision}),
            correlation_id,
        );

        let approval = if decision == Decision::RequireConfirm {
            let approval = Approval {
                id: Uuid::new_v4(),
                requester_agent: requester,
                intent_summary: format!("{} ({})", intent.action, intent.side_effects.join(",")),
                cost_estimate: intent.cost_estimate,
                reversibility: intent.reversibility,
                risk_tags: intent.risk_tags.clone(),
                status: ApprovalStatus::Pending,
                resolved_by: None,
                resolved_at: None,
                created_at: Utc::now(),
                correlation_id,
                version: 0,
            };
            self.store.insert_approval(approval.clone());
            let _ = self
                .bus
                .publish(
                    "approval.required",
                    BusPriority::High,
                    Severity::Normal,
                    serde_json::json!({"approval_id": approval.id}),
                    correlation_id,
                    None,
                    Duration::from_secs(5),
                )
                .await;
            Some(approval)
        } else {
            None
        };

        Ok((decision, approval))
    }

    /// Resolves a pending approval. `approve = false` denies it.
    pub async fn resolve(&self, id: Uuid, approve: bool, resolved_by: impl Into<String>) -> Result<Approval> {
        let mut approval = self
            .store
            .get_approval(id)
            .ok_or(StewardError::ApprovalNotFound { id: id.to_string() })?;

        if approval.status != ApprovalStatus::Pending {
            return Err(StewardError::ApprovalAlreadyResolved { id: id.to_string() });
        }
        if Utc::now() - approval.created_at > APPROVAL_TTL {
            let expected = approval.version;
            approval.status = ApprovalStatus::Expired;
            self.store.update_approval_if_version(approval, expected)?;
            return Err(StewardError::ApprovalExpired { id: id.to_string() });
        }

        let expected = approval.version;
        approval.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        approval.resolved_by = Some(resolved_by.into());
        approval.resolved_at = Some(Utc::now());
        self.store.update_approval_if_version(approval.clone(), expected)?;

        self.store.append_event(
            "approval.resolved",
            Severity::Normal,
            "policy",
            serde_json::json!({"approval_id": approval.id, "status": approval.status}),
            approval.correlation_id,
        );
        let _ = self
            .bus
            .publish(
                "approval.resolved",
                BusPriority::High,
                Severity::Normal,
                serde_json::json!({"approval_id": approval.id}),
                approval.correlation_id,
                None,
                Duration::from_secs(5),
            )
            .await;

        Ok(approval)
    }

    /// Sweeps every still-pending approval older than [`APPROVAL_TTL`] into
    /// `expired`. Intended to run alongside the scheduler tick.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for mut approval in self.store.list_approvals_by_status(ApprovalStatus::Pending) {
            if now - approval.created_at > APPROVAL_TTL {
                let expected = approval.version;
                approval.status = ApprovalStatus::Expired;
                if self.store.update_approval_if_version(approval, expected).is_ok() {
                    expired += 1;
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::EnvConfig;
    use crate::store::entities::{AgentKind, PolicyAllowlists, PolicySnapshot, PolicyThresholds, QuietHoursSpec, Reversibility};
    use std::collections::HashMap;

    fn runtime() -> PolicyRuntime {
        let mut vars = HashMap::new();
        vars.insert("DATA_ROOT".to_string(), std::env::temp_dir().join(format!("steward-policy-{}", Uuid::new_v4())).to_string_lossy().into_owned());
        let cfg = EnvConfig::from_map(&vars).unwrap();
        let store = Arc::new(Store::new(&cfg));
        store.install_policy(PolicySnapshot {
            version: 1,
            thresholds: PolicyThresholds {
                cost_auto_cap: 1.0,
                cost_confirm_cap: 25.0,
            },
            allowlists: PolicyAllowlists::default(),
            quiet_hours: QuietHoursSpec {
                start_hour: 22,
                end_hour: 7,
            },
        });
        let bus = Arc::new(EventBus::new(64));
        PolicyRuntime::new(store, bus)
    }

    #[tokio::test]
    async fn require_confirm_creates_a_pending_approval() {
        let runtime = runtime();
        let intent = Intent {
            action: "transfer".to_string(),
            agent: "finance".to_string(),
            cost_estimate: 5.0,
            reversibility: Reversibility::Reversible,
            side_effects: vec!["finance_transfer".to_string()],
            risk_tags: vec![],
        };
        let (decision, approval) = runtime
            .evaluate(intent, AgentKind::Finance, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(decision, Decision::RequireConfirm);
        let approval = approval.unwrap();
        let resolved = runtime.resolve(approval.id, true, "owner").await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn freeze_forces_confirm_on_otherwise_auto_intent() {
        let runtime = runtime();
        runtime.freeze();
        let intent = Intent {
            action: "noop".to_string(),
            agent: "janitor".to_string(),
            cost_estimate: 0.0,
            reversibility: Reversibility::Reversible,
            side_effects: vec![],
            risk_tags: vec![],
        };
        let (decision, approval) = runtime
            .evaluate(intent, AgentKind::Janitor, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(decision, Decision::RequireConfirm);
        assert!(approval.is_some());
    }

    #[tokio::test]
    async fn resolving_twice_fails() {
        let runtime = runtime();
        let intent = Intent {
            action: "transfer".to_string(),
            agent: "finance".to_string(),
            cost_estimate: 5.0,
            reversibility: Reversibility::Reversible,
            side_effects: vec!["finance_transfer".to_string()],
            risk_tags: vec![],
        };
        let (_, approval) = runtime
            .evaluate(intent, AgentKind::Finance, Uuid::new_v4())
            .await
            .unwrap();
        let approval = approval.unwrap();
        runtime.resolve(approval.id, true, "owner").await.unwrap();
        let err = runtime.resolve(approval.id, true, "owner").await.unwrap_err();
        assert!(matches!(err, StewardError::ApprovalAlreadyResolved { .. }));
    }
}
