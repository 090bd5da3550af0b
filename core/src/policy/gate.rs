//! Policy evaluation (spec.md §4.5).
//!
//! Grounded on `agent/runtime/approval.rs`'s "intent declares, runtime
//! suspends until resolved" shape. This is the policy-level `Intent` — a
//! side-effect request the gate scores against the current
//! [`PolicySnapshot`] — distinct from `agent::types::intents::Intent`,
//! which is the kernel's internal cognition vocabulary (tool calls, LLM
//! requests) and is left untouched.

use crate::store::entities::{PolicySnapshot, Reversibility, Severity};
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side-effect tags that always require confirmation regardless of cost
/// (spec.md §4.5), unless overridden by `critical_safety`.
pub const RESTRICTED_SIDE_EFFECTS: &[&str] = &[
    "credentials",
    "external_message_new_contact",
    "finance_transfer",
    "permission_change",
];

/// Risk tags that are never auto-approved or confirm-approved: evaluating
/// one always denies the intent outright.
pub const PROHIBITED_TAGS: &[&str] = &["secret_exfiltration", "bypass_approval"];

/// A risk tag that overrides the quiet-hours confirmation requirement: a
/// critical-safety intent (e.g. "shut off the gas") is auto-approved even
/// at 3am rather than waiting on a human who may be asleep.
pub const CRITICAL_SAFETY_TAG: &str = "critical_safety";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub agent: String,
    pub cost_estimate: f64,
    pub reversibility: Reversibility,
    pub side_effects: Vec<String>,
    pub risk_tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Auto,
    RequireConfirm,
    Deny,
}

impl Decision {
    pub fn severity(&self) -> Severity {
        match self {
            Decision::Auto => Severity::Low,
            Decision::RequireConfirm => Severity::Normal,
            Decision::Deny => Severity::High,
        }
    }
}

pub struct PolicyGate;

impl PolicyGate {
    /// Evaluates an intent against a snapshot into `auto | require_confirm
    /// | deny` (spec.md §4.5). Pure function: no I/O, no Store access, so
    /// it can be unit-tested and reused by both the runtime path and
    /// `steward policy dry-run` tooling.
    pub fn evaluate(intent: &Intent, snapshot: &PolicySnapshot, now: chrono::DateTime<Utc>) -> Decision {
        if intent
            .risk_tags
            .iter()
            .any(|t| PROHIBITED_TAGS.contains(&t.as_str()))
        {
            return Decision::Deny;
        }

        let is_critical_safety = intent
            .risk_tags
            .iter()
            .any(|t| t == CRITICAL_SAFETY_TAG);
        if is_critical_safety {
            return Decision::Auto;
        }

        let has_restricted_effect = intent
            .side_effects
            .iter()
            .any(|e| RESTRICTED_SIDE_EFFECTS.contains(&e.as_str()));
        if has_restricted_effect {
            return Decision::RequireConfirm;
        }

        if intent.reversibility == Reversibility::Irreversible {
            return Decision::RequireConfirm;
        }

        let hour = now.hour();
        let in_quiet_hours = quiet_hours_contains(snapshot, hour);

        if intent.cost_estimate > snapshot.thresholds.cost_confirm_cap {
            return Decision::Deny;
        }
        if intent.cost_estimate > snapshot.thresholds.cost_auto_cap {
            return Decision::RequireConfirm;
        }
        if in_quiet_hours {
            return Decision::RequireConfirm;
        }

        Decision::Auto
    }
}

fn quiet_hours_contains(snapshot: &PolicySnapshot, hour: u32) -> bool {
    let start = snapshot.quiet_hours.start_hour;
    let end = snapshot.quiet_hours.end_hour;
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Stable correlation handle for a submitted intent, used to join the
/// eventual `Approval` record back to its originating request.
pub fn new_correlation_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{PolicyAllowlists, PolicyThresholds, QuietHoursSpec};

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot {
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
        }
    }

    fn base_intent() -> Intent {
        Intent {
            action: "pay_invoice".to_string(),
            agent: "finance".to_string(),
            cost_estimate: 0.5,
            reversibility: Reversibility::Reversible,
            side_effects: vec![],
            risk_tags: vec![],
        }
    }

    fn noon() -> chrono::DateTime<Utc> {
        Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    fn three_am() -> chrono::DateTime<Utc> {
        Utc::now().date_naive().and_hms_opt(3, 0, 0).unwrap().and_utc()
    }

    #[test]
    fn cheap_reversible_daytime_intent_is_auto_approved() {
        let decision = PolicyGate::evaluate(&base_intent(), &snapshot(), noon());
        assert_eq!(decision, Decision::Auto);
    }

    #[test]
    fn prohibited_tag_always_denies() {
        let mut intent = base_intent();
        intent.risk_tags.push("secret_exfiltration".to_string());
        intent.cost_estimate = 0.0;
        let decision = PolicyGate::evaluate(&intent, &snapshot(), noon());
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn critical_safety_overrides_quiet_hours() {
        let mut intent = base_intent();
        intent.risk_tags.push(CRITICAL_SAFETY_TAG.to_string());
        intent.cost_estimate = 1000.0;
        let decision = PolicyGate::evaluate(&intent, &snapshot(), three_am());
        assert_eq!(decision, Decision::Auto);
    }

    #[test]
    fn restricted_side_effect_requires_confirm_even_when_cheap() {
        let mut intent = base_intent();
        intent.side_effects.push("finance_transfer".to_string());
        let decision = PolicyGate::evaluate(&intent, &snapshot(), noon());
        assert_eq!(decision, Decision::RequireConfirm);
    }

    #[test]
    fn quiet_hours_requires_confirm_for_otherwise_auto_intent() {
        let decision = PolicyGate::evaluate(&base_intent(), &snapshot(), three_am());
        assert_eq!(decision, Decision::RequireConfirm);
    }

    #[test]
    fn cost_above_confirm_cap_denies() {
        let mut intent = base_intent();
        intent.cost_estimate = 100.0;
        let decision = PolicyGate::evaluate(&intent, &snapshot(), noon());
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn irreversible_requires_confirm() {
        let mut intent = base_intent();
        intent.reversibility = Reversibility::Irreversible;
        let decision = PolicyGate::evaluate(&intent, &snapshot(), noon());
        assert_eq!(decision, Decision::RequireConfirm);
    }
}
