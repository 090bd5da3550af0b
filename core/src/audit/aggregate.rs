//! Pure aggregation functions over an audit slice (spec.md §4.9). None of
//! these touch the Store; they exist so a view can be rebuilt from scratch
//! from the append-only stream at any time.

use crate::store::entities::{AgentKind, AuditRecord};
use chrono::{DateTime, Datelike, IsoWeek, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CostSummary {
    pub count: u64,
    pub cost_estimate_total: f64,
    pub cost_actual_total: f64,
}

impl CostSummary {
    fn absorb(&mut self, record: &AuditRecord) {
        self.count += 1;
        self.cost_estimate_total += record.cost_estimate.unwrap_or(0.0);
        self.cost_actual_total += record.cost_actual.unwrap_or(0.0);
    }
}

fn group_by<K: std::hash::Hash + Eq, F: Fn(&AuditRecord) -> K>(
    records: &[AuditRecord],
    key_fn: F,
) -> HashMap<K, CostSummary> {
    let mut out: HashMap<K, CostSummary> = HashMap::new();
    for record in records {
        out.entry(key_fn(record)).or_default().absorb(record);
    }
    out
}

pub fn daily(records: &[AuditRecord]) -> HashMap<String, CostSummary> {
    group_by(records, |r| r.timestamp.format("%Y-%m-%d").to_string())
}

pub fn weekly(records: &[AuditRecord]) -> HashMap<String, CostSummary> {
    group_by(records, |r| {
        let week: IsoWeek = r.timestamp.iso_week();
        format!("{}-W{:02}", week.year(), week.week())
    })
}

pub fn monthly(records: &[AuditRecord]) -> HashMap<String, CostSummary> {
    group_by(records, |r| r.timestamp.format("%Y-%m").to_string())
}

pub fn per_agent(records: &[AuditRecord]) -> HashMap<AgentKind, CostSummary> {
    group_by(records, |r| r.actor_agent)
}

pub fn per_action(records: &[AuditRecord]) -> HashMap<String, CostSummary> {
    group_by(records, |r| r.action.clone())
}

/// Records within `[start, end)`, for windowed re-aggregation.
pub fn window<'a>(records: &'a [AuditRecord], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&'a AuditRecord> {
    records
        .iter()
        .filter(|r| r.timestamp >= start && r.timestamp < end)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(agent: AgentKind, action: &str, cost_estimate: f64, at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            action_id: 0,
            actor_agent: agent,
            action: action.to_string(),
            inputs_hash: "deadbeef".to_string(),
            outputs_hash: None,
            model: None,
            tokens: None,
            cost_estimate: Some(cost_estimate),
            cost_actual: None,
            timestamp: at,
            correlation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn per_agent_sums_cost_estimate_across_records() {
        let now = Utc::now();
        let records = vec![
            record(AgentKind::Finance, "pay", 1.0, now),
            record(AgentKind::Finance, "pay", 2.0, now),
            record(AgentKind::Janitor, "tidy", 0.0, now),
        ];
        let summary = per_agent(&records);
        assert_eq!(summary[&AgentKind::Finance].count, 2);
        assert!((summary[&AgentKind::Finance].cost_estimate_total - 3.0).abs() < f64::EPSILON);
        assert_eq!(summary[&AgentKind::Janitor].count, 1);
    }

    #[test]
    fn daily_buckets_by_calendar_day() {
        let d1 = Utc::now();
        let d2 = d1 + chrono::Duration::days(1);
        let records = vec![
            record(AgentKind::Finance, "pay", 1.0, d1),
            record(AgentKind::Finance, "pay", 1.0, d2),
        ];
        let summary = daily(&records);
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn aggregation_is_rebuildable_from_the_same_slice() {
        let now = Utc::now();
        let records = vec![record(AgentKind::Security, "scan", 0.1, now)];
        let first = per_action(&records);
        let second = per_action(&records);
        assert_eq!(first[&"scan".to_string()].count, second[&"scan".to_string()].count);
    }
}
