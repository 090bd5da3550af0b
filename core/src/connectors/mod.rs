//! Connector Registry (C3, spec.md §4.3)
//!
//! Grounded on `agent/contract/transport.rs`'s trait-object pattern (async
//! trait, `Send + Sync`, multiple named implementations behind one
//! interface) and the teacher's concrete tool adapters
//! (`agent/tools/web_search.rs`, `agent/tools/git.rs`) as the shape of a
//! capability call. Real network clients are out-of-scope external
//! collaborators (spec.md §1); this module ships the lifecycle/registry
//! plumbing plus stub in-process adapters sufficient to exercise it.

use crate::bus::{EventBus, Priority as BusPriority};
use crate::error::Result;
use crate::store::entities::Severity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Capability contract every connector satisfies (spec.md §4.3).
/// Connectors never call into agents directly; they publish on the bus or
/// answer synchronous capability calls issued by an agent handler.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    async fn health(&self) -> Health;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: Uuid,
}

/// mail-skill's capability contract (spec.md §4.3).
#[async_trait]
pub trait MailCapability: Connector {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<Message>>;
    async fn send(&self, draft: Draft) -> Result<Ack>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub ticker: String,
    pub value: f64,
    pub as_of: DateTime<Utc>,
}

/// price-feed's capability contract (spec.md §4.3).
#[async_trait]
pub trait PriceFeedCapability: Connector {
    async fn quote(&self, ticker: &str) -> Result<Price>;
}

/// Stub mail connector: an in-memory inbox, enough to exercise the
/// registry/gate/bus end to end without a real mail protocol client.
pub struct StubMailConnector {
    health: parking_lot::RwLock<Health>,
    inbox: parking_lot::RwLock<Vec<Message>>,
}

impl StubMailConnector {
    pub fn new() -> Self {
        Self {
            health: parking_lot::RwLock::new(Health::Healthy),
            inbox: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Test/ops hook: deposits a message as if it had arrived externally.
    pub fn deliver(&self, message: Message) {
        self.inbox.write().push(message);
    }
}

impl Default for StubMailConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for StubMailConnector {
    fn name(&self) -> &str {
        "mail-skill"
    }

    async fn health(&self) -> Health {
        *self.health.read()
    }

    async fn start(&self) -> Result<()> {
        *self.health.write() = Health::Healthy;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.health.write() = Health::Unhealthy;
        Ok(())
    }
}

#[async_trait]
impl MailCapability for StubMailConnector {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        Ok(self
            .inbox
            .read()
            .iter()
            .filter(|m| m.received_at >= since)
            .cloned()
            .collect())
    }

    async fn send(&self, draft: Draft) -> Result<Ack> {
        let message = Message {
            id: Uuid::new_v4(),
            from: "household@steward.local".to_string(),
            subject: draft.subject,
            body: draft.body,
            received_at: Utc::now(),
        };
        let ack = Ack { message_id: message.id };
        Ok(ack)
    }
}

/// Stub price-feed connector returning a fixed quote table, standing in for
/// a real market-data client.
pub struct StubPriceFeedConnector {
    health: parking_lot::RwLock<Health>,
    quotes: parking_lot::RwLock<HashMap<String, f64>>,
}

impl StubPriceFeedConnector {
    pub fn new() -> Self {
        Self {
            health: parking_lot::RwLock::new(Health::Healthy),
            quotes: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn set_quote(&self, ticker: &str, value: f64) {
        self.quotes.write().insert(ticker.to_string(), value);
    }
}

impl Default for StubPriceFeedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for StubPriceFeedConnector {
    fn name(&self) -> &str {
        "price-feed"
    }

    async fn health(&self) -> Health {
        *self.health.read()
    }

    async fn start(&self) -> Result<()> {
        *self.health.write() = Health::Healthy;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.health.write() = Health::Unhealthy;
        Ok(())
    }
}

#[async_trait]
impl PriceFeedCapability for StubPriceFeedConnector {
    async fn quote(&self, ticker: &str) -> Result<Price> {
        let value = self.quotes.read().get(ticker).copied().unwrap_or(0.0);
        Ok(Price {
            ticker: ticker.to_string(),
            value,
            as_of: Utc::now(),
        })
    }
}

/// Registry owning every connector's lifecycle (spec.md §4.3). The
/// Supervisor starts/stops connectors as a dependency-ordered phase of
/// system startup/shutdown (spec.md §4.8).
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    bus: Arc<EventBus>,
}

impl ConnectorRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            connectors: HashMap::new(),
            bus,
        }
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(name).cloned()
    }

    pub async fn start_all(&self) -> Result<()> {
        for connector in self.connectors.values() {
            connector.start().await?;
            self.publish_health(connector.name(), connector.health().await).await;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        for connector in self.connectors.values() {
            connector.stop().await?;
            self.publish_health(connector.name(), connector.health().await).await;
        }
        Ok(())
    }

    /// Health transitions are themselves events (spec.md §4.3).
    async fn publish_health(&self, name: &str, health: Health) {
        let _ = self
            .bus
            .publish(
                "connector.health",
                BusPriority::Normal,
                Severity::Low,
                serde_json::json!({"connector": name, "health": health}),
                Uuid::new_v4(),
                None,
                Duration::from_millis(100),
            )
            .await;
    }

    pub async fn poll_health(&self) -> HashMap<String, Health> {
        let mut out = HashMap::new();
        for (name, connector) in &self.connectors {
            out.insert(name.clone(), connector.health().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mail_connector_fetch_filters_by_since() {
        let mail = StubMailConnector::new();
        let old = Utc::now() - chrono::Duration::days(2);
        let recent = Utc::now();
        mail.deliver(Message {
            id: Uuid::new_v4(),
            from: "a@b.com".to_string(),
            subject: "old".to_string(),
            body: String::new(),
            received_at: old,
        });
        mail.deliver(Message {
            id: Uuid::new_v4(),
            from: "a@b.com".to_string(),
            subject: "new".to_string(),
            body: String::new(),
            received_at: recent,
        });
        let since = Utc::now() - chrono::Duration::hours(1);
        let messages = mail.fetch(since).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "new");
    }

    #[tokio::test]
    async fn registry_starts_and_reports_health() {
        let bus = Arc::new(EventBus::new(64));
        let mut registry = ConnectorRegistry::new(bus);
        registry.register(Arc::new(StubMailConnector::new()));
        registry.start_all().await.unwrap();
        let health = registry.poll_health().await;
        assert_eq!(health.get("mail-skill"), Some(&Health::Healthy));
    }
}
