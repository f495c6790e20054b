//! Domain event log.
//!
//! The engine never talks to the notification dispatcher directly; it
//! appends events to `domain_events` and external consumers pick them up.
//! Logging is fire-and-forget: callers log a warning on failure and move
//! on, a lost notification must never roll back an accounting mutation.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventType {
    SubscriptionExpired,
    SubscriptionReinstated,
    TenantAttached,
    TenantDetached,
    FeesGenerated,
    FeePaid,
}

impl DomainEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionExpired => "subscription_expired",
            Self::SubscriptionReinstated => "subscription_reinstated",
            Self::TenantAttached => "tenant_attached",
            Self::TenantDetached => "tenant_detached",
            Self::FeesGenerated => "fees_generated",
            Self::FeePaid => "fee_paid",
        }
    }
}

impl std::fmt::Display for DomainEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who triggered the mutation behind an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Admin,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

/// Builder for a domain event row.
#[derive(Debug, Clone)]
pub struct DomainEventBuilder {
    event_type: DomainEventType,
    subscription_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
    unit_id: Option<Uuid>,
    payload: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl DomainEventBuilder {
    pub fn new(event_type: DomainEventType) -> Self {
        Self {
            event_type,
            subscription_id: None,
            tenant_id: None,
            unit_id: None,
            payload: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn subscription(mut self, id: Uuid) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn tenant(mut self, id: Uuid) -> Self {
        self.tenant_id = Some(id);
        self
    }

    pub fn unit(mut self, id: Uuid) -> Self {
        self.unit_id = Some(id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }
}

/// Appends domain events; never reads them back.
#[derive(Clone)]
pub struct DomainEventLogger {
    pool: PgPool,
}

impl DomainEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, event: DomainEventBuilder) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_events
                (event_type, subscription_id, tenant_id, unit_id, payload, actor_id, actor_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(event.subscription_id)
        .bind(event.tenant_id)
        .bind(event.unit_id)
        .bind(&event.payload)
        .bind(event.actor_id)
        .bind(event.actor_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_use_snake_case_wire_names() {
        assert_eq!(
            DomainEventType::SubscriptionExpired.as_str(),
            "subscription_expired"
        );
        assert_eq!(DomainEventType::FeePaid.as_str(), "fee_paid");
        assert_eq!(DomainEventType::TenantDetached.to_string(), "tenant_detached");
    }

    #[test]
    fn builder_defaults_to_system_actor() {
        let event = DomainEventBuilder::new(DomainEventType::FeePaid);
        assert_eq!(event.actor_type.as_str(), "system");
        assert!(event.actor_id.is_none());
    }
}
