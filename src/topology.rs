//! Exchange, queue, and binding topology derived from an application
//! identity.
//!
//! Guaranteed delivery runs through a durable queue shared by every
//! instance of an app, bound to the app's direct exchange. Best-effort
//! delivery runs through a per-instance auto-deleted queue reachable from
//! both the direct exchange (point-to-point cast) and the topic exchange
//! (fan-out cast).

use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    Channel, Connection, Consumer, ExchangeKind,
};
use tracing::info;

use crate::error::RpcError;

/// Deterministic names and routing keys for one application instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TopologyPlan {
    pub direct_exchange: String,
    pub topic_exchange: String,
    /// Shared by all instances of the app.
    pub direct_queue: String,
    /// Unique to this instance.
    pub topic_queue: String,
    pub call_keys: [String; 2],
    pub cast_keys: [String; 2],
}

impl TopologyPlan {
    /// Derive the topology for an application instance. Routing keys are
    /// lower-cased to match publish-time key construction.
    pub(crate) fn new(name: &str, instance: &str) -> Self {
        Self {
            direct_exchange: format!("{}:direct", name),
            topic_exchange: format!("{}:topic", name),
            direct_queue: format!("{}:direct", name),
            topic_queue: format!("{}:{}:topic", name, instance),
            call_keys: [
                format!("{}:call", instance).to_lowercase(),
                format!("{}:call", name).to_lowercase(),
            ],
            cast_keys: [
                format!("{}:cast", instance).to_lowercase(),
                format!("{}:cast", name).to_lowercase(),
            ],
        }
    }
}

/// Live topology on a freshly dialed connection.
pub(crate) struct Topology {
    plan: TopologyPlan,
    direct: Channel,
    topic: Channel,
}

impl Topology {
    /// Declare exchanges, queues, and bindings, then start the two
    /// consume streams.
    pub(crate) async fn establish(
        conn: &Connection,
        plan: TopologyPlan,
        prefetch: u16,
    ) -> Result<(Self, Consumer, Consumer), RpcError> {
        let direct = create_channel(conn, prefetch).await?;
        let topic = create_channel(conn, prefetch).await?;

        declare_exchange(&direct, &plan.direct_exchange, ExchangeKind::Direct).await?;
        declare_exchange(&topic, &plan.topic_exchange, ExchangeKind::Topic).await?;

        // Durable shared queue for guaranteed delivery.
        direct
            .queue_declare(
                &plan.direct_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RpcError::Topology(format!(
                    "Failed to declare queue '{}': {}",
                    plan.direct_queue, e
                ))
            })?;

        // Per-instance queue for best-effort delivery, removed with its
        // last consumer.
        topic
            .queue_declare(
                &plan.topic_queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RpcError::Topology(format!(
                    "Failed to declare queue '{}': {}",
                    plan.topic_queue, e
                ))
            })?;

        for key in &plan.call_keys {
            bind(&direct, &plan.direct_queue, &plan.direct_exchange, key).await?;
        }

        // Casts reach this instance's queue whether addressed
        // point-to-point (direct exchange) or fanned out (topic exchange).
        for key in &plan.cast_keys {
            bind(&topic, &plan.topic_queue, &plan.direct_exchange, key).await?;
            bind(&topic, &plan.topic_queue, &plan.topic_exchange, key).await?;
        }

        let direct_consumer = consume(&direct, &plan.direct_queue).await?;
        let topic_consumer = consume(&topic, &plan.topic_queue).await?;

        info!(
            direct_queue = %plan.direct_queue,
            topic_queue = %plan.topic_queue,
            "Topology established"
        );

        Ok((Self { plan, direct, topic }, direct_consumer, topic_consumer))
    }

    /// Cancel both consumers so the delivery streams close.
    pub(crate) async fn cancel(&self) -> Result<(), RpcError> {
        self.direct
            .basic_cancel(&self.plan.direct_queue, BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::Connection(format!("Consumer cancel failed: {}", e)))?;

        self.topic
            .basic_cancel(&self.plan.topic_queue, BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::Connection(format!("Consumer cancel failed: {}", e)))?;

        Ok(())
    }

    /// Remove the declared topology. Intended for ephemeral and test
    /// instances; the topic queue auto-deletes with its consumer.
    pub(crate) async fn cleanup(&self) -> Result<(), RpcError> {
        self.direct
            .exchange_delete(&self.plan.direct_exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| {
                RpcError::Topology(format!(
                    "Failed to delete exchange '{}': {}",
                    self.plan.direct_exchange, e
                ))
            })?;

        self.direct
            .queue_delete(&self.plan.direct_queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| {
                RpcError::Topology(format!(
                    "Failed to delete queue '{}': {}",
                    self.plan.direct_queue, e
                ))
            })?;

        self.topic
            .exchange_delete(&self.plan.topic_exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| {
                RpcError::Topology(format!(
                    "Failed to delete exchange '{}': {}",
                    self.plan.topic_exchange, e
                ))
            })?;

        Ok(())
    }
}

async fn create_channel(conn: &Connection, prefetch: u16) -> Result<Channel, RpcError> {
    let channel = conn
        .create_channel()
        .await
        .map_err(|e| RpcError::Connection(format!("Failed to create channel: {}", e)))?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| RpcError::Topology(format!("Failed to set QoS: {}", e)))?;

    Ok(channel)
}

async fn declare_exchange(
    channel: &Channel,
    exchange: &str,
    kind: ExchangeKind,
) -> Result<(), RpcError> {
    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| RpcError::Topology(format!("Failed to declare exchange '{}': {}", exchange, e)))
}

async fn bind(channel: &Channel, queue: &str, exchange: &str, key: &str) -> Result<(), RpcError> {
    channel
        .queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            RpcError::Topology(format!(
                "Failed to bind '{}' to '{}' with key '{}': {}",
                queue, exchange, key, e
            ))
        })
}

async fn consume(channel: &Channel, queue: &str) -> Result<Consumer, RpcError> {
    channel
        .basic_consume(
            queue,
            queue,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| RpcError::Topology(format!("Failed to consume from '{}': {}", queue, e)))
}
