//! Outbound frame publishing.

use lapin::{options::BasicPublishOptions, BasicProperties, Connection};
use tracing::debug;

use crate::codec::Codec;
use crate::error::RpcError;
use crate::types::{Destination, Receiver, Sender};

/// Resolve the exchange and routing key for a frame.
///
/// A proxy hop shifts the exchange to the hop's application; the
/// destination's broadcast flag selects the topic exchange. The routing
/// key prefers the instance id over the group name, with the hop taking
/// precedence over the destination, and is suffixed `:call` or `:cast`
/// and lower-cased to match the bind-time keys.
pub(crate) fn resolve_route(
    guaranteed: bool,
    destination: &Destination,
    receiver: &Receiver,
) -> (String, String) {
    let app = if receiver.name.is_empty() {
        &destination.name
    } else {
        &receiver.name
    };
    let kind = if destination.broadcast { "topic" } else { "direct" };
    let exchange = format!("{}:{}", app, kind);

    let target = if receiver.name.is_empty() {
        if destination.instance.is_empty() {
            &destination.name
        } else {
            &destination.instance
        }
    } else if receiver.instance.is_empty() {
        &receiver.name
    } else {
        &receiver.instance
    };
    let suffix = if guaranteed { "call" } else { "cast" };
    let key = format!("{}:{}", target, suffix).to_lowercase();

    (exchange, key)
}

/// Encode and publish a frame.
///
/// Fire-and-forget: returns once the transport accepts the publish. The
/// broker's publisher confirm is not awaited; guaranteed delivery means
/// durable-queue delivery, not end-to-end confirmation.
pub(crate) async fn publish(
    conn: &Connection,
    codec: &Codec,
    guaranteed: bool,
    sender: &Sender,
    destination: &Destination,
    receiver: &Receiver,
    payload: &[u8],
) -> Result<(), RpcError> {
    let body = codec.encode(sender, destination, receiver, payload)?;
    let (exchange, key) = resolve_route(guaranteed, destination, receiver);

    let channel = conn
        .create_channel()
        .await
        .map_err(|e| RpcError::Publish(format!("Failed to create channel: {}", e)))?;

    let mut properties = BasicProperties::default().with_content_type("application/octet-stream".into());
    if guaranteed {
        properties = properties.with_delivery_mode(2); // persistent
    }

    // The returned confirm is dropped, not awaited.
    let _ = channel
        .basic_publish(
            &exchange,
            &key,
            BasicPublishOptions::default(),
            &body,
            properties,
        )
        .await
        .map_err(|e| RpcError::Publish(format!("Failed to publish: {}", e)))?;

    debug!(
        exchange = %exchange,
        routing_key = %key,
        bytes = body.len(),
        "Published frame"
    );

    Ok(())
}
