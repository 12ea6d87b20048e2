//! AMQP 0-9-1 transport (LavinMQ / RabbitMQ) backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::transport::{BrokerSession, BrokerTransport, DeliveryStream, LinkEvents};
use crate::error::BrokerError;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Transport that talks AMQP to a real broker.
pub struct AmqpTransport {
    endpoint: SecretString,
}

impl AmqpTransport {
    pub fn new(endpoint: SecretString) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn connect(&self, events: LinkEvents) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection =
            Connection::connect(self.endpoint.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(0, "channel open failed").await {
                    debug!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(BrokerError::Channel(e.to_string()));
            }
        };

        let error_events = events.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            error_events.error(format!("connection error: {err}"));
        });

        // A channel can be closed by the broker while the connection stays up
        let channel_events = events.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "AMQP channel closed");
            channel_events.closed(format!("channel closed: {err}"));
        });

        info!(generation = events.generation(), "AMQP connection and channel open");

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
        }))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        debug!(queue = %queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("job-dispatch-{queue}"),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| d.data)
                    .map_err(|e| BrokerError::Consume {
                        queue: queue.clone(),
                        reason: e.to_string(),
                    })
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            debug!("AMQP connection already closed");
            return Ok(());
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}
