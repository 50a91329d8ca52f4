// AMQP Broker Adapter
// One AMQP connection per logical channel; publishes go through the default
// exchange with the queue name as routing key.

use crate::error::map_lapin_error;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use loanq_core::port::{
    Acker, BrokerChannel, BrokerConnector, BrokerError, Delivery, DeliveryStream,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// AMQP delivery modes
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

/// Connector for `amqp://` and `amqps://` addresses
#[derive(Debug, Default, Clone)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpBroker {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(address, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect to broker: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        // Publisher confirms: publish returns once the broker has taken the message
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, ""))?;

        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: Arc<AtomicBool>,
}

impl AmqpChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_lapin_error(e, name))?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let delivery_mode = if persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                // mandatory: an unroutable message comes back instead of vanishing
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default().with_delivery_mode(delivery_mode),
            )
            .await
            .map_err(|e| map_lapin_error(e, queue))?
            .await
            .map_err(|e| map_lapin_error(e, queue))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                Err(BrokerError::QueueNotFound(queue.to_string()))
            }
            Confirmation::Nack(None) => Err(BrokerError::Channel(format!(
                "broker refused message for queue '{}'",
                queue
            ))),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, ""))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.ensure_open()?;
        let consumer_tag = format!("loanq-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_lapin_error(e, queue))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        Ok(Box::new(AmqpDeliveryStream {
            consumer,
            queue: queue.to_string(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The broker requeues anything this channel left unacked
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            warn!(error = %e, "Error closing AMQP channel");
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| map_lapin_error(e, ""))?;
        debug!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
    queue: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let item = self.consumer.next().await?;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            item.map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                        queue: self.queue.clone(),
                    }),
                )
            })
            .map_err(|e| map_lapin_error(e, &self.queue)),
        )
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    queue: String,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, &self.queue))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| map_lapin_error(e, &self.queue))
    }
}
