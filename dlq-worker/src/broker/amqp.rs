//! RabbitMQ session using lapin.
//!
//! One connection, one channel. The channel is owned by whoever holds the
//! session; nothing else may ack or reject on it.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{info, warn};

use super::{BrokerSession, Delivery, DeliveryStream, DeliveryTag};
use crate::error::BrokerError;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec, DEAD_LETTER_EXCHANGE_ARG};

/// A lapin connection and the single channel opened on it.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Connect, open a channel and enable publisher confirms.
    ///
    /// Every step is checked; a failure after the connection is open closes it
    /// before returning.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        info!(url_length = url.len(), "rabbitmq_connecting");

        let connection = Connection::connect(url, ConnectionProperties::default()).await?;

        info!("rabbitmq_connected");

        let channel = match open_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(200, "Channel setup failed").await {
                    warn!(error = %close_err, "rabbitmq_connection_close_error");
                }
                return Err(e);
            }
        };

        info!("rabbitmq_channel_created");

        Ok(Self {
            connection,
            channel,
        })
    }

    /// The underlying lapin channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

async fn open_channel(connection: &Connection) -> Result<Channel, BrokerError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

/// Queue arguments carrying the dead-letter metadata, if any.
fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    args
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &spec.name,
                spec.kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions::default(),
                queue_arguments(spec),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &spec.queue,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        info!(prefetch_count = count, "rabbitmq_qos_set");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = queue, consumer_tag = consumer_tag, "rabbitmq_consumer_started");

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        if confirm.is_nack() {
            return Err(BrokerError::PublishNacked(exchange.to_string()));
        }
        Ok(())
    }

    /// Close the channel, then the connection. Both are attempted; the first
    /// error is returned.
    async fn close(&self) -> Result<(), BrokerError> {
        let channel_result = self.channel.close(200, "Normal shutdown").await;
        if let Err(e) = &channel_result {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        let connection_result = self.connection.close(200, "Normal shutdown").await;
        if let Err(e) = &connection_result {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_session_closed");

        channel_result?;
        connection_result?;
        Ok(())
    }
}
