//! Exchange-protocol transport backed by `lapin`.

use async_trait::async_trait;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio_stream::StreamExt;

use brokerlink_common::CONTENT_TYPE;

use super::{
    Delivery, DeliveryStream, ExchangeChannel, ExchangeConnection, ExchangeConnector,
    TransportResult,
};

/// Reply code sent when closing channels and connections.
const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery mode marking a message persistent.
const PERSISTENT: u8 = 2;

/// Connector opening `lapin` connections.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (executor, client name, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl ExchangeConnector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self, uri: &str) -> TransportResult<Self::Connection> {
        let connection = Connection::connect(uri, self.properties.clone()).await?;
        Ok(AmqpConnection { connection })
    }
}

/// A `lapin` connection.
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl ExchangeConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> TransportResult<Self::Channel> {
        let channel = self.connection.create_channel().await?;
        Ok(AmqpChannel { channel })
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl ExchangeChannel for AmqpChannel {
    type Consumer = AmqpConsumer;

    async fn declare_exchange(&self, name: &str) -> TransportResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> TransportResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> TransportResult<()> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> TransportResult<Self::Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(AmqpConsumer { consumer })
    }

    async fn close(&self) -> TransportResult<()> {
        self.channel.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

/// Deliveries of a `lapin` consumer.
pub struct AmqpConsumer {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpConsumer {
    type Delivery = AmqpDelivery;

    async fn next(&mut self) -> Option<TransportResult<Self::Delivery>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(|delivery| AmqpDelivery { delivery })
                .map_err(Into::into),
        )
    }
}

/// A `lapin` delivery awaiting acknowledgment.
pub struct AmqpDelivery {
    delivery: LapinDelivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    async fn ack(&self) -> TransportResult<()> {
        self.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> TransportResult<()> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}
