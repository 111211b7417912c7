//! RabbitMQ broker over `lapin`

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Acker, BrokerChannel, BrokerError, BrokerResult, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use csvq_ingest::codec::CONTENT_TYPE;

/// AMQP reply code for a normal channel close
const REPLY_SUCCESS: u16 = 200;

struct Link {
    connection: Connection,
    /// Shared by declare and publish
    channel: Channel,
    /// Channel of the current subscription, closed before the next one opens
    consumer: Option<Channel>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Alive,
    Dead,
    Missing,
}

impl LinkState {
    /// `alive` is `None` when no connection has been opened yet.
    fn classify(alive: Option<bool>) -> Self {
        match alive {
            Some(true) => LinkState::Alive,
            Some(false) => LinkState::Dead,
            None => LinkState::Missing,
        }
    }
}

pub struct AmqpBroker {
    uri: AMQPUri,
    prefetch: u16,
    consumer_tag: String,
    /// Current connection; replaced when found dead
    link: Mutex<Option<Link>>,
}

impl AmqpBroker {
    /// Parse the URL, apply credential overrides and open the first connection.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let broker = Self {
            uri: broker_uri(config)?,
            prefetch: config.prefetch,
            consumer_tag: format!("csvq-{}", uuid::Uuid::new_v4()),
            link: Mutex::new(None),
        };

        broker.publish_channel().await?;
        Ok(broker)
    }

    /// The live link in `slot`, reconnecting first if the current connection is gone.
    async fn ensure_link<'a>(&self, slot: &'a mut Option<Link>) -> BrokerResult<&'a mut Link> {
        match LinkState::classify(slot.as_ref().map(Link::is_alive)) {
            LinkState::Alive => {},
            LinkState::Dead => {
                warn!(host = %self.uri.authority.host, "AMQP connection lost, reconnecting");
                *slot = Some(self.open().await?);
            },
            LinkState::Missing => *slot = Some(self.open().await?),
        }

        slot.as_mut()
            .ok_or_else(|| BrokerError::Unavailable("no AMQP connection".to_string()))
    }

    async fn publish_channel(&self) -> BrokerResult<Channel> {
        let mut slot = self.link.lock().await;
        Ok(self.ensure_link(&mut slot).await?.channel.clone())
    }

    /// A fresh channel for a subscription. The previous subscription's channel is closed.
    async fn consume_channel(&self) -> BrokerResult<Channel> {
        let mut slot = self.link.lock().await;
        let link = self.ensure_link(&mut slot).await?;

        if let Some(previous) = link.consumer.take() {
            if previous.status().connected() {
                if let Err(e) = previous.close(REPLY_SUCCESS, "resubscribing").await {
                    warn!(error = %e, "Failed to close previous consumer channel");
                }
            }
        }

        let channel = link.connection.create_channel().await?;
        link.consumer = Some(channel.clone());
        Ok(channel)
    }

    async fn open(&self) -> BrokerResult<Link> {
        let connection =
            Connection::connect_uri(self.uri.clone(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        info!(
            host = %self.uri.authority.host,
            port = self.uri.authority.port,
            vhost = %self.uri.vhost,
            "Connected to AMQP broker"
        );

        Ok(Link {
            connection,
            channel,
            consumer: None,
        })
    }
}

fn broker_uri(config: &BrokerConfig) -> BrokerResult<AMQPUri> {
    let mut uri: AMQPUri = config.url.parse().map_err(BrokerError::InvalidUrl)?;

    if let Some(username) = &config.username {
        uri.authority.userinfo.username = username.clone();
    }
    if let Some(password) = &config.password {
        uri.authority.userinfo.password = password.clone();
    }

    Ok(uri)
}

#[async_trait]
impl BrokerChannel for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        let channel = self.publish_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        let channel = self.publish_channel().await?;

        // The returned confirm is dropped: publisher confirms are not enabled.
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let channel = self.consume_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue, prefetch = self.prefetch, tag = %self.consumer_tag, "Consuming");

        let deliveries = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    AmqpAcker(delivery.acker),
                )
            })
            .map_err(BrokerError::from)
        });

        Ok(deliveries.boxed())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
