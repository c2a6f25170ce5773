use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    BrokerConfig, BrokerError,
    r#trait::{
        Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryReceipt,
        DeliveryStream, FailureHandler,
    },
};

const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP 0-9-1 broker with lapin.
pub struct AmqpConnector {
    uri: AMQPUri,
}

impl AmqpConnector {
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        let uri = AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: config.host.clone(),
                port: config.port,
            },
            vhost: config.virtual_host.clone(),
            ..AMQPUri::default()
        };

        Self { uri }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let properties = ConnectionProperties::default().with_connection_name("courier".into());
        let connection = Connection::connect_uri(self.uri.clone(), properties)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Box::new(AmqpConnection::new(connection)))
    }
}

struct AmqpConnection {
    connection: Connection,
    closed: CancellationToken,
    handler: Arc<Mutex<Option<FailureHandler>>>,
}

impl AmqpConnection {
    fn new(connection: Connection) -> Self {
        let closed = CancellationToken::new();
        let handler: Arc<Mutex<Option<FailureHandler>>> = Arc::default();

        // lapin keeps a single error callback per connection, so it fans out
        // to channel shutdown tokens and the registered failure handler
        let on_error_closed = closed.clone();
        let on_error_handler = Arc::clone(&handler);
        connection.on_error(move |error| {
            on_error_closed.cancel();
            if let Some(handler) = on_error_handler.lock().as_ref() {
                handler(BrokerError::Connection(error.to_string()));
            }
        });

        Self {
            connection,
            closed,
            handler,
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn on_failure(&self, handler: FailureHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        Ok(Box::new(AmqpChannel {
            channel,
            shutdown: self.closed.child_token(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        self.connection
            .close(REPLY_SUCCESS, "courier shutting down")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
    shutdown: CancellationToken,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {exchange}: {e}")))
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter_exchange.into()),
        );

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology(format!("queue {queue}: {e}")))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("binding {queue} to {exchange}: {e}")))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("prefetch {count}: {e}")))
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
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| BrokerError::Consume(e.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        self.channel
            .close(REPLY_SUCCESS, "courier shutting down")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let delivery_tag = delivery.delivery_tag;

    Delivery {
        delivery_tag,
        redelivered: delivery.redelivered,
        body: delivery.data,
        receipt: DeliveryReceipt::new(
            delivery_tag,
            Box::new(AmqpAcker {
                delivery_tag,
                acker: delivery.acker,
            }),
        ),
    }
}

struct AmqpAcker {
    delivery_tag: u64,
    acker: Acker,
}

impl AmqpAcker {
    fn failed(&self, error: &lapin::Error) -> BrokerError {
        BrokerError::Acknowledge {
            delivery_tag: self.delivery_tag,
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| self.failed(&e))
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map_err(|e| self.failed(&e))
    }
}
