use std::time::Duration;

use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::errors::Disposition;

pub const CRAWL_QUEUE: &str = "repos_to_crawl";
pub const PROCESS_QUEUE: &str = "raw_data_to_process";
pub const EMBED_QUEUE: &str = "readme_to_embed";

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker unreachable: {0}")]
    Transport(#[from] lapin::Error),

    #[error("Payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// RabbitMQ adapter. Queues are durable and declared idempotently before
/// every publish and consume; consumers ack/nack each delivery explicitly.
pub struct Bus {
    connection: Connection,
    channel: Channel,
    closed_rx: watch::Receiver<bool>,
}

impl Bus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let (closed_tx, closed_rx) = watch::channel(false);
        connection.on_error(move |error| {
            warn!("Connection to the broker lost: {error}");
            let _ = closed_tx.send(true);
        });

        info!("Connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
            closed_rx,
        })
    }

    /// Connects with a bounded retry loop, for service startup where the
    /// broker may not be up yet.
    pub async fn connect_with_retry(url: &str) -> Result<Self, BusError> {
        let mut last_err = None;
        for attempt in 1..=CONNECT_RETRIES {
            match Self::connect(url).await {
                Ok(bus) => return Ok(bus),
                Err(e) => {
                    warn!("Broker connect attempt {attempt} failed: {e}. Retrying in 5s...");
                    last_err = Some(e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        Err(last_err.expect("at least one connect attempt"))
    }

    /// Resolves when the underlying connection reports closure. Consumers
    /// use this to tear down their stream and reconnect.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender never drops before the connection does.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    async fn declare(&self, queue: &str) -> Result<(), BusError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<(), BusError> {
        let payload = serde_json::to_vec(message)?;
        self.declare(queue).await?;
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, BusError> {
        self.declare(queue).await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    pub async fn close(self) {
        let _ = self.connection.close(200, "shutting down").await;
    }
}

/// Settles a delivery according to the handler's verdict. Settlement
/// failures are logged, not propagated: the broker will redeliver an
/// unsettled message anyway once the channel drops.
pub async fn settle(delivery: &Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack | Disposition::Discard => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(e) = result {
        warn!("Failed to settle delivery: {e}");
    }
}
