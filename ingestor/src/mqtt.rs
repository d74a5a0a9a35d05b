use crate::config::MqttConfig;
use crate::decode::{decode, DecodeError};
use crate::errors::{Error, Result};
use crate::metrics::{
    CHANNEL_FULL_TOTAL, DECODED_TOTAL, HANDLER_FAILURES_TOTAL, MESSAGES_TOTAL, REJECTED_TOTAL,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

/// Receives every successfully decoded reading.
#[async_trait]
pub trait ReadingHandler: Send + Sync {
    async fn handle(&self, device_id: &str, value: f64, observed_at: DateTime<Utc>) -> Result<()>;
}

/// What happened to a single inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Rejected,
    HandlerFailed,
}

/// Decodes one payload and hands it to the registered handler. Failures stay
/// scoped to the message.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn ReadingHandler>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ReadingHandler>) -> Self {
        Self { handler }
    }

    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Outcome {
        let reading = match decode(payload) {
            Ok(reading) => reading,
            Err(e) => {
                let reason = match e {
                    DecodeError::MalformedPayload(_) => "malformed_payload",
                    DecodeError::MissingDeviceId => "missing_device_id",
                };
                REJECTED_TOTAL.with_label_values(&[reason]).inc();
                warn!(topic, "Dropping message: {}", e);
                return Outcome::Rejected;
            }
        };
        DECODED_TOTAL.inc();

        match self
            .handler
            .handle(&reading.device_id, reading.value, reading.observed_at)
            .await
        {
            Ok(()) => Outcome::Processed,
            Err(e) => {
                HANDLER_FAILURES_TOTAL.inc();
                error!(
                    topic,
                    device_id = %reading.device_id,
                    "Handler error: {}",
                    e
                );
                Outcome::HandlerFailed
            }
        }
    }
}

/// MQTT source with exactly one handler, fixed at construction.
pub struct MqttConsumer {
    config: MqttConfig,
    dispatcher: Dispatcher,
}

impl MqttConsumer {
    pub fn new(config: MqttConfig, handler: Arc<dyn ReadingHandler>) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(handler),
        }
    }

    /// Connects, subscribes and starts the transport loop and worker.
    ///
    /// An unreachable broker is retried every `reconnect_interval` until it
    /// accepts the connection; only a refusal the broker will keep repeating
    /// (bad credentials, rejected client id) is returned as an error. Later
    /// connection losses are retried the same way and the subscription is
    /// re-issued on each reconnect.
    pub async fn subscribe(self, topic: &str, qos: QoS) -> Result<Subscription> {
        let config = self.config;
        info!("Connecting to MQTT broker at {}:{}", config.host, config.port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        mqtt_options.set_clean_session(false);
        if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
            mqtt_options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) if is_fatal(&e) => {
                    error!("MQTT broker refused connection: {}", e);
                    return Err(Error::Connection(e));
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to MQTT broker: {}. Retrying in {:?}",
                        e, config.reconnect_interval
                    );
                    tokio::time::sleep(config.reconnect_interval).await;
                }
            }
        }
        info!("Connected to MQTT broker as {}", config.client_id);

        client.subscribe(topic, qos).await?;
        info!("Subscribed to {} with {:?}", topic, qos);

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let poll_handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            topic.to_string(),
            qos,
            tx,
            config.reconnect_interval,
            stop_rx,
        ));
        let worker_handle = tokio::spawn(run_worker(rx, self.dispatcher));

        Ok(Subscription {
            client,
            stop_tx,
            poll_handle,
            worker_handle,
        })
    }
}

/// Refusals that retrying with the same options cannot fix.
fn is_fatal(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ConnectionRefused(code)
            if !matches!(code, ConnectReturnCode::ServiceUnavailable)
    )
}

/// A live subscription: the transport loop plus the worker draining it.
pub struct Subscription {
    client: AsyncClient,
    stop_tx: watch::Sender<bool>,
    poll_handle: JoinHandle<()>,
    worker_handle: JoinHandle<()>,
}

impl Subscription {
    /// Disconnects from the broker and gives the worker up to `grace` to
    /// finish the messages already buffered.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Stopping MQTT subscription");
        let deadline = Instant::now() + grace;

        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to request MQTT disconnect: {}", e);
            let _ = self.stop_tx.send(true);
        }

        if tokio::time::timeout_at(deadline, &mut self.poll_handle)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not stop in time, aborting");
            let _ = self.stop_tx.send(true);
            self.poll_handle.abort();
        }

        if tokio::time::timeout_at(deadline, &mut self.worker_handle)
            .await
            .is_err()
        {
            warn!("Worker did not drain in time, abandoning buffered messages");
            self.worker_handle.abort();
        }

        info!("Disconnected from MQTT broker");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    tx: mpsc::Sender<Publish>,
    reconnect_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = stop_rx.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if forward(&tx, publish).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker, re-subscribing to {}", topic);
                if let Err(e) = client.try_subscribe(topic.as_str(), qos) {
                    error!("Failed to re-subscribe to {}: {}", topic, e);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    "MQTT connection error: {}. Reconnecting in {:?}",
                    e, reconnect_interval
                );
                let stopped = tokio::select! {
                    _ = stop_rx.changed() => true,
                    _ = tokio::time::sleep(reconnect_interval) => false,
                };
                if stopped {
                    break;
                }
            }
        }
    }

    info!("MQTT event loop stopped");
}

/// Hands a message to the worker, waiting for room when the buffer is full.
async fn forward(tx: &mpsc::Sender<Publish>, publish: Publish) -> Result<()> {
    match tx.try_send(publish) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(publish)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, waiting for worker");
            tx.send(publish).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot forward message");
            Err(Error::ChannelSend)
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Publish>, dispatcher: Dispatcher) {
    while let Some(publish) = rx.recv().await {
        dispatcher.dispatch(&publish.topic, &publish.payload).await;
    }
    info!("Worker stopped");
}
