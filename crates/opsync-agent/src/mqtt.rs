//! MQTT link for the transport channel.

use crate::transport::{Connector, FrameSink, FrameStream, TransportError};
use opsync_core::DeviceId;
use opsync_proto::TopicScheme;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

/// Opens MQTT sessions that carry operation frames.
///
/// Frames are published to the peer's device topic, or to the tenant-wide
/// topic when no peer is configured. The device receives on its own device
/// topic and on the tenant-wide topic. A send resolves only once the broker
/// acknowledged the publish.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    outbound_topic: String,
    inbound_topics: Vec<String>,
    keep_alive: Duration,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl MqttConnector {
    /// Create a connector for `device`.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        broker: &str,
        device: &DeviceId,
        peer: Option<&DeviceId>,
        scheme: &TopicScheme,
    ) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(broker)?;
        let outbound_topic = match peer {
            Some(peer) => scheme.device_ops(peer.as_str()),
            None => scheme.broadcast_ops(),
        };

        Ok(Self {
            host,
            port,
            client_id: format!("opsync-{device}"),
            outbound_topic,
            inbound_topics: vec![scheme.device_ops(device.as_str()), scheme.broadcast_ops()],
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        })
    }

    /// Topic frames are published to.
    #[must_use]
    pub fn outbound_topic(&self) -> &str {
        &self.outbound_topic
    }

    async fn open(&self) -> Result<(MqttSink, MqttStream), TransportError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        for topic in &self.inbound_topics {
            tracing::info!(topic, "Subscribing to operation topic");
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }

        tracing::info!(host = %self.host, port = self.port, "MQTT session established");

        let acks = Arc::new(Mutex::new(PendingAcks::default()));
        Ok((
            MqttSink {
                client,
                topic: self.outbound_topic.clone(),
                acks: Arc::clone(&acks),
                ack_timeout: self.ack_timeout,
            },
            MqttStream {
                eventloop,
                topics: self.inbound_topics.clone(),
                acks,
            },
        ))
    }
}

impl Connector for MqttConnector {
    type Sink = MqttSink;
    type Stream = MqttStream;

    async fn connect(&self) -> Result<(MqttSink, MqttStream), TransportError> {
        tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| TransportError::Connect("timed out waiting for CONNACK".to_string()))?
    }
}

/// Publishes waiting for their PUBACK.
///
/// Publish requests leave the event loop in the order they were made, so
/// each outgoing packet id is matched with the oldest unassigned waiter.
#[derive(Default)]
struct PendingAcks {
    unassigned: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl PendingAcks {
    fn register(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.unassigned.push_back(tx);
        rx
    }

    fn withdraw_last(&mut self) {
        self.unassigned.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(tx) = self.unassigned.pop_front() {
            self.in_flight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(tx) = self.in_flight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// Drop every waiter; their sends fail.
    fn abandon(&mut self) {
        self.unassigned.clear();
        self.in_flight.clear();
    }
}

fn lock(acks: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishing half of an MQTT session.
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    acks: Arc<Mutex<PendingAcks>>,
    ack_timeout: Duration,
}

impl FrameSink for MqttSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        tracing::debug!(topic = %self.topic, payload_len = frame.len(), "Publishing frame");
        let ack = lock(&self.acks).register();
        if let Err(e) = self
            .client
            .publish(&self.topic, QoS::AtLeastOnce, false, frame.to_vec())
            .await
        {
            lock(&self.acks).withdraw_last();
            return Err(TransportError::Send(e.to_string()));
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Send(
                "session lost before PUBACK".to_string(),
            )),
            Err(_) => Err(TransportError::Send(
                "timed out waiting for PUBACK".to_string(),
            )),
        }
    }
}

/// Receiving half of an MQTT session.
///
/// Polling it also drives outgoing publishes and their acknowledgements,
/// so it must be read continuously while the session is in use.
pub struct MqttStream {
    eventloop: EventLoop,
    topics: Vec<String>,
    acks: Arc<Mutex<PendingAcks>>,
}

impl FrameStream for MqttStream {
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if self.topics.iter().any(|t| *t == publish.topic) {
                        return Some(publish.payload.to_vec());
                    }
                    tracing::debug!(topic = %publish.topic, "Ignoring publish on foreign topic");
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&self.acks).sent(pkid),
                Ok(Event::Incoming(Packet::PubAck(ack))) => lock(&self.acks).acked(ack.pkid),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT session lost");
                    lock(&self.acks).abandon();
                    return None;
                }
            }
        }
    }
}

impl Drop for MqttStream {
    fn drop(&mut self) {
        lock(&self.acks).abandon();
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    let invalid = |reason: String| TransportError::Config(format!("{input}: {reason}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => return Err(invalid(format!("unsupported scheme '{scheme}'"))),
        }

        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        return Ok((host.to_string(), url.port().unwrap_or(1883)));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port
            .parse()
            .map_err(|_| invalid(format!("invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(invalid("too many ':' separators".to_string()));
    }

    Ok((host.to_string(), port))
}
