//! Reconnecting, priority-buffered operation channel.
//!
//! The channel is generic over a [`Connector`] that opens a
//! `(FrameSink, FrameStream)` pair. Outbound operations are sent at once
//! while the link is up and buffered by priority while it is down. A lost
//! link is re-opened with exponential backoff; on success the buffer is
//! flushed critical first.

use opsync_core::{Operation, Priority};
use opsync_proto::OperationEnvelope;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Outbound half of a link.
pub trait FrameSink: Send + 'static {
    /// Write one frame, resolving once the other end acknowledged it.
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Inbound half of a link.
pub trait FrameStream: Send + 'static {
    /// Next frame, or `None` once the link is gone.
    fn next_frame(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;
}

/// Opens links to the peer.
pub trait Connector: Send + Sync + 'static {
    /// Outbound half produced by this connector
    type Sink: FrameSink;
    /// Inbound half produced by this connector
    type Stream: FrameStream;

    /// Open a new link.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Stream), TransportError>> + Send;
}

/// Channel tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Upper bound for reconnect delays
    pub backoff_max: Duration,
    /// Delay between non-critical frames when flushing the buffer
    pub flush_stagger: Duration,
    /// Capacity of the inbound fan-out channel
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            flush_stagger: Duration::from_millis(50),
            inbound_capacity: 256,
        }
    }
}

/// Exponential reconnect delay: `base`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Link state as seen by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No link; a reconnect may be pending
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Frames are sent immediately
    Connected,
    /// Closed for good
    Closed,
}

/// What happened to an outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Acknowledged by the other end of the link
    Sent,
    /// Held until the link is back
    Buffered,
}

#[derive(Debug, Default)]
struct PendingFrames {
    by_priority: BTreeMap<Priority, VecDeque<Vec<u8>>>,
}

impl PendingFrames {
    fn push(&mut self, priority: Priority, frame: Vec<u8>) {
        self.by_priority.entry(priority).or_default().push_back(frame);
    }

    /// Put frames back at the front of their class, keeping their order.
    fn restore(&mut self, frames: Vec<(Priority, Vec<u8>)>) {
        for (priority, frame) in frames.into_iter().rev() {
            self.by_priority
                .entry(priority)
                .or_default()
                .push_front(frame);
        }
    }

    fn drain(&mut self) -> Vec<(Priority, Vec<u8>)> {
        std::mem::take(&mut self.by_priority)
            .into_iter()
            .flat_map(|(priority, frames)| frames.into_iter().map(move |f| (priority, f)))
            .collect()
    }

    fn len(&self) -> usize {
        self.by_priority.values().map(VecDeque::len).sum()
    }
}

#[derive(Default)]
struct Tasks {
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

struct Shared<C: Connector> {
    connector: C,
    config: TransportConfig,
    sink: tokio::sync::Mutex<Option<C::Sink>>,
    pending: Mutex<PendingFrames>,
    backoff: Mutex<Backoff>,
    tasks: Mutex<Tasks>,
    link: AtomicU64,
    state: watch::Sender<ChannelState>,
    inbound: broadcast::Sender<OperationEnvelope>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconnecting operation channel to one peer.
pub struct TransportChannel<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> TransportChannel<C> {
    /// Create a disconnected channel.
    #[must_use]
    pub fn new(connector: C, config: TransportConfig) -> Self {
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                sink: tokio::sync::Mutex::new(None),
                pending: Mutex::new(PendingFrames::default()),
                backoff: Mutex::new(backoff),
                tasks: Mutex::new(Tasks::default()),
                link: AtomicU64::new(0),
                state,
                inbound,
            }),
        }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Watch link state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Number of frames waiting for the link.
    #[must_use]
    pub fn buffered(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Receive every inbound operation from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEnvelope> {
        self.shared.inbound.subscribe()
    }

    /// Open the link.
    ///
    /// On failure a reconnect with backoff is scheduled before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns error if the channel is closed or the connector fails.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }

        self.shared.set_state(ChannelState::Connecting);
        match self.shared.connector.connect().await {
            Ok((sink, stream)) => {
                self.shared.install(sink, stream).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Connection failed");
                self.shared.set_state(ChannelState::Disconnected);
                self.shared.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Send an operation, buffering it while the link is down.
    ///
    /// # Errors
    ///
    /// Returns error if the channel is closed or the operation cannot be
    /// encoded.
    pub async fn send_operation(
        &self,
        op: &Operation,
        priority: Priority,
    ) -> Result<Delivery, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }

        let frame = OperationEnvelope::new(op.clone(), priority)
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        if self.state() == ChannelState::Connected {
            match self.shared.send_frame(&frame).await {
                Ok(()) => {
                    tracing::debug!(op_id = %op.id(), ?priority, "Sent operation");
                    return Ok(Delivery::Sent);
                }
                Err(err) => {
                    tracing::warn!(op_id = %op.id(), error = %err, "Send failed, buffering");
                    lock(&self.shared.pending).push(priority, frame);
                    self.shared.connection_lost();
                    return Ok(Delivery::Buffered);
                }
            }
        }

        tracing::debug!(op_id = %op.id(), ?priority, "Link down, buffering operation");
        lock(&self.shared.pending).push(priority, frame);
        Ok(Delivery::Buffered)
    }

    /// Close the channel, cancelling the reconnect timer and reader task.
    pub async fn close(&self) {
        self.shared.shutdown();
        self.shared.sink.lock().await.take();
        tracing::info!(buffered = self.buffered(), "Transport channel closed");
    }
}

impl<C: Connector> Drop for TransportChannel<C> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<C: Connector> Shared<C> {
    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == ChannelState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ChannelState::Closed
    }

    fn shutdown(&self) {
        self.set_state(ChannelState::Closed);
        let mut tasks = lock(&self.tasks);
        for handle in [tasks.reconnect.take(), tasks.reader.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let result = sink.send(frame).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn install(self: &Arc<Self>, sink: C::Sink, stream: C::Stream) {
        *self.sink.lock().await = Some(sink);
        lock(&self.backoff).reset();
        self.spawn_reader(stream);
        self.set_state(ChannelState::Connected);
        tracing::info!("Transport connected");
        self.flush().await;
    }

    /// Send buffered frames: critical back to back, the rest staggered.
    async fn flush(self: &Arc<Self>) {
        let frames = lock(&self.pending).drain();
        if frames.is_empty() {
            return;
        }
        tracing::info!(count = frames.len(), "Flushing buffered operations");

        let mut frames = frames.into_iter();
        let mut first_staggered = true;
        while let Some((priority, frame)) = frames.next() {
            if self.is_closed() {
                let mut rest = vec![(priority, frame)];
                rest.extend(frames);
                lock(&self.pending).restore(rest);
                return;
            }

            if priority != Priority::Critical {
                if !first_staggered {
                    tokio::time::sleep(self.config.flush_stagger).await;
                }
                first_staggered = false;
            }

            if let Err(err) = self.send_frame(&frame).await {
                tracing::warn!(error = %err, "Flush interrupted, re-buffering");
                let mut rest = vec![(priority, frame)];
                rest.extend(frames);
                lock(&self.pending).restore(rest);
                self.connection_lost();
                return;
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: C::Stream) {
        let shared = Arc::clone(self);
        let link = self.link.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(async move {
            while let Some(frame) = stream.next_frame().await {
                match OperationEnvelope::from_json(&frame) {
                    Ok(envelope) => {
                        tracing::debug!(op_id = %envelope.operation.id(), "Received operation");
                        // No subscribers is fine: the frame is simply dropped.
                        let _ = shared.inbound.send(envelope);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, len = frame.len(), "Dropping malformed frame");
                    }
                }
            }
            // A reader outlived by a newer link must not tear that link down.
            if shared.link.load(Ordering::SeqCst) == link {
                tracing::warn!("Transport link closed by peer");
                shared.connection_lost();
            }
        });

        if let Some(previous) = lock(&self.tasks).reader.replace(handle) {
            previous.abort();
        }
    }

    fn connection_lost(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        self.set_state(ChannelState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let mut tasks = lock(&self.tasks);
        if tasks
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let shared = Arc::clone(self);
        tasks.reconnect = Some(tokio::spawn(shared.reconnect_loop()));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let delay = lock(&self.backoff).next_delay();
            tracing::info!(?delay, "Reconnecting after backoff");
            tokio::time::sleep(delay).await;

            if self.is_closed() {
                return;
            }

            self.set_state(ChannelState::Connecting);
            match self.connector.connect().await {
                Ok((sink, stream)) => {
                    // Detach so a failure while flushing can schedule a new loop.
                    lock(&self.tasks).reconnect = None;
                    self.install(sink, stream).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Reconnect failed");
                    self.set_state(ChannelState::Disconnected);
                }
            }
        }
    }
}

/// Errors for the transport channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The link could not be opened
    #[error("connect error: {0}")]
    Connect(String),
    /// Writing to the link failed
    #[error("send error: {0}")]
    Send(String),
    /// No link is open
    #[error("not connected")]
    NotConnected,
    /// The channel was closed
    #[error("channel closed")]
    Closed,
    /// The operation could not be encoded
    #[error("encode error: {0}")]
    Encode(String),
    /// Invalid link configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryConnector;
    use super::*;
    use opsync_core::{Collection, DeviceId, OperationKind, OperationManager, Record};

    fn operation(manager: &mut OperationManager, kind: OperationKind, id: &str) -> Operation {
        manager.create_operation(kind, Record::new(id), Collection::Tasks)
    }

    fn sent_ids(connector: &MemoryConnector) -> Vec<String> {
        connector
            .sent()
            .iter()
            .map(|frame| {
                OperationEnvelope::from_json(frame)
                    .unwrap()
                    .operation
                    .payload()
                    .id
                    .clone()
            })
            .collect()
    }

    async fn wait_for(channel: &TransportChannel<MemoryConnector>, state: ChannelState) {
        let mut rx = channel.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn connected_send_goes_out_immediately() {
        let connector = MemoryConnector::default();
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());
        let mut manager = OperationManager::new(DeviceId::new("a"));

        channel.connect().await.unwrap();
        let delivery = channel
            .send_operation(&operation(&mut manager, OperationKind::Create, "1"), Priority::Normal)
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(sent_ids(&connector), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_flushes_critical_first() {
        let connector = MemoryConnector::default();
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());
        let mut manager = OperationManager::new(DeviceId::new("a"));

        for (kind, id) in [
            (OperationKind::Custom("x".into()), "bg"),
            (OperationKind::Create, "n"),
            (OperationKind::Delete, "c"),
        ] {
            let op = operation(&mut manager, kind, id);
            let delivery = channel.send_operation(&op, op.priority()).await.unwrap();
            assert_eq!(delivery, Delivery::Buffered);
        }
        assert_eq!(channel.buffered(), 3);

        channel.connect().await.unwrap();

        assert_eq!(channel.buffered(), 0);
        assert_eq!(sent_ids(&connector), vec!["c", "n", "bg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_with_backoff() {
        let connector = MemoryConnector::default();
        connector.fail_next_connects(2);
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());

        let start = tokio::time::Instant::now();
        assert!(channel.connect().await.is_err());
        wait_for(&channel, ChannelState::Connected).await;

        assert_eq!(connector.attempts(), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_buffers_and_recovers() {
        let connector = MemoryConnector::default();
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());
        let mut manager = OperationManager::new(DeviceId::new("a"));
        channel.connect().await.unwrap();

        connector.fail_sends(true);
        let op = operation(&mut manager, OperationKind::Complete, "1");
        let delivery = channel.send_operation(&op, op.priority()).await.unwrap();
        assert_eq!(delivery, Delivery::Buffered);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        connector.fail_sends(false);
        wait_for(&channel, ChannelState::Connected).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(channel.buffered(), 0);
        assert_eq!(sent_ids(&connector), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_hangup_triggers_reconnect() {
        let connector = MemoryConnector::default();
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());
        channel.connect().await.unwrap();

        connector.drop_link();
        wait_for(&channel, ChannelState::Disconnected).await;
        wait_for(&channel, ChannelState::Connected).await;

        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn inbound_frames_fan_out_and_garbage_is_dropped() {
        let connector = MemoryConnector::default();
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        channel.connect().await.unwrap();

        let mut remote = OperationManager::new(DeviceId::new("b"));
        let op = operation(&mut remote, OperationKind::Create, "7");
        connector.deliver(b"not json");
        connector.deliver(&OperationEnvelope::new(op.clone(), Priority::Normal).to_json().unwrap());

        assert_eq!(first.recv().await.unwrap().operation, op);
        assert_eq!(second.recv().await.unwrap().operation, op);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_reconnect() {
        let connector = MemoryConnector::default();
        connector.fail_next_connects(100);
        let channel = TransportChannel::new(connector.clone(), TransportConfig::default());

        assert!(channel.connect().await.is_err());
        channel.close().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(channel.state(), ChannelState::Closed);

        let mut manager = OperationManager::new(DeviceId::new("a"));
        let op = operation(&mut manager, OperationKind::Create, "1");
        assert!(matches!(
            channel.send_operation(&op, Priority::Normal).await,
            Err(TransportError::Closed)
        ));
    }
}
