//! Channel multiplexer over a secret connection.
//!
//! Messages queued per channel are cut into packets of at most
//! `max_packet_msg_payload_size` bytes; the last packet of a message carries
//! `eof`. The send routine interleaves channels by `recently_sent / priority`
//! and keeps the link alive with pings.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::network::packet::{max_packet_size, Packet};
use crate::network::secret_connection::{
    SecretConnection, SecretConnectionError, SecretReader, SecretWriter,
};

#[derive(Error, Debug)]
pub enum MConnError {
    #[error(transparent)]
    Connection(#[from] SecretConnectionError),
    #[error("pong timeout")]
    PongTimeout,
    #[error("received message for unknown channel {0:#04x}")]
    UnknownChannel(u8),
    #[error("message on channel {channel:#04x} exceeds {max} bytes")]
    MessageTooLarge { channel: u8, max: usize },
    #[error("receive handler failed: {0}")]
    Receive(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("multiplexer already started")]
    AlreadyStarted,
    #[error("multiplexer stopped")]
    Stopped,
}

/// Static description of one multiplexed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub priority: u32,
    pub send_queue_capacity: usize,
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: 1,
            send_queue_capacity: 1,
            recv_message_capacity: 22 * 1024 * 1024,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone)]
pub struct MConnConfig {
    /// Bytes per second; 0 disables throttling.
    pub send_rate: u64,
    pub recv_rate: u64,
    pub max_packet_msg_payload_size: usize,
    /// Period at which per-channel send statistics decay.
    pub flush_throttle: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// How long `send` waits for room in a full channel queue.
    pub send_timeout: Duration,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            send_rate: 5_120_000,
            recv_rate: 5_120_000,
            max_packet_msg_payload_size: 1024,
            flush_throttle: Duration::from_millis(100),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(45),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Callbacks from the multiplexer routines.
#[async_trait]
pub trait MConnHandler: Send + Sync + 'static {
    /// Called once per received packet, in arrival order.
    async fn on_receive(&self, channel_id: u8, data: Bytes, eof: bool) -> Result<(), MConnError>;

    /// Called at most once, when either routine fails.
    fn on_error(&self, err: MConnError);
}

enum Control {
    SendPong,
    PongReceived,
}

struct Shared {
    queues: HashMap<u8, mpsc::Sender<Bytes>>,
    /// Wakes the send routine when a queue gains a message.
    ready: Notify,
    cancel: CancellationToken,
    errored: AtomicBool,
    send_timeout: Duration,
}

impl Shared {
    fn fail(&self, handler: &dyn MConnHandler, err: MConnError) {
        if self.cancel.is_cancelled() || self.errored.swap(true, Ordering::SeqCst) {
            tracing::trace!(error = %err, "Ignoring multiplexer error after shutdown");
            return;
        }
        self.cancel.cancel();
        handler.on_error(err);
    }
}

struct SendChannel {
    id: u8,
    priority: u32,
    queue: mpsc::Receiver<Bytes>,
    /// Message being sent and the offset of its next packet.
    sending: Option<(Bytes, usize)>,
    recently_sent: u64,
}

impl SendChannel {
    fn ratio(&self) -> f64 {
        self.recently_sent as f64 / self.priority.max(1) as f64
    }
}

struct RecvChannel {
    capacity: usize,
    received: usize,
}

struct Unstarted {
    conn: SecretConnection,
    send_channels: Vec<SendChannel>,
    recv_channels: HashMap<u8, RecvChannel>,
}

/// Cloneable handle for queueing messages on a multiplexer.
#[derive(Clone)]
pub struct MConnSender {
    shared: Arc<Shared>,
}

impl MConnSender {
    /// Queues one complete message, waiting up to the send timeout for room.
    /// Returns false on unknown channel, stopped connection or timeout.
    pub async fn send(&self, channel_id: u8, msg: Bytes) -> bool {
        let Some(queue) = self.shared.queues.get(&channel_id) else {
            tracing::debug!(channel = channel_id, "Send on unknown channel");
            return false;
        };
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        let queued = tokio::select! {
            _ = self.shared.cancel.cancelled() => false,
            res = tokio::time::timeout(self.shared.send_timeout, queue.send(msg)) => matches!(res, Ok(Ok(()))),
        };
        if queued {
            self.shared.ready.notify_one();
        } else {
            tracing::debug!(channel = channel_id, "Send failed");
        }
        queued
    }
}

pub struct MConnection {
    shared: Arc<Shared>,
    config: MConnConfig,
    unstarted: Mutex<Option<Unstarted>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MConnection {
    /// Panics if two descriptors share a channel id.
    pub fn new(conn: SecretConnection, descs: &[ChannelDescriptor], config: MConnConfig) -> Self {
        let mut queues = HashMap::with_capacity(descs.len());
        let mut send_channels = Vec::with_capacity(descs.len());
        let mut recv_channels = HashMap::with_capacity(descs.len());

        for desc in descs {
            if queues.contains_key(&desc.id) {
                panic!("duplicate channel id {:#04x}", desc.id);
            }
            let (tx, rx) = mpsc::channel(desc.send_queue_capacity.max(1));
            queues.insert(desc.id, tx);
            send_channels.push(SendChannel {
                id: desc.id,
                priority: desc.priority,
                queue: rx,
                sending: None,
                recently_sent: 0,
            });
            recv_channels.insert(
                desc.id,
                RecvChannel {
                    capacity: desc.recv_message_capacity,
                    received: 0,
                },
            );
        }

        Self {
            shared: Arc::new(Shared {
                queues,
                ready: Notify::new(),
                cancel: CancellationToken::new(),
                errored: AtomicBool::new(false),
                send_timeout: config.send_timeout,
            }),
            config,
            unstarted: Mutex::new(Some(Unstarted {
                conn,
                send_channels,
                recv_channels,
            })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> MConnSender {
        MConnSender {
            shared: self.shared.clone(),
        }
    }

    /// Spawns the send and receive routines.
    pub fn start(&self, handler: Arc<dyn MConnHandler>) -> Result<(), MConnError> {
        if self.shared.cancel.is_cancelled() {
            return Err(MConnError::Stopped);
        }
        let Unstarted {
            conn,
            send_channels,
            recv_channels,
        } = self.unstarted.lock().take().ok_or(MConnError::AlreadyStarted)?;

        let (reader, writer) = conn.into_split();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let send_task = {
            let shared = self.shared.clone();
            let handler = handler.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    send_routine(&shared, writer, send_channels, ctrl_rx, &config).await
                {
                    shared.fail(handler.as_ref(), e);
                }
            })
        };
        let recv_task = {
            let shared = self.shared.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = shared.cancel.cancelled() => Ok(()),
                    res = recv_routine(reader, recv_channels, ctrl_tx, handler.as_ref(), &config) => res,
                };
                if let Err(e) = result {
                    shared.fail(handler.as_ref(), e);
                }
            })
        };

        self.tasks.lock().extend([send_task, recv_task]);
        Ok(())
    }

    /// Stops both routines and drops the underlying socket. Idempotent.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        self.unstarted.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for MConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Moves the next queued message into `sending` for idle channels and
/// returns whether any channel has data to send.
fn refill(channels: &mut [SendChannel]) -> bool {
    let mut pending = false;
    for ch in channels.iter_mut() {
        if ch.sending.is_none() {
            if let Ok(msg) = ch.queue.try_recv() {
                ch.sending = Some((msg, 0));
            }
        }
        pending |= ch.sending.is_some();
    }
    pending
}

/// Next time a packet of `len` bytes may go out under `rate` bytes/s.
fn throttle(next: Instant, len: usize, rate: u64) -> Instant {
    if rate == 0 {
        return next;
    }
    next.max(Instant::now()) + Duration::from_secs_f64(len as f64 / rate as f64)
}

async fn send_routine(
    shared: &Shared,
    mut writer: SecretWriter,
    mut channels: Vec<SendChannel>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Control>,
    config: &MConnConfig,
) -> Result<(), MConnError> {
    let max_packet = max_packet_size(config.max_packet_msg_payload_size);
    let max_payload = config.max_packet_msg_payload_size.max(1);
    let decay_period = config.flush_throttle.max(Duration::from_millis(1));
    let ping_period = config.ping_interval.max(Duration::from_millis(1));
    let now = Instant::now();
    let mut decay = interval_at(now + decay_period, decay_period);
    let mut ping = interval_at(now + ping_period, ping_period);
    let mut pong_deadline: Option<Instant> = None;
    let mut next_send = now;

    loop {
        let pending = refill(&mut channels);
        let deadline = pong_deadline.unwrap_or(now);

        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => return Ok(()),

            Some(ctrl) = ctrl_rx.recv() => match ctrl {
                Control::SendPong => writer.write_msg(&Packet::Pong, max_packet).await?,
                Control::PongReceived => pong_deadline = None,
            },

            _ = sleep_until(deadline), if pong_deadline.is_some() => {
                return Err(MConnError::PongTimeout);
            }

            _ = ping.tick() => {
                tracing::trace!("Sending ping");
                writer.write_msg(&Packet::Ping, max_packet).await?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + config.pong_timeout);
                }
            }

            _ = decay.tick() => {
                for ch in channels.iter_mut() {
                    ch.recently_sent = ch.recently_sent * 4 / 5;
                }
            }

            _ = sleep_until(next_send), if pending => {
                let Some(ch) = channels
                    .iter_mut()
                    .filter(|ch| ch.sending.is_some())
                    .min_by(|a, b| a.ratio().total_cmp(&b.ratio()))
                else {
                    continue;
                };
                let Some((msg, offset)) = ch.sending.take() else {
                    continue;
                };
                let end = msg.len().min(offset + max_payload);
                let eof = end == msg.len();
                let packet = Packet::msg(ch.id, eof, msg.slice(offset..end));
                writer.write_msg(&packet, max_packet).await?;

                let sent = end - offset;
                ch.recently_sent += sent as u64;
                if !eof {
                    ch.sending = Some((msg, end));
                }
                next_send = throttle(next_send, sent, config.send_rate);
            }

            _ = shared.ready.notified(), if !pending => {}
        }
    }
}

async fn recv_routine(
    mut reader: SecretReader,
    mut channels: HashMap<u8, RecvChannel>,
    ctrl_tx: mpsc::UnboundedSender<Control>,
    handler: &dyn MConnHandler,
    config: &MConnConfig,
) -> Result<(), MConnError> {
    let max_packet = max_packet_size(config.max_packet_msg_payload_size);
    let mut next_recv = Instant::now();

    loop {
        sleep_until(next_recv).await;
        let packet: Packet = reader.read_msg(max_packet).await?;

        match packet {
            Packet::Ping => {
                tracing::trace!("Received ping");
                let _ = ctrl_tx.send(Control::SendPong);
            }
            Packet::Pong => {
                tracing::trace!("Received pong");
                let _ = ctrl_tx.send(Control::PongReceived);
            }
            Packet::Msg {
                channel_id,
                eof,
                data,
            } => {
                let ch = channels
                    .get_mut(&channel_id)
                    .ok_or(MConnError::UnknownChannel(channel_id))?;
                ch.received += data.len();
                if ch.received > ch.capacity {
                    return Err(MConnError::MessageTooLarge {
                        channel: channel_id,
                        max: ch.capacity,
                    });
                }
                if eof {
                    ch.received = 0;
                }
                next_recv = throttle(next_recv, data.len(), config.recv_rate);
                handler.on_receive(channel_id, data, eof).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::secret_pair;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<(u8, Bytes, bool)>>,
        errors: Mutex<Vec<String>>,
        received: Notify,
        failed: Notify,
    }

    #[async_trait]
    impl MConnHandler for Recorder {
        async fn on_receive(&self, ch: u8, data: Bytes, eof: bool) -> Result<(), MConnError> {
            self.packets.lock().push((ch, data, eof));
            self.received.notify_one();
            Ok(())
        }

        fn on_error(&self, err: MConnError) {
            self.errors.lock().push(err.to_string());
            self.failed.notify_one();
        }
    }

    impl Recorder {
        /// Reassembles messages per channel from the recorded packets.
        fn messages(&self, ch: u8) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            let mut current = Vec::new();
            for (id, data, eof) in self.packets.lock().iter() {
                if *id != ch {
                    continue;
                }
                current.extend_from_slice(data);
                if *eof {
                    out.push(std::mem::take(&mut current));
                }
            }
            out
        }

        async fn wait_for(&self, ch: u8, count: usize) -> Vec<Vec<u8>> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let msgs = self.messages(ch);
                    if msgs.len() >= count {
                        return msgs;
                    }
                    self.received.notified().await;
                }
            })
            .await
            .expect("timed out waiting for messages")
        }
    }

    fn descs() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new(0x01).with_send_queue_capacity(8),
            ChannelDescriptor::new(0x20)
                .with_priority(5)
                .with_send_queue_capacity(8)
                .with_recv_message_capacity(4096),
        ]
    }

    fn config() -> MConnConfig {
        MConnConfig {
            max_packet_msg_payload_size: 64,
            ..MConnConfig::default()
        }
    }

    #[tokio::test]
    async fn test_messages_split_and_reassembled() {
        let (a, b) = secret_pair().await;
        let mconn_a = MConnection::new(a, &descs(), config());
        let mconn_b = MConnection::new(b, &descs(), config());
        let recorder = Arc::new(Recorder::default());
        mconn_a.start(Arc::new(Recorder::default())).unwrap();
        mconn_b.start(recorder.clone()).unwrap();

        let big: Vec<u8> = (0..200u8).collect();
        let sender = mconn_a.sender();
        assert!(sender.send(0x20, Bytes::from(big.clone())).await);
        assert!(sender.send(0x20, Bytes::new()).await);
        assert!(sender.send(0x01, Bytes::from_static(b"hi")).await);

        let msgs = recorder.wait_for(0x20, 2).await;
        assert_eq!(msgs[0], big);
        assert!(msgs[1].is_empty());
        assert_eq!(recorder.wait_for(0x01, 1).await[0], b"hi");

        // 200 bytes at 64 per packet.
        let packets = recorder
            .packets
            .lock()
            .iter()
            .filter(|(ch, data, _)| *ch == 0x20 && !data.is_empty())
            .count();
        assert_eq!(packets, 4);
    }

    #[tokio::test]
    async fn test_send_on_unknown_channel_fails() {
        let (a, _b) = secret_pair().await;
        let mconn = MConnection::new(a, &descs(), config());
        mconn.start(Arc::new(Recorder::default())).unwrap();
        assert!(!mconn.sender().send(0x7f, Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let (a, _b) = secret_pair().await;
        let mconn = MConnection::new(a, &descs(), config());
        mconn.start(Arc::new(Recorder::default())).unwrap();
        mconn.stop();
        mconn.stop();
        assert!(mconn.is_stopped());
        assert!(!mconn.sender().send(0x01, Bytes::from_static(b"x")).await);
        assert!(matches!(
            mconn.start(Arc::new(Recorder::default())),
            Err(MConnError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (a, _b) = secret_pair().await;
        let mconn = MConnection::new(a, &descs(), config());
        mconn.start(Arc::new(Recorder::default())).unwrap();
        assert!(matches!(
            mconn.start(Arc::new(Recorder::default())),
            Err(MConnError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_reports_error_once() {
        let (a, b) = secret_pair().await;
        let mconn_a = MConnection::new(a, &descs(), config());
        let mconn_b = MConnection::new(b, &descs(), config());
        let recorder = Arc::new(Recorder::default());
        mconn_a.start(recorder.clone()).unwrap();
        mconn_b.start(Arc::new(Recorder::default())).unwrap();

        mconn_b.stop();
        tokio::time::timeout(Duration::from_secs(5), recorder.failed.notified())
            .await
            .expect("no error reported");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(mconn_a.is_stopped());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_by_receiver() {
        let (a, b) = secret_pair().await;
        let mconn_a = MConnection::new(a, &descs(), config());
        let mconn_b = MConnection::new(b, &descs(), config());
        let recorder = Arc::new(Recorder::default());
        mconn_a.start(Arc::new(Recorder::default())).unwrap();
        mconn_b.start(recorder.clone()).unwrap();

        assert!(mconn_a.sender().send(0x20, Bytes::from(vec![0u8; 5000])).await);
        tokio::time::timeout(Duration::from_secs(5), recorder.failed.notified())
            .await
            .expect("no error reported");
        assert!(recorder.errors.lock()[0].contains("exceeds 4096 bytes"));
    }

    #[tokio::test]
    async fn test_ping_pong_keeps_connection_alive() {
        let (a, b) = secret_pair().await;
        let fast = MConnConfig {
            ping_interval: Duration::from_millis(20),
            pong_timeout: Duration::from_millis(200),
            ..config()
        };
        let mconn_a = MConnection::new(a, &descs(), fast.clone());
        let mconn_b = MConnection::new(b, &descs(), fast);
        let recorder = Arc::new(Recorder::default());
        mconn_a.start(recorder.clone()).unwrap();
        mconn_b.start(Arc::new(Recorder::default())).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(recorder.errors.lock().is_empty());
        assert!(!mconn_a.is_stopped());
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate channel id")]
    async fn test_duplicate_channel_panics() {
        let (a, _b) = secret_pair().await;
        let descs = vec![ChannelDescriptor::new(1), ChannelDescriptor::new(1)];
        let _ = MConnection::new(a, &descs, config());
    }
}
