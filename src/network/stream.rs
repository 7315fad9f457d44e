//! One logical channel of a connection.
//!
//! Inbound data arrives as chunks; a zero-length chunk marks the end of one
//! logical message and surfaces to readers as a read of 0 bytes.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::network::mconnection::MConnSender;

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    /// Chunk that did not fit the caller's last buffer.
    pending: Option<Bytes>,
}

struct Inner {
    id: u8,
    tx: mpsc::Sender<Bytes>,
    reader: tokio::sync::Mutex<ReadState>,
    closed: CancellationToken,
    sender: MConnSender,
}

#[derive(Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

impl Stream {
    pub(crate) fn new(id: u8, sender: MConnSender) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                id,
                tx,
                reader: tokio::sync::Mutex::new(ReadState { rx, pending: None }),
                closed: CancellationToken::new(),
                sender,
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Reads the next chunk into `buf`.
    ///
    /// Returns `Ok(0)` at the end of a logical message and
    /// `Err(StreamError::Closed)` once the stream is closed. A chunk larger
    /// than `buf` fails with `ShortBuffer` and stays queued for the next read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let closed = StreamError::Closed(self.inner.id);
        let mut state = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(closed),
            state = self.inner.reader.lock() => state,
        };

        let chunk = match state.pending.take() {
            Some(chunk) if !self.is_closed() => chunk,
            Some(_) => return Err(closed),
            None => tokio::select! {
                biased;
                _ = self.inner.closed.cancelled() => return Err(closed),
                chunk = state.rx.recv() => chunk.ok_or(closed)?,
            },
        };

        if chunk.len() > buf.len() {
            let needed = chunk.len();
            state.pending = Some(chunk);
            return Err(StreamError::ShortBuffer {
                needed,
                available: buf.len(),
            });
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Sends one complete logical message.
    pub async fn write(&self, msg: impl Into<Bytes>) -> Result<usize, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed(self.inner.id));
        }
        let msg = msg.into();
        let len = msg.len();
        if !self.inner.sender.send(self.inner.id, msg).await {
            return Err(StreamError::SendFailed(self.inner.id));
        }
        Ok(len)
    }

    /// Idempotent; wakes any pending read or receive.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            tracing::trace!(stream = self.inner.id, "Closing stream");
        }
        self.inner.closed.cancel();
    }

    /// Hands a received packet to readers, blocking until a reader takes it
    /// or the stream closes.
    pub(crate) async fn receive(&self, data: Bytes, eof: bool) -> Result<(), StreamError> {
        if !data.is_empty() {
            self.push(data).await?;
        }
        if eof {
            self.push(Bytes::new()).await?;
        }
        Ok(())
    }

    async fn push(&self, chunk: Bytes) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(StreamError::Closed(self.inner.id)),
            res = self.inner.tx.send(chunk) => res.map_err(|_| StreamError::Closed(self.inner.id)),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
