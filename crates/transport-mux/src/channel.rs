//! Bidirectional, closable signal channels.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::signal::SignalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("signal channel closed")]
    Closed,
    #[error("end of signal stream")]
    EndOfStream,
}

/// Carries signal messages between the two sides of one negotiation.
///
/// `recv` waits until a message arrives or the channel is closed, in which
/// case it reports [`ChannelError::EndOfStream`]. `close` is idempotent and
/// wakes every pending `recv`.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), ChannelError>;
    async fn recv(&self) -> Result<SignalMessage, ChannelError>;
    async fn close(&self);
}

/// One end of an in-memory signal pipe, see [`pipe`].
pub struct PipeEnd {
    tx: mpsc::Sender<SignalMessage>,
    rx: AsyncMutex<mpsc::Receiver<SignalMessage>>,
    closed: CancellationToken,
    remote_closed: CancellationToken,
}

/// Creates two cross-wired channel ends.
///
/// Each direction is a single-slot hand-off. Closing an end fails its own
/// `send`/`recv` immediately; the other end still receives every message
/// already handed off before it observes `EndOfStream`.
pub fn pipe() -> (Arc<PipeEnd>, Arc<PipeEnd>) {
    let (left_tx, right_rx) = mpsc::channel(1);
    let (right_tx, left_rx) = mpsc::channel(1);
    let left_closed = CancellationToken::new();
    let right_closed = CancellationToken::new();

    let left = PipeEnd {
        tx: left_tx,
        rx: AsyncMutex::new(left_rx),
        closed: left_closed.clone(),
        remote_closed: right_closed.clone(),
    };
    let right = PipeEnd {
        tx: right_tx,
        rx: AsyncMutex::new(right_rx),
        closed: right_closed,
        remote_closed: left_closed,
    };
    (Arc::new(left), Arc::new(right))
}

impl PipeEnd {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl SignalChannel for PipeEnd {
    async fn send(&self, message: SignalMessage) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() || self.remote_closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            _ = self.remote_closed.cancelled() => Err(ChannelError::Closed),
            sent = self.tx.send(message) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    async fn recv(&self) -> Result<SignalMessage, ChannelError> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ChannelError::EndOfStream),
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::EndOfStream),
            message = rx.recv() => message.ok_or(ChannelError::EndOfStream),
            _ = self.remote_closed.cancelled() => Err(ChannelError::EndOfStream),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
