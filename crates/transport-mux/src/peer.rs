//! A negotiated connection and the multiplexer on its control channel.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::CodecError;
use crate::config::MuxConfig;
use crate::mux::{ControlEvent, ControlLink, Mux, VirtualChannel};
use crate::negotiate::{NegotiateError, Negotiator};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("control channel closed")]
    ChannelClosed,
    #[error("control channel send failed: {0}")]
    Link(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Negotiate(#[from] NegotiateError),
}

/// Callbacks installed on a control data channel while it is being negotiated.
///
/// Frames are buffered from the moment the channel exists, so nothing the
/// remote sends between open and the multiplexer starting is lost.
pub(crate) struct ControlAttachment {
    pub(crate) channel: Arc<RTCDataChannel>,
    pub(crate) events: mpsc::UnboundedReceiver<ControlEvent>,
    pub(crate) ready: oneshot::Receiver<Result<(), String>>,
}

impl ControlAttachment {
    pub(crate) fn attach(channel: Arc<RTCDataChannel>) -> Self {
        let (ready_tx, ready) = oneshot::channel();
        let ready_signal = Arc::new(Mutex::new(Some(ready_tx)));
        let (events_tx, events) = mpsc::unbounded_channel();

        let signal = Arc::clone(&ready_signal);
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                if let Some(tx) = signal.lock().take() {
                    let _ = tx.send(Ok(()));
                }
            })
        }));

        let signal = Arc::clone(&ready_signal);
        channel.on_error(Box::new(move |err| {
            let signal = Arc::clone(&signal);
            Box::pin(async move {
                warn!(target: "mux", error = %err, "control channel error");
                if let Some(tx) = signal.lock().take() {
                    let _ = tx.send(Err(err.to_string()));
                }
            })
        }));

        let frames = events_tx.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = frames.send(ControlEvent::Frame(msg.data));
            Box::pin(async {})
        }));

        channel.on_close(Box::new(move || {
            let signal = Arc::clone(&ready_signal);
            let events = events_tx.clone();
            Box::pin(async move {
                trace!(target: "mux", "control channel closed");
                if let Some(tx) = signal.lock().take() {
                    let _ = tx.send(Err("closed before opening".to_string()));
                }
                let _ = events.send(ControlEvent::Closed);
            })
        }));

        Self {
            channel,
            events,
            ready,
        }
    }
}

/// A connected peer.
///
/// Clones share the same connection and multiplexer. Nested connections are
/// negotiated over virtual channels on the control channel: [`Peer::offer`]
/// starts one, the inbound offer handler answers the remote's.
#[derive(Clone)]
pub struct Peer {
    connection: Arc<RTCPeerConnection>,
    mux: Arc<Mux>,
    config: Arc<MuxConfig>,
}

impl Peer {
    /// Starts the dispatch loop for an opened control channel.
    pub(crate) fn start(
        connection: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
        config: Arc<MuxConfig>,
    ) -> Self {
        let link: Arc<dyn ControlLink> = channel;
        let mux = Mux::new(link, Arc::clone(&config));

        let closer = Arc::clone(&connection);
        tokio::spawn(Arc::clone(&mux).pump(events, move || {
            let connection = Arc::clone(&closer);
            async move {
                debug!(target: "mux", "closing peer connection");
                if let Err(err) = connection.close().await {
                    warn!(target: "mux", error = %err, "peer connection close failed");
                }
            }
        }));

        Self {
            connection,
            mux,
            config,
        }
    }

    /// Installs the handler for the remote's nested offers, replacing the
    /// previous one. The handler receives the offer's label and its channel,
    /// typically passed to [`Negotiator::answer`] in a spawned task.
    pub fn set_on_inbound_offer<F>(&self, handler: F)
    where
        F: Fn(String, Arc<VirtualChannel>) + Send + Sync + 'static,
    {
        self.mux.set_on_inbound_offer(Arc::new(handler));
    }

    /// Negotiates `connection` as a nested connection, acting as the offerer.
    pub async fn offer(
        &self,
        connection: Arc<RTCPeerConnection>,
        label: &str,
    ) -> Result<Peer, PeerError> {
        let channel = self.mux.open(label).await?;
        debug!(target: "mux", port = channel.port(), label, "negotiating nested connection");
        let negotiator = Negotiator::with_config(Arc::clone(&self.config));
        Ok(negotiator.offer(connection, channel).await?)
    }

    /// Asks the remote to close; both connections close once it acknowledges,
    /// or once the control channel goes away while the request is pending.
    pub async fn close(&self) -> Result<(), PeerError> {
        match self.mux.request_close().await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(target: "mux", error = %err, "closing without acknowledgement");
                self.connection
                    .close()
                    .await
                    .map_err(|err| PeerError::Link(err.to_string()))
            }
        }
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.connection.connection_state()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }
}
