//! Virtual signal channels multiplexed over one control channel.
//!
//! Every nested negotiation gets a [`VirtualChannel`] keyed by a random
//! 32-bit port. Signal messages travel inside control `signal` frames and are
//! routed to the channel registered at their port. The port table allows at
//! most one registration per port.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;

use crate::channel::{ChannelError, SignalChannel};
use crate::codec::Envelope;
use crate::config::MuxConfig;
use crate::control::{Accept, CloseAck, Closing, Connect, ControlMessage, Reject, Signal};
use crate::peer::PeerError;
use crate::signal::SignalMessage;

/// Receives `(label, channel)` for every accepted inbound offer.
///
/// Called from the dispatch loop; implementations must not block and should
/// spawn the answering negotiation.
pub type OfferHandler = Arc<dyn Fn(String, Arc<VirtualChannel>) + Send + Sync>;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// Sends text frames on a peer's control channel.
#[async_trait]
pub trait ControlLink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), String>;

    /// Waits until frames already sent have left the local buffer.
    async fn flush(&self) {}
}

#[async_trait]
impl ControlLink for RTCDataChannel {
    async fn send_text(&self, text: String) -> Result<(), String> {
        RTCDataChannel::send_text(self, text)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    async fn flush(&self) {
        let drained = tokio::time::timeout(FLUSH_TIMEOUT, async {
            while self.buffered_amount().await > 0 {
                tokio::time::sleep(FLUSH_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            trace!(target: "mux", "control channel still buffering after flush timeout");
        }
    }
}

/// Inbound traffic of a control channel, in arrival order.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    Frame(Bytes),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Continue,
    CloseConnection,
}

enum Inbound {
    Accepted,
    Signal(SignalMessage),
}

enum Acceptance {
    Accepted,
    Rejected,
    Closed,
}

/// The port table's view of a virtual channel.
struct Slot {
    lifetime: CancellationToken,
    inbox: Mutex<Option<mpsc::Sender<Inbound>>>,
}

impl Slot {
    async fn deliver(&self, item: Inbound) {
        let Some(inbox) = self.inbox.lock().clone() else {
            return;
        };
        // Blocks dispatch while the inbox is full.
        tokio::select! {
            _ = self.lifetime.cancelled() => {}
            _ = inbox.send(item) => {}
        }
    }

    fn seal(&self) {
        self.inbox.lock().take();
    }
}

pub(crate) struct Mux {
    link: Arc<dyn ControlLink>,
    send_lock: AsyncMutex<()>,
    channels: DashMap<u32, Arc<Slot>>,
    on_offer: RwLock<OfferHandler>,
    closing: AtomicBool,
    config: Arc<MuxConfig>,
}

impl Mux {
    pub(crate) fn new(link: Arc<dyn ControlLink>, config: Arc<MuxConfig>) -> Arc<Self> {
        Arc::new(Self {
            link,
            send_lock: AsyncMutex::new(()),
            channels: DashMap::new(),
            on_offer: RwLock::new(default_offer_handler(config.offer_grace)),
            closing: AtomicBool::new(false),
            config,
        })
    }

    pub(crate) fn set_on_inbound_offer(&self, handler: OfferHandler) {
        *self.on_offer.write() = handler;
    }

    pub(crate) async fn send_control(&self, message: &ControlMessage) -> Result<(), PeerError> {
        let frame = message.encode()?;
        let _guard = self.send_lock.lock().await;
        self.link.send_text(frame).await.map_err(PeerError::Link)
    }

    /// Sends `closing`. From then on the connection is also closed when the
    /// control channel goes away before the acknowledgement arrives.
    pub(crate) async fn request_close(&self) -> Result<(), PeerError> {
        self.closing.store(true, Ordering::SeqCst);
        self.send_control(&ControlMessage::Closing(Closing {})).await
    }

    /// Opens a virtual channel the remote has accepted, for a nested offer.
    pub(crate) async fn open(self: &Arc<Self>, label: &str) -> Result<Arc<VirtualChannel>, PeerError> {
        self.open_with_ports(label, rand::random::<u32>).await
    }

    pub(crate) async fn open_with_ports<P>(
        self: &Arc<Self>,
        label: &str,
        mut next_port: P,
    ) -> Result<Arc<VirtualChannel>, PeerError>
    where
        P: FnMut() -> u32 + Send,
    {
        loop {
            let port = next_port();
            let Some(channel) = self.register(port) else {
                trace!(target: "mux", port, "port already registered, drawing another");
                continue;
            };

            let connect = ControlMessage::Connect(Connect {
                port,
                label: label.to_string(),
            });
            if let Err(err) = self.send_control(&connect).await {
                channel.shutdown();
                return Err(err);
            }

            match channel.await_acceptance().await {
                Acceptance::Accepted => {
                    debug!(target: "mux", port, label, "nested offer accepted");
                    return Ok(channel);
                }
                Acceptance::Rejected => {
                    debug!(target: "mux", port, label, "nested offer rejected, retrying on a fresh port");
                    channel.shutdown();
                }
                Acceptance::Closed => {
                    channel.shutdown();
                    return Err(PeerError::ChannelClosed);
                }
            }
        }
    }

    /// Registers a fresh channel at `port` unless one is already there.
    fn register(self: &Arc<Self>, port: u32) -> Option<Arc<VirtualChannel>> {
        match self.channels.entry(port) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.config.inbox_depth.max(1));
                let slot = Arc::new(Slot {
                    lifetime: CancellationToken::new(),
                    inbox: Mutex::new(Some(tx)),
                });
                entry.insert(Arc::clone(&slot));
                Some(Arc::new(VirtualChannel {
                    port,
                    mux: Arc::clone(self),
                    slot,
                    inbox: AsyncMutex::new(rx),
                }))
            }
        }
    }

    fn deregister(&self, port: u32, slot: &Arc<Slot>) {
        self.channels
            .remove_if(&port, |_, registered| Arc::ptr_eq(registered, slot));
    }

    fn slot(&self, port: u32) -> Option<Arc<Slot>> {
        self.channels.get(&port).map(|entry| Arc::clone(entry.value()))
    }

    /// Closes every registered channel.
    pub(crate) fn close_all(&self) {
        let slots: Vec<(u32, Arc<Slot>)> = self
            .channels
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (port, slot) in slots {
            slot.lifetime.cancel();
            self.deregister(port, &slot);
        }
    }

    /// Handles one inbound control frame.
    pub(crate) async fn dispatch(self: &Arc<Self>, frame: &[u8]) -> Directive {
        let message = match ControlMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "mux", error = %err, "dropping undecodable control frame");
                return Directive::Continue;
            }
        };
        trace!(target: "mux", kind = message.kind(), "control frame");

        match message {
            ControlMessage::Closing(_) => {
                if let Err(err) = self
                    .send_control(&ControlMessage::CloseAck(CloseAck {}))
                    .await
                {
                    warn!(target: "mux", error = %err, "failed to acknowledge close");
                }
                // The ack must reach the wire before the connection tears down.
                self.link.flush().await;
                Directive::CloseConnection
            }
            ControlMessage::CloseAck(_) => Directive::CloseConnection,
            ControlMessage::Connect(Connect { port, label }) => {
                self.accept_inbound(port, label).await;
                Directive::Continue
            }
            ControlMessage::Accept(Accept { port }) => {
                match self.slot(port) {
                    Some(slot) => slot.deliver(Inbound::Accepted).await,
                    None => trace!(target: "mux", port, "accept for unknown port"),
                }
                Directive::Continue
            }
            ControlMessage::Reject(Reject { port }) => {
                match self.channels.remove(&port) {
                    Some((_, slot)) => slot.seal(),
                    None => trace!(target: "mux", port, "reject for unknown port"),
                }
                Directive::Continue
            }
            ControlMessage::Signal(Signal { port, message }) => {
                match self.slot(port) {
                    Some(slot) => slot.deliver(Inbound::Signal(message)).await,
                    None => trace!(target: "mux", port, "signal for unknown port"),
                }
                Directive::Continue
            }
        }
    }

    async fn accept_inbound(self: &Arc<Self>, port: u32, label: String) {
        let Some(channel) = self.register(port) else {
            debug!(target: "mux", port, %label, "port collision on inbound offer, rejecting");
            if let Err(err) = self
                .send_control(&ControlMessage::Reject(Reject { port }))
                .await
            {
                warn!(target: "mux", port, error = %err, "failed to reject inbound offer");
            }
            return;
        };

        if let Err(err) = self
            .send_control(&ControlMessage::Accept(Accept { port }))
            .await
        {
            warn!(target: "mux", port, error = %err, "failed to accept inbound offer");
            channel.shutdown();
            return;
        }

        // Whichever handler is installed right now takes the offer.
        let handler = Arc::clone(&self.on_offer.read());
        debug!(target: "mux", port, %label, "inbound offer accepted");
        handler(label, channel);
    }

    /// Dispatch loop: consumes control events until the control channel closes,
    /// then tears down every virtual channel.
    ///
    /// A control channel that closes after a local close request closes the
    /// connection too, since the acknowledgement can no longer arrive.
    pub(crate) async fn pump<F, Fut>(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
        mut close_connection: F,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut connection_closed = false;
        while let Some(event) = events.recv().await {
            match event {
                ControlEvent::Frame(frame) => {
                    if self.dispatch(&frame).await == Directive::CloseConnection
                        && !connection_closed
                    {
                        connection_closed = true;
                        close_connection().await;
                    }
                }
                ControlEvent::Closed => {
                    if self.closing.load(Ordering::SeqCst) && !connection_closed {
                        debug!(target: "mux", "control channel closed before close-ack");
                        close_connection().await;
                    }
                    break;
                }
            }
        }
        debug!(
            target: "mux",
            channels = self.channels.len(),
            "control channel closed, closing virtual channels"
        );
        self.close_all();
    }
}

fn default_offer_handler(grace: Duration) -> OfferHandler {
    Arc::new(move |label: String, channel: Arc<VirtualChannel>| {
        debug!(
            target: "mux",
            port = channel.port(),
            %label,
            grace_ms = grace.as_millis() as u64,
            "no inbound offer handler installed"
        );
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let reason = format!("no handler accepted offer {label:?}");
            if let Err(err) = channel.send(SignalMessage::abort(reason)).await {
                trace!(
                    target: "mux",
                    port = channel.port(),
                    error = %err,
                    "abort for unhandled offer not sent"
                );
            }
            channel.close().await;
        });
    })
}

/// A signal channel tunnelled through a peer's control channel.
///
/// Dropping or closing it removes its port registration.
pub struct VirtualChannel {
    port: u32,
    mux: Arc<Mux>,
    slot: Arc<Slot>,
    inbox: AsyncMutex<mpsc::Receiver<Inbound>>,
}

impl VirtualChannel {
    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lifetime.is_cancelled()
    }

    fn shutdown(&self) {
        self.slot.lifetime.cancel();
        self.mux.deregister(self.port, &self.slot);
    }

    async fn await_acceptance(&self) -> Acceptance {
        let mut inbox = self.inbox.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = self.slot.lifetime.cancelled() => return Acceptance::Closed,
                item = inbox.recv() => match item {
                    Some(Inbound::Accepted) => return Acceptance::Accepted,
                    Some(Inbound::Signal(_)) => {
                        trace!(target: "mux", port = self.port, "signal before accept, dropping");
                    }
                    None => return Acceptance::Rejected,
                },
            }
        }
    }
}

#[async_trait]
impl SignalChannel for VirtualChannel {
    async fn send(&self, message: SignalMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let frame = ControlMessage::Signal(Signal {
            port: self.port,
            message,
        });
        self.mux.send_control(&frame).await.map_err(|err| {
            debug!(target: "mux", port = self.port, error = %err, "virtual channel send failed");
            ChannelError::Closed
        })
    }

    async fn recv(&self) -> Result<SignalMessage, ChannelError> {
        let mut inbox = tokio::select! {
            biased;
            _ = self.slot.lifetime.cancelled() => return Err(ChannelError::EndOfStream),
            guard = self.inbox.lock() => guard,
        };
        loop {
            tokio::select! {
                biased;
                _ = self.slot.lifetime.cancelled() => return Err(ChannelError::EndOfStream),
                item = inbox.recv() => match item {
                    Some(Inbound::Signal(message)) => return Ok(message),
                    Some(Inbound::Accepted) => continue,
                    None => return Err(ChannelError::EndOfStream),
                },
            }
        }
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MemoryLink {
        remote: mpsc::UnboundedSender<ControlEvent>,
    }

    #[async_trait]
    impl ControlLink for MemoryLink {
        async fn send_text(&self, text: String) -> Result<(), String> {
            self.remote
                .send(ControlEvent::Frame(Bytes::from(text)))
                .map_err(|_| "link closed".to_string())
        }
    }

    struct Side {
        mux: Arc<Mux>,
        events: mpsc::UnboundedSender<ControlEvent>,
        closes: Arc<AtomicUsize>,
    }

    fn linked(config: MuxConfig) -> (Side, Side) {
        let config = Arc::new(config);
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let left = Mux::new(
            Arc::new(MemoryLink {
                remote: right_tx.clone(),
            }),
            Arc::clone(&config),
        );
        let right = Mux::new(
            Arc::new(MemoryLink {
                remote: left_tx.clone(),
            }),
            config,
        );
        (
            spawn_side(left, left_tx, left_rx),
            spawn_side(right, right_tx, right_rx),
        )
    }

    fn spawn_side(
        mux: Arc<Mux>,
        events: mpsc::UnboundedSender<ControlEvent>,
        inbound: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Side {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        tokio::spawn(Arc::clone(&mux).pump(inbound, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        }));
        Side {
            mux,
            events,
            closes,
        }
    }

    /// Records every send, flush and connection close in order.
    struct RecordingLink {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ControlLink for RecordingLink {
        async fn send_text(&self, text: String) -> Result<(), String> {
            let kind = ControlMessage::decode(text.as_bytes())
                .map(|message| message.kind())
                .map_err(|err| err.to_string())?;
            self.log.lock().push(format!("send:{kind}"));
            Ok(())
        }

        async fn flush(&self) {
            self.log.lock().push("flush".to_string());
        }
    }

    struct Recorded {
        mux: Arc<Mux>,
        events: mpsc::UnboundedSender<ControlEvent>,
        pump: tokio::task::JoinHandle<()>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn recorded() -> Recorded {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mux = Mux::new(
            Arc::new(RecordingLink {
                log: Arc::clone(&log),
            }),
            Arc::new(MuxConfig::default()),
        );
        let (events, inbound) = mpsc::unbounded_channel();
        let closes = Arc::clone(&log);
        let pump = tokio::spawn(Arc::clone(&mux).pump(inbound, move || {
            closes.lock().push("close".to_string());
            async {}
        }));
        Recorded {
            mux,
            events,
            pump,
            log,
        }
    }

    fn frame(message: ControlMessage) -> ControlEvent {
        ControlEvent::Frame(Bytes::from(message.encode().expect("encode")))
    }

    fn collect_offers(side: &Side) -> mpsc::UnboundedReceiver<(String, Arc<VirtualChannel>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        side.mux.set_on_inbound_offer(Arc::new(move |label, channel| {
            let _ = tx.send((label, channel));
        }));
        rx
    }

    fn ports(sequence: Vec<u32>) -> impl FnMut() -> u32 + Send {
        let mut sequence = sequence.into_iter();
        move || sequence.next().expect("test ran out of ports")
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn accepted_offer_tunnels_signals_both_ways() {
        let (left, right) = linked(MuxConfig::default());
        let mut offers = collect_offers(&right);

        let outbound = left.mux.open("svc").await.expect("open");
        let (label, inbound) = offers.recv().await.expect("inbound offer");
        assert_eq!(label, "svc");
        assert_eq!(inbound.port(), outbound.port());

        outbound
            .send(SignalMessage::abort("ping"))
            .await
            .expect("send");
        assert_eq!(inbound.recv().await, Ok(SignalMessage::abort("ping")));

        inbound
            .send(SignalMessage::abort("pong"))
            .await
            .expect("send");
        assert_eq!(outbound.recv().await, Ok(SignalMessage::abort("pong")));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn port_collision_draws_a_new_port() {
        let (left, right) = linked(MuxConfig::default());
        let _offers = collect_offers(&right);

        let held = left.mux.register(7).expect("register");
        let opened = left
            .mux
            .open_with_ports("svc", ports(vec![7, 8]))
            .await
            .expect("open");

        assert_eq!(opened.port(), 8);
        let registered = left.mux.slot(7).expect("port 7 still registered");
        assert!(Arc::ptr_eq(&registered, &held.slot));
        assert!(!held.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn rejected_offer_retries_on_a_fresh_port() {
        let (left, right) = linked(MuxConfig::default());
        let mut offers = collect_offers(&right);

        let _taken = right.mux.register(7).expect("register");
        let opened = left
            .mux
            .open_with_ports("svc", ports(vec![7, 9]))
            .await
            .expect("open");

        assert_eq!(opened.port(), 9);
        assert!(left.mux.slot(7).is_none());
        let (_, inbound) = offers.recv().await.expect("inbound offer");
        assert_eq!(inbound.port(), 9);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn full_inbox_stalls_dispatch_until_drained() {
        let (left, right) = linked(MuxConfig::default().with_inbox_depth(10));
        let mut offers = collect_offers(&right);

        let outbound = left.mux.open("first").await.expect("open");
        let (_, inbound) = offers.recv().await.expect("inbound offer");

        let sent: Vec<_> = (0..12)
            .map(|n| SignalMessage::abort(format!("{n}")))
            .collect();
        for message in &sent {
            outbound.send(message.clone()).await.expect("send");
        }

        let second = tokio::spawn({
            let mux = Arc::clone(&left.mux);
            async move { mux.open("second").await.map(|channel| channel.port()) }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished(), "dispatch kept running past a full inbox");

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(inbound.recv().await.expect("recv"));
        }
        assert_eq!(received, sent);

        let port = second.await.expect("task").expect("second open");
        let (label, channel) = offers.recv().await.expect("second inbound offer");
        assert_eq!(label, "second");
        assert_eq!(channel.port(), port);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_is_acknowledged_and_closes_both_connections() {
        let (left, right) = linked(MuxConfig::default());

        left.mux.request_close().await.expect("request close");

        while left.closes.load(Ordering::SeqCst) == 0 || right.closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(left.closes.load(Ordering::SeqCst), 1);
        assert_eq!(right.closes.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_ack_is_flushed_before_the_connection_closes() {
        let side = recorded();

        side.events
            .send(frame(ControlMessage::Closing(Closing {})))
            .expect("inject closing");
        side.events.send(ControlEvent::Closed).expect("inject close");
        side.pump.await.expect("pump");

        assert_eq!(*side.log.lock(), vec!["send:close-ack", "flush", "close"]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn requester_closes_when_the_ack_never_arrives() {
        let side = recorded();

        side.mux.request_close().await.expect("request close");
        side.events.send(ControlEvent::Closed).expect("inject close");
        side.pump.await.expect("pump");

        assert_eq!(*side.log.lock(), vec!["send:closing", "close"]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn requester_closes_once_when_ack_and_control_close_both_arrive() {
        let side = recorded();

        side.mux.request_close().await.expect("request close");
        side.events
            .send(frame(ControlMessage::CloseAck(CloseAck {})))
            .expect("inject close-ack");
        side.events.send(ControlEvent::Closed).expect("inject close");
        side.pump.await.expect("pump");

        assert_eq!(*side.log.lock(), vec!["send:closing", "close"]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn control_close_without_a_request_leaves_the_connection_alone() {
        let side = recorded();

        side.events.send(ControlEvent::Closed).expect("inject close");
        side.pump.await.expect("pump");

        assert!(side.log.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn control_close_tears_down_every_channel() {
        let (left, right) = linked(MuxConfig::default());
        let _offers = collect_offers(&right);

        let first = left.mux.open("a").await.expect("open");
        let second = left.mux.open("b").await.expect("open");
        let waiter = tokio::spawn({
            let first = Arc::clone(&first);
            async move { first.recv().await }
        });

        left.events.send(ControlEvent::Closed).expect("inject close");

        assert_eq!(
            waiter.await.expect("waiter"),
            Err(ChannelError::EndOfStream)
        );
        assert_eq!(second.recv().await, Err(ChannelError::EndOfStream));
        assert_eq!(
            second.send(SignalMessage::abort("late")).await,
            Err(ChannelError::Closed)
        );
        assert!(left.mux.channels.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unhandled_offer_is_aborted_after_grace() {
        let config = MuxConfig::default().with_offer_grace(Duration::from_millis(50));
        let (left, right) = linked(config);

        let outbound = left.mux.open("nobody").await.expect("open");
        match outbound.recv().await {
            Ok(SignalMessage::Abort(abort)) => assert!(abort.reason.contains("nobody")),
            other => panic!("expected abort, got {other:?}"),
        }
        while !right.mux.channels.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unhandled_offer_on_a_closed_control_sends_nothing() {
        let config = MuxConfig::default().with_offer_grace(Duration::from_millis(100));
        let (left, right) = linked(config);

        let outbound = left.mux.open("nobody").await.expect("open");
        right.events.send(ControlEvent::Closed).expect("inject close");

        let late = tokio::time::timeout(Duration::from_millis(400), outbound.recv()).await;
        assert!(late.is_err(), "unexpected {late:?}");
        assert!(right.mux.channels.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stray_frames_are_ignored() {
        let (left, _right) = linked(MuxConfig::default());

        assert_eq!(left.mux.dispatch(b"not json").await, Directive::Continue);
        assert_eq!(
            left.mux.dispatch(br#"{"kind":"bogus"}"#).await,
            Directive::Continue
        );
        let stale = [
            ControlMessage::Accept(Accept { port: 5 }),
            ControlMessage::Reject(Reject { port: 5 }),
            ControlMessage::Signal(Signal {
                port: 5,
                message: SignalMessage::abort("stale"),
            }),
        ];
        for message in stale {
            let frame = message.encode().expect("encode");
            assert_eq!(
                left.mux.dispatch(frame.as_bytes()).await,
                Directive::Continue
            );
        }
        assert!(left.mux.channels.is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_a_channel_twice_is_harmless() {
        let (left, _right) = linked(MuxConfig::default());

        let stale = left.mux.register(11).expect("register");
        stale.close().await;
        stale.close().await;
        assert_eq!(stale.recv().await, Err(ChannelError::EndOfStream));

        let fresh = left.mux.register(11).expect("port free again");
        stale.close().await;
        let registered = left.mux.slot(11).expect("fresh registration kept");
        assert!(Arc::ptr_eq(&registered, &fresh.slot));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn latest_offer_handler_wins() {
        let (left, right) = linked(MuxConfig::default());
        let mut stale = collect_offers(&right);
        let mut current = collect_offers(&right);

        let _outbound = left.mux.open("svc").await.expect("open");
        let (label, _channel) = current.recv().await.expect("current handler");
        assert_eq!(label, "svc");
        assert!(stale.try_recv().is_err());
    }
}
