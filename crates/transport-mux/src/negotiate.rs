//! Offer/answer negotiation over a [`SignalChannel`].
//!
//! A run exchanges one session description each way and trickles ICE
//! candidates until the connection reaches `Connected`, then waits for the
//! pre-negotiated control data channel to open and hands back a [`Peer`].
//! Either side may abort: the remote learns the reason through an `abort`
//! message, the local caller through the returned [`NegotiateError`].

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::SignalChannel;
use crate::config::MuxConfig;
use crate::peer::{ControlAttachment, Peer};
use crate::signal::{Abort, Candidate, Sdp, SignalMessage};

const ABORT_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiateError {
    #[error("remote abort: {0}")]
    RemoteAbort(String),
    #[error("{context}: {reason}")]
    LocalFailure { context: &'static str, reason: String },
    #[error("signal channel closed before the connection was established")]
    UnexpectedClose,
    #[error("control channel failed to open: {0}")]
    ControlChannelFailed(String),
}

impl NegotiateError {
    pub(crate) fn local(context: &'static str, reason: impl std::fmt::Display) -> Self {
        NegotiateError::LocalFailure {
            context,
            reason: reason.to_string(),
        }
    }
}

/// Shared state of one negotiation run.
struct Run {
    channel: Arc<dyn SignalChannel>,
    outcome: OnceLock<NegotiateError>,
}

impl Run {
    /// Stores `err` unless a failure is already recorded. Returns the retained
    /// failure and whether `err` was the one kept.
    fn record(&self, err: NegotiateError) -> (NegotiateError, bool) {
        match self.outcome.set(err.clone()) {
            Ok(()) => (err, true),
            Err(_) => (self.outcome.get().cloned().unwrap_or(err), false),
        }
    }

    fn outcome(&self) -> Option<NegotiateError> {
        self.outcome.get().cloned()
    }

    /// Records a local failure, tells the remote about it, and closes the
    /// channel. Only the first failure is reported to the remote.
    async fn abort(&self, err: NegotiateError) -> NegotiateError {
        let (err, first) = self.record(err);
        if first {
            self.notify(&err).await;
        }
        self.channel.close().await;
        err
    }

    /// Like [`Run::abort`] but usable from synchronous callbacks.
    fn abort_detached(self: &Arc<Self>, err: NegotiateError) {
        let (err, first) = self.record(err);
        let run = Arc::clone(self);
        tokio::spawn(async move {
            if first {
                run.notify(&err).await;
            }
            run.channel.close().await;
        });
    }

    async fn notify(&self, err: &NegotiateError) {
        debug!(target: "negotiate", error = %err, "aborting negotiation");
        let notice = self.channel.send(SignalMessage::abort(err.to_string()));
        match tokio::time::timeout(ABORT_NOTICE_TIMEOUT, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(target: "negotiate", error = %err, "abort notice not delivered"),
            Err(_) => trace!(target: "negotiate", "abort notice timed out"),
        }
    }
}

/// Negotiates connections with a fixed [`MuxConfig`].
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    config: Arc<MuxConfig>,
}

impl Negotiator {
    pub fn new(config: MuxConfig) -> Self {
        Self::with_config(Arc::new(config))
    }

    pub fn with_config(config: Arc<MuxConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Runs a negotiation whose local session description comes from `local`.
    ///
    /// The control data channel is created before `local` runs so that it is
    /// part of the description. The signal channel is closed when the run
    /// ends, successful or not.
    pub async fn dial<F, Fut>(
        &self,
        connection: Arc<RTCPeerConnection>,
        channel: Arc<dyn SignalChannel>,
        local: F,
    ) -> Result<Peer, NegotiateError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<RTCSessionDescription, NegotiateError>> + Send,
    {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(self.config.control_id),
            ..Default::default()
        };
        let control = match connection
            .create_data_channel(&self.config.control_label, Some(init))
            .await
        {
            Ok(control) => control,
            Err(err) => {
                channel.close().await;
                return Err(NegotiateError::local("create control channel", err));
            }
        };
        let ControlAttachment {
            channel: control,
            events,
            ready,
        } = ControlAttachment::attach(control);

        let run = Arc::new(Run {
            channel: Arc::clone(&channel),
            outcome: OnceLock::new(),
        });
        let outcome = self.drive(&connection, &run, ready, local).await;

        connection.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        connection
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        channel.close().await;

        match outcome {
            Ok(()) => {
                debug!(target: "negotiate", "negotiation complete");
                Ok(Peer::start(
                    connection,
                    control,
                    events,
                    Arc::clone(&self.config),
                ))
            }
            Err(err) => {
                debug!(target: "negotiate", error = %err, "negotiation failed");
                Err(err)
            }
        }
    }

    /// Negotiates as the offering side.
    pub async fn offer(
        &self,
        connection: Arc<RTCPeerConnection>,
        channel: Arc<dyn SignalChannel>,
    ) -> Result<Peer, NegotiateError> {
        let offerer = Arc::clone(&connection);
        self.dial(connection, channel, move || async move {
            offerer
                .create_offer(None)
                .await
                .map_err(|err| NegotiateError::local("create offer", err))
        })
        .await
    }

    /// Negotiates as the answering side: waits for the remote offer, then
    /// answers it.
    pub async fn answer(
        &self,
        connection: Arc<RTCPeerConnection>,
        channel: Arc<dyn SignalChannel>,
    ) -> Result<Peer, NegotiateError> {
        let answerer = Arc::clone(&connection);
        let signals = Arc::clone(&channel);
        self.dial(connection, channel, move || async move {
            answer_remote_offer(&answerer, signals.as_ref()).await
        })
        .await
    }

    async fn drive<F, Fut>(
        &self,
        connection: &Arc<RTCPeerConnection>,
        run: &Arc<Run>,
        ready: oneshot::Receiver<Result<(), String>>,
        local: F,
    ) -> Result<(), NegotiateError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<RTCSessionDescription, NegotiateError>> + Send,
    {
        let (candidate_tx, candidates) = mpsc::unbounded_channel::<RTCIceCandidateInit>();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(init);
                    }
                    Err(err) => {
                        warn!(target: "negotiate", error = %err, "failed to serialize local candidate")
                    }
                }
            })
        }));

        let (state_tx, mut state_rx) = watch::channel(connection.connection_state());
        let watcher = Arc::clone(run);
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                state_tx.send_replace(state);
                trace!(target: "negotiate", ?state, "peer connection state");
                let connected = match state {
                    RTCPeerConnectionState::Failed => {
                        watcher.abort_detached(NegotiateError::local("peer connection", "failed"));
                        None
                    }
                    RTCPeerConnectionState::Closed => {
                        watcher.abort_detached(NegotiateError::local("peer connection", "closed"));
                        None
                    }
                    RTCPeerConnectionState::Connected => Some(Arc::clone(&watcher)),
                    _ => None,
                };
                Box::pin(async move {
                    if let Some(run) = connected {
                        run.channel.close().await;
                    }
                })
            },
        ));

        let description = match local().await {
            Ok(description) => description,
            Err(err) => return Err(run.abort(err).await),
        };
        if let Err(err) = connection.set_local_description(description).await {
            return Err(run
                .abort(NegotiateError::local("set local description", err))
                .await);
        }
        let Some(description) = connection.local_description().await else {
            return Err(run
                .abort(NegotiateError::local("get local description", "missing"))
                .await);
        };
        if let Err(err) = run
            .channel
            .send(Sdp { data: description }.into())
            .await
        {
            return Err(run
                .abort(NegotiateError::local("send session description", err))
                .await);
        }
        tokio::spawn(forward_candidates(Arc::clone(&run.channel), candidates));

        loop {
            match run.channel.recv().await {
                Ok(SignalMessage::Abort(Abort { reason })) => {
                    debug!(target: "negotiate", %reason, "remote aborted");
                    return Err(NegotiateError::RemoteAbort(reason));
                }
                Ok(SignalMessage::Sdp(Sdp { data })) => {
                    trace!(target: "negotiate", sdp_type = %data.sdp_type, "remote session description");
                    if let Err(err) = connection.set_remote_description(data).await {
                        return Err(run
                            .abort(NegotiateError::local("set remote description", err))
                            .await);
                    }
                }
                Ok(SignalMessage::Candidate(Candidate { data })) => {
                    if let Err(err) = connection.add_ice_candidate(data).await {
                        return Err(run
                            .abort(NegotiateError::local("add remote candidate", err))
                            .await);
                    }
                }
                Err(_) => break,
            }
        }

        if let Some(err) = run.outcome() {
            return Err(err);
        }
        if connection.connection_state() == RTCPeerConnectionState::Connecting {
            // The channel can close just before the state settles.
            let _ = state_rx
                .wait_for(|state| {
                    !matches!(
                        state,
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting
                    )
                })
                .await;
        }
        if let Some(err) = run.outcome() {
            return Err(err);
        }
        if connection.connection_state() != RTCPeerConnectionState::Connected {
            return Err(NegotiateError::UnexpectedClose);
        }

        match tokio::time::timeout(self.config.control_open_timeout, ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(NegotiateError::ControlChannelFailed(reason)),
            Ok(Err(_)) => Err(NegotiateError::ControlChannelFailed(
                "channel dropped before opening".to_string(),
            )),
            Err(_) => Err(NegotiateError::ControlChannelFailed(format!(
                "not open after {}ms",
                self.config.control_open_timeout.as_millis()
            ))),
        }
    }
}

async fn answer_remote_offer(
    connection: &RTCPeerConnection,
    channel: &dyn SignalChannel,
) -> Result<RTCSessionDescription, NegotiateError> {
    loop {
        match channel.recv().await {
            Ok(SignalMessage::Sdp(Sdp { data })) => {
                connection
                    .set_remote_description(data)
                    .await
                    .map_err(|err| NegotiateError::local("set remote description", err))?;
                return connection
                    .create_answer(None)
                    .await
                    .map_err(|err| NegotiateError::local("create answer", err));
            }
            Ok(SignalMessage::Abort(Abort { reason })) => {
                return Err(NegotiateError::RemoteAbort(reason))
            }
            Ok(SignalMessage::Candidate(_)) => {
                trace!(target: "negotiate", "candidate before offer, ignoring");
            }
            Err(err) => return Err(NegotiateError::local("receive offer", err)),
        }
    }
}

/// Sends local candidates in gathering order once the local description is
/// out; stops when the channel closes or gathering handlers are reset.
async fn forward_candidates(
    channel: Arc<dyn SignalChannel>,
    mut candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
) {
    while let Some(data) = candidates.recv().await {
        if let Err(err) = channel.send(Candidate { data }.into()).await {
            trace!(target: "negotiate", error = %err, "stopped forwarding candidates");
            break;
        }
    }
}

/// [`Negotiator::offer`] with the default configuration.
pub async fn offer(
    connection: Arc<RTCPeerConnection>,
    channel: Arc<dyn SignalChannel>,
) -> Result<Peer, NegotiateError> {
    Negotiator::default().offer(connection, channel).await
}

/// [`Negotiator::answer`] with the default configuration.
pub async fn answer(
    connection: Arc<RTCPeerConnection>,
    channel: Arc<dyn SignalChannel>,
) -> Result<Peer, NegotiateError> {
    Negotiator::default().answer(connection, channel).await
}

/// [`Negotiator::dial`] with the default configuration.
pub async fn dial<F, Fut>(
    connection: Arc<RTCPeerConnection>,
    channel: Arc<dyn SignalChannel>,
    local: F,
) -> Result<Peer, NegotiateError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<RTCSessionDescription, NegotiateError>> + Send,
{
    Negotiator::default().dial(connection, channel, local).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{pipe, ChannelError};

    #[test]
    fn local_failures_name_their_step() {
        let err = NegotiateError::local("create offer", "boom");
        assert_eq!(err.to_string(), "create offer: boom");
        assert_eq!(
            NegotiateError::RemoteAbort("bye".into()).to_string(),
            "remote abort: bye"
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn first_failure_is_kept_and_reported_once() {
        let (local, remote) = pipe();
        let run = Run {
            channel: local,
            outcome: OnceLock::new(),
        };

        let reader = tokio::spawn({
            let remote = Arc::clone(&remote);
            async move {
                let mut received = Vec::new();
                while let Ok(message) = remote.recv().await {
                    received.push(message);
                }
                received
            }
        });

        let first = run
            .abort(NegotiateError::local("set local description", "bad sdp"))
            .await;
        let second = run.abort(NegotiateError::UnexpectedClose).await;

        assert_eq!(first, NegotiateError::local("set local description", "bad sdp"));
        assert_eq!(second, first);
        assert_eq!(
            reader.await.expect("reader"),
            vec![SignalMessage::abort("set local description: bad sdp")]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_connection_aborts_the_run_once() {
        let (local, remote) = pipe();
        let connection = Arc::new(
            webrtc::api::APIBuilder::new()
                .build()
                .new_peer_connection(Default::default())
                .await
                .expect("peer connection"),
        );

        let remote_task = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                match remote.recv().await {
                    Ok(SignalMessage::Sdp(_)) => {}
                    other => panic!("expected offer first, got {other:?}"),
                }
                connection.close().await.expect("close connection");
                let mut received = Vec::new();
                while let Ok(message) = remote.recv().await {
                    received.push(message);
                }
                received
            }
        });

        let result = Negotiator::default().offer(connection, local).await;
        assert!(
            matches!(
                result,
                Err(NegotiateError::LocalFailure {
                    context: "peer connection",
                    ..
                })
            ),
            "{:?}",
            result.err()
        );

        let aborts: Vec<_> = remote_task
            .await
            .expect("remote task")
            .into_iter()
            .filter(|message| matches!(message, SignalMessage::Abort(_)))
            .collect();
        assert_eq!(aborts, vec![SignalMessage::abort("peer connection: closed")]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn detached_abort_wins_over_later_failures() {
        let (local, remote) = pipe();
        let run = Arc::new(Run {
            channel: local,
            outcome: OnceLock::new(),
        });

        let reader = tokio::spawn({
            let remote = Arc::clone(&remote);
            async move {
                let mut received = Vec::new();
                while let Ok(message) = remote.recv().await {
                    received.push(message);
                }
                received
            }
        });

        run.abort_detached(NegotiateError::local("peer connection", "failed"));
        assert_eq!(
            reader.await.expect("reader"),
            vec![SignalMessage::abort("peer connection: failed")]
        );

        let later = run.abort(NegotiateError::UnexpectedClose).await;
        assert_eq!(later, NegotiateError::local("peer connection", "failed"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn answerer_ignores_early_candidates_and_honours_abort() {
        let (local, remote) = pipe();
        let connection = webrtc::api::APIBuilder::new()
            .build()
            .new_peer_connection(Default::default())
            .await
            .expect("peer connection");

        let feeder = tokio::spawn(async move {
            remote
                .send(Candidate::default().into())
                .await
                .expect("send candidate");
            remote
                .send(SignalMessage::abort("changed my mind"))
                .await
                .expect("send abort");
            remote
        });

        let err = answer_remote_offer(&connection, local.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, NegotiateError::RemoteAbort("changed my mind".into()));

        let remote = feeder.await.expect("feeder");
        remote.close().await;
        let err = answer_remote_offer(&connection, local.as_ref())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NegotiateError::local("receive offer", ChannelError::EndOfStream)
        );
        let _ = connection.close().await;
    }
}
