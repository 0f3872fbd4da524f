//! WebRTC signalling negotiation and nested connection multiplexing.
//!
//! [`negotiate::offer`] and [`negotiate::answer`] run the offer/answer
//! exchange for a peer connection over any [`SignalChannel`], producing a
//! [`Peer`]. Each peer carries a pre-negotiated control data channel that
//! multiplexes virtual signal channels, so further connections can be
//! negotiated through an existing one with [`Peer::offer`] and answered from
//! the handler installed with [`Peer::set_on_inbound_offer`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod control;
pub mod loopback;
mod mux;
pub mod negotiate;
pub mod peer;
pub mod signal;

pub use channel::{pipe, ChannelError, PipeEnd, SignalChannel};
pub use codec::{CodecError, Envelope};
pub use config::MuxConfig;
pub use control::ControlMessage;
pub use loopback::{LoopbackError, VirtualLan};
pub use mux::{ControlLink, OfferHandler, VirtualChannel};
pub use negotiate::{answer, dial, offer, NegotiateError, Negotiator};
pub use peer::{Peer, PeerError};
pub use signal::SignalMessage;
