//! Core types shared by the herald state machines: local time, link direction and
//! state-machine outputs.
#![warn(missing_docs)]
use std::fmt;
use std::net;
use std::sync::Arc;

pub mod time;

pub use time::{LocalDuration, LocalTime};

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of a protocol state machine.
///
/// `M` is the message type written to peers, `E` the event type and `D` the
/// reason given when disconnecting a peer.
#[derive(Debug, Clone)]
pub enum Io<M, E, D> {
    /// A message is ready to be sent to a peer.
    Write(net::SocketAddr, M),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Disconnect reason, as seen by the state machine.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error with an underlying established connection.
    ConnectionError(Arc<std::io::Error>),
    /// Peer was disconnected by the state machine itself.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    /// Check whether the disconnect was caused by a connection error.
    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A network protocol state machine.
///
/// State machines are *I/O-free*: they are fed inputs through the methods below, and
/// produce outputs that are drained through the [`Iterator`] implementation. The reactor
/// driving the state machine is responsible for all socket and timer I/O.
pub trait StateMachine: Iterator<Item = Io<Self::Message, Self::Event, Self::DisconnectReason>> {
    /// Message type sent and received by the state machine.
    type Message;
    /// Events emitted by the state machine.
    type Event: fmt::Debug;
    /// Reason a peer was disconnected.
    type DisconnectReason: fmt::Debug + fmt::Display;

    /// Initialize the state machine. Called once before any other input.
    fn initialize(&mut self, _time: LocalTime) {}
    /// Received a message from a peer.
    fn message_received(&mut self, addr: &net::SocketAddr, message: Self::Message);
    /// New connection with a peer, after the handshake has completed.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);
    /// Disconnected from peer.
    fn disconnected(&mut self, addr: &net::SocketAddr, reason: Disconnect<Self::DisconnectReason>);
    /// Used to update the state machine's internal clock.
    fn tick(&mut self, local_time: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    fn timer_expired(&mut self);
}
