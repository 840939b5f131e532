//! Connection state machine as an explicit transition table.

use sessionlink_protocol::{ConnectionState, Event};

/// Outcome of feeding an event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    To(ConnectionState),
    /// The current state is terminal; the event is dropped.
    Ignored,
    /// No rule exists for this (state, event) pair.
    Unsupported,
}

/// Looks up the next state for `(state, event)`.
pub fn transition(state: ConnectionState, event: Event) -> Transition {
    use ConnectionState as S;
    use Event as E;

    match (state, event) {
        (S::DisconnectedForever, _) => Transition::Ignored,
        (_, E::FatalError) => Transition::To(S::DisconnectedForever),

        (S::Initial, E::Initialized) => Transition::To(S::PingingServer),

        (S::PingingServer, E::ServerPingSucceeded) => Transition::To(S::Connecting),

        (S::Connecting, E::ConnectionSucceeded) => Transition::To(S::Connected),
        (S::Connecting, E::ConnectionTimedOut | E::ConnectionError | E::ConnectionClosed) => {
            Transition::To(S::PingingServer)
        }

        (S::Connected, E::ConnectionClosed | E::ConnectionError) => {
            Transition::To(S::PingingServer)
        }

        _ => Transition::Unsupported,
    }
}
