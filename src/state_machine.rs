//! Transport lifecycle state machine
//!
//! Single-writer pattern: every transition goes through [`reduce`], which
//! returns the next state and the effects the engine must run. The reducer
//! never touches the network; it only decides.
//!
//! ```text
//! uninitialized -> initializing -> initialized -> connecting -> connected -> ready
//!                                                   ^   |          |          |
//!                                           (retry) |   v          v          v
//!                                                reconnecting <----+----------+
//! any active state -> disconnecting -> disconnected
//! any active state -> error (terminal until the next connect)
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TransportError;

/// Authoritative lifecycle state of one transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
    Connecting,
    Connected,
    /// The remote side confirmed setup
    Ready,
    Reconnecting,
    Disconnecting,
    Disconnected,
    Error,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Uninitialized => "uninitialized",
            TransportState::Initializing => "initializing",
            TransportState::Initialized => "initialized",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Ready => "ready",
            TransportState::Reconnecting => "reconnecting",
            TransportState::Disconnecting => "disconnecting",
            TransportState::Disconnected => "disconnected",
            TransportState::Error => "error",
        }
    }

    /// A backend connection exists or is being established
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransportState::Connecting
                | TransportState::Connected
                | TransportState::Ready
                | TransportState::Reconnecting
        )
    }

    /// `connect()` may start from here
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            TransportState::Uninitialized
                | TransportState::Initialized
                | TransportState::Disconnected
                | TransportState::Error
        )
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the reducer, from the application and from the backend
#[derive(Debug, Clone)]
pub enum Event {
    /// Device acquisition started
    Initialize,
    /// Devices acquired
    Initialized,
    /// Application asked to connect
    Connect,
    /// Backend channel is up (first time or after a drop)
    BackendConnected { reconnected: bool },
    /// Remote sent `bot-ready`
    BotReady,
    /// Backend dropped and is retrying
    ConnectionLost { attempt: u32, delay: Duration },
    /// Backoff wait is over; the backend is dialing again
    Retrying { attempt: u32 },
    /// The in-flight connect was aborted before `ready`
    Cancelled,
    /// Unrecoverable failure (initial connect, exhausted retries)
    Fatal(TransportError),
    /// Recoverable or informational failure; state is kept
    Warning(TransportError),
    /// Application (or remote hang-up) asked to disconnect
    Disconnect,
    /// Backend teardown finished
    TeardownComplete,
}

/// Work the engine performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Broadcast the new state
    NotifyState(TransportState),
    NotifyError(TransportError),
    NotifyConnected,
    NotifyReconnecting { attempt: u32, delay: Duration },
    NotifyReconnected,
    NotifyReady,
    NotifyDisconnected,
    /// Send the `client-ready` envelope
    SendClientReady,
    /// Close the backend connection and halt media
    Teardown,
}

/// Reducer: (state, event) -> (next_state, effects)
///
/// Events that make no sense in the current state leave it unchanged with no
/// effects. Callers check [`TransportState::can_connect`] themselves when they
/// need to reject a request.
pub fn reduce(state: &TransportState, event: Event) -> (TransportState, Vec<Effect>) {
    use Effect::*;
    use TransportState::*;

    let to = |next: TransportState, mut effects: Vec<Effect>| {
        effects.insert(0, NotifyState(next));
        (next, effects)
    };

    match (*state, event) {
        // -----------------
        // Setup
        // -----------------
        (Uninitialized, Event::Initialize) => to(Initializing, vec![]),
        (Initializing, Event::Initialized) => to(Initialized, vec![]),
        // Device failure during setup is reported but does not block connecting
        (Initializing, Event::Warning(err)) => to(Initialized, vec![NotifyError(err)]),

        // -----------------
        // Connecting
        // -----------------
        (s, Event::Connect) if s.can_connect() => to(Connecting, vec![]),
        (Connecting, Event::BackendConnected { reconnected: false }) => {
            to(Connected, vec![NotifyConnected, SendClientReady])
        }
        (Connecting, Event::BackendConnected { reconnected: true }) => to(
            Connected,
            vec![NotifyConnected, NotifyReconnected, SendClientReady],
        ),
        (Connecting | Connected, Event::Cancelled) => {
            to(Disconnected, vec![Teardown, NotifyDisconnected])
        }

        // -----------------
        // Connected / ready
        // -----------------
        (Connected, Event::BotReady) => to(Ready, vec![NotifyReady]),
        (Connected | Ready, Event::ConnectionLost { attempt, delay }) => {
            to(Reconnecting, vec![NotifyReconnecting { attempt, delay }])
        }

        // -----------------
        // Reconnecting
        // -----------------
        // Further retries while already reconnecting only notify
        (Reconnecting, Event::ConnectionLost { attempt, delay }) => {
            (Reconnecting, vec![NotifyReconnecting { attempt, delay }])
        }
        (Reconnecting, Event::Retrying { .. }) => to(Connecting, vec![]),
        // A retry that fails to open goes back to waiting
        (Connecting, Event::ConnectionLost { attempt, delay }) => {
            to(Reconnecting, vec![NotifyReconnecting { attempt, delay }])
        }

        // -----------------
        // Failure
        // -----------------
        (s, Event::Fatal(err)) if s.is_active() || s == Initializing => to(
            Error,
            vec![NotifyError(err), Teardown, NotifyDisconnected],
        ),
        (_, Event::Warning(err)) => (*state, vec![NotifyError(err)]),

        // -----------------
        // Disconnect
        // -----------------
        (s, Event::Disconnect) if s.is_active() => to(Disconnecting, vec![Teardown]),
        (Disconnecting, Event::TeardownComplete) => to(Disconnected, vec![NotifyDisconnected]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (*state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mut state: TransportState, events: Vec<Event>) -> TransportState {
        for event in events {
            state = reduce(&state, event).0;
        }
        state
    }

    #[test]
    fn full_lifecycle_reaches_ready_only_after_bot_ready() {
        let state = run(
            TransportState::Uninitialized,
            vec![
                Event::Initialize,
                Event::Initialized,
                Event::Connect,
                Event::BackendConnected { reconnected: false },
            ],
        );
        assert_eq!(state, TransportState::Connected);

        let (next, effects) = reduce(&state, Event::BotReady);
        assert_eq!(next, TransportState::Ready);
        assert_eq!(
            effects,
            vec![Effect::NotifyState(TransportState::Ready), Effect::NotifyReady]
        );
    }

    #[test]
    fn backend_connected_sends_client_ready() {
        let (next, effects) = reduce(
            &TransportState::Connecting,
            Event::BackendConnected { reconnected: false },
        );
        assert_eq!(next, TransportState::Connected);
        assert!(effects.contains(&Effect::SendClientReady));
        assert!(!effects.contains(&Effect::NotifyReconnected));
    }

    #[test]
    fn reconnect_cycle_repeats_handshake() {
        let delay = Duration::from_millis(1_000);
        let (next, effects) = reduce(
            &TransportState::Ready,
            Event::ConnectionLost { attempt: 1, delay },
        );
        assert_eq!(next, TransportState::Reconnecting);
        assert!(effects.contains(&Effect::NotifyReconnecting { attempt: 1, delay }));

        let (again, effects) = reduce(&next, Event::ConnectionLost { attempt: 2, delay });
        assert_eq!(again, TransportState::Reconnecting);
        assert!(!effects.iter().any(|e| matches!(e, Effect::NotifyState(_))));

        // The retry passes through connecting before the wire is up again
        let (next, effects) = reduce(&again, Event::Retrying { attempt: 2 });
        assert_eq!(next, TransportState::Connecting);
        assert_eq!(effects, vec![Effect::NotifyState(TransportState::Connecting)]);

        let (next, effects) = reduce(&next, Event::BackendConnected { reconnected: true });
        assert_eq!(next, TransportState::Connected);
        assert_eq!(
            effects,
            vec![
                Effect::NotifyState(TransportState::Connected),
                Effect::NotifyConnected,
                Effect::NotifyReconnected,
                Effect::SendClientReady,
            ]
        );
    }

    #[test]
    fn wire_never_reopens_straight_from_reconnecting() {
        let (next, effects) = reduce(
            &TransportState::Reconnecting,
            Event::BackendConnected { reconnected: true },
        );
        assert_eq!(next, TransportState::Reconnecting);
        assert!(effects.is_empty());
    }

    #[test]
    fn failed_retry_returns_to_reconnecting() {
        let delay = Duration::from_millis(1_500);
        let (next, effects) = reduce(
            &TransportState::Connecting,
            Event::ConnectionLost { attempt: 2, delay },
        );
        assert_eq!(next, TransportState::Reconnecting);
        assert!(effects.contains(&Effect::NotifyReconnecting { attempt: 2, delay }));
    }

    #[test]
    fn fatal_error_tears_down_and_disconnects() {
        let err = TransportError::ExhaustedRetries { attempts: 2 };
        let (next, effects) = reduce(&TransportState::Reconnecting, Event::Fatal(err.clone()));

        assert_eq!(next, TransportState::Error);
        assert_eq!(
            effects,
            vec![
                Effect::NotifyState(TransportState::Error),
                Effect::NotifyError(err),
                Effect::Teardown,
                Effect::NotifyDisconnected,
            ]
        );
    }

    #[test]
    fn fatal_error_when_idle_is_ignored() {
        let (next, effects) = reduce(
            &TransportState::Disconnected,
            Event::Fatal(TransportError::StaleConnection),
        );
        assert_eq!(next, TransportState::Disconnected);
        assert!(effects.is_empty());
    }

    #[test]
    fn warning_keeps_state() {
        let err = TransportError::StaleConnection;
        let (next, effects) = reduce(&TransportState::Ready, Event::Warning(err.clone()));
        assert_eq!(next, TransportState::Ready);
        assert_eq!(effects, vec![Effect::NotifyError(err)]);
    }

    #[test]
    fn connect_rejected_while_active() {
        for state in [
            TransportState::Connecting,
            TransportState::Connected,
            TransportState::Ready,
            TransportState::Reconnecting,
        ] {
            let (next, effects) = reduce(&state, Event::Connect);
            assert_eq!(next, state);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn connect_allowed_after_error() {
        let (next, _) = reduce(&TransportState::Error, Event::Connect);
        assert_eq!(next, TransportState::Connecting);
    }

    #[test]
    fn cancelled_connect_returns_to_disconnected() {
        let (next, effects) = reduce(&TransportState::Connecting, Event::Cancelled);
        assert_eq!(next, TransportState::Disconnected);
        assert!(effects.contains(&Effect::Teardown));
        assert!(!effects.iter().any(|e| matches!(e, Effect::NotifyError(_))));
    }

    #[test]
    fn disconnect_goes_through_disconnecting() {
        let (next, effects) = reduce(&TransportState::Ready, Event::Disconnect);
        assert_eq!(next, TransportState::Disconnecting);
        assert!(effects.contains(&Effect::Teardown));

        let (next, effects) = reduce(&next, Event::TeardownComplete);
        assert_eq!(next, TransportState::Disconnected);
        assert!(effects.contains(&Effect::NotifyDisconnected));
    }

    #[test]
    fn stale_bot_ready_is_ignored() {
        let (next, effects) = reduce(&TransportState::Reconnecting, Event::BotReady);
        assert_eq!(next, TransportState::Reconnecting);
        assert!(effects.is_empty());
    }

    #[test]
    fn device_failure_during_setup_still_initializes() {
        let err = TransportError::Device(crate::error::DeviceError::Enumeration("denied".into()));
        let (next, effects) = reduce(&TransportState::Initializing, Event::Warning(err.clone()));
        assert_eq!(next, TransportState::Initialized);
        assert!(effects.contains(&Effect::NotifyError(err)));
    }
}
