//! Connection state machine.
//!
//! Pure bookkeeping: [`StateMachine::transition`] validates the previous
//! state and returns the timer effects the connection actor must apply.
//! It never touches a timer or a socket itself.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Starting,
    ReadyForConnection,
    Connected,
    RegisteredConnection,
    RegisteredCorresponding,
    Protocol1Sent,
    Protocol2Received,
    Protocol3Sent,
    WaitingForSasValidation,
    Listening,
    WaitingForReconnection,
    Reconnecting,
    Finishing,
    Error,
    ErrorInvalidStep,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Finishing | ConnectionState::Error | ConnectionState::ErrorInvalidStep
        )
    }

    /// Whether `previous` may lead into `self`.
    fn accepts_from(self, previous: ConnectionState, protocol_done: bool) -> bool {
        use ConnectionState::*;
        match self {
            Starting => false,
            ReadyForConnection => previous == Starting,
            Connected => matches!(previous, ReadyForConnection | Reconnecting),
            RegisteredConnection => previous == Connected,
            RegisteredCorresponding => previous == RegisteredConnection,
            Protocol1Sent => previous == RegisteredCorresponding && !protocol_done,
            Protocol2Received => previous == Protocol1Sent,
            Protocol3Sent => previous == Protocol2Received,
            WaitingForSasValidation => previous == Protocol3Sent,
            Listening => match previous {
                WaitingForSasValidation | WaitingForReconnection => true,
                RegisteredCorresponding => protocol_done,
                _ => false,
            },
            WaitingForReconnection => previous == Listening,
            Reconnecting => matches!(previous, Listening | WaitingForReconnection),
            Finishing | Error | ErrorInvalidStep => true,
        }
    }
}

/// Timer work implied by a transition, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEffect {
    CancelProtocolTimeout,
    ArmProtocolTimeout,
    StartKeepAlive,
    StartProactiveReconnect,
    CancelReconnectionTimeout,
    /// Terminal state: stop every timer.
    CancelAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// `to` differs from the state that was asked for.
    pub rejected: bool,
    pub effects: Vec<TimerEffect>,
}

#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    protocol_done: bool,
    proactive_reconnect_started: bool,
    unexpected_peer_registration: Option<Instant>,
    anti_flap_window: Duration,
}

impl StateMachine {
    pub fn new(anti_flap_window: Duration) -> Self {
        Self {
            state: ConnectionState::Starting,
            protocol_done: false,
            proactive_reconnect_started: false,
            unexpected_peer_registration: None,
            anti_flap_window,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The handshake completed at least once; reconnections skip it.
    pub fn protocol_done(&self) -> bool {
        self.protocol_done
    }

    /// Move to `requested`. Returns `None` once `Finishing` was entered:
    /// nothing changes and no timer is touched.
    pub fn transition(&mut self, requested: ConnectionState) -> Option<Transition> {
        if self.state == ConnectionState::Finishing {
            debug!(?requested, "finishing; transition ignored");
            return None;
        }

        let from = self.state;
        let rejected = !requested.accepts_from(from, self.protocol_done);
        let to = if rejected {
            warn!(?from, ?requested, "invalid step");
            ConnectionState::ErrorInvalidStep
        } else {
            requested
        };
        self.state = to;

        let mut effects = vec![TimerEffect::CancelProtocolTimeout];
        if to.is_terminal() {
            effects.push(TimerEffect::CancelAll);
        } else {
            effects.push(TimerEffect::ArmProtocolTimeout);
        }

        if to == ConnectionState::Listening {
            if from == ConnectionState::WaitingForSasValidation {
                self.protocol_done = true;
            }
            if from == ConnectionState::WaitingForReconnection {
                effects.push(TimerEffect::CancelReconnectionTimeout);
            }
            effects.push(TimerEffect::StartKeepAlive);
            if !self.proactive_reconnect_started {
                self.proactive_reconnect_started = true;
                effects.push(TimerEffect::StartProactiveReconnect);
            }
        }
        if from == ConnectionState::WaitingForReconnection && to == ConnectionState::Reconnecting {
            effects.push(TimerEffect::CancelReconnectionTimeout);
        }

        debug!(?from, ?to, "state transition");
        Some(Transition {
            from,
            to,
            rejected,
            effects,
        })
    }

    /// A protocol-progress timeout is fatal unless we are listening, waiting
    /// on the user for the SAS, or the handshake already completed.
    pub fn protocol_timeout_is_fatal(&self) -> bool {
        !(self.protocol_done
            || matches!(
                self.state,
                ConnectionState::Listening | ConnectionState::WaitingForSasValidation
            ))
    }

    /// The relay announced a new browser registration outside the
    /// reconnection flow.
    pub fn note_unexpected_peer_registration(&mut self, now: Instant) {
        self.unexpected_peer_registration = Some(now);
    }

    /// Whether a "peer disconnected" notice is a stale echo of the
    /// registration just noted. Consumes the mark either way.
    pub fn suppress_disconnect(&mut self, now: Instant) -> bool {
        match self.unexpected_peer_registration.take() {
            Some(at) => now.saturating_duration_since(at) <= self.anti_flap_window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn machine() -> StateMachine {
        StateMachine::new(Duration::from_secs(30))
    }

    fn walk(sm: &mut StateMachine, states: &[ConnectionState]) {
        for s in states {
            let t = sm.transition(*s).unwrap();
            assert!(!t.rejected, "{:?} -> {:?} rejected", t.from, s);
        }
    }

    const HANDSHAKE: [ConnectionState; 9] = [
        ReadyForConnection,
        Connected,
        RegisteredConnection,
        RegisteredCorresponding,
        Protocol1Sent,
        Protocol2Received,
        Protocol3Sent,
        WaitingForSasValidation,
        Listening,
    ];

    #[test]
    fn skipping_registered_corresponding_is_an_invalid_step() {
        let mut sm = machine();
        walk(&mut sm, &[ReadyForConnection, Connected, RegisteredConnection]);
        let t = sm.transition(Listening).unwrap();
        assert!(t.rejected);
        assert_eq!(sm.state(), ErrorInvalidStep);
        assert!(t.effects.contains(&TimerEffect::CancelAll));
    }

    #[test]
    fn first_listening_starts_proactive_reconnect_once() {
        let mut sm = machine();
        for s in &HANDSHAKE[..8] {
            sm.transition(*s);
        }
        let first = sm.transition(Listening).unwrap();
        assert!(first.effects.contains(&TimerEffect::StartProactiveReconnect));
        assert!(sm.protocol_done());

        walk(&mut sm, &[Reconnecting, Connected, RegisteredConnection, RegisteredCorresponding]);
        let again = sm.transition(Listening).unwrap();
        assert!(!again.rejected);
        assert!(again.effects.contains(&TimerEffect::StartKeepAlive));
        assert!(!again.effects.contains(&TimerEffect::StartProactiveReconnect));
    }

    #[test]
    fn handshake_cannot_restart_after_completion() {
        let mut sm = machine();
        walk(&mut sm, &HANDSHAKE);
        walk(&mut sm, &[Reconnecting, Connected, RegisteredConnection, RegisteredCorresponding]);
        assert!(sm.transition(Protocol1Sent).unwrap().rejected);
    }

    #[test]
    fn registered_corresponding_to_listening_needs_completed_handshake() {
        let mut sm = machine();
        walk(&mut sm, &HANDSHAKE[..4]);
        assert!(sm.transition(Listening).unwrap().rejected);
    }

    #[test]
    fn finishing_is_sticky() {
        let mut sm = machine();
        walk(&mut sm, &HANDSHAKE[..3]);
        sm.transition(Finishing).unwrap();
        assert!(sm.transition(Error).is_none());
        assert!(sm.transition(RegisteredCorresponding).is_none());
        assert_eq!(sm.state(), Finishing);
    }

    #[test]
    fn every_transition_cancels_before_arming() {
        let mut sm = machine();
        let t = sm.transition(ReadyForConnection).unwrap();
        assert_eq!(
            t.effects,
            vec![TimerEffect::CancelProtocolTimeout, TimerEffect::ArmProtocolTimeout]
        );
    }

    #[test]
    fn timeout_policy() {
        let mut sm = machine();
        walk(&mut sm, &HANDSHAKE[..5]);
        assert!(sm.protocol_timeout_is_fatal());
        walk(&mut sm, &HANDSHAKE[5..8]);
        assert_eq!(sm.state(), WaitingForSasValidation);
        assert!(!sm.protocol_timeout_is_fatal());
        walk(&mut sm, &[Listening, WaitingForReconnection]);
        // Handshake done: benign everywhere from now on.
        assert!(!sm.protocol_timeout_is_fatal());
    }

    #[test]
    fn peer_reconnect_returns_to_listening() {
        let mut sm = machine();
        walk(&mut sm, &HANDSHAKE);
        walk(&mut sm, &[WaitingForReconnection]);
        let t = sm.transition(Listening).unwrap();
        assert!(t.effects.contains(&TimerEffect::CancelReconnectionTimeout));
    }

    #[test]
    fn disconnect_right_after_unexpected_registration_is_suppressed_once() {
        let mut sm = machine();
        let t0 = Instant::now();
        sm.note_unexpected_peer_registration(t0);
        assert!(sm.suppress_disconnect(t0 + Duration::from_secs(10)));
        assert!(!sm.suppress_disconnect(t0 + Duration::from_secs(11)));

        sm.note_unexpected_peer_registration(t0);
        assert!(!sm.suppress_disconnect(t0 + Duration::from_secs(31)));
    }
}
