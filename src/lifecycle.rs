//! Device life-cycle state machine.
//!
//! The single source of truth for whether the feeder is reachable and
//! healthy. Other components consult it before issuing requests: feature
//! requests queue while the device is not `Online` and flush in FIFO order
//! once it is. Transitions happen only through [`Lifecycle::apply`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    AwaitingFirstHeartbeat,
    Online,
    /// One heartbeat missed; the next one either recovers the device or
    /// sends it to `Reconnecting`.
    Degraded,
    Reconnecting,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::AwaitingFirstHeartbeat => "awaiting_first_heartbeat",
            LifecycleState::Online => "online",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Inputs the machine reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A transport connect attempt started.
    ConnectStarted,
    /// The transport session is up and subscriptions are issued.
    SessionEstablished,
    HeartbeatReceived,
    /// The startup window elapsed without a first heartbeat.
    StartupWindowElapsed,
    HeartbeatMissed,
    /// Reconnect backoff delay elapsed.
    BackoffElapsed,
    /// The transport dropped unexpectedly.
    TransportLost,
    /// Explicit disconnect/shutdown request.
    ShutdownRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

pub struct Lifecycle {
    state: LifecycleState,
    entered_at_ms: i64,
}

impl Lifecycle {
    pub fn new(now_ms: i64) -> Self {
        Lifecycle {
            state: LifecycleState::Disconnected,
            entered_at_ms: now_ms,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == LifecycleState::Online
    }

    /// Milliseconds spent in the current state.
    pub fn in_state_for(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.entered_at_ms)
    }

    /// Apply an event. Returns the transition taken, or `None` when the
    /// event does not move the machine (which is normal, e.g. heartbeats
    /// while already `Online`).
    pub fn apply(&mut self, event: LifecycleEvent, now_ms: i64) -> Option<Transition> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        let next = match (self.state, event) {
            (_, E::ShutdownRequested) => Some(S::Disconnected),
            // An unexpected transport drop sends every connected state back
            // through the reconnect path.
            (S::Connecting | S::AwaitingFirstHeartbeat | S::Online | S::Degraded, E::TransportLost) => {
                Some(S::Reconnecting)
            }
            (S::Disconnected | S::Reconnecting, E::ConnectStarted) => Some(S::Connecting),
            (S::Connecting, E::SessionEstablished) => Some(S::AwaitingFirstHeartbeat),
            (S::AwaitingFirstHeartbeat, E::HeartbeatReceived) => Some(S::Online),
            (S::AwaitingFirstHeartbeat, E::StartupWindowElapsed) => Some(S::Reconnecting),
            (S::Online, E::HeartbeatMissed) => Some(S::Degraded),
            (S::Degraded, E::HeartbeatReceived) => Some(S::Online),
            (S::Degraded, E::HeartbeatMissed) => Some(S::Reconnecting),
            (S::Reconnecting, E::BackoffElapsed) => Some(S::Connecting),
            _ => None,
        };

        let to = next?;
        if to == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to,
        };
        log::info!("lifecycle: {} -> {}", transition.from, transition.to);
        self.state = to;
        self.entered_at_ms = now_ms;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    fn machine() -> Lifecycle {
        Lifecycle::new(0)
    }

    #[test]
    fn connect_session_heartbeat_reaches_online() {
        let mut lc = machine();
        lc.apply(E::ConnectStarted, 0);
        assert_eq!(lc.state(), S::Connecting);
        lc.apply(E::SessionEstablished, 1);
        assert_eq!(lc.state(), S::AwaitingFirstHeartbeat);
        lc.apply(E::HeartbeatReceived, 2);
        assert_eq!(lc.state(), S::Online);
    }

    #[test]
    fn two_consecutive_misses_after_online_end_in_reconnecting() {
        let mut lc = machine();
        for (event, at) in [
            (E::ConnectStarted, 0),
            (E::SessionEstablished, 1),
            (E::HeartbeatReceived, 2),
            (E::HeartbeatReceived, 3),
            (E::HeartbeatMissed, 4),
            (E::HeartbeatMissed, 5),
        ] {
            lc.apply(event, at);
        }
        assert_eq!(lc.state(), S::Reconnecting);
    }

    #[test]
    fn degraded_recovers_on_next_heartbeat() {
        let mut lc = machine();
        lc.apply(E::ConnectStarted, 0);
        lc.apply(E::SessionEstablished, 0);
        lc.apply(E::HeartbeatReceived, 0);
        lc.apply(E::HeartbeatMissed, 1);
        assert_eq!(lc.state(), S::Degraded);
        lc.apply(E::HeartbeatReceived, 2);
        assert_eq!(lc.state(), S::Online);
    }

    #[test]
    fn startup_window_elapsing_goes_to_reconnecting() {
        let mut lc = machine();
        lc.apply(E::ConnectStarted, 0);
        lc.apply(E::SessionEstablished, 0);
        lc.apply(E::StartupWindowElapsed, 90_000);
        assert_eq!(lc.state(), S::Reconnecting);
        lc.apply(E::BackoffElapsed, 91_000);
        assert_eq!(lc.state(), S::Connecting);
    }

    #[test]
    fn transport_loss_interrupts_any_connected_state() {
        for prime in [E::SessionEstablished, E::HeartbeatReceived] {
            let mut lc = machine();
            lc.apply(E::ConnectStarted, 0);
            lc.apply(E::SessionEstablished, 0);
            lc.apply(prime, 0);
            lc.apply(E::TransportLost, 1);
            assert_eq!(lc.state(), S::Reconnecting);
        }
    }

    #[test]
    fn shutdown_wins_from_every_state() {
        let mut lc = machine();
        lc.apply(E::ConnectStarted, 0);
        lc.apply(E::SessionEstablished, 0);
        lc.apply(E::HeartbeatReceived, 0);
        let t = lc.apply(E::ShutdownRequested, 1).unwrap();
        assert_eq!(t.to, S::Disconnected);
        // Shutdown while already disconnected is a no-op.
        assert!(lc.apply(E::ShutdownRequested, 2).is_none());
    }

    #[test]
    fn irrelevant_events_do_not_move_the_machine() {
        let mut lc = machine();
        assert!(lc.apply(E::HeartbeatReceived, 0).is_none());
        assert!(lc.apply(E::HeartbeatMissed, 0).is_none());
        assert_eq!(lc.state(), S::Disconnected);
    }

    #[test]
    fn tracks_time_in_state() {
        let mut lc = machine();
        lc.apply(E::ConnectStarted, 1_000);
        assert_eq!(lc.in_state_for(4_500), 3_500);
    }
}
