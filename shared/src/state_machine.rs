//! Connection State Machine
//!
//! Defines the valid lifecycle transitions for a transport endpoint or a
//! single connection. Every backend embeds one of these per endpoint and
//! per connection, so the observable lifecycle is the same on every medium.

use std::fmt;

/// Lifecycle state of an endpoint or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing in progress; a client may connect
    Idle,
    /// Client connect (and handshake) in progress
    Connecting,
    /// Server endpoint bound and accepting peers
    Listening,
    /// Ready for data exchange
    Open,
    /// Teardown in progress
    Closing,
    /// Terminal; the entity is discarded afterward
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Open or Closing (i.e. still allowed in a registry)
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Listening => "listening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Client asked to connect
    ConnectRequested,
    /// Medium (and handshake, if any) completed
    Established,
    /// Connect attempt failed or was cancelled
    ConnectFailed,
    /// Server endpoint claimed
    Bound,
    /// Local side asked to close
    CloseRequested,
    /// Peer closed cleanly
    RemoteClosed,
    /// Medium reported an error
    MediumFailed,
    /// All resources released
    TeardownComplete,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        event: LifecycleEvent,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success(_))
    }
}

/// The lifecycle state machine for one endpoint or connection
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Idle,
        }
    }

    /// State machine for a connection that is open from birth
    /// (accepted peers, datagram peers)
    pub fn accepted() -> Self {
        Self {
            current_state: ConnectionState::Open,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn is_closed(&self) -> bool {
        self.current_state == ConnectionState::Closed
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> TransitionResult {
        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LifecycleEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LifecycleEvent::*;

        match (self.current_state, event) {
            // Client side
            (Idle, ConnectRequested) => Some(Connecting),
            (Connecting, Established) => Some(Open),
            (Connecting, ConnectFailed) => Some(Idle),

            // Server side
            (Idle, Bound) => Some(Listening),

            // Teardown
            (Open, CloseRequested | RemoteClosed | MediumFailed) => Some(Closing),
            (Listening, CloseRequested | MediumFailed) => Some(Closing),
            (Closing, TeardownComplete) => Some(Closed),

            // Closed is terminal
            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Idle, Connecting)
            | (Connecting, Open)
            | (Connecting, Idle)
            | (Idle, Listening)
            | (Open, Closing)
            | (Listening, Closing)
            | (Closing, Closed)
    )
}
