use signal_proto::PeerId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Unset,
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }

    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Closed | Failed) => true,
            (Idle, OfferSent | OfferReceived) => true,
            (OfferSent | OfferReceived, Answered) => true,
            (Answered, Connected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid channel transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },
    #[error("role cannot change once the session is {state:?}")]
    RoleLocked { state: ChannelState },
    #[error("role already {current:?}, refusing {requested:?}")]
    RoleConflict { current: Role, requested: Role },
}

/// Negotiation progress with one remote peer. A replaced or finished session
/// is never revived; the coordinator starts a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    remote: PeerId,
    role: Role,
    channel_state: ChannelState,
}

impl SessionState {
    pub fn new(remote: PeerId) -> Self {
        Self {
            remote,
            role: Role::Unset,
            channel_state: ChannelState::Idle,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    pub fn is_terminal(&self) -> bool {
        self.channel_state.is_terminal()
    }

    pub fn assign_role(&mut self, role: Role) -> Result<(), StateError> {
        if self.role == role {
            return Ok(());
        }
        if self.channel_state == ChannelState::Connected || self.channel_state.is_terminal() {
            return Err(StateError::RoleLocked {
                state: self.channel_state,
            });
        }
        if self.role != Role::Unset {
            return Err(StateError::RoleConflict {
                current: self.role,
                requested: role,
            });
        }
        self.role = role;
        Ok(())
    }

    /// Moves to `next`, returning the state left behind.
    pub fn transition(&mut self, next: ChannelState) -> Result<ChannelState, StateError> {
        if !self.channel_state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.channel_state,
                to: next,
            });
        }
        let previous = self.channel_state;
        self.channel_state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        SessionState::new(PeerId::from("remote"))
    }

    #[test]
    fn initiator_path() {
        let mut state = session();
        state.assign_role(Role::Initiator).unwrap();
        state.transition(ChannelState::OfferSent).unwrap();
        state.transition(ChannelState::Answered).unwrap();
        assert_eq!(
            state.transition(ChannelState::Connected),
            Ok(ChannelState::Answered)
        );
        assert_eq!(state.role(), Role::Initiator);
    }

    #[test]
    fn responder_path() {
        let mut state = session();
        state.assign_role(Role::Responder).unwrap();
        state.transition(ChannelState::OfferReceived).unwrap();
        state.transition(ChannelState::Answered).unwrap();
        state.transition(ChannelState::Connected).unwrap();
    }

    #[test]
    fn skipping_steps_is_rejected() {
        let mut state = session();
        assert_eq!(
            state.transition(ChannelState::Connected),
            Err(StateError::InvalidTransition {
                from: ChannelState::Idle,
                to: ChannelState::Connected
            })
        );
        state.transition(ChannelState::OfferSent).unwrap();
        assert!(state.transition(ChannelState::OfferReceived).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [ChannelState::Closed, ChannelState::Failed] {
            let mut state = session();
            state.transition(ChannelState::OfferSent).unwrap();
            state.transition(terminal).unwrap();
            assert!(state.is_terminal());
            assert!(state.transition(ChannelState::Idle).is_err());
            assert!(state.transition(ChannelState::Closed).is_err());
        }
    }

    #[test]
    fn connected_can_fail() {
        let mut state = session();
        state.transition(ChannelState::OfferReceived).unwrap();
        state.transition(ChannelState::Answered).unwrap();
        state.transition(ChannelState::Connected).unwrap();
        assert_eq!(
            state.transition(ChannelState::Failed),
            Ok(ChannelState::Connected)
        );
    }

    #[test]
    fn role_locks_once_connected() {
        let mut state = session();
        state.assign_role(Role::Responder).unwrap();
        state.transition(ChannelState::OfferReceived).unwrap();
        state.transition(ChannelState::Answered).unwrap();
        state.transition(ChannelState::Connected).unwrap();
        assert_eq!(
            state.assign_role(Role::Initiator),
            Err(StateError::RoleLocked {
                state: ChannelState::Connected
            })
        );
        assert_eq!(state.assign_role(Role::Responder), Ok(()));
    }

    #[test]
    fn role_conflict_before_connect() {
        let mut state = session();
        state.assign_role(Role::Initiator).unwrap();
        assert!(matches!(
            state.assign_role(Role::Responder),
            Err(StateError::RoleConflict { .. })
        ));
    }
}
