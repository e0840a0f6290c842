use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// The lifecycle of a port. `Starting`, `Finishing` and `Closing` are the transition windows
///  between the stable states.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PortState {
    Dormant = 0,
    /// bound to a network address, not yet accepting connections
    Listening = 1,
    Starting = 2,
    Running = 3,
    /// close was requested: no new connections, no new sends
    Finishing = 4,
    /// connections are being joined
    Closing = 5,
    Finished = 6,
}

impl PortState {
    /// a port can send and receive in these states
    pub fn is_open(&self) -> bool {
        matches!(self, PortState::Listening | PortState::Starting | PortState::Running)
    }
}

/// A [PortState] that changes only through explicit transitions, so that exactly one caller
///  wins a race for e.g. closing a port.
pub struct AtomicPortState(AtomicU8);

impl AtomicPortState {
    pub fn new() -> AtomicPortState {
        AtomicPortState(AtomicU8::new(PortState::Dormant.into()))
    }

    pub fn get(&self) -> PortState {
        PortState::try_from_primitive(self.0.load(Ordering::Acquire))
            .unwrap_or(PortState::Finished)
    }

    /// Moves from one of the `from` states to `to`, returning the previous state. Fails if the
    ///  current state is not among `from`.
    pub fn transition(&self, from: &[PortState], to: PortState) -> anyhow::Result<PortState> {
        let mut current = self.get();
        loop {
            if !from.contains(&current) {
                return Err(anyhow!("invalid port state transition {:?} -> {:?}", current, to));
            }
            match self.0.compare_exchange(current.into(), to.into(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current),
                Err(actual) => {
                    current = PortState::try_from_primitive(actual)
                        .unwrap_or(PortState::Finished);
                }
            }
        }
    }

    /// unconditionally sets the state, for rolling back a failed transition
    pub fn set(&self, state: PortState) {
        self.0.store(state.into(), Ordering::Release);
    }
}

impl Default for AtomicPortState {
    fn default() -> Self {
        AtomicPortState::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use PortState::*;

    #[rstest]
    #[case::listen(Dormant, &[Dormant], Listening, true)]
    #[case::start_from_dormant(Dormant, &[Listening], Starting, false)]
    #[case::close_running(Running, &[Listening, Running], Finishing, true)]
    #[case::close_twice(Finishing, &[Listening, Running], Finishing, false)]
    fn test_transition(#[case] initial: PortState, #[case] from: &[PortState], #[case] to: PortState, #[case] expected_ok: bool) {
        let state = AtomicPortState::new();
        state.set(initial);

        let result = state.transition(from, to);
        assert_eq!(result.is_ok(), expected_ok);
        if expected_ok {
            assert_eq!(result.unwrap(), initial);
            assert_eq!(state.get(), to);
        }
        else {
            assert_eq!(state.get(), initial);
        }
    }

    #[rstest]
    #[case(Dormant, false)]
    #[case(Listening, true)]
    #[case(Running, true)]
    #[case(Closing, false)]
    #[case(Finished, false)]
    fn test_is_open(#[case] state: PortState, #[case] expected: bool) {
        assert_eq!(state.is_open(), expected);
    }
}
