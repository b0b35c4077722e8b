//! Generic Finite State Machine
//!
//! A machine holds a current state and a shared, immutable transition table
//! mapping every known state to its set of legal successors. A state whose
//! successor set is empty is final.
//!
//! Mutation is serialized by an exclusive lock; `current()`/`has_ended()`
//! take the shared side. Instances are cheap (the table is behind an `Arc`)
//! and are never shared between transfers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::error;

/// Errors returned by [`StateMachine::transition`].
///
/// Both variants are programmer errors: the caller asked for a move the
/// table does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("unknown state \"{0}\"")]
    UnknownState(String),

    #[error("illegal transition from \"{from}\" to \"{to}\"")]
    IllegalTransition { from: String, to: String },
}

/// Transition table: state -> legal successors.
#[derive(Debug, Clone)]
pub struct Transitions<S> {
    table: HashMap<S, HashSet<S>>,
}

impl<S: Copy + Eq + Hash> Transitions<S> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Declare `state` with the given successors. An empty slice makes it final.
    pub fn state(mut self, state: S, successors: &[S]) -> Self {
        self.table
            .entry(state)
            .or_default()
            .extend(successors.iter().copied());
        self
    }

    pub fn successors(&self, state: S) -> Option<&HashSet<S>> {
        self.table.get(&state)
    }

    pub fn contains(&self, state: S) -> bool {
        self.table.contains_key(&state)
    }

    pub fn is_final(&self, state: S) -> bool {
        self.table.get(&state).is_some_and(HashSet::is_empty)
    }
}

impl<S: Copy + Eq + Hash> Default for Transitions<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct Position<S> {
    current: S,
    last: S,
}

/// A mutex-protected state machine instance.
pub struct StateMachine<S> {
    transitions: Arc<Transitions<S>>,
    position: RwLock<Position<S>>,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Hash + fmt::Display,
{
    /// Create a machine positioned on `initial`.
    pub fn new(transitions: Arc<Transitions<S>>, initial: S) -> Self {
        Self {
            transitions,
            position: RwLock::new(Position {
                current: initial,
                last: initial,
            }),
        }
    }

    pub fn current(&self) -> S {
        self.position
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    /// The state held immediately before the current one.
    pub fn last(&self) -> S {
        self.position
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last
    }

    /// Move to `next` if the table allows it from the current state.
    ///
    /// On failure the current state is left untouched.
    pub fn transition(&self, next: S) -> Result<(), FsmError> {
        let mut position = self
            .position
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.transitions.contains(next) {
            error!(state = %next, "State machine asked to move to an unknown state");
            return Err(FsmError::UnknownState(next.to_string()));
        }

        let allowed = self
            .transitions
            .successors(position.current)
            .is_some_and(|successors| successors.contains(&next));

        if !allowed {
            error!(
                from = %position.current,
                to = %next,
                "Illegal state machine transition"
            );
            return Err(FsmError::IllegalTransition {
                from: position.current.to_string(),
                to: next.to_string(),
            });
        }

        position.last = position.current;
        position.current = next;
        Ok(())
    }

    /// True iff the current state has no successors.
    pub fn has_ended(&self) -> bool {
        self.transitions.is_final(self.current())
    }
}

impl<S: fmt::Debug + Copy> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = *self.position.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StateMachine")
            .field("current", &position.current)
            .field("last", &position.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Orange,
        Broken,
        Unplugged,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn table() -> Arc<Transitions<Light>> {
        Arc::new(
            Transitions::new()
                .state(Light::Red, &[Light::Green, Light::Broken])
                .state(Light::Green, &[Light::Orange, Light::Broken])
                .state(Light::Orange, &[Light::Red, Light::Broken])
                .state(Light::Broken, &[]),
        )
    }

    #[test]
    fn test_legal_transitions() {
        let machine = StateMachine::new(table(), Light::Red);
        assert_eq!(machine.current(), Light::Red);

        machine.transition(Light::Green).unwrap();
        machine.transition(Light::Orange).unwrap();
        assert_eq!(machine.current(), Light::Orange);
        assert_eq!(machine.last(), Light::Green);
        assert!(!machine.has_ended());
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let machine = StateMachine::new(table(), Light::Red);

        let err = machine.transition(Light::Orange).unwrap_err();
        assert_eq!(
            err,
            FsmError::IllegalTransition {
                from: "Red".into(),
                to: "Orange".into()
            }
        );
        assert_eq!(machine.current(), Light::Red);
    }

    #[test]
    fn test_unknown_state() {
        let machine = StateMachine::new(table(), Light::Green);

        let err = machine.transition(Light::Unplugged).unwrap_err();
        assert_eq!(err, FsmError::UnknownState("Unplugged".into()));
        assert_eq!(machine.current(), Light::Green);
    }

    #[test]
    fn test_final_state() {
        let machine = StateMachine::new(table(), Light::Green);
        machine.transition(Light::Broken).unwrap();
        assert!(machine.has_ended());

        // Nothing leaves a final state
        assert!(machine.transition(Light::Red).is_err());
        assert_eq!(machine.current(), Light::Broken);
    }

    #[test]
    fn test_concurrent_transitions_single_winner() {
        let machine = Arc::new(StateMachine::new(table(), Light::Red));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&machine);
                std::thread::spawn(move || machine.transition(Light::Green).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // Green -> Green is not in the table, so only the first caller succeeds
        assert_eq!(wins, 1);
        assert_eq!(machine.current(), Light::Green);
    }
}
