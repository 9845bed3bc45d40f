//! Timestamped lifecycle history with validated transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CraneError, CraneResult};

/// A lifecycle state machine
pub trait Lifecycle: Copy + Eq + fmt::Debug + fmt::Display {
    /// Whether `self -> next` is a legal edge
    fn can_transition_to(self, next: Self) -> bool;

    /// Whether no further transitions are expected
    fn is_terminal(self) -> bool;
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S> {
    pub state: S,
    pub at: DateTime<Utc>,
}

/// Ordered list of states an object has been in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistory<S> {
    current: S,
    transitions: Vec<Transition<S>>,
}

impl<S: Lifecycle> StateHistory<S> {
    pub fn new(initial: S) -> Self {
        Self::starting_at(initial, Utc::now())
    }

    pub fn starting_at(initial: S, at: DateTime<Utc>) -> Self {
        Self {
            current: initial,
            transitions: vec![Transition { state: initial, at }],
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Time the object entered its first state
    pub fn created_at(&self) -> DateTime<Utc> {
        self.transitions
            .first()
            .map(|t| t.at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Time the object entered its current state
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map(|t| t.at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn transitions(&self) -> &[Transition<S>] {
        &self.transitions
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: S) -> CraneResult<S> {
        self.transition_at(next, Utc::now())
    }

    pub fn transition_at(&mut self, next: S, at: DateTime<Utc>) -> CraneResult<S> {
        let previous = self.current;
        if !previous.can_transition_to(next) {
            return Err(CraneError::InvalidTransition {
                from: previous.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.transitions.push(Transition { state: next, at });
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    enum Light {
        Red,
        Green,
        Off,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Lifecycle for Light {
        fn can_transition_to(self, next: Self) -> bool {
            matches!(
                (self, next),
                (Light::Red, Light::Green) | (Light::Green, Light::Red) | (_, Light::Off)
            ) && self != Light::Off
        }

        fn is_terminal(self) -> bool {
            self == Light::Off
        }
    }

    #[test]
    fn test_history_records_transitions() {
        let mut history = StateHistory::new(Light::Red);
        assert_eq!(history.transition(Light::Green).unwrap(), Light::Red);
        history.transition(Light::Off).unwrap();

        assert_eq!(history.current(), Light::Off);
        let states: Vec<Light> = history.transitions().iter().map(|t| t.state).collect();
        assert_eq!(states, vec![Light::Red, Light::Green, Light::Off]);
        assert!(history.last_transition_at() >= history.created_at());
    }

    #[test]
    fn test_history_rejects_illegal_transition() {
        let mut history = StateHistory::new(Light::Off);
        let err = history.transition(Light::Green).unwrap_err();
        assert!(matches!(err, CraneError::InvalidTransition { .. }));
        assert_eq!(history.current(), Light::Off);
        assert_eq!(history.transitions().len(), 1);
    }
}
