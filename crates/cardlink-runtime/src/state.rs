//! Device lifecycle state tracking.
//!
//! A [`Device`](crate::Device)'s state is derived from its flags (released,
//! waiting, active session, card presence). Every time one of those flags
//! changes the device recomputes its state and records the transition in a
//! [`StateTracker`], which validates it against [`DeviceState::can_transition_to`]
//! and keeps a bounded history for diagnostics.
//!
//! ```text
//!   Idle ──► Acquired ◄──────► Waiting
//!               ▲  │              │
//!               │  ▼              ▼
//!            CardPresent ◄──► SessionActive
//!
//!   (any state except Idle) ──► Released
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Number of transitions kept by a [`StateTracker`].
pub const MAX_HISTORY_SIZE: usize = 32;

/// Lifecycle state of an acquired device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Known to the platform but not acquired.
    Idle,

    /// Acquired, reader mode on, no card in the field.
    Acquired,

    /// A caller is blocked in `wait_for_card_presence`.
    Waiting,

    /// A card is in the field, no session open.
    CardPresent,

    /// A card session is open.
    SessionActive,

    /// Terminal. The handle no longer refers to a live device.
    Released,
}

impl DeviceState {
    /// Whether moving from `self` to `target` follows the lifecycle.
    ///
    /// ```
    /// use cardlink_runtime::DeviceState;
    ///
    /// assert!(DeviceState::Acquired.can_transition_to(&DeviceState::Waiting));
    /// assert!(DeviceState::CardPresent.can_transition_to(&DeviceState::SessionActive));
    /// assert!(!DeviceState::Released.can_transition_to(&DeviceState::Acquired));
    /// assert!(!DeviceState::Idle.can_transition_to(&DeviceState::SessionActive));
    /// ```
    pub fn can_transition_to(&self, target: &DeviceState) -> bool {
        use DeviceState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Acquired)
            // From Acquired
            | (Acquired, Waiting | CardPresent | Released)
            // From Waiting
            | (Waiting, Acquired | CardPresent | SessionActive | Released)
            // From CardPresent
            | (CardPresent, Acquired | Waiting | SessionActive | Released)
            // From SessionActive
            | (SessionActive, Acquired | CardPresent | Waiting | Released)
        )
    }

    /// Whether the device still accepts operations.
    pub fn is_live(&self) -> bool {
        !matches!(self, DeviceState::Idle | DeviceState::Released)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "Idle",
            DeviceState::Acquired => "Acquired",
            DeviceState::Waiting => "Waiting",
            DeviceState::CardPresent => "CardPresent",
            DeviceState::SessionActive => "SessionActive",
            DeviceState::Released => "Released",
        };
        f.write_str(name)
    }
}

/// A single recorded transition.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: DeviceState,
    pub to: DeviceState,

    /// Whether the transition followed [`DeviceState::can_transition_to`].
    pub valid: bool,

    pub timestamp: Instant,
}

impl StateTransition {
    fn new(from: DeviceState, to: DeviceState) -> Self {
        Self {
            from,
            to,
            valid: from.can_transition_to(&to),
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Current state plus a bounded transition history.
///
/// Not synchronized; the owning device keeps it behind its state lock.
#[derive(Debug)]
pub struct StateTracker {
    current: DeviceState,
    entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: DeviceState::Idle,
            entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn current(&self) -> DeviceState {
        self.current
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Record that the device is now in `next`.
    ///
    /// Same-state observations are ignored. Transitions outside the lifecycle
    /// are still recorded (the flags are the source of truth) but logged.
    /// Returns `true` when the state changed.
    pub fn observe(&mut self, next: DeviceState) -> bool {
        if next == self.current {
            return false;
        }

        let transition = StateTransition::new(self.current, next);
        if transition.valid {
            trace!("State transition {} -> {}", transition.from, transition.to);
        } else {
            warn!(
                "Unexpected state transition {} -> {}",
                transition.from, transition.to
            );
        }

        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        self.current = next;
        self.entered_at = Instant::now();
        true
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.iter().cloned().collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeviceState::Idle, DeviceState::Acquired, true)]
    #[case(DeviceState::Acquired, DeviceState::Waiting, true)]
    #[case(DeviceState::Waiting, DeviceState::CardPresent, true)]
    #[case(DeviceState::CardPresent, DeviceState::SessionActive, true)]
    #[case(DeviceState::SessionActive, DeviceState::Acquired, true)]
    #[case(DeviceState::SessionActive, DeviceState::Released, true)]
    #[case(DeviceState::Idle, DeviceState::Released, false)]
    #[case(DeviceState::Acquired, DeviceState::SessionActive, false)]
    #[case(DeviceState::Released, DeviceState::Acquired, false)]
    #[case(DeviceState::Released, DeviceState::Released, false)]
    fn test_transition_table(
        #[case] from: DeviceState,
        #[case] to: DeviceState,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_transition_to(&to), expected);
    }

    #[test]
    fn test_every_live_state_can_release() {
        for state in [
            DeviceState::Acquired,
            DeviceState::Waiting,
            DeviceState::CardPresent,
            DeviceState::SessionActive,
        ] {
            assert!(state.is_live());
            assert!(state.can_transition_to(&DeviceState::Released));
        }
        assert!(!DeviceState::Released.is_live());
    }

    #[test]
    fn test_tracker_records_changes_only() {
        let mut tracker = StateTracker::new();
        assert!(tracker.observe(DeviceState::Acquired));
        assert!(!tracker.observe(DeviceState::Acquired));
        assert!(tracker.observe(DeviceState::CardPresent));

        let history = tracker.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, DeviceState::Idle);
        assert_eq!(history[1].to, DeviceState::CardPresent);
        assert!(history.iter().all(|t| t.valid));
        assert_eq!(tracker.current(), DeviceState::CardPresent);
    }

    #[test]
    fn test_tracker_flags_invalid_transition() {
        let mut tracker = StateTracker::new();
        tracker.observe(DeviceState::SessionActive);
        assert!(!tracker.history()[0].valid);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = StateTracker::new();
        tracker.observe(DeviceState::Acquired);
        for _ in 0..MAX_HISTORY_SIZE {
            tracker.observe(DeviceState::CardPresent);
            tracker.observe(DeviceState::Acquired);
        }
        assert_eq!(tracker.history().len(), MAX_HISTORY_SIZE);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceState::SessionActive.to_string(), "SessionActive");
    }
}
