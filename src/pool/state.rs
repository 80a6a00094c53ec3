//! Pool status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Workers are being allocated.
    Spawning,
    /// All requested workers are up.
    Active,
    /// A scale operation is in progress.
    Scaling,
    /// Some workers failed; the pool still serves tasks.
    Degraded,
    /// Close requested; no new tasks.
    Closing,
    /// Terminal.
    Closed,
}

impl PoolStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: PoolStatus) -> bool {
        use PoolStatus::*;

        matches!(
            (self, target),
            // From Spawning
            (Spawning, Active) | (Spawning, Degraded) |
            (Spawning, Closing) | (Spawning, Closed) |
            // From Active
            (Active, Scaling) | (Active, Degraded) | (Active, Closing) |
            // From Scaling
            (Scaling, Active) | (Scaling, Degraded) | (Scaling, Closing) |
            // From Degraded (can recover)
            (Degraded, Active) | (Degraded, Scaling) | (Degraded, Closing) |
            // From Closing
            (Closing, Closed)
        )
    }

    /// Whether the router may select this pool and `execute` is allowed.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Active | Self::Scaling | Self::Degraded)
    }

    /// Closing or closed.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Closed
    }
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Scaling => "scaling",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: PoolStatus,
    pub to: PoolStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Mutable per-pool state guarded by the pool core.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub status: PoolStatus,
    pub worker_count: usize,
    pub last_error: Option<String>,
    pub transitions: Vec<StatusTransition>,
}

/// Cap on the retained transition history.
const MAX_TRANSITIONS: usize = 50;

impl PoolState {
    pub fn new() -> Self {
        Self {
            status: PoolStatus::Spawning,
            worker_count: 0,
            last_error: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        new_status: PoolStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if self.status == new_status {
            return Ok(());
        }
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;
        Ok(())
    }

    /// Record a failure and mark the pool degraded if it was serving.
    pub fn mark_degraded(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.last_error = Some(reason.clone());
        if matches!(self.status, PoolStatus::Active | PoolStatus::Scaling) {
            let _ = self.transition_to(PoolStatus::Degraded, Some(reason));
        }
    }
}

impl Default for PoolState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(PoolStatus::Spawning.can_transition_to(PoolStatus::Active));
        assert!(PoolStatus::Spawning.can_transition_to(PoolStatus::Degraded));
        assert!(PoolStatus::Active.can_transition_to(PoolStatus::Scaling));
        assert!(PoolStatus::Scaling.can_transition_to(PoolStatus::Active));
        assert!(PoolStatus::Degraded.can_transition_to(PoolStatus::Active));
        assert!(PoolStatus::Closing.can_transition_to(PoolStatus::Closed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!PoolStatus::Closed.can_transition_to(PoolStatus::Active));
        assert!(!PoolStatus::Closing.can_transition_to(PoolStatus::Active));
        assert!(!PoolStatus::Active.can_transition_to(PoolStatus::Closed));
        assert!(!PoolStatus::Active.can_transition_to(PoolStatus::Spawning));
    }

    #[test]
    fn routable_statuses() {
        assert!(PoolStatus::Active.accepts_tasks());
        assert!(PoolStatus::Scaling.accepts_tasks());
        assert!(PoolStatus::Degraded.accepts_tasks());
        assert!(!PoolStatus::Spawning.accepts_tasks());
        assert!(!PoolStatus::Closing.accepts_tasks());
        assert!(!PoolStatus::Closed.accepts_tasks());
    }

    #[test]
    fn state_records_transitions() {
        let mut state = PoolState::new();
        state.transition_to(PoolStatus::Active, None).unwrap();
        state
            .transition_to(PoolStatus::Closing, Some("shutdown".into()))
            .unwrap();
        assert_eq!(state.status, PoolStatus::Closing);
        assert_eq!(state.transitions.len(), 2);
        assert!(state.transition_to(PoolStatus::Active, None).is_err());
    }

    #[test]
    fn same_status_is_noop() {
        let mut state = PoolState::new();
        state.transition_to(PoolStatus::Active, None).unwrap();
        state.transition_to(PoolStatus::Active, None).unwrap();
        assert_eq!(state.transitions.len(), 1);
    }

    #[test]
    fn mark_degraded_only_from_serving() {
        let mut state = PoolState::new();
        state.transition_to(PoolStatus::Active, None).unwrap();
        state.mark_degraded("worker-2 crashed");
        assert_eq!(state.status, PoolStatus::Degraded);
        assert_eq!(state.last_error.as_deref(), Some("worker-2 crashed"));

        let mut closing = PoolState::new();
        closing.transition_to(PoolStatus::Closing, None).unwrap();
        closing.mark_degraded("late failure");
        assert_eq!(closing.status, PoolStatus::Closing);
    }

    #[test]
    fn transition_history_capped() {
        let mut state = PoolState::new();
        state.transition_to(PoolStatus::Active, None).unwrap();
        for _ in 0..100 {
            state.transition_to(PoolStatus::Scaling, None).unwrap();
            state.transition_to(PoolStatus::Active, None).unwrap();
        }
        assert!(state.transitions.len() <= MAX_TRANSITIONS);
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(PoolStatus::Degraded.to_string(), "degraded");
        let json = serde_json::to_string(&PoolStatus::Closing).unwrap();
        assert_eq!(json, "\"closing\"");
        let parsed: PoolStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, PoolStatus::Closing);
    }
}
