//! Pure status transition function over per-tick observations.
//!
//! Once per reconciliation tick the loop gathers what the collaborators
//! report about a session and maps `(current status, observations)` to the
//! next status. The mapping is total: every status has defined behavior for
//! every observation shape, "stay" included. Side effects (recording into
//! the detector, notifications, merge dispatch) belong to the loop, never
//! to this function.

use crate::plugin::{CiStatus, MergeReadiness, PrInfo, ReviewDecision};
use crate::session::SessionStatus;

/// What the collaborators reported for one session this tick.
///
/// `None` on an optional field means the signal was not available this tick
/// (poll failed with no cached fallback); the machine treats it as "no new
/// information" and holds position.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub runtime_alive: Option<bool>,
    /// Agent produced fresh output since the last poll.
    pub agent_active: Option<bool>,
    pub pr: Option<PrInfo>,
    pub ci: Option<CiStatus>,
    pub review: Option<ReviewDecision>,
    pub readiness: Option<MergeReadiness>,
    pub issue_completed: Option<bool>,
    pub kill_requested: bool,
    pub terminate_requested: bool,
}

impl Observations {
    fn ci_is(&self, status: CiStatus) -> bool {
        self.ci == Some(status)
    }

    fn review_is(&self, decision: ReviewDecision) -> bool {
        self.review == Some(decision)
    }

    fn mergeable_now(&self) -> bool {
        self.readiness.as_ref().is_some_and(|r| r.mergeable)
    }
}

/// Map a session's current status and this tick's observations to the next
/// status.
///
/// Ordering rules: terminal statuses absorb everything; explicit kill and
/// terminate requests win over any observation; `merging` is a guard the
/// machine never leaves (only the merge completion path does).
pub fn next_status(current: SessionStatus, obs: &Observations) -> SessionStatus {
    use SessionStatus::*;

    if current.is_terminal() {
        return current;
    }
    if obs.kill_requested {
        return Killed;
    }
    if obs.terminate_requested {
        return Terminated;
    }

    match current {
        Spawning => {
            if obs.agent_active == Some(true) {
                Working
            } else if obs.runtime_alive == Some(false) {
                Killed
            } else {
                Spawning
            }
        }
        Working => {
            if obs.issue_completed == Some(true) {
                Cleanup
            } else if obs.mergeable_now() {
                Mergeable
            } else if obs.ci_is(CiStatus::Failing) {
                CiFailed
            } else if obs.review_is(ReviewDecision::ChangesRequested) {
                ChangesRequested
            } else if obs.pr.is_some() {
                PrOpen
            } else if obs.runtime_alive == Some(false) {
                // Agent died before opening a PR.
                Killed
            } else {
                Working
            }
        }
        PrOpen => {
            if obs.mergeable_now() {
                Mergeable
            } else if obs.ci_is(CiStatus::Failing) {
                CiFailed
            } else if obs.review_is(ReviewDecision::ChangesRequested) {
                ChangesRequested
            } else if obs.review_is(ReviewDecision::Approved) {
                Approved
            } else if obs.ci_is(CiStatus::Passing) {
                ReviewPending
            } else {
                PrOpen
            }
        }
        CiFailed => {
            if obs.mergeable_now() {
                Mergeable
            } else if obs.ci_is(CiStatus::Passing) {
                ReviewPending
            } else if obs.agent_active == Some(true) {
                Working
            } else {
                CiFailed
            }
        }
        ReviewPending => {
            if obs.mergeable_now() {
                Mergeable
            } else if obs.ci_is(CiStatus::Failing) {
                CiFailed
            } else if obs.review_is(ReviewDecision::ChangesRequested) {
                ChangesRequested
            } else if obs.review_is(ReviewDecision::Approved) {
                Approved
            } else {
                ReviewPending
            }
        }
        ChangesRequested => {
            if obs.mergeable_now() {
                Mergeable
            } else if obs.agent_active == Some(true) {
                Working
            } else {
                ChangesRequested
            }
        }
        Approved => {
            if obs.mergeable_now() {
                Mergeable
            } else if obs.ci_is(CiStatus::Failing) {
                CiFailed
            } else {
                Approved
            }
        }
        // The loop moves mergeable to merging before dispatching the
        // steward; observations alone never advance it.
        Mergeable => Mergeable,
        // Left only via the merge completion path.
        Merging => Merging,
        // Manual intervention territory; kill/terminate handled above.
        Stuck => Stuck,
        Cleanup => {
            if obs.runtime_alive == Some(false) {
                Done
            } else {
                Cleanup
            }
        }
        Merged | Killed | Done | Terminated => current,
    }
}
