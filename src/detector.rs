//! Loop and cycle detection over session status history.
//!
//! Agents polled on a fixed interval produce noisy, repeating status
//! sequences when they stop making progress: CI fails, the agent retries,
//! CI fails again. A naive "same status N times" check misses ping-pong
//! patterns (working/ci_failed), so the detector keeps a bounded per-session
//! status history and recognizes two shapes of repetition:
//!
//! - a **loop**: the same status repeated at the tail, run length over a
//!   threshold;
//! - a **cycle**: the shortest multi-status pattern repeated back-to-back at
//!   the tail, repetition count over a threshold.
//!
//! Both thresholds count repetitions, not elapsed time, which keeps the
//! verdicts robust to variable polling cadence. Detection timestamps are
//! sticky: while a detected run or cycle keeps extending, repeated calls
//! return the first `detected_at`; breaking and re-establishing the pattern
//! issues a fresh one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::session::SessionStatus;

/// Detection thresholds. Test fixtures use small values for determinism.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Tail run length at which an unbroken same-status repeat is a loop.
    pub max_consecutive_same_status: usize,
    /// Back-to-back repetitions at which a tail pattern is a cycle.
    pub max_cycle_repetitions: usize,
    /// History bound per session; oldest entries evicted first.
    pub max_history_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_same_status: 5,
            max_cycle_repetitions: 3,
            max_history_size: 64,
        }
    }
}

/// An unbroken same-status run at the tail of a session's history.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub status: SessionStatus,
    pub count: usize,
    pub detected_at: DateTime<Utc>,
}

/// The shortest repeating multi-status pattern at the tail.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleState {
    pub pattern: Vec<SessionStatus>,
    pub repetitions: usize,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stuck,
    Productive,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Break,
    Continue,
    Escalate,
}

/// Classification of a detected loop or cycle plus the recommended action.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub verdict: Verdict,
    pub recommendation: Recommendation,
    pub reason: String,
    pub suggested_action: Option<String>,
}

/// Per-session detector state: the raw history plus the sticky-timestamp
/// records for the last matched loop and cycle signatures.
#[derive(Debug, Default)]
struct SessionEntry {
    history: VecDeque<SessionStatus>,
    loop_mark: Option<(SessionStatus, DateTime<Utc>)>,
    cycle_mark: Option<(Vec<SessionStatus>, DateTime<Utc>)>,
}

/// Pattern recognizer over bounded per-session status history. Pure
/// in-memory computation; no I/O, never suspends.
///
/// State is partitioned per session id: the outer map lock is held only for
/// entry lookup, so concurrent calls for different sessions do not contend.
pub struct CycleDetector {
    config: DetectorConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
}

impl CycleDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<SessionEntry>> {
        let mut sessions = self.sessions.lock().expect("detector map lock poisoned");
        sessions.entry(session_id.to_string()).or_default().clone()
    }

    fn peek(&self, session_id: &str) -> Option<Arc<Mutex<SessionEntry>>> {
        let sessions = self.sessions.lock().expect("detector map lock poisoned");
        sessions.get(session_id).cloned()
    }

    /// Append a committed status to the session's history.
    ///
    /// Invalidates the loop mark when the tail run breaks, and the cycle
    /// mark when the new status stops extending the marked period.
    pub fn record_transition(&self, session_id: &str, status: SessionStatus) {
        let entry = self.entry(session_id);
        let mut entry = entry.lock().expect("detector entry lock poisoned");

        if let Some(&tail) = entry.history.back()
            && tail != status
        {
            entry.loop_mark = None;
        }
        let cycle_broken = match &entry.cycle_mark {
            Some((pattern, _)) => {
                let p = pattern.len();
                entry.history.len() < p || entry.history[entry.history.len() - p] != status
            }
            None => false,
        };
        if cycle_broken {
            entry.cycle_mark = None;
        }

        entry.history.push_back(status);
        while entry.history.len() > self.config.max_history_size {
            entry.history.pop_front();
        }
    }

    /// The session's status history, oldest first. A copy; mutating it never
    /// affects detector state. Unknown ids return an empty history.
    pub fn get_history(&self, session_id: &str) -> Vec<SessionStatus> {
        match self.peek(session_id) {
            Some(entry) => entry
                .lock()
                .expect("detector entry lock poisoned")
                .history
                .iter()
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Detect an unbroken same-status run at the tail.
    ///
    /// `None` until the run reaches `max_consecutive_same_status`. The
    /// returned `detected_at` is fixed at the first qualifying call and held
    /// until the run breaks.
    pub fn detect_loop(&self, session_id: &str) -> Option<LoopState> {
        let entry = self.peek(session_id)?;
        let mut entry = entry.lock().expect("detector entry lock poisoned");

        let status = *entry.history.back()?;
        let run = entry
            .history
            .iter()
            .rev()
            .take_while(|&&s| s == status)
            .count();
        if run < self.config.max_consecutive_same_status {
            return None;
        }

        let detected_at = match entry.loop_mark {
            Some((marked, at)) if marked == status => at,
            _ => {
                let at = Utc::now();
                entry.loop_mark = Some((status, at));
                at
            }
        };

        Some(LoopState {
            status,
            count: run,
            detected_at,
        })
    }

    /// Detect the shortest repeating tail pattern.
    ///
    /// Periods are searched ascending so the shortest qualifying one wins.
    /// All-identical patterns are loop territory and never qualify, length-1
    /// periods included. `detected_at` is sticky for the same cycle even as
    /// the tail window rotates through it.
    pub fn detect_cycle(&self, session_id: &str) -> Option<CycleState> {
        let entry = self.peek(session_id)?;
        let mut entry = entry.lock().expect("detector entry lock poisoned");

        let history: Vec<SessionStatus> = entry.history.iter().copied().collect();
        let n = history.len();

        for p in 1..=n / 2 {
            let pattern = &history[n - p..];
            if pattern.iter().all(|&s| s == pattern[0]) {
                continue;
            }

            let mut reps = 1;
            while (reps + 1) * p <= n && history[n - (reps + 1) * p..n - reps * p] == *pattern {
                reps += 1;
            }
            if reps < self.config.max_cycle_repetitions {
                continue;
            }

            let detected_at = match &entry.cycle_mark {
                Some((marked, at)) if is_rotation(marked, pattern) => *at,
                _ => {
                    let at = Utc::now();
                    entry.cycle_mark = Some((pattern.to_vec(), at));
                    at
                }
            };

            return Some(CycleState {
                pattern: pattern.to_vec(),
                repetitions: reps,
                detected_at,
            });
        }

        None
    }

    /// Classify the session's tail repetition, cycles taking priority over
    /// loops. `None` when neither is present.
    pub fn judge_cycle(&self, session_id: &str) -> Option<Judgment> {
        if let Some(cycle) = self.detect_cycle(session_id) {
            return Some(classify_cycle(&cycle, self.config.max_cycle_repetitions));
        }

        if let Some(lp) = self.detect_loop(session_id) {
            return Some(Judgment {
                verdict: Verdict::Stuck,
                recommendation: Recommendation::Break,
                reason: format!(
                    "`{}` has repeated for {} consecutive polls",
                    lp.status, lp.count
                ),
                suggested_action: Some(
                    "interrupt the session and inspect the latest agent output".to_string(),
                ),
            });
        }

        None
    }

    /// Drop one session's history and derived loop/cycle state. Safe on
    /// unknown ids.
    pub fn clear_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("detector map lock poisoned");
        sessions.remove(session_id);
    }

    /// Drop all sessions.
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock().expect("detector map lock poisoned");
        sessions.clear();
    }
}

impl Default for CycleDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Classify a detected cycle against a repetition threshold.
///
/// The knowledge table matches unordered status pairs: a cycle observed as
/// `[ci_failed, working]` is the same ping-pong as `[working, ci_failed]`.
pub fn classify_cycle(cycle: &CycleState, min_repetitions: usize) -> Judgment {
    if cycle.repetitions < min_repetitions {
        return Judgment {
            verdict: Verdict::Productive,
            recommendation: Recommendation::Continue,
            reason: format!(
                "pattern {} repeats {} time(s), below the stuck threshold of {}",
                pattern_label(&cycle.pattern),
                cycle.repetitions,
                min_repetitions
            ),
            suggested_action: None,
        };
    }

    if is_pair(cycle, SessionStatus::Working, SessionStatus::CiFailed) {
        return Judgment {
            verdict: Verdict::Stuck,
            recommendation: Recommendation::Break,
            reason: format!("CI keeps failing after {} fix attempts", cycle.repetitions),
            suggested_action: Some(
                "inspect the failing checks and consider taking over the branch".to_string(),
            ),
        };
    }

    if is_pair(cycle, SessionStatus::Working, SessionStatus::ChangesRequested) {
        return Judgment {
            verdict: Verdict::Stuck,
            recommendation: Recommendation::Break,
            reason: format!(
                "reviewer keeps requesting changes and the agent is not converging ({} rounds)",
                cycle.repetitions
            ),
            suggested_action: Some(
                "read the review thread and restate the requirements to the agent".to_string(),
            ),
        };
    }

    if is_pair(cycle, SessionStatus::Spawning, SessionStatus::Killed) {
        return Judgment {
            verdict: Verdict::Stuck,
            recommendation: Recommendation::Break,
            reason: format!(
                "agent is failing to start, killed {} times in a row",
                cycle.repetitions
            ),
            suggested_action: Some("check runtime capacity and credentials".to_string()),
        };
    }

    Judgment {
        verdict: Verdict::Uncertain,
        recommendation: Recommendation::Escalate,
        reason: format!(
            "unrecognized repeating pattern {} ({} repetitions)",
            pattern_label(&cycle.pattern),
            cycle.repetitions
        ),
        suggested_action: None,
    }
}

fn is_pair(cycle: &CycleState, a: SessionStatus, b: SessionStatus) -> bool {
    cycle.pattern.len() == 2 && cycle.pattern.contains(&a) && cycle.pattern.contains(&b)
}

fn pattern_label(pattern: &[SessionStatus]) -> String {
    let names: Vec<&str> = pattern.iter().map(|s| s.as_str()).collect();
    format!("[{}]", names.join(", "))
}

/// Whether `b` is a rotation of `a`. The sticky cycle timestamp survives the
/// tail window rotating through the same period.
fn is_rotation(a: &[SessionStatus], b: &[SessionStatus]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let doubled: Vec<SessionStatus> = [b, b].concat();
    doubled.windows(a.len()).any(|w| w == a)
}
