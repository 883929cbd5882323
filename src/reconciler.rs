//! Reconciliation loop: fixed-interval supervision of all active sessions.
//!
//! Each tick gathers observations for every non-terminal session from its
//! project's bound plugins, applies the pure transition function, records
//! the committed status into the cycle detector, and acts on the result:
//! stuck verdicts notify and freeze the session, mergeable sessions get
//! exactly one test-then-merge dispatch, terminal sessions are archived.
//!
//! Collaborator polls are bounded: each carries a short timeout after which
//! the loop reuses last-known-good cached data for the tick, and a tick-wide
//! budget stops live polling entirely so one slow backend cannot stall
//! reconciliation of every session. Sessions are reconciled concurrently on
//! a bounded worker pool; a session with a merge in flight is skipped until
//! the merge thread completes, so no session ever sees two concurrent
//! reconciliations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detector::{CycleDetector, Recommendation, Verdict};
use crate::plugin::{CiStatus, MergeReadiness, NotifyEvent, PluginSet, PrInfo, ReviewDecision};
use crate::session::{Session, SessionStatus, SessionStore};
use crate::steward::{CommandRunner, MergeMethod, MergeParams, MergeSteward, ShellCommandRunner};
use crate::transition::{Observations, next_status};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Budget for a single collaborator call.
    pub poll_timeout: Duration,
    /// Budget for live polling across one whole tick.
    pub tick_budget: Duration,
    /// Bounded worker count for per-session reconciliation.
    pub max_workers: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            poll_timeout: Duration::from_secs(20),
            tick_budget: Duration::from_secs(60),
            max_workers: 4,
        }
    }
}

/// One configured project: where its repo lives, how to merge, and the
/// plugin set bound to it.
#[derive(Debug)]
pub struct ProjectContext {
    pub id: String,
    pub repo_path: PathBuf,
    pub target_branch: String,
    pub test_command: String,
    pub merge_method: MergeMethod,
    pub plugins: PluginSet,
}

/// Last-known-good poll results per session, reused when a collaborator
/// fails or times out.
#[derive(Debug, Clone, Default)]
struct PollCache {
    runtime_alive: Option<bool>,
    last_output: Option<String>,
    pr: Option<PrInfo>,
    ci: Option<CiStatus>,
    review: Option<ReviewDecision>,
    readiness: Option<MergeReadiness>,
    issue_completed: Option<bool>,
}

struct Inner<R: CommandRunner> {
    config: ReconcilerConfig,
    projects: HashMap<String, ProjectContext>,
    store: Mutex<SessionStore>,
    detector: CycleDetector,
    steward: MergeSteward<R>,
    cache: Mutex<HashMap<String, PollCache>>,
    /// Sessions with a merge thread in flight; excluded from ticks.
    merging: Mutex<HashSet<String>>,
    kill_requests: Mutex<HashSet<String>>,
    terminate_requests: Mutex<HashSet<String>>,
}

/// The top-level control loop. Cheap to clone; clones share state.
pub struct Reconciler<R: CommandRunner = ShellCommandRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: CommandRunner> Clone for Reconciler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: CommandRunner> Reconciler<R> {
    pub fn new(
        config: ReconcilerConfig,
        projects: Vec<ProjectContext>,
        detector: CycleDetector,
        steward: MergeSteward<R>,
    ) -> Self {
        let projects = projects.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            inner: Arc::new(Inner {
                config,
                projects,
                store: Mutex::new(SessionStore::new()),
                detector,
                steward,
                cache: Mutex::new(HashMap::new()),
                merging: Mutex::new(HashSet::new()),
                kill_requests: Mutex::new(HashSet::new()),
                terminate_requests: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Create a tracked session: provision a runtime and insert the session
    /// in `spawning`, which is also the first recorded history entry.
    pub fn spawn_session(
        &self,
        project_id: &str,
        name: Option<String>,
        branch: Option<String>,
        issue_id: Option<String>,
    ) -> Result<String> {
        let project = self
            .inner
            .projects
            .get(project_id)
            .with_context(|| format!("unknown project '{project_id}'"))?;

        let id = name.unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{project_id}-{}", &suffix[..8])
        });
        let branch = branch.unwrap_or_else(|| format!("agent/{id}"));

        let handle = project
            .plugins
            .runtime
            .create(&id, project_id)
            .with_context(|| format!("failed to create runtime for session '{id}'"))?;

        let mut session = Session::new(id.clone(), project_id, branch);
        session.issue_id = issue_id;
        session.runtime_handle = Some(handle);

        self.inner
            .store
            .lock()
            .expect("store lock poisoned")
            .insert(session)?;
        self.inner
            .detector
            .record_transition(&id, SessionStatus::Spawning);
        info!(session = %id, project = project_id, "session spawned");
        Ok(id)
    }

    /// Request explicit termination; applied on the session's next tick.
    pub fn request_kill(&self, session_id: &str) {
        self.inner
            .kill_requests
            .lock()
            .expect("kill set lock poisoned")
            .insert(session_id.to_string());
    }

    pub fn request_terminate(&self, session_id: &str) {
        self.inner
            .terminate_requests
            .lock()
            .expect("terminate set lock poisoned")
            .insert(session_id.to_string());
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .store
            .lock()
            .expect("store lock poisoned")
            .get(session_id)
            .map(|s| s.status)
    }

    pub fn is_archived(&self, session_id: &str) -> bool {
        self.inner
            .store
            .lock()
            .expect("store lock poisoned")
            .is_archived(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner
            .store
            .lock()
            .expect("store lock poisoned")
            .active_len()
    }

    pub fn detector(&self) -> &CycleDetector {
        &self.inner.detector
    }

    /// Run ticks until the stop flag is raised.
    pub fn run(&self, stop: &AtomicBool) {
        info!(
            interval_secs = self.inner.config.poll_interval.as_secs(),
            "reconciliation loop starting"
        );
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();

            // Sleep in short slices so a stop request lands promptly.
            let wake = started + self.inner.config.poll_interval;
            while !stop.load(Ordering::Relaxed) && Instant::now() < wake {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        info!("reconciliation loop stopped");
    }

    /// One pass over all active sessions.
    pub fn tick(&self) {
        let deadline = Instant::now() + self.inner.config.tick_budget;

        let merging = self
            .inner
            .merging
            .lock()
            .expect("merging set lock poisoned")
            .clone();
        let ids: Vec<String> = {
            let store = self.inner.store.lock().expect("store lock poisoned");
            store
                .active_ids()
                .into_iter()
                .filter(|id| !merging.contains(id))
                .collect()
        };
        if ids.is_empty() {
            return;
        }
        debug!(sessions = ids.len(), "tick");

        let queue: Mutex<VecDeque<String>> = Mutex::new(ids.iter().cloned().collect());
        let workers = self.inner.config.max_workers.clamp(1, ids.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = queue.lock().expect("queue lock poisoned").pop_front();
                        let Some(id) = next else { break };
                        self.reconcile_session(&id, deadline);
                    }
                });
            }
        });
    }

    fn reconcile_session(&self, session_id: &str, deadline: Instant) {
        let outcome = self.inner.reconcile(session_id, deadline);
        if outcome != Some(SessionStatus::Mergeable) {
            return;
        }

        // Transition to merging happens inside begin_merge, before the
        // steward thread starts, so a second tick can never dispatch again.
        let Some(params) = self.inner.begin_merge(session_id) else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        std::thread::spawn(move || {
            let result = inner.steward.test_then_merge(&params);
            inner.finish_merge(&session_id, result);
        });
    }
}

impl<R: CommandRunner> Inner<R> {
    /// Observe, transition, record, judge, notify. Returns the committed
    /// status, or `None` when the session is gone or already terminal.
    fn reconcile(&self, session_id: &str, deadline: Instant) -> Option<SessionStatus> {
        let snapshot = {
            let store = self.store.lock().expect("store lock poisoned");
            store.get(session_id)?.clone()
        };
        if snapshot.status.is_terminal() {
            return None;
        }
        let Some(project) = self.projects.get(&snapshot.project_id) else {
            warn!(
                session = session_id,
                project = %snapshot.project_id,
                "session references an unknown project; skipping"
            );
            return None;
        };

        // Stuck sessions stop active polling but stay responsive to
        // explicit kill/terminate requests.
        let obs = if snapshot.status == SessionStatus::Stuck {
            Observations {
                kill_requested: self.kill_requested(session_id),
                terminate_requested: self.terminate_requested(session_id),
                ..Default::default()
            }
        } else {
            self.gather(project, &snapshot, deadline)
        };

        let next = next_status(snapshot.status, &obs);
        {
            let mut store = self.store.lock().expect("store lock poisoned");
            let session = store.get_active_mut(session_id)?;
            if let Some(pr) = &obs.pr {
                session.pr = Some(pr.clone());
            }
            if obs.agent_active == Some(true) {
                session.last_activity_at = Utc::now();
            }
            session.status = next;
        }
        // History reflects every committed tick status, repeats included;
        // that is exactly what loop detection reads.
        self.detector.record_transition(session_id, next);

        let mut current = next;
        if !current.is_terminal()
            && current != SessionStatus::Merging
            && current != SessionStatus::Stuck
            && self.mark_stuck_if_judged(project, session_id)
        {
            current = SessionStatus::Stuck;
        }

        if current != snapshot.status && current != SessionStatus::Stuck {
            self.notify(
                project,
                session_id,
                &format!("status: {current}"),
                &format!("{} -> {}", snapshot.status, current),
            );
        }

        if current.is_terminal() {
            self.finalize(project, session_id);
        }
        Some(current)
    }

    /// Apply the detector's verdict. Returns true when the session was
    /// moved to stuck.
    fn mark_stuck_if_judged(&self, project: &ProjectContext, session_id: &str) -> bool {
        let Some(judgment) = self.detector.judge_cycle(session_id) else {
            return false;
        };
        if judgment.verdict != Verdict::Stuck || judgment.recommendation != Recommendation::Break {
            return false;
        }

        {
            let mut store = self.store.lock().expect("store lock poisoned");
            let Some(session) = store.get_active_mut(session_id) else {
                return false;
            };
            session.status = SessionStatus::Stuck;
        }
        self.detector
            .record_transition(session_id, SessionStatus::Stuck);
        warn!(session = session_id, reason = %judgment.reason, "session judged stuck");

        let body = match &judgment.suggested_action {
            Some(action) => format!("{} ({action})", judgment.reason),
            None => judgment.reason.clone(),
        };
        self.notify(project, session_id, "session stuck", &body);
        true
    }

    /// Gather this tick's observations, falling back to cached data per
    /// field on poll failure or timeout.
    fn gather(&self, project: &ProjectContext, snapshot: &Session, deadline: Instant) -> Observations {
        let session_id = snapshot.id.as_str();
        let mut cache = {
            let cache = self.cache.lock().expect("cache lock poisoned");
            cache.get(session_id).cloned().unwrap_or_default()
        };

        let mut agent_active = None;
        if let Some(handle) = &snapshot.runtime_handle {
            if let Some(budget) = self.remaining(deadline) {
                let runtime = Arc::clone(&project.plugins.runtime);
                let h = handle.clone();
                match call_with_timeout(budget, move || runtime.is_alive(&h)) {
                    Some(Ok(alive)) => cache.runtime_alive = Some(alive),
                    Some(Err(e)) => {
                        warn!(session = session_id, error = %e, "liveness poll failed; using cached value");
                    }
                    None => {
                        warn!(session = session_id, "liveness poll timed out; using cached value");
                    }
                }
            }

            // Activity: fresh output since the last poll.
            if cache.runtime_alive != Some(false)
                && let Some(budget) = self.remaining(deadline)
            {
                let runtime = Arc::clone(&project.plugins.runtime);
                let h = handle.clone();
                match call_with_timeout(budget, move || runtime.get_output(&h, 40)) {
                    Some(Ok(output)) => {
                        agent_active = Some(cache.last_output.as_deref() != Some(output.as_str()));
                        cache.last_output = Some(output);
                    }
                    Some(Err(e)) => {
                        warn!(session = session_id, error = %e, "output poll failed");
                    }
                    None => {
                        warn!(session = session_id, "output poll timed out");
                    }
                }
            }
        }

        if snapshot.pr.is_none()
            && cache.pr.is_none()
            && let Some(budget) = self.remaining(deadline)
        {
            let scm = Arc::clone(&project.plugins.scm);
            let (project_id, branch) = (project.id.clone(), snapshot.branch.clone());
            match call_with_timeout(budget, move || scm.detect_pr(&project_id, &branch)) {
                Some(Ok(found)) => cache.pr = found,
                Some(Err(e)) => {
                    warn!(session = session_id, error = %e, "PR detection failed");
                }
                None => warn!(session = session_id, "PR detection timed out"),
            }
        }

        let pr = snapshot.pr.clone().or_else(|| cache.pr.clone());
        if let Some(info) = &pr {
            let number = info.number;

            if let Some(budget) = self.remaining(deadline) {
                let scm = Arc::clone(&project.plugins.scm);
                let project_id = project.id.clone();
                match call_with_timeout(budget, move || scm.ci_summary(&project_id, number)) {
                    Some(Ok(ci)) => cache.ci = Some(ci),
                    Some(Err(e)) => {
                        warn!(session = session_id, error = %e, "CI poll failed; using cached value");
                    }
                    None => warn!(session = session_id, "CI poll timed out; using cached value"),
                }
            }

            if let Some(budget) = self.remaining(deadline) {
                let scm = Arc::clone(&project.plugins.scm);
                let project_id = project.id.clone();
                match call_with_timeout(budget, move || scm.review_decision(&project_id, number)) {
                    Some(Ok(review)) => cache.review = Some(review),
                    Some(Err(e)) => {
                        warn!(session = session_id, error = %e, "review poll failed; using cached value");
                    }
                    None => {
                        warn!(session = session_id, "review poll timed out; using cached value");
                    }
                }
            }

            if let Some(budget) = self.remaining(deadline) {
                let scm = Arc::clone(&project.plugins.scm);
                let project_id = project.id.clone();
                match call_with_timeout(budget, move || scm.mergeability(&project_id, number)) {
                    Some(Ok(readiness)) => cache.readiness = Some(readiness),
                    Some(Err(e)) => {
                        warn!(session = session_id, error = %e, "mergeability poll failed; using cached value");
                    }
                    None => {
                        warn!(session = session_id, "mergeability poll timed out; using cached value");
                    }
                }
            }
        }

        if let Some(issue_id) = &snapshot.issue_id
            && let Some(budget) = self.remaining(deadline)
        {
            let tracker = Arc::clone(&project.plugins.tracker);
            let (project_id, issue_id) = (project.id.clone(), issue_id.clone());
            match call_with_timeout(budget, move || tracker.is_completed(&project_id, &issue_id)) {
                Some(Ok(completed)) => cache.issue_completed = Some(completed),
                Some(Err(e)) => {
                    warn!(session = session_id, error = %e, "issue poll failed; using cached value");
                }
                None => warn!(session = session_id, "issue poll timed out; using cached value"),
            }
        }

        let obs = Observations {
            runtime_alive: cache.runtime_alive,
            agent_active,
            pr,
            ci: cache.ci,
            review: cache.review,
            readiness: cache.readiness.clone(),
            issue_completed: cache.issue_completed,
            kill_requested: self.kill_requested(session_id),
            terminate_requested: self.terminate_requested(session_id),
        };

        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(session_id.to_string(), cache);
        obs
    }

    /// Claim the merge slot and move the session to merging. `None` when a
    /// merge is already in flight or the session is gone.
    fn begin_merge(&self, session_id: &str) -> Option<MergeParams> {
        {
            let mut merging = self.merging.lock().expect("merging set lock poisoned");
            if !merging.insert(session_id.to_string()) {
                return None;
            }
        }

        let (project_id, branch) = {
            let mut store = self.store.lock().expect("store lock poisoned");
            let Some(session) = store.get_active_mut(session_id) else {
                self.release_merge_slot(session_id);
                return None;
            };
            session.status = SessionStatus::Merging;
            (session.project_id.clone(), session.branch.clone())
        };
        let Some(project) = self.projects.get(&project_id) else {
            self.release_merge_slot(session_id);
            return None;
        };

        self.detector
            .record_transition(session_id, SessionStatus::Merging);
        self.notify(
            project,
            session_id,
            "merge started",
            &format!(
                "testing and merging '{}' into '{}'",
                branch, project.target_branch
            ),
        );

        Some(MergeParams {
            repo_path: project.repo_path.clone(),
            source_branch: branch,
            target_branch: project.target_branch.clone(),
            test_command: project.test_command.clone(),
            merge_method: project.merge_method,
        })
    }

    fn release_merge_slot(&self, session_id: &str) {
        self.merging
            .lock()
            .expect("merging set lock poisoned")
            .remove(session_id);
    }

    /// Merge thread completion: commit the result status, notify, and on
    /// success close out the PR and archive.
    fn finish_merge(&self, session_id: &str, result: Result<crate::steward::MergeOutcome>) {
        self.release_merge_slot(session_id);

        let (project_id, pr_number) = {
            let store = self.store.lock().expect("store lock poisoned");
            let Some(session) = store.get(session_id) else {
                return;
            };
            (
                session.project_id.clone(),
                session.pr.as_ref().map(|pr| pr.number),
            )
        };
        let Some(project) = self.projects.get(&project_id) else {
            return;
        };

        match result {
            Ok(_) => {
                {
                    let mut store = self.store.lock().expect("store lock poisoned");
                    if let Some(session) = store.get_active_mut(session_id) {
                        session.status = SessionStatus::Merged;
                    }
                }
                self.detector
                    .record_transition(session_id, SessionStatus::Merged);
                info!(session = session_id, "merge completed");
                self.notify(
                    project,
                    session_id,
                    "merged",
                    &format!("branch merged into '{}'", project.target_branch),
                );

                if let Some(number) = pr_number
                    && let Err(e) = project.plugins.scm.close_pr(&project.id, number)
                {
                    warn!(session = session_id, pr = number, error = %e, "failed to close merged PR");
                }

                self.finalize(project, session_id);
            }
            Err(e) => {
                {
                    let mut store = self.store.lock().expect("store lock poisoned");
                    if let Some(session) = store.get_active_mut(session_id) {
                        session.status = SessionStatus::CiFailed;
                    }
                }
                self.detector
                    .record_transition(session_id, SessionStatus::CiFailed);
                warn!(session = session_id, error = %e, "merge failed");
                // The underlying test/merge error goes out unmodified so
                // the operator can diagnose root cause.
                self.notify(project, session_id, "merge failed", &format!("{e:#}"));

                // A repetitive merge-fail pattern escalates like any other.
                self.mark_stuck_if_judged(project, session_id);
            }
        }
    }

    /// Terminal status: best-effort runtime teardown, then archive. The
    /// detector history is retained for inspection.
    fn finalize(&self, project: &ProjectContext, session_id: &str) {
        let handle = {
            let store = self.store.lock().expect("store lock poisoned");
            store.get(session_id).and_then(|s| s.runtime_handle.clone())
        };
        if let Some(handle) = handle
            && let Err(e) = project.plugins.runtime.destroy(&handle)
        {
            warn!(session = session_id, error = %e, "runtime teardown failed");
        }

        {
            let mut store = self.store.lock().expect("store lock poisoned");
            if let Err(e) = store.archive(session_id) {
                warn!(session = session_id, error = %e, "archive failed");
            }
        }
        self.kill_requests
            .lock()
            .expect("kill set lock poisoned")
            .remove(session_id);
        self.terminate_requests
            .lock()
            .expect("terminate set lock poisoned")
            .remove(session_id);
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .remove(session_id);
        info!(session = session_id, "session archived");
    }

    fn notify(&self, project: &ProjectContext, session_id: &str, title: &str, body: &str) {
        let event = NotifyEvent {
            session_id: session_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        };
        if let Err(e) = project.plugins.notifier.notify(&event) {
            warn!(session = session_id, error = %e, "notifier failed");
        }
    }

    fn kill_requested(&self, session_id: &str) -> bool {
        self.kill_requests
            .lock()
            .expect("kill set lock poisoned")
            .contains(session_id)
    }

    fn terminate_requested(&self, session_id: &str) -> bool {
        self.terminate_requests
            .lock()
            .expect("terminate set lock poisoned")
            .contains(session_id)
    }

    /// Per-call budget: the poll timeout, clipped to what is left of the
    /// tick. `None` once the tick budget is exhausted.
    fn remaining(&self, deadline: Instant) -> Option<Duration> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        Some(self.config.poll_timeout.min(deadline - now))
    }
}

/// Run a collaborator call on its own thread with a receive timeout.
///
/// `None` means the budget elapsed; the worker thread finishes in the
/// background and its late result is discarded.
fn call_with_timeout<T: Send + 'static>(
    timeout: Duration,
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Option<Result<T>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::plugin::{
        Issue, Notifier, NotifyAction, PrState, Runtime, RuntimeHandle, RuntimeMetrics, Scm,
        Tracker,
    };
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    struct FakeRuntime {
        alive: Mutex<bool>,
        output: Mutex<String>,
        destroyed: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                alive: Mutex::new(true),
                output: Mutex::new(String::new()),
                destroyed: Mutex::new(Vec::new()),
            }
        }

        fn set_output(&self, text: &str) {
            *self.output.lock().unwrap() = text.to_string();
        }
    }

    impl Runtime for FakeRuntime {
        fn create(&self, session_id: &str, _project_id: &str) -> Result<RuntimeHandle> {
            Ok(RuntimeHandle::new(format!("rt-{session_id}")))
        }

        fn destroy(&self, handle: &RuntimeHandle) -> Result<()> {
            self.destroyed.lock().unwrap().push(handle.as_str().to_string());
            Ok(())
        }

        fn is_alive(&self, _handle: &RuntimeHandle) -> Result<bool> {
            Ok(*self.alive.lock().unwrap())
        }

        fn get_output(&self, _handle: &RuntimeHandle, _lines: usize) -> Result<String> {
            Ok(self.output.lock().unwrap().clone())
        }

        fn get_metrics(&self, _handle: &RuntimeHandle) -> Result<RuntimeMetrics> {
            Ok(RuntimeMetrics::default())
        }

        fn send_message(&self, _handle: &RuntimeHandle, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeScm {
        pr: Mutex<Option<PrInfo>>,
        ci: Mutex<CiStatus>,
        review: Mutex<ReviewDecision>,
        mergeable: Mutex<bool>,
        failing: AtomicBool,
        closed: Mutex<Vec<u64>>,
    }

    impl FakeScm {
        fn new() -> Self {
            Self {
                pr: Mutex::new(None),
                ci: Mutex::new(CiStatus::None),
                review: Mutex::new(ReviewDecision::None),
                mergeable: Mutex::new(false),
                failing: AtomicBool::new(false),
                closed: Mutex::new(Vec::new()),
            }
        }

        fn open_pr(&self, number: u64) {
            *self.pr.lock().unwrap() = Some(PrInfo {
                number,
                url: format!("https://example.com/pr/{number}"),
                state: PrState::Open,
                ci_status: CiStatus::Pending,
                review_decision: ReviewDecision::None,
            });
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                anyhow::bail!("scm backend unavailable");
            }
            Ok(())
        }
    }

    impl Scm for FakeScm {
        fn detect_pr(&self, _project_id: &str, _branch: &str) -> Result<Option<PrInfo>> {
            self.check()?;
            Ok(self.pr.lock().unwrap().clone())
        }

        fn pr_state(&self, _project_id: &str, _number: u64) -> Result<PrState> {
            self.check()?;
            Ok(PrState::Open)
        }

        fn ci_summary(&self, _project_id: &str, _number: u64) -> Result<CiStatus> {
            self.check()?;
            Ok(*self.ci.lock().unwrap())
        }

        fn review_decision(&self, _project_id: &str, _number: u64) -> Result<ReviewDecision> {
            self.check()?;
            Ok(*self.review.lock().unwrap())
        }

        fn mergeability(&self, _project_id: &str, _number: u64) -> Result<MergeReadiness> {
            self.check()?;
            Ok(MergeReadiness {
                mergeable: *self.mergeable.lock().unwrap(),
                ci_status: *self.ci.lock().unwrap(),
                review_decision: *self.review.lock().unwrap(),
                blockers: vec![],
            })
        }

        fn merge_pr(&self, _project_id: &str, _number: u64) -> Result<()> {
            Ok(())
        }

        fn close_pr(&self, _project_id: &str, number: u64) -> Result<()> {
            self.closed.lock().unwrap().push(number);
            Ok(())
        }
    }

    struct FakeTracker {
        completed: Mutex<bool>,
    }

    impl Tracker for FakeTracker {
        fn get_issue(&self, _project_id: &str, issue_id: &str) -> Result<Issue> {
            Ok(Issue {
                id: issue_id.to_string(),
                title: "issue".to_string(),
                completed: *self.completed.lock().unwrap(),
            })
        }

        fn is_completed(&self, _project_id: &str, _issue_id: &str) -> Result<bool> {
            Ok(*self.completed.lock().unwrap())
        }

        fn list_issues(&self, _project_id: &str) -> Result<Vec<Issue>> {
            Ok(vec![])
        }

        fn update_issue(&self, _project_id: &str, _issue: &Issue) -> Result<()> {
            Ok(())
        }

        fn create_issue(&self, _project_id: &str, title: &str, _body: &str) -> Result<Issue> {
            Ok(Issue {
                id: "new".to_string(),
                title: title.to_string(),
                completed: false,
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn titles(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }

        fn bodies(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: &NotifyEvent) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event.title.clone(), event.body.clone()));
            Ok(())
        }

        fn notify_with_actions(&self, event: &NotifyEvent, _actions: &[NotifyAction]) -> Result<()> {
            self.notify(event)
        }
    }

    /// Records steward commands; a configurable per-call delay lets tests
    /// overlap ticks with an in-flight merge.
    struct OkRunner {
        calls: Mutex<Vec<String>>,
        delay: Duration,
        fail_tests: bool,
    }

    impl OkRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                fail_tests: false,
            }
        }

        fn count(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.contains(needle))
                .count()
        }
    }

    impl CommandRunner for OkRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: &Path,
            _timeout: Duration,
        ) -> Result<crate::steward::CommandResult> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let rendered = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(rendered.clone());
            let failed = self.fail_tests && rendered.starts_with("sh -lc");
            Ok(crate::steward::CommandResult {
                status_success: !failed,
                stdout: String::new(),
                stderr: if failed { "1 test failed".to_string() } else { String::new() },
            })
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        scm: Arc<FakeScm>,
        tracker: Arc<FakeTracker>,
        notifier: Arc<RecordingNotifier>,
        reconciler: Reconciler<OkRunner>,
    }

    fn harness_with(detector_config: DetectorConfig, runner: OkRunner) -> Harness {
        let runtime = Arc::new(FakeRuntime::new());
        let scm = Arc::new(FakeScm::new());
        let tracker = Arc::new(FakeTracker {
            completed: Mutex::new(false),
        });
        let notifier = Arc::new(RecordingNotifier::default());

        let plugins = PluginSet {
            runtime: runtime.clone(),
            scm: scm.clone(),
            tracker: tracker.clone(),
            notifier: notifier.clone(),
        };
        let project = ProjectContext {
            id: "proj".to_string(),
            repo_path: PathBuf::from("/repo"),
            target_branch: "main".to_string(),
            test_command: "true".to_string(),
            merge_method: MergeMethod::Squash,
            plugins,
        };
        let config = ReconcilerConfig {
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_secs(2),
            tick_budget: Duration::from_secs(10),
            max_workers: 2,
        };
        let reconciler = Reconciler::new(
            config,
            vec![project],
            CycleDetector::new(detector_config),
            MergeSteward::new(runner),
        );

        Harness {
            runtime,
            scm,
            tracker,
            notifier,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(DetectorConfig::default(), OkRunner::new())
    }

    fn wait_for_status(h: &Harness, id: &str, status: SessionStatus) {
        for _ in 0..200 {
            if h.reconciler.session_status(id) == Some(status) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "session never reached {status}, last = {:?}",
            h.reconciler.session_status(id)
        );
    }

    #[test]
    fn spawning_becomes_working_on_first_output() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Spawning));

        h.runtime.set_output("booting agent");
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Working));
        assert_eq!(
            h.reconciler.detector().get_history(&id),
            vec![SessionStatus::Spawning, SessionStatus::Working]
        );
    }

    #[test]
    fn pr_detection_moves_working_to_pr_open_and_notifies() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::PrOpen));
        assert!(
            h.notifier.titles().iter().any(|t| t == "status: pr_open"),
            "titles: {:?}",
            h.notifier.titles()
        );
    }

    #[test]
    fn failing_ci_routes_to_ci_failed() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.ci.lock().unwrap() = CiStatus::Failing;
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::CiFailed));
    }

    #[test]
    fn mergeable_session_is_merged_and_archived() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.mergeable.lock().unwrap() = true;
        h.reconciler.tick();

        wait_for_status(&h, &id, SessionStatus::Merged);
        assert!(h.reconciler.is_archived(&id));
        assert_eq!(*h.scm.closed.lock().unwrap(), vec![7]);
        assert_eq!(h.runtime.destroyed.lock().unwrap().len(), 1);
        assert!(h.notifier.titles().iter().any(|t| t == "merge started"));
        assert!(h.notifier.titles().iter().any(|t| t == "merged"));
    }

    #[test]
    fn merge_is_dispatched_exactly_once_across_ticks() {
        let runner = OkRunner {
            calls: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
            fail_tests: false,
        };
        let h = harness_with(DetectorConfig::default(), runner);
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.mergeable.lock().unwrap() = true;
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Merging));

        // Further ticks while the merge thread is still running must not
        // re-dispatch.
        h.reconciler.tick();
        h.reconciler.tick();
        wait_for_status(&h, &id, SessionStatus::Merged);

        let runner = h.reconciler.inner.steward.runner();
        assert_eq!(runner.count("git fetch origin"), 1);
    }

    #[test]
    fn merge_failure_records_ci_failed_with_raw_error() {
        let runner = OkRunner {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail_tests: true,
        };
        let h = harness_with(DetectorConfig::default(), runner);
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.mergeable.lock().unwrap() = true;
        h.reconciler.tick();

        wait_for_status(&h, &id, SessionStatus::CiFailed);
        assert!(
            h.notifier
                .bodies()
                .iter()
                .any(|b| b.contains("1 test failed")),
            "bodies: {:?}",
            h.notifier.bodies()
        );
    }

    #[test]
    fn scm_outage_falls_back_to_cached_observations() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.ci.lock().unwrap() = CiStatus::Passing;
        h.reconciler.tick(); // working -> pr_open
        h.reconciler.tick(); // pr_open -> review_pending on passing CI
        assert_eq!(
            h.reconciler.session_status(&id),
            Some(SessionStatus::ReviewPending)
        );

        // Backend goes down; the tick keeps the session on cached data
        // instead of erroring or regressing.
        h.scm.failing.store(true, Ordering::Relaxed);
        *h.scm.ci.lock().unwrap() = CiStatus::Failing;
        h.reconciler.tick();
        assert_eq!(
            h.reconciler.session_status(&id),
            Some(SessionStatus::ReviewPending)
        );
    }

    #[test]
    fn repeated_ci_failures_judge_the_session_stuck() {
        let h = harness_with(
            DetectorConfig {
                max_consecutive_same_status: 3,
                max_cycle_repetitions: 3,
                max_history_size: 64,
            },
            OkRunner::new(),
        );
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.scm.open_pr(7);
        *h.scm.ci.lock().unwrap() = CiStatus::Failing;
        for _ in 0..4 {
            h.reconciler.tick();
        }

        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Stuck));
        let bodies = h.notifier.bodies();
        assert!(
            bodies.iter().any(|b| b.contains("consecutive polls")),
            "bodies: {bodies:?}"
        );
        // Stuck sessions hold position on later ticks.
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Stuck));
    }

    #[test]
    fn completed_issue_moves_working_session_to_cleanup_then_done() {
        let h = harness();
        let id = h
            .reconciler
            .spawn_session("proj", None, None, Some("ISSUE-1".to_string()))
            .unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Working));

        *h.tracker.completed.lock().unwrap() = true;
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Cleanup));

        *h.runtime.alive.lock().unwrap() = false;
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Done));
        assert!(h.reconciler.is_archived(&id));
    }

    #[test]
    fn kill_request_archives_the_session() {
        let h = harness();
        let id = h.reconciler.spawn_session("proj", None, None, None).unwrap();
        h.runtime.set_output("working");
        h.reconciler.tick();

        h.reconciler.request_kill(&id);
        h.reconciler.tick();
        assert_eq!(h.reconciler.session_status(&id), Some(SessionStatus::Killed));
        assert!(h.reconciler.is_archived(&id));
        assert_eq!(h.runtime.destroyed.lock().unwrap().len(), 1);

        // Archived sessions are no longer polled.
        let history_len = h.reconciler.detector().get_history(&id).len();
        h.reconciler.tick();
        assert_eq!(h.reconciler.detector().get_history(&id).len(), history_len);
    }

    #[test]
    fn spawn_rejects_unknown_project() {
        let h = harness();
        let err = h
            .reconciler
            .spawn_session("nope", None, None, None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown project"));
    }
}
